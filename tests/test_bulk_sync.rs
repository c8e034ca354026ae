//! Bulk catch-up: generation rebuilds, atomic alias swaps, side-buffer
//! replay of changes arriving mid-rebuild, and abort handling.

mod common;

use common::WidgetHandler;
use async_trait::async_trait;
use searchsync::sync::bulk::BulkSyncCoordinator;
use searchsync::{
    ChangeEvent, ChangeEventProcessor, ChangeType, HandlerRegistry, IndexDocument, IndexHandler,
    IndexVersionState, MemoryChangeFeed, MemoryEntityReader, MemorySearchIndex, MemoryStateStore,
    SearchIndexClient, SourceEntity, StateStore, SyncError,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Watches `gadget` entities but renders nothing, so its generation stays
/// empty.
struct AccessoryHandler {
    sources: Vec<String>,
}

#[async_trait]
impl IndexHandler for AccessoryHandler {
    fn handler_id(&self) -> &str {
        "accessory-search"
    }
    fn alias(&self) -> &str {
        "accessories"
    }
    fn schema_version(&self) -> &str {
        "v1"
    }
    fn source_types(&self) -> &[String] {
        &self.sources
    }
    fn render(&self, _entity: &SourceEntity) -> Option<IndexDocument> {
        None
    }
    async fn apply(&self, _event: &ChangeEvent) -> searchsync::Result<()> {
        Ok(())
    }
}

struct Env {
    store: Arc<MemoryStateStore>,
    search: Arc<MemorySearchIndex>,
    feed: Arc<MemoryChangeFeed>,
    reader: Arc<MemoryEntityReader>,
    bulk: Arc<BulkSyncCoordinator>,
}

fn env(handler_version: &str) -> Env {
    common::init_tracing();
    let config = common::fast_config("bulk-test");
    let store = Arc::new(MemoryStateStore::new());
    let search = Arc::new(MemorySearchIndex::new());
    let feed = Arc::new(MemoryChangeFeed::new());
    let reader = Arc::new(MemoryEntityReader::new());

    let handler: Arc<dyn IndexHandler> =
        Arc::new(WidgetHandler::new(search.clone(), handler_version));
    let registry = Arc::new(HandlerRegistry::with_handlers(vec![handler]));
    let processor = Arc::new(ChangeEventProcessor::new(
        Arc::clone(&registry),
        store.clone(),
        &config,
    ));
    let bulk = Arc::new(BulkSyncCoordinator::new(
        registry,
        store.clone(),
        search.clone(),
        feed.clone(),
        reader.clone(),
        processor,
        config,
    ));

    Env {
        store,
        search,
        feed,
        reader,
        bulk,
    }
}

#[tokio::test]
async fn test_first_boot_full_rebuild() {
    let env = env("v1");
    env.reader.insert("widget", "w1", json!({"name": "anvil"}));
    env.reader.insert("widget", "w2", json!({"name": "bolt"}));
    env.reader.insert("widget", "w3", json!({"unnamed": true}));

    let summary = env.bulk.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(summary.rebuilt, vec!["widget-search".to_string()]);

    // w3 has no name and renders to nothing.
    assert_eq!(env.search.count("widgets"), 2);
    assert_eq!(env.search.get("widgets", "w1").unwrap()["name"], "anvil");

    let state = env
        .store
        .load_version_state("widget-search")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.synced_schema_version, "v1");
    assert!(!state.needs_full_rebuild);

    // One generation, promoted under the alias.
    let generations = env.search.resolve_alias("widgets").await.unwrap();
    assert_eq!(generations.len(), 1);
    assert!(generations[0].starts_with("widgets_v1_"));
}

#[tokio::test]
async fn test_noop_when_schema_current_still_baselines() {
    let env = env("v1");
    env.store
        .save_version_state(&IndexVersionState {
            handler_id: "widget-search".to_string(),
            synced_schema_version: "v1".to_string(),
            needs_full_rebuild: false,
        })
        .await
        .unwrap();
    env.feed
        .publish("widget", ChangeType::Insert, "w1", json!({"name": "anvil"}));
    let t2 = env
        .feed
        .publish("widget", ChangeType::Update, "w1", json!({"name": "anvil mk2"}));

    let summary = env.bulk.run(&CancellationToken::new()).await.unwrap();
    assert!(summary.rebuilt.is_empty());
    assert_eq!(env.search.count("widgets"), 0);

    // Realtime starts at the tail, not at the beginning of history.
    assert_eq!(
        env.store.load_resume_token("widget").await.unwrap(),
        Some(t2)
    );
}

#[tokio::test]
async fn test_concurrent_change_lands_in_new_generation() {
    let env = env("v2");
    env.store
        .save_version_state(&IndexVersionState {
            handler_id: "widget-search".to_string(),
            synced_schema_version: "v1".to_string(),
            needs_full_rebuild: false,
        })
        .await
        .unwrap();
    for (id, name) in [("w1", "anvil"), ("w2", "bolt"), ("w3", "crank")] {
        env.reader.insert("widget", id, json!({"name": name}));
    }
    // Hold the rebuild window open long enough to publish into it.
    env.reader.set_scan_delay(Duration::from_millis(30));

    let bulk = env.bulk.clone();
    let run = tokio::spawn(async move { bulk.run(&CancellationToken::new()).await });

    tokio::time::sleep(Duration::from_millis(40)).await;
    env.feed
        .publish("widget", ChangeType::Insert, "w4", json!({"name": "dynamo"}));

    let summary = run.await.unwrap().unwrap();
    assert_eq!(summary.rebuilt, vec!["widget-search".to_string()]);
    assert_eq!(summary.replayed, 1);
    assert!(summary.observed_during_rebuild >= 1);

    // The replayed insert went through the alias into the new generation.
    assert_eq!(env.search.count("widgets"), 4);
    assert_eq!(env.search.get("widgets", "w4").unwrap()["name"], "dynamo");

    let state = env
        .store
        .load_version_state("widget-search")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.synced_schema_version, "v2");
}

#[tokio::test]
async fn test_persistent_failure_aborts_and_discards_generation() {
    let env = env("v1");
    env.reader.insert("widget", "w1", json!({"name": "anvil"}));
    env.search.fail_next_upserts(100);

    let err = env.bulk.run(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, SyncError::RebuildAborted { .. }));

    // No version row was written, so the next session retries the rebuild.
    assert!(env
        .store
        .load_version_state("widget-search")
        .await
        .unwrap()
        .is_none());

    // The half-built generation is gone and the alias never existed.
    assert!(!env
        .search
        .index_names()
        .iter()
        .any(|n| n.starts_with("widgets_v1_")));
    assert!(env.search.resolve_alias("widgets").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_rebuild_discards_other_handlers_generations() {
    common::init_tracing();
    let config = common::fast_config("bulk-test");
    let store = Arc::new(MemoryStateStore::new());
    let search = Arc::new(MemorySearchIndex::new());
    let feed = Arc::new(MemoryChangeFeed::new());
    let reader = Arc::new(MemoryEntityReader::new());

    // Accessories rebuild first and index nothing; widgets rebuild second
    // and hit a persistent upsert failure.
    let accessories: Arc<dyn IndexHandler> = Arc::new(AccessoryHandler {
        sources: vec!["gadget".to_string()],
    });
    let widgets: Arc<dyn IndexHandler> = Arc::new(WidgetHandler::new(search.clone(), "v1"));
    let registry = Arc::new(HandlerRegistry::with_handlers(vec![accessories, widgets]));
    let processor = Arc::new(ChangeEventProcessor::new(
        Arc::clone(&registry),
        store.clone(),
        &config,
    ));
    let bulk = BulkSyncCoordinator::new(
        registry,
        store.clone(),
        search.clone(),
        feed,
        reader.clone(),
        processor,
        config,
    );

    reader.insert("widget", "w1", json!({"name": "anvil"}));
    search.fail_next_upserts(100);

    let err = bulk.run(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, SyncError::RebuildAborted { .. }));

    // The accessories generation was fully built but never swapped; the
    // abort must discard it along with the widgets generation.
    assert!(
        search.index_names().is_empty(),
        "leaked generations: {:?}",
        search.index_names()
    );
    assert!(store.load_version_state("accessory-search").await.unwrap().is_none());
    assert!(store.load_version_state("widget-search").await.unwrap().is_none());
}

#[tokio::test]
async fn test_swap_is_atomic_for_readers() {
    let env = env("v2");
    // An old generation is live with two documents.
    env.search.create_index("widgets_v1_old", &json!({})).await.unwrap();
    env.search
        .upsert("widgets_v1_old", "w1", &json!({"name": "anvil", "schema": "v1"}))
        .await
        .unwrap();
    env.search
        .upsert("widgets_v1_old", "w2", &json!({"name": "bolt", "schema": "v1"}))
        .await
        .unwrap();
    env.search.attach_alias("widgets", "widgets_v1_old").await.unwrap();
    env.store
        .save_version_state(&IndexVersionState {
            handler_id: "widget-search".to_string(),
            synced_schema_version: "v1".to_string(),
            needs_full_rebuild: false,
        })
        .await
        .unwrap();

    for (id, name) in [("w1", "anvil"), ("w2", "bolt"), ("w3", "crank")] {
        env.reader.insert("widget", id, json!({"name": name}));
    }
    env.reader.set_scan_delay(Duration::from_millis(20));

    let bulk = env.bulk.clone();
    let run = tokio::spawn(async move { bulk.run(&CancellationToken::new()).await });

    // Readers only ever see the complete old set or the complete new set.
    loop {
        let count = env.search.count("widgets");
        assert!(count == 2 || count == 3, "partial generation visible: {count}");
        if run.is_finished() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    run.await.unwrap().unwrap();

    assert_eq!(env.search.count("widgets"), 3);
    assert_eq!(env.search.get("widgets", "w3").unwrap()["schema"], "v2");
    // The superseded generation was deleted after the swap.
    assert!(!env.search.index_exists("widgets_v1_old"));
}
