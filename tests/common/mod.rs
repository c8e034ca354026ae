//! Shared fixtures for the integration tests: tracing init and a realistic
//! widget-search handler wired to the in-memory search index.

use async_trait::async_trait;
use searchsync::{
    ChangeEvent, ChangeType, IndexDocument, IndexHandler, MemorySearchIndex, SearchIndexClient,
    SourceEntity, SyncConfig,
};
use serde_json::json;
use std::sync::Arc;

pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Config with intervals tight enough for wall-clock tests.
#[allow(dead_code)]
pub fn fast_config(instance: &str) -> SyncConfig {
    SyncConfig {
        instance_id: instance.to_string(),
        heartbeat_interval_ms: 20,
        lock_expiry_ms: 200,
        acquire_retry_interval_ms: 10,
        retry_backoff_ms: 1,
        ..Default::default()
    }
}

/// Indexes the `name` field of `widget` entities under the `widgets` alias.
/// Entities without a name render to nothing.
pub struct WidgetHandler {
    search: Arc<MemorySearchIndex>,
    version: String,
    sources: Vec<String>,
}

impl WidgetHandler {
    pub fn new(search: Arc<MemorySearchIndex>, version: &str) -> Self {
        WidgetHandler {
            search,
            version: version.to_string(),
            sources: vec!["widget".to_string()],
        }
    }
}

#[async_trait]
impl IndexHandler for WidgetHandler {
    fn handler_id(&self) -> &str {
        "widget-search"
    }

    fn alias(&self) -> &str {
        "widgets"
    }

    fn schema_version(&self) -> &str {
        &self.version
    }

    fn source_types(&self) -> &[String] {
        &self.sources
    }

    fn render(&self, entity: &SourceEntity) -> Option<IndexDocument> {
        let name = entity.data.get("name")?.as_str()?;
        Some(IndexDocument {
            id: entity.id.clone(),
            body: json!({ "name": name, "schema": self.version }),
        })
    }

    async fn apply(&self, event: &ChangeEvent) -> searchsync::Result<()> {
        match event.change_type {
            ChangeType::Delete => self.search.delete(self.alias(), &event.entity_id).await,
            _ => {
                let entity = SourceEntity {
                    id: event.entity_id.clone(),
                    data: event.payload.clone(),
                };
                match self.render(&entity) {
                    Some(doc) => self.search.upsert(self.alias(), &doc.id, &doc.body).await,
                    None => Ok(()),
                }
            }
        }
    }
}
