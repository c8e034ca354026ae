//! Full-index rebuilds for stale handlers, without losing live changes.
//!
//! The change feed is subscribed *before* any rebuild starts; events that
//! arrive mid-rebuild land in a side buffer that keeps only the first event
//! per source type. The buffer is a wake-up signal, not a durable log: full
//! correctness comes from the realtime phase resuming at the committed
//! tokens, which re-delivers everything after them.

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::feed::{ChangeFeed, EntityReader};
use crate::handler::{HandlerRegistry, IndexHandler};
use crate::search::SearchIndexClient;
use crate::store::StateStore;
use crate::sync::processor::ChangeEventProcessor;
use crate::types::{ChangeEvent, IndexDocument, IndexVersionState, SourceType};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct BulkSummary {
    /// Handler ids that went through a full rebuild.
    pub rebuilt: Vec<String>,
    /// Buffered first-events replayed after the swap.
    pub replayed: usize,
    /// Total live events observed while the rebuild window was open.
    pub observed_during_rebuild: u64,
}

pub struct BulkSyncCoordinator {
    registry: Arc<HandlerRegistry>,
    store: Arc<dyn StateStore>,
    search: Arc<dyn SearchIndexClient>,
    feed: Arc<dyn ChangeFeed>,
    reader: Arc<dyn EntityReader>,
    processor: Arc<ChangeEventProcessor>,
    config: SyncConfig,
}

impl BulkSyncCoordinator {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        store: Arc<dyn StateStore>,
        search: Arc<dyn SearchIndexClient>,
        feed: Arc<dyn ChangeFeed>,
        reader: Arc<dyn EntityReader>,
        processor: Arc<ChangeEventProcessor>,
        config: SyncConfig,
    ) -> Self {
        BulkSyncCoordinator {
            registry,
            store,
            search,
            feed,
            reader,
            processor,
            config,
        }
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<BulkSummary> {
        let watched = self.registry.watched_source_types();

        // Resume baselines must exist before anything else, so the realtime
        // phase knows where to pick up even when nothing is stale.
        self.establish_baselines(&watched).await?;

        // Subscribe before stale detection: every event arriving during the
        // rebuild window is observed before any entity scan starts, and an
        // expired resume position gets its handlers flagged in time to be
        // rebuilt in this very session.
        let buffer = Arc::new(SideBuffer::new());
        let buffer_cancel = cancel.child_token();
        let collectors = self
            .start_collectors(&watched, &buffer, &buffer_cancel)
            .await?;

        let mut stale: Vec<Arc<dyn IndexHandler>> = Vec::new();
        for handler in self.registry.handlers() {
            if self.needs_full_rebuild(handler.as_ref()).await? {
                stale.push(Arc::clone(handler));
            }
        }

        if stale.is_empty() {
            tracing::info!("All indices current, bulk sync is a no-op");
            buffer_cancel.cancel();
            for collector in collectors {
                let _ = collector.await;
            }
            return Ok(BulkSummary {
                rebuilt: Vec::new(),
                replayed: 0,
                observed_during_rebuild: 0,
            });
        }
        tracing::info!(
            "Bulk sync: {} stale handler(s): {:?}",
            stale.len(),
            stale.iter().map(|h| h.handler_id()).collect::<Vec<_>>()
        );

        let outcome = self.rebuild_and_swap(&stale, cancel).await;

        buffer_cancel.cancel();
        for collector in collectors {
            let _ = collector.await;
        }

        let rebuilt = outcome?;

        // Replay runs after the swap so replayed writes land in the live
        // generation instead of one about to be deleted.
        let (first_events, observed) = buffer.take();
        let replayed = first_events.len();
        for event in first_events {
            self.processor.process_event(&event).await?;
        }

        for handler in &stale {
            self.store
                .save_version_state(&IndexVersionState {
                    handler_id: handler.handler_id().to_string(),
                    synced_schema_version: handler.schema_version().to_string(),
                    needs_full_rebuild: false,
                })
                .await?;
        }

        tracing::info!(
            "Bulk sync complete: {} rebuilt, {} buffered replayed, {} observed mid-rebuild",
            rebuilt.len(),
            replayed,
            observed
        );
        Ok(BulkSummary {
            rebuilt,
            replayed,
            observed_during_rebuild: observed,
        })
    }

    async fn establish_baselines(&self, watched: &[SourceType]) -> Result<()> {
        for source in watched {
            if self.store.load_resume_token(source).await?.is_none() {
                if let Some(token) = self.feed.latest_token(source).await? {
                    tracing::info!("Baseline for '{}' set to token {}", source, token);
                    self.store.save_resume_token(source, &token).await?;
                }
            }
        }
        Ok(())
    }

    async fn needs_full_rebuild(&self, handler: &dyn IndexHandler) -> Result<bool> {
        Ok(match self.store.load_version_state(handler.handler_id()).await? {
            None => true,
            Some(state) => {
                state.needs_full_rebuild
                    || state.synced_schema_version != handler.schema_version()
            }
        })
    }

    async fn start_collectors(
        &self,
        watched: &[SourceType],
        buffer: &Arc<SideBuffer>,
        cancel: &CancellationToken,
    ) -> Result<Vec<tokio::task::JoinHandle<()>>> {
        let mut collectors = Vec::with_capacity(watched.len());
        for source in watched {
            let from = self.store.load_resume_token(source).await?;
            let mut rx = match self.feed.subscribe(source, from.as_deref()).await {
                Ok(rx) => rx,
                Err(SyncError::TokenTooOld(_)) => self.rebaseline_expired(source).await?,
                Err(e) => return Err(e),
            };
            let buffer = Arc::clone(buffer);
            let cancel = cancel.clone();
            collectors.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        maybe = rx.recv() => match maybe {
                            Some(event) => buffer.observe(event),
                            None => return,
                        }
                    }
                }
            }));
        }
        Ok(collectors)
    }

    /// The committed position fell off the feed's retention window. The gap
    /// cannot be streamed, so every handler of the source is flagged for a
    /// full rebuild and the baseline moves to the current tail; the scan
    /// that follows covers everything up to it.
    async fn rebaseline_expired(
        &self,
        source: &SourceType,
    ) -> Result<tokio::sync::mpsc::Receiver<ChangeEvent>> {
        for handler in self.registry.handlers_for(source) {
            self.store
                .save_version_state(&IndexVersionState {
                    handler_id: handler.handler_id().to_string(),
                    synced_schema_version: handler.schema_version().to_string(),
                    needs_full_rebuild: true,
                })
                .await?;
        }

        let latest = self.feed.latest_token(source).await?;
        if let Some(token) = latest.as_deref() {
            self.store.save_resume_token(source, token).await?;
        }
        tracing::warn!(
            "Resume position for '{}' expired, rebaselined to {} with full rebuild",
            source,
            latest.as_deref().unwrap_or("<beginning>")
        );
        self.feed.subscribe(source, latest.as_deref()).await
    }

    async fn rebuild_and_swap(
        &self,
        stale: &[Arc<dyn IndexHandler>],
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let mut generations = Vec::with_capacity(stale.len());
        for handler in stale {
            match self.rebuild_handler(handler.as_ref(), cancel).await {
                Ok(generation) => generations.push((Arc::clone(handler), generation)),
                Err(e) => {
                    // Nothing was swapped yet, so every generation built for
                    // the earlier handlers is unreachable; discard them all.
                    for (_, generation) in generations {
                        if let Err(del) = self.search.delete_index(&generation).await {
                            tracing::warn!(
                                "Failed to discard unswapped generation {}: {}",
                                generation,
                                del
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }

        // Swaps happen only after every stale handler rebuilt, so a failure
        // midway leaves all aliases on their old generations.
        let mut rebuilt = Vec::with_capacity(generations.len());
        for (handler, generation) in generations {
            let old = self.search.swap_alias(handler.alias(), &generation).await?;
            tracing::info!(
                "Alias '{}' now serves {} (was {:?})",
                handler.alias(),
                generation,
                old
            );
            for old_generation in old {
                if let Err(e) = self.search.delete_index(&old_generation).await {
                    // An orphaned generation wastes space but breaks nothing.
                    tracing::warn!("Failed to delete old generation {}: {}", old_generation, e);
                }
            }
            rebuilt.push(handler.handler_id().to_string());
        }
        Ok(rebuilt)
    }

    /// Stream every entity of the handler's source types into a fresh
    /// generation index. Any persistent document failure discards the
    /// generation and leaves the version state untouched so the next leader
    /// retries.
    async fn rebuild_handler(
        &self,
        handler: &dyn IndexHandler,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let generation = format!(
            "{}_{}_{}",
            handler.alias(),
            handler.schema_version(),
            uuid::Uuid::new_v4().simple()
        );
        self.search
            .create_index(&generation, &handler.index_schema())
            .await?;

        match self.fill_generation(handler, &generation, cancel).await {
            Ok((indexed, skipped)) => {
                tracing::info!(
                    "Rebuilt {} into {}: {} documents, {} renderless entities",
                    handler.handler_id(),
                    generation,
                    indexed,
                    skipped
                );
                Ok(generation)
            }
            Err(e) => {
                if let Err(del) = self.search.delete_index(&generation).await {
                    tracing::warn!("Failed to discard aborted generation {}: {}", generation, del);
                }
                match e {
                    SyncError::Cancelled => Err(SyncError::Cancelled),
                    other => Err(SyncError::RebuildAborted {
                        handler: handler.handler_id().to_string(),
                        reason: other.to_string(),
                    }),
                }
            }
        }
    }

    async fn fill_generation(
        &self,
        handler: &dyn IndexHandler,
        generation: &str,
        cancel: &CancellationToken,
    ) -> Result<(u64, u64)> {
        let mut indexed = 0u64;
        let mut skipped = 0u64;

        for source in handler.source_types() {
            let mut rx = self.reader.scan_all(source).await?;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                    maybe = rx.recv() => {
                        let Some(entity) = maybe else { break };
                        match handler.render(&entity) {
                            Some(doc) => {
                                self.upsert_with_retry(generation, &doc).await?;
                                indexed += 1;
                            }
                            // Entity has nothing for this view: no-op.
                            None => skipped += 1,
                        }
                    }
                }
            }
        }
        Ok((indexed, skipped))
    }

    async fn upsert_with_retry(&self, generation: &str, doc: &IndexDocument) -> Result<()> {
        let mut attempt = 1u32;
        loop {
            match self.search.upsert(generation, &doc.id, &doc.body).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.config.max_apply_attempts => {
                    tracing::warn!(
                        "Bulk upsert of {} into {} failed (attempt {}): {}",
                        doc.id,
                        generation,
                        attempt,
                        e
                    );
                    tokio::time::sleep(self.config.retry_backoff() * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// First event per source type seen while a rebuild window is open, in
/// arrival order, plus a count of everything else observed and discarded.
struct SideBuffer {
    first_events: Mutex<Vec<ChangeEvent>>,
    seen: DashMap<SourceType, ()>,
    observed: AtomicU64,
}

impl SideBuffer {
    fn new() -> Self {
        SideBuffer {
            first_events: Mutex::new(Vec::new()),
            seen: DashMap::new(),
            observed: AtomicU64::new(0),
        }
    }

    fn observe(&self, event: ChangeEvent) {
        self.observed.fetch_add(1, Ordering::SeqCst);
        if self.seen.insert(event.source_type.clone(), ()).is_none() {
            self.first_events.lock().unwrap().push(event);
        }
    }

    fn take(&self) -> (Vec<ChangeEvent>, u64) {
        let events = std::mem::take(&mut *self.first_events.lock().unwrap());
        (events, self.observed.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{now_ms, ChangeType};

    fn event(source: &str, entity: &str, token: &str) -> ChangeEvent {
        ChangeEvent {
            source_type: source.to_string(),
            change_type: ChangeType::Update,
            entity_id: entity.to_string(),
            payload: serde_json::json!({}),
            resume_token: token.to_string(),
            timestamp_ms: now_ms(),
        }
    }

    #[test]
    fn test_side_buffer_keeps_first_event_per_type() {
        let buffer = SideBuffer::new();
        buffer.observe(event("widget", "w1", "t1"));
        buffer.observe(event("widget", "w2", "t2"));
        buffer.observe(event("gadget", "g1", "t1"));
        buffer.observe(event("widget", "w3", "t3"));

        let (events, observed) = buffer.take();
        assert_eq!(observed, 4);
        let ids: Vec<&str> = events.iter().map(|e| e.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["w1", "g1"]);
    }
}
