//! Streaming phase: resume every watched change stream from its committed
//! token, forward into one bounded queue, and run the single-consumer
//! processor until cancelled or poisoned. Phase transitions are published on
//! a watch channel for health checks.

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::feed::ChangeFeed;
use crate::handler::HandlerRegistry;
use crate::store::StateStore;
use crate::sync::processor::ChangeEventProcessor;
use crate::types::{ChangeEvent, IndexVersionState};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Starting,
    Subscribing,
    Streaming,
    Draining,
    Failed,
    Stopped,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncPhase::Starting => "starting",
            SyncPhase::Subscribing => "subscribing",
            SyncPhase::Streaming => "streaming",
            SyncPhase::Draining => "draining",
            SyncPhase::Failed => "failed",
            SyncPhase::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

pub struct RealtimeSyncCoordinator {
    registry: Arc<HandlerRegistry>,
    store: Arc<dyn StateStore>,
    feed: Arc<dyn ChangeFeed>,
    processor: Arc<ChangeEventProcessor>,
    queue_capacity: usize,
    phase_tx: watch::Sender<SyncPhase>,
}

impl RealtimeSyncCoordinator {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        store: Arc<dyn StateStore>,
        feed: Arc<dyn ChangeFeed>,
        processor: Arc<ChangeEventProcessor>,
        config: &SyncConfig,
    ) -> Self {
        let (phase_tx, _) = watch::channel(SyncPhase::Starting);
        RealtimeSyncCoordinator {
            registry,
            store,
            feed,
            processor,
            queue_capacity: config.queue_capacity,
            phase_tx,
        }
    }

    pub fn phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase_tx.subscribe()
    }

    pub fn current_phase(&self) -> SyncPhase {
        *self.phase_tx.borrow()
    }

    fn set_phase(&self, phase: SyncPhase) {
        if *self.phase_tx.borrow() != phase {
            tracing::info!("Realtime sync phase: {}", phase);
            let _ = self.phase_tx.send_replace(phase);
        }
    }

    /// Stream until `cancel` fires (returns `Ok`) or the processor halts on
    /// a poison event or store failure (returns the error, phase `Failed`).
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        self.set_phase(SyncPhase::Subscribing);

        let (tx, mut rx) = mpsc::channel::<ChangeEvent>(self.queue_capacity);
        let mut forwarders = Vec::new();
        for source in self.registry.watched_source_types() {
            let from = self.store.load_resume_token(&source).await?;
            let mut sub = match self.feed.subscribe(&source, from.as_deref()).await {
                Ok(sub) => sub,
                Err(SyncError::TokenTooOld(_)) => {
                    self.flag_rebuild_for(&source).await?;
                    self.fail_subscriptions(cancel, forwarders).await;
                    return Err(SyncError::TokenTooOld(source));
                }
                Err(e) => {
                    self.fail_subscriptions(cancel, forwarders).await;
                    return Err(e);
                }
            };
            tracing::info!(
                "Subscribed to '{}' from {}",
                source,
                from.as_deref().unwrap_or("<beginning>")
            );

            let tx = tx.clone();
            let cancel = cancel.clone();
            forwarders.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        maybe = sub.recv() => {
                            let Some(event) = maybe else { return };
                            // Blocks when the queue is full; backpressure
                            // reaches the feed through this buffer.
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }));
        }
        // Only forwarder clones keep the queue open from here on.
        drop(tx);

        self.set_phase(SyncPhase::Streaming);
        let outcome = self.processor.run(&mut rx, cancel).await;

        self.set_phase(if outcome.is_ok() {
            SyncPhase::Draining
        } else {
            SyncPhase::Failed
        });
        cancel.cancel();
        for forwarder in forwarders {
            let _ = forwarder.await;
        }

        if outcome.is_ok() {
            self.set_phase(SyncPhase::Stopped);
        }
        outcome
    }

    async fn fail_subscriptions(
        &self,
        cancel: &CancellationToken,
        forwarders: Vec<tokio::task::JoinHandle<()>>,
    ) {
        self.set_phase(SyncPhase::Failed);
        cancel.cancel();
        for forwarder in forwarders {
            let _ = forwarder.await;
        }
    }

    /// A token older than the feed retains cannot be caught up by streaming;
    /// every handler of the source must rebuild from the primary store.
    async fn flag_rebuild_for(&self, source: &str) -> Result<()> {
        for handler in self.registry.handlers_for(source) {
            let state = self.store.load_version_state(handler.handler_id()).await?;
            self.store
                .save_version_state(&IndexVersionState {
                    handler_id: handler.handler_id().to_string(),
                    synced_schema_version: state
                        .map(|s| s.synced_schema_version)
                        .unwrap_or_else(|| handler.schema_version().to_string()),
                    needs_full_rebuild: true,
                })
                .await?;
            tracing::warn!(
                "Resume token for '{}' too old, flagged {} for full rebuild",
                source,
                handler.handler_id()
            );
        }
        Ok(())
    }
}
