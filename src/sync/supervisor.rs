//! Top-level lifecycle: contend for the fleet-wide lock, then run bulk
//! catch-up followed by realtime streaming under one session token. Losing
//! the lease cancels the session mid-flight; shutdown and lease loss share
//! the same ordered teardown.

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::feed::{ChangeFeed, EntityReader};
use crate::handler::HandlerRegistry;
use crate::lock::DistributedLock;
use crate::search::SearchIndexClient;
use crate::store::StateStore;
use crate::sync::bulk::BulkSyncCoordinator;
use crate::sync::processor::ChangeEventProcessor;
use crate::sync::realtime::{RealtimeSyncCoordinator, SyncPhase};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub struct SyncSupervisor {
    config: SyncConfig,
    lock: DistributedLock,
    bulk: BulkSyncCoordinator,
    realtime: Arc<RealtimeSyncCoordinator>,
    is_leader: AtomicBool,
}

impl SyncSupervisor {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn StateStore>,
        search: Arc<dyn SearchIndexClient>,
        feed: Arc<dyn ChangeFeed>,
        reader: Arc<dyn EntityReader>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        let processor = Arc::new(ChangeEventProcessor::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            &config,
        ));
        let bulk = BulkSyncCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            search,
            Arc::clone(&feed),
            reader,
            Arc::clone(&processor),
            config.clone(),
        );
        let realtime = Arc::new(RealtimeSyncCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            feed,
            processor,
            &config,
        ));
        let lock = DistributedLock::new(store, &config);

        SyncSupervisor {
            config,
            lock,
            bulk,
            realtime,
            is_leader: AtomicBool::new(false),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    /// Phase of the realtime stage, `Starting` while not leading.
    pub fn phase(&self) -> watch::Receiver<SyncPhase> {
        self.realtime.phase()
    }

    /// True only while this instance holds the lock and the streaming loop
    /// has not failed.
    pub fn is_leader_and_healthy(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
            && self.realtime.current_phase() != SyncPhase::Failed
    }

    /// Contend for leadership until `shutdown` fires. A lost lease tears the
    /// session down and re-enters the contention loop; a poison event or
    /// store failure is fatal and propagates.
    pub async fn run(&self, shutdown: &CancellationToken) -> Result<()> {
        self.config.validate()?;
        tracing::info!(
            "Sync supervisor {} starting, contending for lock '{}'",
            self.config.instance_id,
            self.config.lock_name
        );

        loop {
            if shutdown.is_cancelled() {
                tracing::info!("Sync supervisor {} shut down", self.config.instance_id);
                return Ok(());
            }

            // Lease loss cancels this token; so does process shutdown.
            let session = shutdown.child_token();
            let lease = match self.lock.acquire(&session).await {
                Ok(lease) => lease,
                Err(SyncError::Cancelled) => continue,
                Err(e) => return Err(e),
            };

            self.is_leader.store(true, Ordering::SeqCst);
            let outcome = self.lead(&session).await;

            // Ordered teardown: stop all session work, then give the lock
            // up so a peer does not wait out the TTL.
            session.cancel();
            let lost = lease.is_lost();
            lease.release().await;
            self.is_leader.store(false, Ordering::SeqCst);

            match outcome {
                Ok(()) | Err(SyncError::Cancelled) => {
                    if lost {
                        tracing::warn!(
                            "Instance {} lost leadership, re-entering contention",
                            self.config.instance_id
                        );
                    }
                }
                // A too-old token already flagged the affected handlers for
                // a full rebuild; the next session performs it.
                Err(SyncError::TokenTooOld(source)) => {
                    tracing::warn!(
                        "Resume position for '{}' expired, restarting session with full rebuild",
                        source
                    );
                }
                Err(e) => {
                    tracing::error!("Sync session failed: {}", e);
                    return Err(e);
                }
            }
        }
    }

    async fn lead(&self, session: &CancellationToken) -> Result<()> {
        let summary = self.bulk.run(session).await?;
        if !summary.rebuilt.is_empty() {
            tracing::info!(
                "Leader {} finished bulk phase: {:?}",
                self.config.instance_id,
                summary.rebuilt
            );
        }
        self.realtime.run(session).await
    }
}
