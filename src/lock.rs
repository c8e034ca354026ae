//! Lease-based mutual exclusion on top of the primary datastore: one row per
//! lock name, a heartbeat renewal loop, and an independent monitor that
//! abdicates the moment the row is missing or stolen. Losing the lease
//! cancels the session token handed to [`DistributedLock::acquire`].

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::store::{LockInsert, StateStore};
use crate::types::{now_ms, LockDocument};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Consecutive heartbeat-write failures before the holder gives up
/// leadership rather than risking dual-leader writes.
const MAX_HEARTBEAT_FAILURES: u32 = 3;

pub struct DistributedLock {
    store: Arc<dyn StateStore>,
    name: String,
    holder_id: String,
    heartbeat_interval: Duration,
    acquire_retry_interval: Duration,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn StateStore>, config: &SyncConfig) -> Self {
        DistributedLock {
            store,
            name: config.lock_name.clone(),
            holder_id: config.instance_id.clone(),
            heartbeat_interval: config.heartbeat_interval(),
            acquire_retry_interval: config.acquire_retry_interval(),
        }
    }

    /// One insert attempt. `None` means another holder owns a live row.
    pub async fn try_acquire(&self, session: &CancellationToken) -> Result<Option<LeaseHandle>> {
        let now = now_ms();
        let doc = LockDocument {
            name: self.name.clone(),
            holder_id: self.holder_id.clone(),
            heartbeat_at_ms: now,
            acquired_at_ms: now,
        };

        match self.store.insert_lock(&doc).await? {
            LockInsert::Acquired => {
                tracing::info!("Acquired lock '{}' as {}", self.name, self.holder_id);
                Ok(Some(self.start_lease(session.clone())))
            }
            LockInsert::AlreadyHeld => Ok(None),
        }
    }

    /// Block until the lock is ours, retrying every configured interval.
    /// Cancelling `session` aborts the wait; losing the lease later cancels
    /// the same token.
    pub async fn acquire(&self, session: &CancellationToken) -> Result<LeaseHandle> {
        loop {
            if session.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            match self.try_acquire(session).await {
                Ok(Some(lease)) => return Ok(lease),
                Ok(None) => {}
                Err(e) if e.is_transient() => {
                    tracing::warn!("Lock insert for '{}' failed: {}, retrying", self.name, e);
                }
                Err(e) => return Err(e),
            }

            tokio::select! {
                _ = session.cancelled() => return Err(SyncError::Cancelled),
                _ = tokio::time::sleep(self.acquire_retry_interval) => {}
            }
        }
    }

    fn start_lease(&self, session: CancellationToken) -> LeaseHandle {
        let shared = Arc::new(LeaseShared {
            name: self.name.clone(),
            holder_id: self.holder_id.clone(),
            lost: AtomicBool::new(false),
            session,
            lease_cancel: CancellationToken::new(),
        });

        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&self.store),
            Arc::clone(&shared),
            self.heartbeat_interval,
        ));
        let monitor = tokio::spawn(monitor_loop(
            Arc::clone(&self.store),
            Arc::clone(&shared),
            self.heartbeat_interval,
        ));

        LeaseHandle {
            store: Arc::clone(&self.store),
            shared,
            tasks: vec![heartbeat, monitor],
        }
    }
}

struct LeaseShared {
    name: String,
    holder_id: String,
    lost: AtomicBool,
    session: CancellationToken,
    lease_cancel: CancellationToken,
}

impl LeaseShared {
    /// Fires at most once; cancelling the session is the `onLost` contract.
    fn mark_lost(&self, reason: &str) {
        if !self.lost.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                "Lease on '{}' lost for holder {}: {}",
                self.name,
                self.holder_id,
                reason
            );
            self.session.cancel();
            self.lease_cancel.cancel();
        }
    }
}

async fn heartbeat_loop(
    store: Arc<dyn StateStore>,
    shared: Arc<LeaseShared>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately; the row was just written.
    ticker.tick().await;

    let mut failures = 0u32;
    loop {
        tokio::select! {
            _ = shared.lease_cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match store
            .refresh_lock(&shared.name, &shared.holder_id, now_ms())
            .await
        {
            Ok(true) => failures = 0,
            Ok(false) => {
                shared.mark_lost("lock row missing or taken by another holder");
                return;
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(
                    "Heartbeat for '{}' failed ({}/{}): {}",
                    shared.name,
                    failures,
                    MAX_HEARTBEAT_FAILURES,
                    e
                );
                if failures >= MAX_HEARTBEAT_FAILURES {
                    shared.mark_lost("repeated heartbeat failures, giving up leadership");
                    return;
                }
            }
        }
    }
}

async fn monitor_loop(store: Arc<dyn StateStore>, shared: Arc<LeaseShared>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shared.lease_cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match store.read_lock(&shared.name).await {
            Ok(Some(doc)) if doc.holder_id == shared.holder_id => {}
            Ok(Some(_)) => {
                shared.mark_lost("lock row held by another holder");
                return;
            }
            Ok(None) => {
                shared.mark_lost("lock row deleted");
                return;
            }
            // Transient read errors are the heartbeat loop's problem to
            // escalate; the monitor only acts on definitive evidence.
            Err(e) => {
                tracing::warn!("Lock monitor read for '{}' failed: {}", shared.name, e);
            }
        }
    }
}

/// Live lease. Dropping the handle without calling [`LeaseHandle::release`]
/// leaves the row to expire via the store TTL (crash semantics).
pub struct LeaseHandle {
    store: Arc<dyn StateStore>,
    shared: Arc<LeaseShared>,
    tasks: Vec<JoinHandle<()>>,
}

impl LeaseHandle {
    pub fn holder_id(&self) -> &str {
        &self.shared.holder_id
    }

    pub fn is_lost(&self) -> bool {
        self.shared.lost.load(Ordering::SeqCst)
    }

    /// Stop renewing, wait for both loops, then delete the row so a peer
    /// can take over without waiting out the TTL.
    pub async fn release(mut self) {
        self.shared.lease_cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }

        if !self.is_lost() {
            match self
                .store
                .delete_lock(&self.shared.name, &self.shared.holder_id)
                .await
            {
                Ok(true) => {
                    tracing::info!("Released lock '{}'", self.shared.name);
                }
                Ok(false) => {
                    tracing::warn!("Lock '{}' was no longer ours at release", self.shared.name);
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to delete lock '{}' at release: {}, row will expire",
                        self.shared.name,
                        e
                    );
                }
            }
        }
    }
}

impl Drop for LeaseHandle {
    fn drop(&mut self) {
        // Stops renewal without deleting the row: the store TTL decides when
        // a peer may reclaim it, same as a process crash.
        self.shared.lease_cancel.cancel();
    }
}
