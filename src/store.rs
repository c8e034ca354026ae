//! Persistence seam for resume tokens, index version state, and the leader
//! lock. Backed by the same primary database the engine reads from; the
//! in-memory implementation exists for tests and embedded use.

use crate::error::{Result, SyncError};
use crate::types::{now_ms, IndexVersionState, LockDocument, ResumeToken, SourceType};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Outcome of a lock-row insert race. Modeled explicitly instead of catching
/// a duplicate-key error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockInsert {
    Acquired,
    AlreadyHeld,
}

/// Upsert/compare-and-swap access to the three state collections. All writes
/// are atomic at the datastore layer; the engine never assumes in-process
/// mutual exclusion across fleet instances.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_resume_token(&self, source_type: &str) -> Result<Option<ResumeToken>>;

    /// Upsert, so there is always a valid row even on first write.
    async fn save_resume_token(&self, source_type: &str, token: &str) -> Result<()>;

    async fn load_version_state(&self, handler_id: &str) -> Result<Option<IndexVersionState>>;

    async fn save_version_state(&self, state: &IndexVersionState) -> Result<()>;

    /// Insert the lock row; the unique key enforces a single winner. A row
    /// whose heartbeat is older than the store's lock TTL counts as reaped.
    async fn insert_lock(&self, lock: &LockDocument) -> Result<LockInsert>;

    async fn read_lock(&self, name: &str) -> Result<Option<LockDocument>>;

    /// Renew the heartbeat timestamp iff `holder_id` still owns the row.
    /// Returns false when the row is missing or owned by someone else.
    async fn refresh_lock(&self, name: &str, holder_id: &str, heartbeat_at_ms: i64)
        -> Result<bool>;

    /// Delete the lock row iff `holder_id` still owns it.
    async fn delete_lock(&self, name: &str, holder_id: &str) -> Result<bool>;
}

/// DashMap-backed [`StateStore`]. Lock TTL emulates the primary store's
/// expiring-index reaper: a stale row is replaced on the next insert attempt
/// rather than deleted in the background.
pub struct MemoryStateStore {
    resume: DashMap<SourceType, ResumeToken>,
    versions: DashMap<String, IndexVersionState>,
    locks: DashMap<String, LockDocument>,
    lock_ttl_ms: i64,
    fail_refreshes: AtomicUsize,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::with_lock_ttl_ms(70_000)
    }

    pub fn with_lock_ttl_ms(lock_ttl_ms: i64) -> Self {
        MemoryStateStore {
            resume: DashMap::new(),
            versions: DashMap::new(),
            locks: DashMap::new(),
            lock_ttl_ms,
            fail_refreshes: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` heartbeat refreshes fail, for abdication tests.
    pub fn fail_next_refreshes(&self, n: usize) {
        self.fail_refreshes.store(n, Ordering::SeqCst);
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load_resume_token(&self, source_type: &str) -> Result<Option<ResumeToken>> {
        Ok(self.resume.get(source_type).map(|r| r.value().clone()))
    }

    async fn save_resume_token(&self, source_type: &str, token: &str) -> Result<()> {
        self.resume
            .insert(source_type.to_string(), token.to_string());
        Ok(())
    }

    async fn load_version_state(&self, handler_id: &str) -> Result<Option<IndexVersionState>> {
        Ok(self.versions.get(handler_id).map(|r| r.value().clone()))
    }

    async fn save_version_state(&self, state: &IndexVersionState) -> Result<()> {
        self.versions.insert(state.handler_id.clone(), state.clone());
        Ok(())
    }

    async fn insert_lock(&self, lock: &LockDocument) -> Result<LockInsert> {
        let now = now_ms();
        let ttl = self.lock_ttl_ms;

        // Entry API keeps the check-then-insert race-free within this store.
        let mut outcome = LockInsert::AlreadyHeld;
        self.locks
            .entry(lock.name.clone())
            .and_modify(|existing| {
                if now - existing.heartbeat_at_ms > ttl {
                    *existing = lock.clone();
                    outcome = LockInsert::Acquired;
                }
            })
            .or_insert_with(|| {
                outcome = LockInsert::Acquired;
                lock.clone()
            });

        Ok(outcome)
    }

    async fn read_lock(&self, name: &str) -> Result<Option<LockDocument>> {
        Ok(self.locks.get(name).map(|r| r.value().clone()))
    }

    async fn refresh_lock(
        &self,
        name: &str,
        holder_id: &str,
        heartbeat_at_ms: i64,
    ) -> Result<bool> {
        let remaining = self.fail_refreshes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_refreshes.store(remaining - 1, Ordering::SeqCst);
            return Err(SyncError::transient("lock refresh", "injected failure"));
        }

        let mut renewed = false;
        if let Some(mut entry) = self.locks.get_mut(name) {
            if entry.holder_id == holder_id {
                entry.heartbeat_at_ms = heartbeat_at_ms;
                renewed = true;
            }
        }
        Ok(renewed)
    }

    async fn delete_lock(&self, name: &str, holder_id: &str) -> Result<bool> {
        Ok(self
            .locks
            .remove_if(name, |_, doc| doc.holder_id == holder_id)
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_doc(name: &str, holder: &str) -> LockDocument {
        let now = now_ms();
        LockDocument {
            name: name.to_string(),
            holder_id: holder.to_string(),
            heartbeat_at_ms: now,
            acquired_at_ms: now,
        }
    }

    #[tokio::test]
    async fn test_resume_token_upsert() {
        let store = MemoryStateStore::new();
        assert_eq!(store.load_resume_token("widget").await.unwrap(), None);

        store.save_resume_token("widget", "t1").await.unwrap();
        store.save_resume_token("widget", "t2").await.unwrap();
        assert_eq!(
            store.load_resume_token("widget").await.unwrap(),
            Some("t2".to_string())
        );
    }

    #[tokio::test]
    async fn test_lock_insert_single_winner() {
        let store = MemoryStateStore::new();
        let a = store.insert_lock(&lock_doc("sync", "a")).await.unwrap();
        let b = store.insert_lock(&lock_doc("sync", "b")).await.unwrap();

        assert_eq!(a, LockInsert::Acquired);
        assert_eq!(b, LockInsert::AlreadyHeld);
        assert_eq!(
            store.read_lock("sync").await.unwrap().unwrap().holder_id,
            "a"
        );
    }

    #[tokio::test]
    async fn test_lock_stale_row_reclaimed() {
        let store = MemoryStateStore::with_lock_ttl_ms(100);
        let mut stale = lock_doc("sync", "dead");
        stale.heartbeat_at_ms = now_ms() - 1_000;
        store.locks.insert("sync".to_string(), stale);

        let b = store.insert_lock(&lock_doc("sync", "b")).await.unwrap();
        assert_eq!(b, LockInsert::Acquired);
        assert_eq!(
            store.read_lock("sync").await.unwrap().unwrap().holder_id,
            "b"
        );
    }

    #[tokio::test]
    async fn test_refresh_and_delete_check_holder() {
        let store = MemoryStateStore::new();
        store.insert_lock(&lock_doc("sync", "a")).await.unwrap();

        assert!(store.refresh_lock("sync", "a", now_ms()).await.unwrap());
        assert!(!store.refresh_lock("sync", "b", now_ms()).await.unwrap());
        assert!(!store.delete_lock("sync", "b").await.unwrap());
        assert!(store.delete_lock("sync", "a").await.unwrap());
        assert!(store.read_lock("sync").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_refresh_failures() {
        let store = MemoryStateStore::new();
        store.insert_lock(&lock_doc("sync", "a")).await.unwrap();
        store.fail_next_refreshes(1);

        let err = store.refresh_lock("sync", "a", now_ms()).await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.refresh_lock("sync", "a", now_ms()).await.unwrap());
    }
}
