//! Opaque document-indexing API of the search engine.
//!
//! Physical indices are versioned generations; readers go through a stable
//! alias that is atomically repointed when a rebuild completes. The
//! in-memory implementation backs the integration tests.

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[async_trait]
pub trait SearchIndexClient: Send + Sync {
    async fn create_index(&self, index: &str, schema: &serde_json::Value) -> Result<()>;

    async fn delete_index(&self, index: &str) -> Result<()>;

    /// Idempotent write: upserting the same document twice is a no-op.
    async fn upsert(&self, index: &str, doc_id: &str, doc: &serde_json::Value) -> Result<()>;

    /// Idempotent delete: a missing document is not an error.
    async fn delete(&self, index: &str, doc_id: &str) -> Result<()>;

    async fn attach_alias(&self, alias: &str, index: &str) -> Result<()>;

    async fn detach_alias(&self, alias: &str, index: &str) -> Result<()>;

    /// Atomically repoint `alias` to `new_index`, returning the previously
    /// attached physical indices. Readers observe either the fully-old or
    /// fully-new generation, never a mix.
    async fn swap_alias(&self, alias: &str, new_index: &str) -> Result<Vec<String>>;

    async fn resolve_alias(&self, alias: &str) -> Result<Vec<String>>;
}

/// DashMap-backed [`SearchIndexClient`]. Aliases resolve at operation time,
/// so writes issued against an alias land in whichever generation is live.
pub struct MemorySearchIndex {
    indices: DashMap<String, DashMap<String, serde_json::Value>>,
    aliases: Mutex<HashMap<String, Vec<String>>>,
    fail_upserts: AtomicUsize,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        MemorySearchIndex {
            indices: DashMap::new(),
            aliases: Mutex::new(HashMap::new()),
            fail_upserts: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` upserts fail, for rebuild-abort tests.
    pub fn fail_next_upserts(&self, n: usize) {
        self.fail_upserts.store(n, Ordering::SeqCst);
    }

    fn physical(&self, name: &str) -> String {
        let aliases = self.aliases.lock().unwrap();
        match aliases.get(name).and_then(|targets| targets.first()) {
            Some(target) => target.clone(),
            None => name.to_string(),
        }
    }

    /// Number of documents visible through an alias or physical index name.
    pub fn count(&self, name: &str) -> usize {
        let physical = self.physical(name);
        self.indices.get(&physical).map(|idx| idx.len()).unwrap_or(0)
    }

    pub fn get(&self, name: &str, doc_id: &str) -> Option<serde_json::Value> {
        let physical = self.physical(name);
        self.indices
            .get(&physical)
            .and_then(|idx| idx.get(doc_id).map(|d| d.value().clone()))
    }

    pub fn index_exists(&self, index: &str) -> bool {
        self.indices.contains_key(index)
    }

    pub fn index_names(&self) -> Vec<String> {
        self.indices.iter().map(|e| e.key().clone()).collect()
    }
}

impl Default for MemorySearchIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SearchIndexClient for MemorySearchIndex {
    async fn create_index(&self, index: &str, _schema: &serde_json::Value) -> Result<()> {
        self.indices.insert(index.to_string(), DashMap::new());
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> Result<()> {
        self.indices.remove(index);
        Ok(())
    }

    async fn upsert(&self, index: &str, doc_id: &str, doc: &serde_json::Value) -> Result<()> {
        let remaining = self.fail_upserts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_upserts.store(remaining - 1, Ordering::SeqCst);
            return Err(SyncError::transient("upsert", "injected failure"));
        }

        let physical = self.physical(index);
        // Auto-create on first write, like the real engine does.
        self.indices
            .entry(physical)
            .or_insert_with(DashMap::new)
            .insert(doc_id.to_string(), doc.clone());
        Ok(())
    }

    async fn delete(&self, index: &str, doc_id: &str) -> Result<()> {
        let physical = self.physical(index);
        if let Some(idx) = self.indices.get(&physical) {
            idx.remove(doc_id);
        }
        Ok(())
    }

    async fn attach_alias(&self, alias: &str, index: &str) -> Result<()> {
        let mut aliases = self.aliases.lock().unwrap();
        let targets = aliases.entry(alias.to_string()).or_default();
        if !targets.iter().any(|t| t == index) {
            targets.push(index.to_string());
        }
        Ok(())
    }

    async fn detach_alias(&self, alias: &str, index: &str) -> Result<()> {
        let mut aliases = self.aliases.lock().unwrap();
        if let Some(targets) = aliases.get_mut(alias) {
            targets.retain(|t| t != index);
        }
        Ok(())
    }

    async fn swap_alias(&self, alias: &str, new_index: &str) -> Result<Vec<String>> {
        let mut aliases = self.aliases.lock().unwrap();
        let old = aliases
            .insert(alias.to_string(), vec![new_index.to_string()])
            .unwrap_or_default();
        Ok(old.into_iter().filter(|t| t != new_index).collect())
    }

    async fn resolve_alias(&self, alias: &str) -> Result<Vec<String>> {
        let aliases = self.aliases.lock().unwrap();
        Ok(aliases.get(alias).cloned().unwrap_or_default())
    }
}
