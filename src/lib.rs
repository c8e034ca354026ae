//! # searchsync
//!
//! A search-index synchronization engine: keeps an external full-text
//! search index continuously consistent with a primary transactional
//! datastore. One elected leader per fleet runs a bulk catch-up (full
//! rebuild into a fresh generation index, promoted by an atomic alias
//! swap) followed by realtime change-stream tailing with crash-safe
//! resume tokens.
//!
//! The engine is storage- and search-backend-agnostic: implement
//! [`StateStore`], [`ChangeFeed`], [`EntityReader`], and
//! [`SearchIndexClient`] for your infrastructure, plus one
//! [`IndexHandler`] per search view. In-memory implementations of all
//! four seams are included for tests and embedded use.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use searchsync::{
//!     ChangeEvent, HandlerRegistry, IndexDocument, IndexHandler, MemoryChangeFeed,
//!     MemoryEntityReader, MemorySearchIndex, MemoryStateStore, SourceEntity,
//!     SyncConfig, SyncSupervisor,
//! };
//! use async_trait::async_trait;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! struct ProductSearch {
//!     sources: Vec<String>,
//! }
//!
//! #[async_trait]
//! impl IndexHandler for ProductSearch {
//!     fn handler_id(&self) -> &str { "product-search" }
//!     fn alias(&self) -> &str { "products" }
//!     fn schema_version(&self) -> &str { "v1" }
//!     fn source_types(&self) -> &[String] { &self.sources }
//!     fn render(&self, entity: &SourceEntity) -> Option<IndexDocument> {
//!         Some(IndexDocument { id: entity.id.clone(), body: entity.data.clone() })
//!     }
//!     async fn apply(&self, _event: &ChangeEvent) -> searchsync::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> searchsync::Result<()> {
//!     let handler: Arc<dyn IndexHandler> =
//!         Arc::new(ProductSearch { sources: vec!["product".to_string()] });
//!     let registry = Arc::new(HandlerRegistry::with_handlers(vec![handler]));
//!     let supervisor = SyncSupervisor::new(
//!         SyncConfig::default(),
//!         Arc::new(MemoryStateStore::new()),
//!         Arc::new(MemorySearchIndex::new()),
//!         Arc::new(MemoryChangeFeed::new()),
//!         Arc::new(MemoryEntityReader::new()),
//!         registry,
//!     );
//!
//!     let shutdown = CancellationToken::new();
//!     supervisor.run(&shutdown).await
//! }
//! ```
//!
//! Every instance in a fleet runs the same [`SyncSupervisor::run`] loop;
//! exactly one holds the distributed lock at a time, and the rest retry
//! until it crashes or releases.

pub mod config;
pub mod error;
pub mod executor;
pub mod feed;
pub mod handler;
pub mod lock;
pub mod search;
pub mod store;
pub mod sync;
pub mod types;

pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use executor::BoundedExecutor;
pub use feed::{ChangeFeed, EntityReader, MemoryChangeFeed, MemoryEntityReader};
pub use handler::{HandlerRegistry, IndexHandler};
pub use lock::{DistributedLock, LeaseHandle};
pub use search::{MemorySearchIndex, SearchIndexClient};
pub use store::{LockInsert, MemoryStateStore, StateStore};
pub use sync::{
    BulkSummary, BulkSyncCoordinator, ChangeEventProcessor, RealtimeSyncCoordinator, SyncPhase,
    SyncSupervisor,
};
pub use types::{ChangeEvent, ChangeType, IndexDocument, IndexVersionState, SourceEntity};
