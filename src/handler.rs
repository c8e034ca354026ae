//! Handler-registration contract implemented by every index owner, and the
//! explicit registry the supervisor is constructed with.

use crate::error::Result;
use crate::types::{ChangeEvent, IndexDocument, SourceEntity, SourceType};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

/// One derived search index: which source types feed it, how an entity is
/// rendered into a document, and how a live change event is applied.
///
/// `render` must be a pure projection of the entity so that bulk rebuild and
/// incremental apply produce identical documents. `apply` must be
/// idempotent — duplicate delivery of the same event is harmless by
/// contract.
#[async_trait]
pub trait IndexHandler: Send + Sync {
    /// Stable identifier persisted in version-state rows. Never derive
    /// behavior from this string; it is only a registry key.
    fn handler_id(&self) -> &str;

    /// The live logical index name readers query.
    fn alias(&self) -> &str;

    /// Declared schema version; a mismatch with the persisted synced
    /// version triggers a full rebuild.
    fn schema_version(&self) -> &str;

    /// Schema passed to `create_index` for new generations.
    fn index_schema(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    fn source_types(&self) -> &[SourceType];

    /// Project an entity into its index document. `None` means the entity
    /// has nothing to contribute to this view — a no-op, not a failure.
    fn render(&self, entity: &SourceEntity) -> Option<IndexDocument>;

    /// Apply one live change event to the index (through the alias).
    async fn apply(&self, event: &ChangeEvent) -> Result<()>;
}

/// Explicitly constructed handler registry; there is no global state and no
/// reconstruction of handlers from persisted type names.
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn IndexHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        HandlerRegistry {
            handlers: Vec::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn IndexHandler>) {
        self.handlers.push(handler);
    }

    pub fn with_handlers(handlers: Vec<Arc<dyn IndexHandler>>) -> Self {
        HandlerRegistry { handlers }
    }

    pub fn handlers(&self) -> &[Arc<dyn IndexHandler>] {
        &self.handlers
    }

    pub fn by_id(&self, handler_id: &str) -> Option<Arc<dyn IndexHandler>> {
        self.handlers
            .iter()
            .find(|h| h.handler_id() == handler_id)
            .cloned()
    }

    /// Handlers whose subscription set contains `source_type`.
    pub fn handlers_for(&self, source_type: &str) -> Vec<Arc<dyn IndexHandler>> {
        self.handlers
            .iter()
            .filter(|h| h.source_types().iter().any(|t| t == source_type))
            .cloned()
            .collect()
    }

    /// Union of every handler's subscription set, in stable order.
    pub fn watched_source_types(&self) -> Vec<SourceType> {
        let set: BTreeSet<SourceType> = self
            .handlers
            .iter()
            .flat_map(|h| h.source_types().iter().cloned())
            .collect();
        set.into_iter().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
