use serde::{Deserialize, Serialize};

/// Watched source-entity type in the primary store — a plain string like `"widget"`.
pub type SourceType = String;
/// Identifier of an entity in the primary store.
pub type EntityId = String;
/// Identifier of a document in the search engine.
pub type DocumentId = String;
/// Opaque, totally-ordered position marker in a change feed, per source type.
/// The engine never inspects tokens; it persists them and hands them back.
pub type ResumeToken = String;

/// Kind of change carried by a [`ChangeEvent`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
    /// The entity must be re-read or dropped; the payload may be partial.
    Invalidate,
}

/// A single notification from the upstream change feed. Immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub source_type: SourceType,
    pub change_type: ChangeType,
    pub entity_id: EntityId,
    pub payload: serde_json::Value,
    pub resume_token: ResumeToken,
    pub timestamp_ms: i64,
}

/// An entity streamed out of the primary store during a bulk scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEntity {
    pub id: EntityId,
    pub data: serde_json::Value,
}

/// Handler-defined projection of a source entity into the shape the search
/// engine stores. Must be derivable purely from the entity so that bulk
/// rebuild and incremental update produce identical documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDocument {
    pub id: DocumentId,
    pub body: serde_json::Value,
}

/// Per-handler record of which schema version the live index was built with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexVersionState {
    pub handler_id: String,
    pub synced_schema_version: String,
    pub needs_full_rebuild: bool,
}

/// One row per lock name; the unique key makes the insert race pick a single
/// winner. Renewed in place by the holder's heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockDocument {
    pub name: String,
    pub holder_id: String,
    pub heartbeat_at_ms: i64,
    pub acquired_at_ms: i64,
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
