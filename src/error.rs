use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SyncError {
    #[error("Transient failure in {context}: {message}")]
    Transient { context: String, message: String },

    #[error("Poison event {source_type}/{entity_id} failed after {attempts} attempts: {message}")]
    PoisonEvent {
        source_type: String,
        entity_id: String,
        attempts: u32,
        message: String,
    },

    #[error("Rebuild aborted for handler '{handler}': {reason}")]
    RebuildAborted { handler: String, reason: String },

    #[error("Resume token too old for source type '{0}', full resync required")]
    TokenTooOld(String),

    #[error("Sync session cancelled")]
    Cancelled,

    #[error("State store error: {0}")]
    Store(String),

    #[error("Search engine error: {0}")]
    Search(String),

    #[error("Change feed error: {0}")]
    Feed(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Whether a call site should retry with backoff rather than give up.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient { .. })
    }

    pub fn transient(context: impl Into<String>, message: impl Into<String>) -> Self {
        SyncError::Transient {
            context: context.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Store(e.to_string())
    }
}
