//! Error types for diagram synchronization.

use thiserror::Error;

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while synchronizing the diagram.
///
/// Most of these never reach a caller: decode failures and stale references
/// are logged and dropped at the component that sees them.
#[derive(Debug, Error)]
pub enum Error {
    /// Payload could not be decoded
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Event kind outside the known vocabulary
    #[error("unknown event kind: {0}")]
    UnknownEvent(String),

    /// Invalid configuration value
    #[error("configuration error: {0}")]
    Config(String),

    /// Request refused by the backend or by local validation
    #[error("rejected: {0}")]
    Rejected(String),

    /// Referenced entity or snapshot does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Transport failure
    #[error("transport error: {0}")]
    Transport(String),
}
