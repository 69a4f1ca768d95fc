//! Error types for the model crate.

use thiserror::Error;

/// Result type for model operations.
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors raised while interpreting model values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    /// Entity kind string was neither queue nor machine
    #[error("unknown entity kind: {0}")]
    UnknownKind(String),
}
