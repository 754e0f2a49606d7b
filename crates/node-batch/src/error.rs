//! Node batch error types.

use skyhop_engine::EngineError;

/// Errors that abort a whole node batch.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    /// A quota or foreign-node failure that must be shown once for the
    /// batch. Raised after every item has finished.
    #[error("batch aborted: {0}")]
    Fatal(EngineError),

    #[error("invalid batch configuration: {0}")]
    Config(String),
}

impl BatchError {
    pub fn engine_error(&self) -> Option<&EngineError> {
        match self {
            Self::Fatal(e) => Some(e),
            Self::Config(_) => None,
        }
    }
}
