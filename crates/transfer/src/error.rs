//! Transfer orchestration errors.

use skyhop_engine::EngineError;

/// Errors that terminate a batch stream.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("before-start step failed: {0}")]
    BeforeStart(String),

    #[error("worker error: {0}")]
    Worker(String),
}

impl TransferError {
    /// The wrapped engine error, if this failure came from the engine.
    pub fn engine_error(&self) -> Option<&EngineError> {
        match self {
            Self::Engine(e) => Some(e),
            _ => None,
        }
    }
}
