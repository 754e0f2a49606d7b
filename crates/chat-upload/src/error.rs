//! Chat upload error types.

use skyhop_engine::EngineError;

use crate::model::AttachmentState;

/// Errors from the attachment store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("pending attachment not found: {0}")]
    NotFound(i64),
}

/// Errors from the chat upload pipeline.
///
/// Upload and attach failures are not errors: they are recorded on the
/// pending attachment. These cover only what prevents recording them.
#[derive(Debug, thiserror::Error)]
pub enum ChatUploadError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("attachment {id} is {state:?}, cannot {action}")]
    InvalidState {
        id: i64,
        state: AttachmentState,
        action: &'static str,
    },
}
