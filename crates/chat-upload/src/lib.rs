//! Files sent in a chat before their upload finished.
//!
//! Each file becomes a [`PendingAttachment`] that survives restarts. Its
//! upload is tagged with the attachment id so that the monitor started by
//! [`ChatUploader::spawn_monitor`] can attach the uploaded node to the chat
//! long after the foreground flow returned.

mod error;
mod model;
mod store;
mod uploader;

pub use error::{ChatUploadError, StoreError};
pub use model::{AttachmentState, PendingAttachment};
pub use store::{AttachmentStore, JsonAttachmentStore, MemoryAttachmentStore};
pub use uploader::{ChatUploader, MonitorHandle};
