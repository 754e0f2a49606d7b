//! Pending chat attachment record.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skyhop_engine::{ChatId, NodeId, TransferTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttachmentState {
    Queued,
    Uploading,
    Attaching,
    ErrorUploading,
    ErrorAttaching,
}

impl AttachmentState {
    pub fn is_error(self) -> bool {
        matches!(self, Self::ErrorUploading | Self::ErrorAttaching)
    }

    /// An upload may be (re)started from this state.
    pub fn can_upload(self) -> bool {
        matches!(self, Self::Queued | Self::ErrorUploading)
    }
}

/// A file queued to be sent in a chat. Deleted once attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAttachment {
    pub id: i64,
    pub chat_id: ChatId,
    pub file_path: PathBuf,
    pub state: AttachmentState,
    pub transfer_tag: Option<TransferTag>,
    pub remote_node_id: Option<NodeId>,
    pub created_at: DateTime<Utc>,
}

impl PendingAttachment {
    pub fn new(id: i64, chat_id: ChatId, file_path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            chat_id,
            file_path: file_path.into(),
            state: AttachmentState::Queued,
            transfer_tag: None,
            remote_node_id: None,
            created_at: Utc::now(),
        }
    }
}
