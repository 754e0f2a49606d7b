//! Transfer model shared by the engine binding and the orchestration layer.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::app_data::AppData;
use crate::error::EngineError;

/// Engine-assigned identifier of one transfer.
pub type TransferTag = i32;

/// Remote node handle (file or folder in the cloud drive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Chat room identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatId(pub u64);

/// Chat message identifier returned when a node is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub u64);

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferKind {
    Upload,
    Download,
}

/// Progress stage reported by the engine for folder transfers.
///
/// File transfers stay at [`TransferStage::None`] for their whole life.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStage {
    #[default]
    None,
    /// Walking the folder tree.
    Scan,
    /// Creating the remote/local folder structure.
    CreateTree,
    /// Per-file transfers are running.
    TransferringFiles,
}

impl TransferStage {
    /// Maps the raw integer stage reported by engine bindings.
    ///
    /// Unknown values fall back to `None`.
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => Self::Scan,
            2 => Self::CreateTree,
            3 => Self::TransferringFiles,
            _ => Self::None,
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            Self::None => 0,
            Self::Scan => 1,
            Self::CreateTree => 2,
            Self::TransferringFiles => 3,
        }
    }
}

/// Snapshot of one transfer as seen in an engine event.
#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    pub tag: TransferTag,
    pub kind: TransferKind,
    pub file_name: String,
    /// Local source (uploads) or written destination (downloads).
    pub local_path: PathBuf,
    /// Remote node; known for downloads up front and for uploads once finished.
    pub node_id: Option<NodeId>,
    pub parent_node_id: Option<NodeId>,
    pub is_folder: bool,
    /// Tag of the folder transfer that spawned this one, if it is a child.
    pub folder_transfer_tag: Option<TransferTag>,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub stage: TransferStage,
    /// The engine skipped the bytes because the target already existed.
    pub is_already_transferred: bool,
    pub app_data: Vec<AppData>,
}

impl Transfer {
    /// A transfer with zeroed progress, used as a starting point by bindings.
    pub fn new(tag: TransferTag, kind: TransferKind, file_name: impl Into<String>) -> Self {
        Self {
            tag,
            kind,
            file_name: file_name.into(),
            local_path: PathBuf::new(),
            node_id: None,
            parent_node_id: None,
            is_folder: false,
            folder_transfer_tag: None,
            total_bytes: 0,
            transferred_bytes: 0,
            stage: TransferStage::None,
            is_already_transferred: false,
            app_data: Vec::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.folder_transfer_tag.is_none()
    }
}

/// Event emitted by the engine for one underlying transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Started {
        transfer: Transfer,
    },
    Updated {
        transfer: Transfer,
    },
    TemporaryError {
        transfer: Transfer,
        error: EngineError,
    },
    Finished {
        transfer: Transfer,
        error: Option<EngineError>,
    },
    FolderScanProgress {
        transfer: Transfer,
        files_pending: u64,
        folders_pending: u64,
        current_folder: Option<String>,
        current_leaf: Option<String>,
    },
}

impl TransferEvent {
    pub fn transfer(&self) -> &Transfer {
        match self {
            Self::Started { transfer }
            | Self::Updated { transfer }
            | Self::TemporaryError { transfer, .. }
            | Self::Finished { transfer, .. }
            | Self::FolderScanProgress { transfer, .. } => transfer,
        }
    }

    pub fn tag(&self) -> TransferTag {
        self.transfer().tag
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished { .. })
    }
}
