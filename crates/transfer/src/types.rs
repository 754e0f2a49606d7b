//! Batch-level types emitted by the coordinator and pipelines.

use std::fmt;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::{Duration, SystemTime};

use futures_util::Stream;
use skyhop_engine::{NodeId, TransferEvent};

use crate::error::TransferError;

/// Stream of batch events; ends after the batch completes or fails.
pub type BatchStream = Pin<Box<dyn Stream<Item = Result<BatchEvent, TransferError>> + Send>>;

/// Caller-chosen key correlating engine events back to an input item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey(pub String);

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ItemKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A unit handed to the coordinator.
pub trait TransferItem: Send + Sync + 'static {
    fn key(&self) -> ItemKey;
}

/// A local file or folder to upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadItem {
    pub path: PathBuf,
    pub name: Option<String>,
    pub mtime: Option<SystemTime>,
}

impl UploadItem {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            name: None,
            mtime: None,
        }
    }
}

impl TransferItem for UploadItem {
    fn key(&self) -> ItemKey {
        ItemKey(self.path.display().to_string())
    }
}

/// A remote node to download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadItem {
    pub node: NodeId,
    /// Expected size, used by the local space precheck.
    pub size: u64,
}

impl TransferItem for DownloadItem {
    fn key(&self) -> ItemKey {
        ItemKey(self.node.to_string())
    }
}

/// A resource the batch is short of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceShortage {
    LocalStorage { required: u64, available: u64 },
    StorageQuota,
    TransferQuota,
}

/// Running totals over the whole batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchTotals {
    /// Sum of bytes transferred over root transfers. Never decreases.
    pub bytes_transferred: u64,
    /// Sum of bytes to transfer over root transfers. Never decreases.
    pub bytes_total: u64,
    /// Distinct file transfers started, folder children included.
    pub files_started: usize,
    /// Distinct file transfers skipped because the target already existed.
    pub files_already_transferred: usize,
    /// Input items whose root transfer was an already-transferred shortcut.
    pub already_transferred_keys: Vec<ItemKey>,
    pub all_items_scanned: bool,
    /// Sliding-window throughput estimate.
    pub bytes_per_second: f64,
}

impl BatchTotals {
    /// Fraction in `[0, 1]`; zero until a total is known.
    pub fn progress(&self) -> f64 {
        if self.bytes_total == 0 {
            return 0.0;
        }
        (self.bytes_transferred as f64 / self.bytes_total as f64).min(1.0)
    }

    /// Estimated time until every known byte is transferred.
    pub fn eta(&self) -> Option<Duration> {
        if self.bytes_per_second <= 0.0 {
            return None;
        }
        let remaining = self.bytes_total.saturating_sub(self.bytes_transferred);
        Some(Duration::from_secs_f64(
            remaining as f64 / self.bytes_per_second,
        ))
    }
}

/// Event emitted on a batch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchEvent {
    /// An engine event for one input item, with the batch totals after it.
    Item {
        key: ItemKey,
        event: TransferEvent,
        totals: BatchTotals,
    },
    /// The item vanished before its transfer started.
    ItemRejected { key: ItemKey, reason: String },
    InsufficientResources(ResourceShortage),
    /// Every input item finished its scanning phase.
    AllItemsScanned,
}

impl BatchEvent {
    pub fn is_all_items_scanned(&self) -> bool {
        matches!(self, Self::AllItemsScanned)
    }
}
