//! Which engine stages mean "folder scanning is over".
//!
//! The boundary depends on the engine binding, so it is data rather than a
//! hard-coded match.

use serde::{Deserialize, Serialize};
use skyhop_engine::{Transfer, TransferStage};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanStagePolicy {
    /// Stages at which a folder transfer has left scanning.
    pub scan_complete_stages: Vec<TransferStage>,
}

impl Default for ScanStagePolicy {
    fn default() -> Self {
        Self {
            scan_complete_stages: vec![TransferStage::TransferringFiles],
        }
    }
}

impl ScanStagePolicy {
    /// An `Updated` snapshot of `transfer` ends its scanning phase.
    ///
    /// File transfers have no scanning phase, so any update counts.
    pub fn update_ends_scan(&self, transfer: &Transfer) -> bool {
        !transfer.is_folder || self.scan_complete_stages.contains(&transfer.stage)
    }
}
