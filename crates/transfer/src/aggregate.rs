//! Batch-level bookkeeping behind the coordinator.
//!
//! Byte totals are summed over root transfers only, taking the per-tag
//! maximum seen so far so the sums never decrease. File counters cover every
//! non-folder transfer, root or folder child, counted once per tag.

use std::collections::{HashMap, HashSet};

use skyhop_engine::{EngineError, Transfer, TransferEvent, TransferTag};
use tracing::{debug, info, warn};

use crate::progress::SpeedCalculator;
use crate::stage::ScanStagePolicy;
use crate::types::{BatchEvent, BatchTotals, ItemKey, ResourceShortage};

#[derive(Debug, Default, Clone, Copy)]
struct RootBytes {
    total: u64,
    transferred: u64,
}

pub(crate) struct BatchTracker {
    keys: Vec<ItemKey>,
    policy: ScanStagePolicy,
    scanned: Vec<bool>,
    pending_scans: usize,
    scan_completed: bool,
    completion_unclaimed: bool,
    roots: HashMap<TransferTag, usize>,
    root_bytes: HashMap<TransferTag, RootBytes>,
    bytes_total: u64,
    bytes_transferred: u64,
    files_started: HashSet<TransferTag>,
    already_transferred: HashSet<TransferTag>,
    already_transferred_keys: Vec<ItemKey>,
    shortages: HashSet<ResourceShortage>,
    speed: SpeedCalculator,
}

impl BatchTracker {
    pub(crate) fn new(keys: Vec<ItemKey>, policy: ScanStagePolicy) -> Self {
        let count = keys.len();
        Self {
            keys,
            policy,
            scanned: vec![false; count],
            pending_scans: count,
            scan_completed: false,
            completion_unclaimed: false,
            roots: HashMap::new(),
            root_bytes: HashMap::new(),
            bytes_total: 0,
            bytes_transferred: 0,
            files_started: HashSet::new(),
            already_transferred: HashSet::new(),
            already_transferred_keys: Vec::new(),
            shortages: HashSet::new(),
            speed: SpeedCalculator::default(),
        }
    }

    pub(crate) fn key(&self, index: usize) -> &ItemKey {
        &self.keys[index]
    }

    pub(crate) fn all_scanned(&self) -> bool {
        self.scan_completed
    }

    /// Returns `true` exactly once, after the last item finished scanning.
    pub(crate) fn take_scan_completion(&mut self) -> bool {
        std::mem::take(&mut self.completion_unclaimed)
    }

    /// Completes scanning immediately for a batch without items.
    pub(crate) fn complete_if_empty(&mut self) -> Vec<BatchEvent> {
        if !self.keys.is_empty() || self.scan_completed {
            return Vec::new();
        }
        self.scan_completed = true;
        self.completion_unclaimed = true;
        vec![BatchEvent::AllItemsScanned]
    }

    pub(crate) fn totals(&self) -> BatchTotals {
        BatchTotals {
            bytes_transferred: self.bytes_transferred,
            bytes_total: self.bytes_total,
            files_started: self.files_started.len(),
            files_already_transferred: self.already_transferred.len(),
            already_transferred_keys: self.already_transferred_keys.clone(),
            all_items_scanned: self.scan_completed,
            bytes_per_second: self.speed.bytes_per_second(),
        }
    }

    /// Handles an event from the stream of input item `index`.
    pub(crate) fn on_item_event(&mut self, index: usize, event: TransferEvent) -> Vec<BatchEvent> {
        let transfer = event.transfer();
        if !transfer.is_root() {
            return self.on_child_event(index, event);
        }
        self.roots.insert(transfer.tag, index);
        self.record(&event, Some(index));

        let ends_scan = match &event {
            TransferEvent::Finished { .. } => true,
            TransferEvent::Updated { transfer } => self.policy.update_ends_scan(transfer),
            _ => false,
        };
        let completed = ends_scan && self.mark_scanned(index);
        self.emit(index, event, completed)
    }

    /// Handles an event read from the global feed. Only children of root
    /// transfers owned by this batch are considered.
    pub(crate) fn on_feed_event(&mut self, event: TransferEvent) -> Vec<BatchEvent> {
        let owner = event
            .transfer()
            .folder_transfer_tag
            .and_then(|parent| self.roots.get(&parent).copied());
        match owner {
            Some(index) => self.on_child_event(index, event),
            None => Vec::new(),
        }
    }

    /// The item's stream failed because its source no longer exists.
    pub(crate) fn on_item_rejected(&mut self, index: usize, error: &EngineError) -> Vec<BatchEvent> {
        let key = self.keys[index].clone();
        warn!(item = %key, error = %error, "item rejected");
        let completed = self.mark_scanned(index);
        let mut out = vec![BatchEvent::ItemRejected {
            key,
            reason: error.to_string(),
        }];
        if completed {
            out.push(BatchEvent::AllItemsScanned);
        }
        out
    }

    /// The item's stream ended. An item that never signalled the end of its
    /// scan is counted as scanned so the batch can still complete.
    pub(crate) fn on_item_closed(&mut self, index: usize) -> Vec<BatchEvent> {
        if self.scanned[index] {
            return Vec::new();
        }
        warn!(item = %self.keys[index], "item stream ended before its scan finished");
        if self.mark_scanned(index) {
            vec![BatchEvent::AllItemsScanned]
        } else {
            Vec::new()
        }
    }

    fn on_child_event(&mut self, index: usize, event: TransferEvent) -> Vec<BatchEvent> {
        self.record(&event, None);
        self.emit(index, event, false)
    }

    fn emit(&mut self, index: usize, event: TransferEvent, completed: bool) -> Vec<BatchEvent> {
        let shortage = match &event {
            TransferEvent::TemporaryError { error, .. } => self.new_shortage(error),
            TransferEvent::Finished {
                error: Some(error), ..
            } => self.new_shortage(error),
            _ => None,
        };

        let mut out = vec![BatchEvent::Item {
            key: self.keys[index].clone(),
            event,
            totals: self.totals(),
        }];
        if let Some(shortage) = shortage {
            out.push(BatchEvent::InsufficientResources(shortage));
        }
        if completed {
            out.push(BatchEvent::AllItemsScanned);
        }
        out
    }

    /// Updates counters. `root_index` is set for root transfers.
    fn record(&mut self, event: &TransferEvent, root_index: Option<usize>) {
        let transfer = event.transfer();

        if !transfer.is_folder {
            if matches!(event, TransferEvent::Started { .. }) {
                self.files_started.insert(transfer.tag);
            }
            if transfer.is_already_transferred && self.already_transferred.insert(transfer.tag) {
                debug!(tag = transfer.tag, "transfer already done");
                if let Some(index) = root_index {
                    let key = &self.keys[index];
                    if !self.already_transferred_keys.contains(key) {
                        self.already_transferred_keys.push(key.clone());
                    }
                }
            }
        }

        if root_index.is_some()
            && matches!(
                event,
                TransferEvent::Started { .. }
                    | TransferEvent::Updated { .. }
                    | TransferEvent::Finished { .. }
            )
        {
            self.record_bytes(transfer);
        }
    }

    fn record_bytes(&mut self, transfer: &Transfer) {
        let entry = self.root_bytes.entry(transfer.tag).or_default();
        let total = entry.total.max(transfer.total_bytes);
        let transferred = entry.transferred.max(transfer.transferred_bytes);
        let added_total = total - entry.total;
        let added_transferred = transferred - entry.transferred;
        *entry = RootBytes { total, transferred };

        self.bytes_total += added_total;
        self.bytes_transferred += added_transferred;
        if added_transferred > 0 {
            self.speed.add_sample(added_transferred);
        }
    }

    fn new_shortage(&mut self, error: &EngineError) -> Option<ResourceShortage> {
        let shortage = match error {
            EngineError::StorageQuotaExceeded | EngineError::NotEnoughQuota => {
                ResourceShortage::StorageQuota
            }
            EngineError::TransferQuotaExceeded => ResourceShortage::TransferQuota,
            _ => return None,
        };
        self.shortages.insert(shortage).then_some(shortage)
    }

    /// Returns `true` if this call completed scanning for the whole batch.
    fn mark_scanned(&mut self, index: usize) -> bool {
        if std::mem::replace(&mut self.scanned[index], true) {
            return false;
        }
        self.pending_scans -= 1;
        debug!(item = %self.keys[index], pending = self.pending_scans, "item scanned");
        if self.pending_scans == 0 && !self.scan_completed {
            self.scan_completed = true;
            self.completion_unclaimed = true;
            info!(items = self.keys.len(), "all items scanned");
            return true;
        }
        false
    }
}
