//! Persistence of pending attachments.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use skyhop_engine::{NodeId, TransferTag};
use tracing::debug;

use crate::error::StoreError;
use crate::model::{AttachmentState, PendingAttachment};

/// Persistence gateway for [`PendingAttachment`] records.
pub trait AttachmentStore: Send + Sync {
    /// Allocates an id for a new record.
    fn next_id(&self) -> Result<i64, StoreError>;

    /// Inserts or replaces a record.
    fn save(&self, attachment: &PendingAttachment) -> Result<(), StoreError>;

    fn get(&self, id: i64) -> Result<Option<PendingAttachment>, StoreError>;

    /// All records, oldest id first.
    fn list(&self) -> Result<Vec<PendingAttachment>, StoreError>;

    fn delete(&self, id: i64) -> Result<(), StoreError>;

    fn update_state(&self, id: i64, state: AttachmentState) -> Result<(), StoreError> {
        self.modify(id, &mut |a| a.state = state)
    }

    fn set_transfer_tag(&self, id: i64, tag: TransferTag) -> Result<(), StoreError> {
        self.modify(id, &mut |a| a.transfer_tag = Some(tag))
    }

    fn set_remote_node(&self, id: i64, node: NodeId) -> Result<(), StoreError> {
        self.modify(id, &mut |a| a.remote_node_id = Some(node))
    }

    /// Applies `change` to record `id` and saves it.
    fn modify(
        &self,
        id: i64,
        change: &mut dyn FnMut(&mut PendingAttachment),
    ) -> Result<(), StoreError> {
        let mut attachment = self.get(id)?.ok_or(StoreError::NotFound(id))?;
        change(&mut attachment);
        self.save(&attachment)
    }
}

/// Records plus the highest id ever handed out.
///
/// Ids are never reused, even after the newest record is deleted, because
/// feed events of a finished transfer can still arrive carrying its id.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Records {
    #[serde(default)]
    last_id: i64,
    #[serde(default, with = "as_list")]
    attachments: BTreeMap<i64, PendingAttachment>,
}

impl Records {
    fn allocate(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn insert(&mut self, attachment: &PendingAttachment) {
        self.last_id = self.last_id.max(attachment.id);
        self.attachments.insert(attachment.id, attachment.clone());
    }
}

/// Store kept in memory only.
#[derive(Debug, Default)]
pub struct MemoryAttachmentStore {
    records: RwLock<Records>,
}

impl MemoryAttachmentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AttachmentStore for MemoryAttachmentStore {
    fn next_id(&self) -> Result<i64, StoreError> {
        Ok(self.records.write().unwrap().allocate())
    }

    fn save(&self, attachment: &PendingAttachment) -> Result<(), StoreError> {
        self.records.write().unwrap().insert(attachment);
        Ok(())
    }

    fn get(&self, id: i64) -> Result<Option<PendingAttachment>, StoreError> {
        Ok(self.records.read().unwrap().attachments.get(&id).cloned())
    }

    fn list(&self) -> Result<Vec<PendingAttachment>, StoreError> {
        Ok(self.records.read().unwrap().attachments.values().cloned().collect())
    }

    fn delete(&self, id: i64) -> Result<(), StoreError> {
        self.records.write().unwrap().attachments.remove(&id);
        Ok(())
    }
}

/// Store backed by a JSON file.
///
/// Records are cached in memory and the file is rewritten, under the write
/// lock, on every mutation. Allocating an id is a mutation too, so the
/// high-water mark survives restarts.
pub struct JsonAttachmentStore {
    path: PathBuf,
    records: RwLock<Records>,
}

impl JsonAttachmentStore {
    /// Opens the store, loading existing records from `path`.
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let records = load_records(&path)?;
        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, records: &Records) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(records)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, json)?;
        debug!(
            "persisted {} pending attachment(s) to {:?}",
            records.attachments.len(),
            self.path
        );
        Ok(())
    }
}

impl AttachmentStore for JsonAttachmentStore {
    fn next_id(&self) -> Result<i64, StoreError> {
        let mut records = self.records.write().unwrap();
        let id = records.allocate();
        self.persist(&records)?;
        Ok(id)
    }

    fn save(&self, attachment: &PendingAttachment) -> Result<(), StoreError> {
        let mut records = self.records.write().unwrap();
        records.insert(attachment);
        self.persist(&records)
    }

    fn get(&self, id: i64) -> Result<Option<PendingAttachment>, StoreError> {
        Ok(self.records.read().unwrap().attachments.get(&id).cloned())
    }

    fn list(&self) -> Result<Vec<PendingAttachment>, StoreError> {
        Ok(self.records.read().unwrap().attachments.values().cloned().collect())
    }

    fn delete(&self, id: i64) -> Result<(), StoreError> {
        let mut records = self.records.write().unwrap();
        if records.attachments.remove(&id).is_some() {
            self.persist(&records)?;
        }
        Ok(())
    }
}

fn load_records(path: &Path) -> Result<Records, StoreError> {
    if !path.exists() {
        return Ok(Records::default());
    }
    let data = std::fs::read_to_string(path)?;
    let mut records: Records = serde_json::from_str(&data)?;
    let newest = records.attachments.keys().next_back().copied().unwrap_or(0);
    records.last_id = records.last_id.max(newest);
    debug!(
        "loaded {} pending attachment(s) from {:?}",
        records.attachments.len(),
        path
    );
    Ok(records)
}

/// Attachments are stored as a JSON array, keyed by id in memory.
mod as_list {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serializer};

    use crate::model::PendingAttachment;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<i64, PendingAttachment>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(map.values())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<i64, PendingAttachment>, D::Error> {
        let list = Vec::<PendingAttachment>::deserialize(deserializer)?;
        Ok(list.into_iter().map(|a| (a.id, a)).collect())
    }
}
