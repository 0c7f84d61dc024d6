use std::collections::HashMap;
use std::sync::Arc;

use onetox_protocol::{Direction, PeerId, TransferKey};

use crate::types::TransferRecord;

/// Keyed map of live transfers.
///
/// Not synchronised; the manager keeps it behind one lock. Never lock the
/// registry while holding a record lock: `remove` locks the record.
#[derive(Debug, Default)]
pub struct TransferRegistry {
    records: HashMap<TransferKey, Arc<TransferRecord>>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a record. Returns `false` and leaves the existing record in
    /// place if the key is taken.
    pub fn insert(&mut self, record: Arc<TransferRecord>) -> bool {
        let key = record.key();
        if self.records.contains_key(&key) {
            return false;
        }
        self.records.insert(key, record);
        true
    }

    pub fn get(&self, key: &TransferKey) -> Option<Arc<TransferRecord>> {
        self.records.get(key).cloned()
    }

    pub fn contains(&self, key: &TransferKey) -> bool {
        self.records.contains_key(key)
    }

    /// Removes a record and releases its store. No-op if absent.
    pub fn remove(&mut self, key: &TransferKey) -> Option<Arc<TransferRecord>> {
        let record = self.records.remove(key)?;
        drop(record.lock().take_store());
        Some(record)
    }

    /// Records matching the given peer and/or direction (`None` matches all).
    pub fn matching(
        &self,
        peer_id: Option<PeerId>,
        direction: Option<Direction>,
    ) -> Vec<Arc<TransferRecord>> {
        self.records
            .values()
            .filter(|r| peer_id.is_none_or(|p| r.key().peer_id == p))
            .filter(|r| direction.is_none_or(|d| r.direction() == d))
            .cloned()
            .collect()
    }

    /// All registered records.
    pub fn records(&self) -> Vec<Arc<TransferRecord>> {
        self.records.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
