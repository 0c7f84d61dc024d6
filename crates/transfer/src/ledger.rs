//! Resume ledger: durable record of interrupted transfers.
//!
//! Each entry ties a reopenable file to the metadata needed to continue the
//! transfer: who it was with, which transfer it was, its fingerprint and how
//! many bytes were already moved. When the ledger is full new entries are
//! dropped; old ones are never evicted.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use onetox_protocol::{Direction, FileKind, Fingerprint, PeerId, TransferId, TransferKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::association::{Association, AssociationStore, MemoryAssociationStore};

/// Errors from the resume ledger and its storage.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid metadata encoding: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("association capacity reached")]
    CapacityReached,

    #[error("association not found: {0}")]
    TokenNotFound(String),
}

/// Opaque metadata blob stored next to each file reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeMetadata {
    pub peer_id: PeerId,
    pub transfer_id: TransferId,
    pub fingerprint: Fingerprint,
    pub direction: Direction,
    pub transferred_bytes: u64,
    #[serde(default)]
    pub kind: FileKind,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub total_bytes: u64,
}

impl ResumeMetadata {
    pub fn encode(&self) -> Result<Vec<u8>, LedgerError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, LedgerError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// One interrupted transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeEntry {
    pub peer_id: PeerId,
    pub transfer_id: TransferId,
    pub fingerprint: Fingerprint,
    pub direction: Direction,
    pub kind: FileKind,
    pub name: String,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub file: PathBuf,
}

impl ResumeEntry {
    pub fn key(&self) -> TransferKey {
        TransferKey::new(self.peer_id, self.transfer_id)
    }

    /// Same entry under a new transfer key and offset.
    pub fn rekeyed(&self, key: TransferKey, transferred_bytes: u64) -> Self {
        Self {
            peer_id: key.peer_id,
            transfer_id: key.transfer_id,
            transferred_bytes,
            ..self.clone()
        }
    }

    fn metadata(&self) -> ResumeMetadata {
        ResumeMetadata {
            peer_id: self.peer_id,
            transfer_id: self.transfer_id,
            fingerprint: self.fingerprint.clone(),
            direction: self.direction,
            transferred_bytes: self.transferred_bytes,
            kind: self.kind,
            name: self.name.clone(),
            total_bytes: self.total_bytes,
        }
    }

    fn from_parts(file: PathBuf, meta: ResumeMetadata) -> Self {
        Self {
            peer_id: meta.peer_id,
            transfer_id: meta.transfer_id,
            fingerprint: meta.fingerprint,
            direction: meta.direction,
            kind: meta.kind,
            name: meta.name,
            total_bytes: meta.total_bytes,
            transferred_bytes: meta.transferred_bytes,
            file,
        }
    }
}

/// A ledger entry and the token that addresses it in the store.
///
/// Keys can repeat: the peer protocol reuses transfer ids, and numbers each
/// direction separately. The token never does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub token: String,
    pub entry: ResumeEntry,
}

/// Ledger of interrupted transfers over an [`AssociationStore`].
pub struct ResumeLedger {
    store: Arc<dyn AssociationStore>,
    // Serialises lookup-then-modify sequences.
    op: Mutex<()>,
}

impl ResumeLedger {
    pub fn new(store: Arc<dyn AssociationStore>) -> Self {
        Self {
            store,
            op: Mutex::new(()),
        }
    }

    /// Ledger backed by a non-durable store.
    pub fn in_memory(capacity: usize) -> Self {
        Self::new(Arc::new(MemoryAssociationStore::new(capacity)))
    }

    /// Adds an entry and returns the token addressing it from then on.
    ///
    /// Never overwrites: entries are told apart by token, not by key.
    /// Returns `None` without error when the ledger is full or the file
    /// cannot be located; the transfer then simply is not resumable.
    pub fn record(&self, entry: &ResumeEntry) -> Result<Option<String>, LedgerError> {
        let _op = self.op.lock().unwrap();
        if !entry.file.exists() {
            warn!(key = %entry.key(), file = ?entry.file, "not recording resume entry: file missing");
            return Ok(None);
        }
        if self.store.capacity_reached() {
            warn!(key = %entry.key(), "resume ledger full, entry dropped");
            return Ok(None);
        }
        match self.store.add(&entry.file, &entry.metadata().encode()?) {
            Ok(token) => {
                debug!(key = %entry.key(), %token, offset = entry.transferred_bytes, "resume entry recorded");
                Ok(Some(token))
            }
            Err(LedgerError::CapacityReached) => {
                warn!(key = %entry.key(), "resume ledger full, entry dropped");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Finds a broken download with the given fingerprint.
    pub fn find_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<StoredEntry>, LedgerError> {
        let _op = self.op.lock().unwrap();
        Ok(self
            .scan_locked()?
            .into_iter()
            .find(|s| s.entry.direction == Direction::Download && &s.entry.fingerprint == fingerprint))
    }

    /// All entries for a peer in one direction, oldest first.
    pub fn find_all(
        &self,
        peer_id: PeerId,
        direction: Direction,
    ) -> Result<Vec<StoredEntry>, LedgerError> {
        let _op = self.op.lock().unwrap();
        Ok(self
            .scan_locked()?
            .into_iter()
            .filter(|s| s.entry.peer_id == peer_id && s.entry.direction == direction)
            .collect())
    }

    /// Stores a new offset for the entry behind `token`.
    ///
    /// Returns `false` if there is no such entry, or if its file can no
    /// longer be located, in which case the stale entry is purged.
    pub fn update_offset(&self, token: &str, transferred_bytes: u64) -> Result<bool, LedgerError> {
        let _op = self.op.lock().unwrap();
        let Some(found) = self.get_locked(token)? else {
            return Ok(false);
        };
        let key = found.entry.key();
        if !found.entry.file.exists() {
            warn!(%key, file = ?found.entry.file, "resume file missing, purging entry");
            self.store.remove(token)?;
            return Ok(false);
        }
        let updated = found.entry.rekeyed(key, transferred_bytes);
        self.store.replace(token, &updated.file, &updated.metadata().encode()?)?;
        debug!(%key, offset = transferred_bytes, "resume offset updated");
        Ok(true)
    }

    /// Removes the entry behind `token`. Returns `true` if one existed.
    pub fn remove(&self, token: &str) -> Result<bool, LedgerError> {
        let _op = self.op.lock().unwrap();
        let removed = self.store.remove(token)?;
        if removed {
            debug!(token, "resume entry removed");
        }
        Ok(removed)
    }

    /// Overwrites the entry behind `token` with `entry`, keeping its slot,
    /// so a resumed transfer never loses its place to capacity. Returns
    /// `false` if the entry is gone.
    pub fn rekey(&self, token: &str, entry: &ResumeEntry) -> Result<bool, LedgerError> {
        let _op = self.op.lock().unwrap();
        let Some(found) = self.get_locked(token)? else {
            return Ok(false);
        };
        self.store.replace(token, &entry.file, &entry.metadata().encode()?)?;
        info!(from = %found.entry.key(), to = %entry.key(), offset = entry.transferred_bytes, "resume entry re-keyed");
        Ok(true)
    }

    /// All decodable entries, oldest first.
    pub fn entries(&self) -> Result<Vec<ResumeEntry>, LedgerError> {
        let _op = self.op.lock().unwrap();
        Ok(self.scan_locked()?.into_iter().map(|s| s.entry).collect())
    }

    pub fn len(&self) -> Result<usize, LedgerError> {
        self.entries().map(|e| e.len())
    }

    pub fn is_empty(&self) -> Result<bool, LedgerError> {
        self.len().map(|n| n == 0)
    }

    /// Decodes one association. An undecodable blob is purged.
    fn get_locked(&self, token: &str) -> Result<Option<StoredEntry>, LedgerError> {
        let Some(assoc) = self.store.get(token)? else {
            return Ok(None);
        };
        self.decode_locked(assoc)
    }

    /// Decodes every association, purging blobs that no longer parse.
    fn scan_locked(&self) -> Result<Vec<StoredEntry>, LedgerError> {
        let mut out = Vec::new();
        for assoc in self.store.list()? {
            if let Some(found) = self.decode_locked(assoc)? {
                out.push(found);
            }
        }
        Ok(out)
    }

    fn decode_locked(&self, assoc: Association) -> Result<Option<StoredEntry>, LedgerError> {
        match ResumeMetadata::decode(&assoc.metadata) {
            Ok(meta) => Ok(Some(StoredEntry {
                token: assoc.token,
                entry: ResumeEntry::from_parts(assoc.file, meta),
            })),
            Err(e) => {
                warn!(token = %assoc.token, error = %e, "undecodable resume entry, purging");
                self.store.remove(&assoc.token)?;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn entry(dir: &TempDir, peer: PeerId, id: TransferId, direction: Direction, fp: u8) -> ResumeEntry {
        let file = dir.path().join(format!("{peer}-{id}.bin"));
        std::fs::write(&file, [0u8; 16]).unwrap();
        ResumeEntry {
            peer_id: peer,
            transfer_id: id,
            fingerprint: Fingerprint::new(vec![fp; 32]),
            direction,
            kind: FileKind::Data,
            name: "file.bin".into(),
            total_bytes: 16,
            transferred_bytes: 0,
            file,
        }
    }

    #[test]
    fn metadata_roundtrip_and_field_names() {
        let meta = ResumeMetadata {
            peer_id: 3,
            transfer_id: 7,
            fingerprint: Fingerprint::new(vec![0xab; 2]),
            direction: Direction::Upload,
            transferred_bytes: 4000,
            kind: FileKind::Avatar,
            name: "me.png".into(),
            total_bytes: 10000,
        };
        let blob = meta.encode().unwrap();
        let text = String::from_utf8(blob.clone()).unwrap();
        assert!(text.contains("\"transferredBytes\":4000"));
        assert!(text.contains("\"fingerprint\":\"abab\""));
        assert_eq!(ResumeMetadata::decode(&blob).unwrap(), meta);
    }

    #[test]
    fn metadata_tolerates_missing_optional_fields() {
        let json = br#"{"peerId":1,"transferId":2,"fingerprint":"00","direction":"download","transferredBytes":5}"#;
        let meta = ResumeMetadata::decode(json).unwrap();
        assert_eq!(meta.kind, FileKind::Data);
        assert_eq!(meta.total_bytes, 0);
    }

    #[test]
    fn record_and_find_by_fingerprint() {
        let dir = TempDir::new().unwrap();
        let ledger = ResumeLedger::in_memory(10);
        let e = entry(&dir, 1, 0, Direction::Download, 7);
        let token = ledger.record(&e).unwrap().unwrap();

        let found = ledger
            .find_by_fingerprint(&Fingerprint::new(vec![7; 32]))
            .unwrap()
            .unwrap();
        assert_eq!(found.entry, e);
        assert_eq!(found.token, token);
        assert!(
            ledger
                .find_by_fingerprint(&Fingerprint::new(vec![8; 32]))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn fingerprint_lookup_ignores_uploads() {
        let dir = TempDir::new().unwrap();
        let ledger = ResumeLedger::in_memory(10);
        ledger.record(&entry(&dir, 1, 0, Direction::Upload, 7)).unwrap();
        assert!(
            ledger
                .find_by_fingerprint(&Fingerprint::new(vec![7; 32]))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn find_all_by_peer_and_direction() {
        let dir = TempDir::new().unwrap();
        let ledger = ResumeLedger::in_memory(10);
        ledger.record(&entry(&dir, 1, 0, Direction::Upload, 1)).unwrap();
        ledger.record(&entry(&dir, 1, 1, Direction::Upload, 2)).unwrap();
        ledger.record(&entry(&dir, 1, 2, Direction::Download, 3)).unwrap();
        ledger.record(&entry(&dir, 2, 0, Direction::Upload, 4)).unwrap();

        let found = ledger.find_all(1, Direction::Upload).unwrap();
        assert_eq!(found.len(), 2);
        assert!(
            found
                .iter()
                .all(|s| s.entry.peer_id == 1 && s.entry.direction == Direction::Upload)
        );
    }

    #[test]
    fn same_key_in_both_directions_is_two_entries() {
        let dir = TempDir::new().unwrap();
        let ledger = ResumeLedger::in_memory(10);
        let mut download = entry(&dir, 3, 0, Direction::Download, 1);
        download.transferred_bytes = 40;
        let down_token = ledger.record(&download).unwrap().unwrap();
        let up_token = ledger
            .record(&entry(&dir, 3, 0, Direction::Upload, 2))
            .unwrap()
            .unwrap();
        assert_ne!(down_token, up_token);
        assert_eq!(ledger.len().unwrap(), 2);
        assert_eq!(ledger.find_all(3, Direction::Download).unwrap().len(), 1);

        assert!(ledger.remove(&up_token).unwrap());
        let found = ledger.find_by_fingerprint(&download.fingerprint).unwrap().unwrap();
        assert_eq!(found.token, down_token);
        assert_eq!(found.entry.transferred_bytes, 40);
    }

    #[test]
    fn capacity_drops_new_entries() {
        let dir = TempDir::new().unwrap();
        let ledger = ResumeLedger::in_memory(2);
        assert!(ledger.record(&entry(&dir, 1, 0, Direction::Upload, 1)).unwrap().is_some());
        assert!(ledger.record(&entry(&dir, 1, 1, Direction::Upload, 2)).unwrap().is_some());
        assert!(ledger.record(&entry(&dir, 1, 2, Direction::Upload, 3)).unwrap().is_none());

        let keys: Vec<_> = ledger.entries().unwrap().iter().map(|e| e.key()).collect();
        assert_eq!(keys, vec![TransferKey::new(1, 0), TransferKey::new(1, 1)]);
    }

    #[test]
    fn record_refuses_missing_file() {
        let dir = TempDir::new().unwrap();
        let ledger = ResumeLedger::in_memory(10);
        let e = entry(&dir, 1, 0, Direction::Upload, 1);
        std::fs::remove_file(&e.file).unwrap();
        assert!(ledger.record(&e).unwrap().is_none());
        assert!(ledger.is_empty().unwrap());
    }

    #[test]
    fn update_offset() {
        let dir = TempDir::new().unwrap();
        let ledger = ResumeLedger::in_memory(10);
        let e = entry(&dir, 3, 1, Direction::Upload, 1);
        let token = ledger.record(&e).unwrap().unwrap();

        assert!(ledger.update_offset(&token, 12).unwrap());
        assert_eq!(ledger.entries().unwrap()[0].transferred_bytes, 12);
        assert_eq!(ledger.entries().unwrap()[0].key(), e.key());
        assert!(!ledger.update_offset("missing", 1).unwrap());
    }

    #[test]
    fn update_offset_purges_when_file_missing() {
        let dir = TempDir::new().unwrap();
        let ledger = ResumeLedger::in_memory(10);
        let e = entry(&dir, 3, 1, Direction::Upload, 1);
        let token = ledger.record(&e).unwrap().unwrap();
        std::fs::remove_file(&e.file).unwrap();

        assert!(!ledger.update_offset(&token, 12).unwrap());
        assert!(ledger.is_empty().unwrap());
    }

    #[test]
    fn remove_entry() {
        let dir = TempDir::new().unwrap();
        let ledger = ResumeLedger::in_memory(10);
        let token = ledger
            .record(&entry(&dir, 1, 0, Direction::Download, 1))
            .unwrap()
            .unwrap();
        assert!(ledger.remove(&token).unwrap());
        assert!(!ledger.remove(&token).unwrap());
    }

    #[test]
    fn rekey_keeps_slot_when_full() {
        let dir = TempDir::new().unwrap();
        let ledger = ResumeLedger::in_memory(1);
        let e = entry(&dir, 1, 0, Direction::Download, 1);
        let token = ledger.record(&e).unwrap().unwrap();

        let moved = e.rekeyed(TransferKey::new(1, 5), 10);
        assert!(ledger.rekey(&token, &moved).unwrap());

        let all = ledger.entries().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].key(), TransferKey::new(1, 5));
        assert_eq!(all[0].transferred_bytes, 10);
        assert!(!ledger.rekey("missing", &moved).unwrap());
    }

    #[test]
    fn rekey_onto_a_key_still_held_by_another_entry() {
        let dir = TempDir::new().unwrap();
        let ledger = ResumeLedger::in_memory(10);
        let mut a = entry(&dir, 3, 1, Direction::Upload, 1);
        a.name = "a.bin".into();
        let mut b = entry(&dir, 3, 0, Direction::Upload, 2);
        b.name = "b.bin".into();
        let a_token = ledger.record(&a).unwrap().unwrap();
        let b_token = ledger.record(&b).unwrap().unwrap();

        // The peer hands out ids 0 and 1 again, in the other order.
        assert!(ledger.rekey(&a_token, &a.rekeyed(TransferKey::new(3, 0), 5)).unwrap());
        assert!(ledger.rekey(&b_token, &b.rekeyed(TransferKey::new(3, 1), 7)).unwrap());

        let mut saved: Vec<_> = ledger
            .entries()
            .unwrap()
            .into_iter()
            .map(|e| { let key = e.key(); (e.name, key, e.transferred_bytes) })
            .collect();
        saved.sort();
        assert_eq!(
            saved,
            vec![
                ("a.bin".to_string(), TransferKey::new(3, 0), 5),
                ("b.bin".to_string(), TransferKey::new(3, 1), 7),
            ]
        );
    }

    #[test]
    fn undecodable_blobs_are_purged() {
        let store = Arc::new(MemoryAssociationStore::new(10));
        store.add(Path::new("/tmp/x"), b"garbage").unwrap();
        let ledger = ResumeLedger::new(store.clone());

        assert!(ledger.entries().unwrap().is_empty());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn durable_ledger_survives_restart() {
        use crate::association::JsonAssociationStore;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.json");
        let e = entry(&dir, 4, 2, Direction::Download, 9);
        {
            let store = JsonAssociationStore::open(path.clone(), 10).unwrap();
            let ledger = ResumeLedger::new(Arc::new(store));
            let token = ledger.record(&e).unwrap().unwrap();
            ledger.update_offset(&token, 6).unwrap();
        }

        let store = JsonAssociationStore::open(path, 10).unwrap();
        let ledger = ResumeLedger::new(Arc::new(store));
        let found = ledger.find_by_fingerprint(&e.fingerprint).unwrap().unwrap().entry;
        assert_eq!(found.transferred_bytes, 6);
        assert_eq!(found.file, e.file);
    }
}
