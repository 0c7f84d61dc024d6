//! Durable file/metadata associations backing the resume ledger.
//!
//! An association ties a reopenable file reference to an opaque metadata
//! blob. The ledger only relies on this contract, so a platform access list
//! can replace the JSON store without touching the manager.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ledger::LedgerError;

/// One stored association.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Association {
    pub token: String,
    pub file: PathBuf,
    pub metadata: Vec<u8>,
}

/// Storage collaborator for the resume ledger.
pub trait AssociationStore: Send + Sync {
    /// Stores a new association and returns its token. Fails with
    /// [`LedgerError::CapacityReached`] when full.
    fn add(&self, file: &Path, metadata: &[u8]) -> Result<String, LedgerError>;

    fn get(&self, token: &str) -> Result<Option<Association>, LedgerError>;

    /// Overwrites an existing association.
    fn replace(&self, token: &str, file: &Path, metadata: &[u8]) -> Result<(), LedgerError>;

    /// Returns `true` if something was removed.
    fn remove(&self, token: &str) -> Result<bool, LedgerError>;

    /// All associations, oldest first.
    fn list(&self) -> Result<Vec<Association>, LedgerError>;

    fn capacity_reached(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Shared entry list
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Entries {
    items: Vec<Association>,
}

impl Entries {
    fn add(&mut self, capacity: usize, file: &Path, metadata: &[u8]) -> Result<String, LedgerError> {
        if self.items.len() >= capacity {
            return Err(LedgerError::CapacityReached);
        }
        let token = uuid::Uuid::new_v4().to_string();
        self.items.push(Association {
            token: token.clone(),
            file: file.to_path_buf(),
            metadata: metadata.to_vec(),
        });
        Ok(token)
    }

    fn get(&self, token: &str) -> Option<Association> {
        self.items.iter().find(|a| a.token == token).cloned()
    }

    fn replace(&mut self, token: &str, file: &Path, metadata: &[u8]) -> Result<(), LedgerError> {
        let entry = self
            .items
            .iter_mut()
            .find(|a| a.token == token)
            .ok_or_else(|| LedgerError::TokenNotFound(token.to_string()))?;
        entry.file = file.to_path_buf();
        entry.metadata = metadata.to_vec();
        Ok(())
    }

    fn remove(&mut self, token: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|a| a.token != token);
        self.items.len() != before
    }
}

// ---------------------------------------------------------------------------
// MemoryAssociationStore
// ---------------------------------------------------------------------------

/// Non-durable store, for tests and throwaway sessions.
#[derive(Debug)]
pub struct MemoryAssociationStore {
    capacity: usize,
    entries: RwLock<Entries>,
}

impl MemoryAssociationStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: RwLock::new(Entries::default()),
        }
    }
}

impl AssociationStore for MemoryAssociationStore {
    fn add(&self, file: &Path, metadata: &[u8]) -> Result<String, LedgerError> {
        self.entries.write().unwrap().add(self.capacity, file, metadata)
    }

    fn get(&self, token: &str) -> Result<Option<Association>, LedgerError> {
        Ok(self.entries.read().unwrap().get(token))
    }

    fn replace(&self, token: &str, file: &Path, metadata: &[u8]) -> Result<(), LedgerError> {
        self.entries.write().unwrap().replace(token, file, metadata)
    }

    fn remove(&self, token: &str) -> Result<bool, LedgerError> {
        Ok(self.entries.write().unwrap().remove(token))
    }

    fn list(&self) -> Result<Vec<Association>, LedgerError> {
        Ok(self.entries.read().unwrap().items.clone())
    }

    fn capacity_reached(&self) -> bool {
        self.entries.read().unwrap().items.len() >= self.capacity
    }
}

// ---------------------------------------------------------------------------
// JsonAssociationStore
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct StoredFile {
    version: u32,
    #[serde(default)]
    entries: Vec<StoredAssociation>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredAssociation {
    token: String,
    file: PathBuf,
    /// Base64 of the metadata blob.
    metadata: String,
}

const STORE_VERSION: u32 = 1;

/// Durable store persisted as a JSON file.
///
/// Entries are cached in memory and the whole file is rewritten after every
/// change.
#[derive(Debug)]
pub struct JsonAssociationStore {
    path: PathBuf,
    capacity: usize,
    entries: RwLock<Entries>,
}

impl JsonAssociationStore {
    /// Opens the store, loading existing entries from disk.
    pub fn open(path: PathBuf, capacity: usize) -> Result<Self, LedgerError> {
        let entries = load_entries(&path)?;
        Ok(Self {
            path,
            capacity,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &Entries) -> Result<(), LedgerError> {
        let stored = StoredFile {
            version: STORE_VERSION,
            entries: entries
                .items
                .iter()
                .map(|a| StoredAssociation {
                    token: a.token.clone(),
                    file: a.file.clone(),
                    metadata: STANDARD.encode(&a.metadata),
                })
                .collect(),
        };
        let json = serde_json::to_string_pretty(&stored)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, json)?;
        debug!("persisted {} resume association(s) to {:?}", entries.items.len(), self.path);
        Ok(())
    }
}

impl AssociationStore for JsonAssociationStore {
    fn add(&self, file: &Path, metadata: &[u8]) -> Result<String, LedgerError> {
        let mut entries = self.entries.write().unwrap();
        let token = entries.add(self.capacity, file, metadata)?;
        self.persist(&entries)?;
        Ok(token)
    }

    fn get(&self, token: &str) -> Result<Option<Association>, LedgerError> {
        Ok(self.entries.read().unwrap().get(token))
    }

    fn replace(&self, token: &str, file: &Path, metadata: &[u8]) -> Result<(), LedgerError> {
        let mut entries = self.entries.write().unwrap();
        entries.replace(token, file, metadata)?;
        self.persist(&entries)
    }

    fn remove(&self, token: &str) -> Result<bool, LedgerError> {
        let mut entries = self.entries.write().unwrap();
        if !entries.remove(token) {
            return Ok(false);
        }
        self.persist(&entries)?;
        Ok(true)
    }

    fn list(&self) -> Result<Vec<Association>, LedgerError> {
        Ok(self.entries.read().unwrap().items.clone())
    }

    fn capacity_reached(&self) -> bool {
        self.entries.read().unwrap().items.len() >= self.capacity
    }
}

/// Loads entries from a JSON file on disk.
fn load_entries(path: &Path) -> Result<Entries, LedgerError> {
    if !path.exists() {
        return Ok(Entries::default());
    }
    let data = std::fs::read_to_string(path)?;
    let stored: StoredFile = serde_json::from_str(&data)?;
    let items = stored
        .entries
        .into_iter()
        .map(|s| {
            Ok(Association {
                token: s.token,
                file: s.file,
                metadata: STANDARD.decode(s.metadata)?,
            })
        })
        .collect::<Result<Vec<_>, LedgerError>>()?;
    debug!("loaded {} resume association(s) from {:?}", items.len(), path);
    Ok(Entries { items })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json_store(capacity: usize) -> (tempfile::TempDir, JsonAssociationStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonAssociationStore::open(tmp.path().join("resume.json"), capacity).unwrap();
        (tmp, store)
    }

    #[test]
    fn memory_add_get_remove() {
        let store = MemoryAssociationStore::new(4);
        let token = store.add(Path::new("/tmp/a"), b"meta").unwrap();

        let assoc = store.get(&token).unwrap().unwrap();
        assert_eq!(assoc.file, PathBuf::from("/tmp/a"));
        assert_eq!(assoc.metadata, b"meta");

        assert!(store.remove(&token).unwrap());
        assert!(!store.remove(&token).unwrap());
        assert!(store.get(&token).unwrap().is_none());
    }

    #[test]
    fn memory_capacity() {
        let store = MemoryAssociationStore::new(2);
        store.add(Path::new("a"), b"1").unwrap();
        assert!(!store.capacity_reached());
        store.add(Path::new("b"), b"2").unwrap();
        assert!(store.capacity_reached());
        assert!(matches!(
            store.add(Path::new("c"), b"3"),
            Err(LedgerError::CapacityReached)
        ));
        // Existing entries are never evicted.
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn replace_missing_token_fails() {
        let store = MemoryAssociationStore::new(2);
        assert!(matches!(
            store.replace("nope", Path::new("a"), b""),
            Err(LedgerError::TokenNotFound(_))
        ));
    }

    #[test]
    fn list_preserves_insertion_order() {
        let store = MemoryAssociationStore::new(8);
        for name in ["a", "b", "c"] {
            store.add(Path::new(name), name.as_bytes()).unwrap();
        }
        let files: Vec<_> = store.list().unwrap().into_iter().map(|a| a.file).collect();
        assert_eq!(files, vec![PathBuf::from("a"), PathBuf::from("b"), PathBuf::from("c")]);
    }

    #[test]
    fn json_persist_and_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("resume.json");

        let token = {
            let store = JsonAssociationStore::open(path.clone(), 10).unwrap();
            let token = store.add(Path::new("/data/file.bin"), &[0, 159, 255]).unwrap();
            store.add(Path::new("/data/other.bin"), b"x").unwrap();
            token
        };

        let store = JsonAssociationStore::open(path, 10).unwrap();
        let assoc = store.get(&token).unwrap().unwrap();
        assert_eq!(assoc.file, PathBuf::from("/data/file.bin"));
        assert_eq!(assoc.metadata, vec![0, 159, 255]);
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn json_replace_and_remove_persist() {
        let (_tmp, store) = json_store(10);
        let token = store.add(Path::new("a"), b"old").unwrap();
        store.replace(&token, Path::new("b"), b"new").unwrap();

        let reloaded = JsonAssociationStore::open(store.path().to_path_buf(), 10).unwrap();
        let assoc = reloaded.get(&token).unwrap().unwrap();
        assert_eq!(assoc.file, PathBuf::from("b"));
        assert_eq!(assoc.metadata, b"new");

        store.remove(&token).unwrap();
        let reloaded = JsonAssociationStore::open(store.path().to_path_buf(), 10).unwrap();
        assert!(reloaded.list().unwrap().is_empty());
    }

    #[test]
    fn json_load_missing_file_is_empty() {
        let (_tmp, store) = json_store(10);
        assert!(store.list().unwrap().is_empty());
        assert!(!store.path().exists());
    }

    #[test]
    fn json_corrupt_file_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("resume.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            JsonAssociationStore::open(path, 10),
            Err(LedgerError::Json(_))
        ));
    }
}
