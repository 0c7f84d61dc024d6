use std::io::{Seek, SeekFrom};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use onetox_protocol::{Direction, FileKind, Fingerprint, TransferKey};

use crate::backing::BackingStore;
use crate::state::{StartMode, TransferState, initial_state};
use crate::TransferError;

/// Parameters for a new [`TransferRecord`].
#[derive(Debug)]
pub struct NewTransfer {
    pub key: TransferKey,
    pub direction: Direction,
    pub kind: FileKind,
    pub name: String,
    pub total_bytes: u64,
    pub fingerprint: Option<Fingerprint>,
    /// `None` only for a download placeholder awaiting a destination.
    pub store: Option<BackingStore>,
    pub start_mode: StartMode,
}

/// Mutable part of a record, guarded by the record's lock.
///
/// The chunk engine (`read_chunk`, `write_chunk`) is implemented on this type
/// so cursor and store can only move together.
#[derive(Debug)]
pub struct TransferSlot {
    pub(crate) state: TransferState,
    pub(crate) cursor: u64,
    pub(crate) total_bytes: u64,
    pub(crate) store: Option<BackingStore>,
    /// Ledger token of this transfer's resume entry.
    pub(crate) resume_token: Option<String>,
}

impl TransferSlot {
    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    /// File the store can be reopened from, if any.
    pub fn store_path(&self) -> Option<&Path> {
        self.store.as_ref().and_then(BackingStore::path)
    }

    pub(crate) fn set_state(&mut self, state: TransferState) {
        self.state = state;
    }

    /// Attaches a store, positioning it at the current cursor.
    pub(crate) fn attach_store(&mut self, mut store: BackingStore) -> Result<(), TransferError> {
        if self.cursor > 0 {
            store.seek(SeekFrom::Start(self.cursor))?;
        }
        self.store = Some(store);
        Ok(())
    }

    /// Detaches and returns the store. Dropping it releases the handle.
    pub(crate) fn take_store(&mut self) -> Option<BackingStore> {
        self.store.take()
    }

    pub(crate) fn resume_token(&self) -> Option<&str> {
        self.resume_token.as_deref()
    }

    pub(crate) fn set_resume_token(&mut self, token: Option<String>) {
        self.resume_token = token;
    }

    pub(crate) fn take_resume_token(&mut self) -> Option<String> {
        self.resume_token.take()
    }
}

/// One in-flight transfer.
///
/// Immutable identity lives on the record; cursor, state and store live in
/// the locked [`TransferSlot`].
#[derive(Debug)]
pub struct TransferRecord {
    key: TransferKey,
    direction: Direction,
    kind: FileKind,
    name: String,
    total_bytes: u64,
    fingerprint: Option<Fingerprint>,
    slot: Mutex<TransferSlot>,
}

impl TransferRecord {
    /// Builds a record. A resumed record's store is positioned at the
    /// resume offset, clamped to the total size.
    pub fn new(params: NewTransfer) -> Result<Self, TransferError> {
        let cursor = params.start_mode.offset().min(params.total_bytes);
        let mut slot = TransferSlot {
            state: initial_state(params.direction, params.start_mode),
            cursor,
            total_bytes: params.total_bytes,
            store: None,
            resume_token: None,
        };
        if let Some(store) = params.store {
            slot.attach_store(store)?;
        }
        Ok(Self {
            key: params.key,
            direction: params.direction,
            kind: params.kind,
            name: params.name,
            total_bytes: params.total_bytes,
            fingerprint: params.fingerprint,
            slot: Mutex::new(slot),
        })
    }

    /// Locks the mutable part of the record.
    pub fn lock(&self) -> MutexGuard<'_, TransferSlot> {
        self.slot.lock().unwrap()
    }

    pub fn key(&self) -> TransferKey {
        self.key
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.fingerprint.as_ref()
    }

    pub fn state(&self) -> TransferState {
        self.lock().state
    }

    pub fn cursor(&self) -> u64 {
        self.lock().cursor
    }

    /// Returns a point-in-time progress view.
    pub fn progress(&self) -> TransferProgress {
        let slot = self.lock();
        TransferProgress {
            key: self.key,
            direction: self.direction,
            kind: self.kind,
            name: self.name.clone(),
            state: slot.state,
            transferred_bytes: slot.cursor,
            total_bytes: self.total_bytes,
            percent: slot.progress(),
        }
    }
}

/// Progress information for one transfer, as polled by callers.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    pub key: TransferKey,
    pub direction: Direction,
    pub kind: FileKind,
    pub name: String,
    pub state: TransferState,
    pub transferred_bytes: u64,
    pub total_bytes: u64,
    /// 0 to 100.
    pub percent: f64,
}
