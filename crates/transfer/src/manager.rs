//! Transfer manager orchestrating the registry, state machine, chunk engine
//! and resume ledger.
//!
//! Peer-session events come in through [`TransferManager::handle_event`] (or
//! the individual `on_*` methods); caller commands through `send_data`,
//! `accept_incoming`, `pause`, `resume` and `cancel`. Both sides may call
//! concurrently. Domain events go out on a channel taken once with
//! [`TransferManager::take_events`].
//!
//! Lock order is registry, then record. Code holding a record lock never
//! touches the registry.

use std::collections::HashMap;
use std::io::Seek;
use std::sync::{Arc, Mutex, MutexGuard};

use onetox_protocol::{
    Control, Direction, FileKind, Fingerprint, PeerEvent, PeerId, PeerSession, TransferId,
    TransferKey,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::backing::BackingStore;
use crate::chunked::fingerprint_store;
use crate::config::TransferConfig;
use crate::ledger::{ResumeEntry, ResumeLedger, StoredEntry};
use crate::registry::TransferRegistry;
use crate::state::{Origin, StartMode, TransferState, Trigger};
use crate::types::{NewTransfer, TransferProgress, TransferRecord, TransferSlot};
use crate::TransferError;

/// Events emitted by the transfer manager.
#[derive(Debug)]
pub enum TransferEvent {
    /// A peer offered a file; accept it with
    /// [`TransferManager::accept_incoming`] or cancel it.
    IncomingRequest {
        key: TransferKey,
        kind: FileKind,
        name: String,
        size: u64,
    },
    /// A transfer moved to a new state.
    StateChanged {
        key: TransferKey,
        direction: Direction,
        state: TransferState,
    },
    /// An interrupted transfer was picked up again at `offset`.
    Resumed {
        key: TransferKey,
        direction: Direction,
        offset: u64,
    },
    /// A transfer completed. Downloads hand over their store, rewound.
    Finished {
        key: TransferKey,
        direction: Direction,
        kind: FileKind,
        name: String,
        store: Option<BackingStore>,
    },
    /// The peer announced an empty transfer: it removed its item.
    ItemRemoved { peer_id: PeerId, kind: FileKind },
    /// A transfer was aborted by a local I/O failure.
    Failed { key: TransferKey, error: String },
}

/// Multiplexes chunked transfers over a [`PeerSession`].
pub struct TransferManager {
    session: Arc<dyn PeerSession>,
    ledger: ResumeLedger,
    config: TransferConfig,
    registry: Mutex<TransferRegistry>,
    /// Last known connectivity per peer.
    online: Mutex<HashMap<PeerId, bool>>,
    events_tx: mpsc::UnboundedSender<TransferEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransferEvent>>>,
}

impl TransferManager {
    /// Creates a new manager.
    pub fn new(session: Arc<dyn PeerSession>, ledger: ResumeLedger, config: TransferConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            session,
            ledger,
            config,
            registry: Mutex::new(TransferRegistry::new()),
            online: Mutex::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransferEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn ledger(&self) -> &ResumeLedger {
        &self.ledger
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn state(&self, key: TransferKey) -> Option<TransferState> {
        self.lookup(key).map(|r| r.state())
    }

    pub fn progress(&self, key: TransferKey) -> Option<TransferProgress> {
        self.lookup(key).map(|r| r.progress())
    }

    /// Progress of every registered transfer, ordered by key.
    pub fn snapshot(&self) -> Vec<TransferProgress> {
        let records = self.registry().records();
        let mut out: Vec<_> = records.iter().map(|r| r.progress()).collect();
        out.sort_by_key(|p| p.key);
        out
    }

    pub fn active_count(&self) -> usize {
        self.registry().len()
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Offers `store` to a peer.
    ///
    /// Avatars are size-checked, fingerprinted from their content when no
    /// fingerprint is given, and replace any avatar upload already running to
    /// that peer. Nothing is registered if the peer protocol rejects the
    /// request.
    pub fn send_data(
        &self,
        peer_id: PeerId,
        kind: FileKind,
        name: &str,
        mut store: BackingStore,
        fingerprint: Option<Fingerprint>,
    ) -> Result<TransferKey, TransferError> {
        if name.is_empty() {
            return Err(TransferError::InvalidName("empty name".into()));
        }
        let size = store.len()?;
        if kind == FileKind::Avatar && size > self.config.max_avatar_bytes {
            return Err(TransferError::TooLarge {
                size,
                limit: self.config.max_avatar_bytes,
            });
        }
        let fingerprint = match (fingerprint, kind) {
            (Some(fp), _) => Some(fp),
            (None, FileKind::Avatar) => Some(fingerprint_store(&mut store)?),
            (None, FileKind::Data) => None,
        };
        if kind == FileKind::Avatar {
            self.cancel_kind(peer_id, Direction::Upload, FileKind::Avatar);
        }

        let transfer_id = self
            .session
            .request_send(peer_id, kind, size, name, fingerprint.as_ref())
            .inspect_err(|e| warn!(peer = peer_id, name, error = %e, "send request rejected"))?;
        let key = TransferKey::new(peer_id, transfer_id);
        let fingerprint = fingerprint.or_else(|| self.session.fingerprint(peer_id, transfer_id));

        let record = Arc::new(TransferRecord::new(NewTransfer {
            key,
            direction: Direction::Upload,
            kind,
            name: name.to_string(),
            total_bytes: size,
            fingerprint,
            store: Some(store),
            start_mode: StartMode::Fresh,
        })?);
        if !self.registry().insert(Arc::clone(&record)) {
            return Err(TransferError::Duplicate(key));
        }
        info!(%key, size, ?kind, "upload registered");
        self.record_resume(&record, &mut record.lock());
        Ok(key)
    }

    /// Gives a placeholder download its destination and starts it.
    pub fn accept_incoming(&self, key: TransferKey, store: BackingStore) -> Result<(), TransferError> {
        let record = self.lookup(key).ok_or(TransferError::NotFound(key))?;
        let mut slot = record.lock();
        if slot.state() != TransferState::BeforeDownload || slot.has_store() {
            return Err(TransferError::InvalidState {
                key,
                state: slot.state(),
            });
        }
        self.session
            .send_control(key.peer_id, key.transfer_id, Control::Resume)
            .inspect_err(|e| warn!(%key, error = %e, "accept rejected"))?;
        slot.attach_store(store)?;
        slot.set_state(TransferState::Downloading);
        info!(%key, "download accepted");
        self.record_resume(&record, &mut slot);
        drop(slot);
        self.emit_state(&record, TransferState::Downloading);
        Ok(())
    }

    /// Pauses a running transfer. Ignored unless it is transferring.
    pub fn pause(&self, key: TransferKey) -> Result<(), TransferError> {
        self.command(key, Trigger::Pause(Origin::Local), Control::Pause)
    }

    /// Resumes a paused or waiting transfer. Ignored otherwise.
    pub fn resume(&self, key: TransferKey) -> Result<(), TransferError> {
        self.command(key, Trigger::Resume, Control::Resume)
    }

    /// Cancels a transfer. Cancelling an unknown or finished transfer is a
    /// no-op.
    pub fn cancel(&self, key: TransferKey) -> Result<(), TransferError> {
        let Some(record) = self.lookup(key) else {
            debug!(%key, "cancel for unknown transfer ignored");
            return Ok(());
        };
        let slot = record.lock();
        if slot.state().is_terminal() {
            return Ok(());
        }
        self.session
            .send_control(key.peer_id, key.transfer_id, Control::Cancel)
            .inspect_err(|e| warn!(%key, error = %e, "cancel rejected"))?;
        self.close(&record, slot, TransferState::Cancelled, true);
        Ok(())
    }

    /// Cancels every transfer with a peer in one direction. Returns how many
    /// were cancelled.
    pub fn cancel_all(&self, peer_id: PeerId, direction: Direction) -> usize {
        let records = self.registry().matching(Some(peer_id), Some(direction));
        records
            .iter()
            .filter(|r| self.cancel(r.key()).is_ok())
            .count()
    }

    fn command(&self, key: TransferKey, trigger: Trigger, control: Control) -> Result<(), TransferError> {
        let record = self.lookup(key).ok_or(TransferError::NotFound(key))?;
        let mut slot = record.lock();
        if trigger == Trigger::Resume && !slot.has_store() {
            return Err(TransferError::InvalidState {
                key,
                state: slot.state(),
            });
        }
        let Some(next) = slot.state().apply(record.direction(), trigger) else {
            debug!(%key, state = %slot.state(), ?trigger, "ignored");
            return Ok(());
        };
        self.session
            .send_control(key.peer_id, key.transfer_id, control)
            .inspect_err(|e| warn!(%key, ?control, error = %e, "control rejected"))?;
        slot.set_state(next);
        drop(slot);
        self.emit_state(&record, next);
        Ok(())
    }

    /// Cancels existing transfers of `kind` with a peer, best-effort.
    fn cancel_kind(&self, peer_id: PeerId, direction: Direction, kind: FileKind) {
        let records = self.registry().matching(Some(peer_id), Some(direction));
        for record in records.into_iter().filter(|r| r.kind() == kind) {
            if let Err(e) = self.cancel(record.key()) {
                warn!(key = %record.key(), error = %e, "could not cancel superseded transfer");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Peer-session events
    // -----------------------------------------------------------------------

    /// Dispatches one peer-session event.
    pub fn handle_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::ChunkRequested {
                peer_id,
                transfer_id,
                offset,
                length,
            } => self.on_chunk_requested(peer_id, transfer_id, offset, length),
            PeerEvent::ChunkReceived {
                peer_id,
                transfer_id,
                offset,
                data,
            } => self.on_chunk_received(peer_id, transfer_id, offset, &data),
            PeerEvent::ControlReceived {
                peer_id,
                transfer_id,
                control,
            } => self.on_control_received(peer_id, transfer_id, control),
            PeerEvent::SendRequest {
                peer_id,
                transfer_id,
                kind,
                name,
                size,
                fingerprint,
            } => self.on_send_request(peer_id, transfer_id, kind, &name, size, fingerprint),
            PeerEvent::Connectivity { peer_id, online } => {
                self.on_peer_connectivity(peer_id, online)
            }
        }
    }

    /// The peer pulls the next chunk of an upload.
    pub fn on_chunk_requested(&self, peer_id: PeerId, transfer_id: TransferId, offset: u64, length: usize) {
        let key = TransferKey::new(peer_id, transfer_id);
        let Some(record) = self.lookup(key) else {
            trace!(%key, "chunk request for unknown transfer");
            return;
        };
        if record.direction() != Direction::Upload {
            warn!(%key, "chunk request for a download ignored");
            return;
        }
        let mut slot = record.lock();
        match slot.state() {
            TransferState::BeforeUpload => {
                slot.set_state(TransferState::Uploading);
                self.emit_state(&record, TransferState::Uploading);
            }
            TransferState::Uploading => {}
            state => {
                debug!(%key, %state, "chunk request ignored");
                return;
            }
        }

        if length == 0 {
            if slot.is_finished() {
                self.finish(&record, slot);
            }
            return;
        }

        let data = match slot.read_chunk(offset, length) {
            Ok(data) => data,
            Err(e @ TransferError::ChunkOutOfRange { .. }) => {
                warn!(%key, error = %e, "bad chunk request ignored");
                return;
            }
            Err(e) => {
                self.fail(&record, slot, e);
                return;
            }
        };
        if let Err(e) = self.session.send_chunk(peer_id, transfer_id, offset, &data) {
            // The peer asks again; the cursor mismatch makes the next read seek.
            warn!(%key, offset, error = %e, "chunk send failed");
            return;
        }
        trace!(%key, offset, length, "chunk sent");
        if slot.is_finished() {
            self.finish(&record, slot);
        }
    }

    /// The peer pushed a chunk of a download.
    pub fn on_chunk_received(&self, peer_id: PeerId, transfer_id: TransferId, offset: u64, data: &[u8]) {
        let key = TransferKey::new(peer_id, transfer_id);
        let Some(record) = self.lookup(key) else {
            trace!(%key, "chunk for unknown transfer");
            return;
        };
        if record.direction() != Direction::Download {
            warn!(%key, "chunk received for an upload ignored");
            return;
        }
        let mut slot = record.lock();
        if slot.state() != TransferState::Downloading {
            debug!(%key, state = %slot.state(), "chunk ignored");
            return;
        }

        if data.is_empty() {
            if slot.is_finished() {
                self.finish(&record, slot);
            }
            return;
        }

        match slot.write_chunk(offset, data) {
            Ok(()) => trace!(%key, offset, length = data.len(), "chunk written"),
            Err(e @ TransferError::ChunkOutOfRange { .. }) => {
                warn!(%key, error = %e, "bad chunk ignored");
                return;
            }
            Err(e) => {
                self.fail(&record, slot, e);
                return;
            }
        }
        if slot.is_finished() {
            self.finish(&record, slot);
        }
    }

    /// The peer paused, resumed or cancelled a transfer.
    pub fn on_control_received(&self, peer_id: PeerId, transfer_id: TransferId, control: Control) {
        let key = TransferKey::new(peer_id, transfer_id);
        let Some(record) = self.lookup(key) else {
            trace!(%key, ?control, "control for unknown transfer");
            return;
        };
        let mut slot = record.lock();
        let trigger = match control {
            Control::Pause => Trigger::Pause(Origin::Peer),
            Control::Resume => Trigger::Resume,
            Control::Cancel => Trigger::Cancel,
        };
        // A placeholder only starts once we have somewhere to put the bytes.
        if trigger == Trigger::Resume && !slot.has_store() {
            debug!(%key, "resume for placeholder ignored");
            return;
        }
        let Some(next) = slot.state().apply(record.direction(), trigger) else {
            debug!(%key, state = %slot.state(), ?control, "stale control ignored");
            return;
        };
        debug!(%key, ?control, %next, "peer control");
        if next == TransferState::Cancelled {
            self.close(&record, slot, next, true);
            return;
        }
        slot.set_state(next);
        drop(slot);
        self.emit_state(&record, next);
    }

    /// The peer offers a new transfer.
    pub fn on_send_request(
        &self,
        peer_id: PeerId,
        transfer_id: TransferId,
        kind: FileKind,
        name: &str,
        size: u64,
        fingerprint: Option<Fingerprint>,
    ) {
        let key = TransferKey::new(peer_id, transfer_id);
        if size == 0 {
            info!(%key, ?kind, "peer removed its item");
            if let Err(e) = self.session.send_control(peer_id, transfer_id, Control::Cancel) {
                warn!(%key, error = %e, "cancel of empty transfer rejected");
            }
            self.emit(TransferEvent::ItemRemoved { peer_id, kind });
            return;
        }
        if kind == FileKind::Avatar {
            if size > self.config.max_avatar_bytes {
                warn!(%key, size, limit = self.config.max_avatar_bytes, "oversized avatar refused");
                if let Err(e) = self.session.send_control(peer_id, transfer_id, Control::Cancel) {
                    warn!(%key, error = %e, "cancel of oversized avatar rejected");
                }
                return;
            }
            self.cancel_kind(peer_id, Direction::Download, FileKind::Avatar);
        }
        if self.registry().contains(&key) {
            warn!(%key, "duplicate send request ignored");
            return;
        }

        let fingerprint = fingerprint.or_else(|| self.session.fingerprint(peer_id, transfer_id));
        if let Some(fp) = &fingerprint {
            match self.ledger.find_by_fingerprint(fp) {
                Ok(Some(entry)) => {
                    if self.resume_download(key, kind, name, size, entry) {
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(%key, error = %e, "resume ledger lookup failed"),
            }
        }

        let record = match TransferRecord::new(NewTransfer {
            key,
            direction: Direction::Download,
            kind,
            name: name.to_string(),
            total_bytes: size,
            fingerprint,
            store: None,
            start_mode: StartMode::Fresh,
        }) {
            Ok(r) => Arc::new(r),
            Err(e) => {
                error!(%key, error = %e, "could not create placeholder");
                return;
            }
        };
        if !self.registry().insert(record) {
            return;
        }
        info!(%key, size, ?kind, name, "incoming transfer awaiting acceptance");
        self.emit(TransferEvent::IncomingRequest {
            key,
            kind,
            name: name.to_string(),
            size,
        });
    }

    /// The peer's connection status changed.
    pub fn on_peer_connectivity(&self, peer_id: PeerId, online: bool) {
        let was_online = self
            .online
            .lock()
            .unwrap()
            .insert(peer_id, online)
            .unwrap_or(false);

        if !online {
            let records = self.registry().matching(Some(peer_id), None);
            if !records.is_empty() {
                info!(peer = peer_id, count = records.len(), "peer offline, suspending transfers");
            }
            for record in records {
                let mut slot = record.lock();
                if slot.state().is_terminal() {
                    continue;
                }
                if slot.has_store() {
                    self.persist_offset(&record, &mut slot);
                }
                self.close(&record, slot, TransferState::Cancelled, false);
            }
        } else if !was_online {
            info!(peer = peer_id, "peer online");
            self.resume_uploads(peer_id);
        }
    }

    // -----------------------------------------------------------------------
    // Resume
    // -----------------------------------------------------------------------

    /// Continues a broken download the peer offered again. Returns `false`
    /// if the transfer should be treated as new instead.
    fn resume_download(
        &self,
        key: TransferKey,
        kind: FileKind,
        name: &str,
        size: u64,
        stored: StoredEntry,
    ) -> bool {
        let StoredEntry { token, entry } = stored;
        let old_key = entry.key();
        if entry.total_bytes != 0 && entry.total_bytes != size {
            warn!(%key, %old_key, "size changed since interruption, starting over");
            self.purge_resume(&token);
            return false;
        }
        let store = match BackingStore::open_for_resume(&entry.file) {
            Ok(store) => store,
            Err(e) => {
                warn!(%key, file = ?entry.file, error = %e, "resume file missing, starting over");
                self.purge_resume(&token);
                return false;
            }
        };
        let offset = entry.transferred_bytes.min(size);
        let record = match TransferRecord::new(NewTransfer {
            key,
            direction: Direction::Download,
            kind,
            name: name.to_string(),
            total_bytes: size,
            fingerprint: Some(entry.fingerprint.clone()),
            store: Some(store),
            start_mode: StartMode::Resumed { offset },
        }) {
            Ok(r) => Arc::new(r),
            Err(e) => {
                warn!(%key, error = %e, "could not reopen resume file, starting over");
                self.purge_resume(&token);
                return false;
            }
        };
        record.lock().set_resume_token(Some(token.clone()));

        // Registered before the peer may send chunks.
        if !self.registry().insert(Arc::clone(&record)) {
            return false;
        }
        let restarted = self
            .session
            .seek(key.peer_id, key.transfer_id, offset)
            .inspect_err(|e| warn!(%key, offset, error = %e, "seek rejected"))
            .and_then(|()| {
                self.session
                    .send_control(key.peer_id, key.transfer_id, Control::Resume)
                    .inspect_err(|e| warn!(%key, error = %e, "resume rejected"))
            });
        if restarted.is_err() {
            self.unregister(&record);
            return false;
        }
        match self.ledger.rekey(&token, &entry.rekeyed(key, offset)) {
            Ok(true) => {}
            Ok(false) => debug!(%key, "resume entry already gone"),
            Err(e) => warn!(%key, error = %e, "could not re-key resume entry"),
        }
        info!(%key, %old_key, offset, "download resumed");
        self.emit(TransferEvent::Resumed {
            key,
            direction: Direction::Download,
            offset,
        });
        self.emit_state(&record, TransferState::Downloading);
        true
    }

    /// Re-offers every broken upload to a peer that just came online.
    fn resume_uploads(&self, peer_id: PeerId) {
        let stored = match self.ledger.find_all(peer_id, Direction::Upload) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(peer = peer_id, error = %e, "resume ledger lookup failed");
                return;
            }
        };
        for entry in stored {
            self.resume_upload(entry);
        }
    }

    fn resume_upload(&self, stored: StoredEntry) {
        let StoredEntry { token, entry } = stored;
        let old_key = entry.key();
        let mut store = match BackingStore::open_file(&entry.file) {
            Ok(store) => store,
            Err(e) => {
                warn!(%old_key, file = ?entry.file, error = %e, "resume file missing, purging");
                self.purge_resume(&token);
                return;
            }
        };
        let size = match store.len() {
            Ok(size) => size,
            Err(e) => {
                warn!(%old_key, error = %e, "resume file unreadable, purging");
                self.purge_resume(&token);
                return;
            }
        };
        if entry.total_bytes != 0 && entry.total_bytes != size {
            warn!(%old_key, "file changed since interruption, purging");
            self.purge_resume(&token);
            return;
        }

        let transfer_id = match self.session.request_send(
            entry.peer_id,
            entry.kind,
            size,
            &entry.name,
            Some(&entry.fingerprint),
        ) {
            Ok(id) => id,
            Err(e) => {
                // Kept for the next reconnect.
                warn!(%old_key, error = %e, "resumed send request rejected");
                return;
            }
        };
        let key = TransferKey::new(entry.peer_id, transfer_id);
        let offset = entry.transferred_bytes.min(size);
        let record = match TransferRecord::new(NewTransfer {
            key,
            direction: Direction::Upload,
            kind: entry.kind,
            name: entry.name.clone(),
            total_bytes: size,
            fingerprint: Some(entry.fingerprint.clone()),
            store: Some(store),
            start_mode: StartMode::Resumed { offset },
        }) {
            Ok(r) => Arc::new(r),
            Err(e) => {
                warn!(%key, error = %e, "could not position resume file");
                self.withdraw(key);
                return;
            }
        };
        record.lock().set_resume_token(Some(token.clone()));
        if !self.registry().insert(Arc::clone(&record)) {
            warn!(%key, "resumed upload collides with a live transfer");
            self.withdraw(key);
            return;
        }
        if let Err(e) = self.ledger.rekey(&token, &entry.rekeyed(key, offset)) {
            warn!(%key, error = %e, "could not re-key resume entry");
        }
        info!(%key, %old_key, offset, "upload resumed");
        self.emit(TransferEvent::Resumed {
            key,
            direction: Direction::Upload,
            offset,
        });
    }

    /// Adds a ledger entry for a transfer backed by a reopenable file.
    fn record_resume(&self, record: &TransferRecord, slot: &mut TransferSlot) {
        let (Some(fingerprint), Some(file)) = (record.fingerprint(), slot.store_path()) else {
            debug!(key = %record.key(), "transfer is not resumable");
            return;
        };
        let entry = ResumeEntry {
            peer_id: record.key().peer_id,
            transfer_id: record.key().transfer_id,
            fingerprint: fingerprint.clone(),
            direction: record.direction(),
            kind: record.kind(),
            name: record.name().to_string(),
            total_bytes: record.total_bytes(),
            transferred_bytes: slot.cursor(),
            file: file.to_path_buf(),
        };
        match self.ledger.record(&entry) {
            Ok(token) => slot.set_resume_token(token),
            Err(e) => warn!(key = %record.key(), error = %e, "could not record resume entry"),
        }
    }

    /// Saves the current cursor so the transfer can continue later.
    fn persist_offset(&self, record: &TransferRecord, slot: &mut TransferSlot) {
        let Some(token) = slot.resume_token() else {
            self.record_resume(record, slot);
            return;
        };
        match self.ledger.update_offset(token, slot.cursor()) {
            Ok(true) => debug!(key = %record.key(), offset = slot.cursor(), "offset persisted"),
            Ok(false) => {
                slot.set_resume_token(None);
                self.record_resume(record, slot);
            }
            Err(e) => warn!(key = %record.key(), error = %e, "could not persist offset"),
        }
    }

    fn purge_resume(&self, token: &str) {
        if let Err(e) = self.ledger.remove(token) {
            warn!(token, error = %e, "could not purge resume entry");
        }
    }

    /// Cancels a send request nothing will serve.
    fn withdraw(&self, key: TransferKey) {
        if let Err(e) = self
            .session
            .send_control(key.peer_id, key.transfer_id, Control::Cancel)
        {
            warn!(%key, error = %e, "cancel of withdrawn send request rejected");
        }
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Completes a transfer whose cursor reached the end.
    fn finish(&self, record: &Arc<TransferRecord>, slot: MutexGuard<'_, TransferSlot>) {
        let Some(next) = slot.state().apply(record.direction(), Trigger::Complete) else {
            return;
        };
        let store = self.close(record, slot, next, true);
        let store = match (record.direction(), store) {
            (Direction::Download, Some(mut store)) => {
                if let Err(e) = store.rewind() {
                    warn!(key = %record.key(), error = %e, "could not rewind finished store");
                }
                Some(store)
            }
            _ => None,
        };
        info!(key = %record.key(), direction = %record.direction(), "transfer finished");
        self.emit(TransferEvent::Finished {
            key: record.key(),
            direction: record.direction(),
            kind: record.kind(),
            name: record.name().to_string(),
            store,
        });
    }

    /// Aborts a transfer after a local failure.
    fn fail(&self, record: &Arc<TransferRecord>, slot: MutexGuard<'_, TransferSlot>, err: TransferError) {
        let key = record.key();
        error!(%key, error = %err, "transfer failed");
        if let Err(e) = self
            .session
            .send_control(key.peer_id, key.transfer_id, Control::Cancel)
        {
            warn!(%key, error = %e, "cancel after failure rejected");
        }
        self.close(record, slot, TransferState::Cancelled, true);
        self.emit(TransferEvent::Failed {
            key,
            error: err.to_string(),
        });
    }

    /// Moves a record to a terminal state, detaches its store and removes it
    /// from the registry. Returns the detached store.
    fn close(
        &self,
        record: &Arc<TransferRecord>,
        mut slot: MutexGuard<'_, TransferSlot>,
        state: TransferState,
        purge_resume: bool,
    ) -> Option<BackingStore> {
        slot.set_state(state);
        let store = slot.take_store();
        let token = slot.take_resume_token();
        drop(slot);

        let key = record.key();
        self.unregister(record);
        if let Some(token) = token.filter(|_| purge_resume) {
            self.purge_resume(&token);
        }
        debug!(%key, %state, "transfer closed");
        self.emit_state(record, state);
        store
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn registry(&self) -> MutexGuard<'_, TransferRegistry> {
        self.registry.lock().unwrap()
    }

    /// Removes `record` from the registry unless its key was taken over.
    fn unregister(&self, record: &Arc<TransferRecord>) {
        let key = record.key();
        let mut registry = self.registry();
        if registry.get(&key).is_some_and(|r| Arc::ptr_eq(&r, record)) {
            registry.remove(&key);
        }
    }

    fn lookup(&self, key: TransferKey) -> Option<Arc<TransferRecord>> {
        self.registry().get(&key)
    }

    fn emit_state(&self, record: &TransferRecord, state: TransferState) {
        self.emit(TransferEvent::StateChanged {
            key: record.key(),
            direction: record.direction(),
            state,
        });
    }

    fn emit(&self, event: TransferEvent) {
        if self.events_tx.send(event).is_err() {
            trace!("transfer event dropped: receiver closed");
        }
    }
}
