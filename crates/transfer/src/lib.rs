//! Chunked transfer manager with resume support and progress tracking.
//!
//! Multiplexes concurrent transfers keyed by `(peer, transfer)`, serves and
//! stores chunks against each transfer's backing store, and keeps a durable
//! ledger of interrupted transfers so they can continue after a restart or a
//! peer reconnect.

mod association;
mod backing;
mod chunked;
mod config;
mod ledger;
mod manager;
mod progress;
mod registry;
mod state;
mod types;
mod validation;

pub use association::{Association, AssociationStore, JsonAssociationStore, MemoryAssociationStore};
pub use backing::{BackingStore, SeekStream};
pub use chunked::{fingerprint_bytes, fingerprint_store};
pub use config::TransferConfig;
pub use ledger::{LedgerError, ResumeEntry, ResumeLedger, ResumeMetadata, StoredEntry};
pub use manager::{TransferEvent, TransferManager};
pub use progress::{ProgressCallback, ProgressTracker};
pub use registry::TransferRegistry;
pub use state::{Origin, StartMode, TransferState, Trigger, initial_state};
pub use types::{NewTransfer, TransferProgress, TransferRecord, TransferSlot};
pub use validation::validate_file_name;

use onetox_protocol::{SessionError, TransferKey};

/// Default number of entries the resume ledger holds.
pub const DEFAULT_LEDGER_CAPACITY: usize = 1000;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Session(#[from] SessionError),

    #[error("resume ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("transfer not found: {0}")]
    NotFound(TransferKey),

    #[error("transfer already registered: {0}")]
    Duplicate(TransferKey),

    #[error("transfer {key} cannot do that while {state}")]
    InvalidState { key: TransferKey, state: TransferState },

    #[error("chunk out of range: offset {offset}, length {length}, total {total}")]
    ChunkOutOfRange { offset: u64, length: u64, total: u64 },

    #[error("no backing store attached")]
    NoBackingStore,

    #[error("{size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },

    #[error("invalid file name: {0}")]
    InvalidName(String),
}
