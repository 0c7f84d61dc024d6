//! Transfer state machine.
//!
//! Transitions are pure: [`TransferState::apply`] returns the next state or
//! `None` when the trigger is not legal from the current one. Callers ignore
//! illegal triggers; peers routinely send duplicate or stale controls.

use std::fmt;

use onetox_protocol::Direction;

/// Lifecycle state of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferState {
    /// Upload requested, waiting for the peer to accept.
    BeforeUpload,
    /// Download offered, waiting for a local destination.
    BeforeDownload,
    Uploading,
    Downloading,
    PausedByUser,
    PausedByPeer,
    Finished,
    Cancelled,
}

/// Who issued a pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Peer,
}

/// Something that may move a transfer to another state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Pause(Origin),
    Resume,
    Cancel,
    /// The chunk engine reached the end of the stream.
    Complete,
}

impl TransferState {
    /// The transferring state for `direction`.
    pub fn active_for(direction: Direction) -> Self {
        match direction {
            Direction::Upload => TransferState::Uploading,
            Direction::Download => TransferState::Downloading,
        }
    }

    /// The waiting state a fresh transfer starts in.
    pub fn before(direction: Direction) -> Self {
        match direction {
            Direction::Upload => TransferState::BeforeUpload,
            Direction::Download => TransferState::BeforeDownload,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Finished | TransferState::Cancelled)
    }

    pub fn is_active(self) -> bool {
        matches!(self, TransferState::Uploading | TransferState::Downloading)
    }

    pub fn is_paused(self) -> bool {
        matches!(self, TransferState::PausedByUser | TransferState::PausedByPeer)
    }

    pub fn is_waiting(self) -> bool {
        matches!(self, TransferState::BeforeUpload | TransferState::BeforeDownload)
    }

    /// Computes the state after `trigger`, or `None` if it is not legal.
    pub fn apply(self, direction: Direction, trigger: Trigger) -> Option<Self> {
        if self.is_terminal() {
            return None;
        }
        match trigger {
            Trigger::Cancel => Some(TransferState::Cancelled),
            Trigger::Pause(Origin::Local) if self.is_active() => Some(TransferState::PausedByUser),
            Trigger::Pause(Origin::Peer) if self.is_active() => Some(TransferState::PausedByPeer),
            Trigger::Resume if self.is_paused() || self.is_waiting() => {
                Some(TransferState::active_for(direction))
            }
            Trigger::Complete if self.is_active() => Some(TransferState::Finished),
            _ => None,
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferState::BeforeUpload => "before upload",
            TransferState::BeforeDownload => "before download",
            TransferState::Uploading => "uploading",
            TransferState::Downloading => "downloading",
            TransferState::PausedByUser => "paused by user",
            TransferState::PausedByPeer => "paused by peer",
            TransferState::Finished => "finished",
            TransferState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// How a record comes into existence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartMode {
    /// A brand-new transfer starting at byte zero.
    #[default]
    Fresh,
    /// Continuation of an interrupted transfer.
    Resumed { offset: u64 },
}

impl StartMode {
    pub fn offset(self) -> u64 {
        match self {
            StartMode::Fresh => 0,
            StartMode::Resumed { offset } => offset,
        }
    }
}

/// Initial state of a record. Resumed transfers were already agreed on, so
/// they start transferring right away.
pub fn initial_state(direction: Direction, mode: StartMode) -> TransferState {
    match mode {
        StartMode::Fresh => TransferState::before(direction),
        StartMode::Resumed { .. } => TransferState::active_for(direction),
    }
}
