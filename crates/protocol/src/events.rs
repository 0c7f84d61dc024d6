//! Inbound side of the peer session.

use crate::types::{Control, FileKind, Fingerprint, PeerId, TransferId, TransferKey};

/// Transfer-protocol event raised by the peer session.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// The peer wants `length` bytes of an upload starting at `offset`.
    /// A zero `length` marks the end of the transfer.
    ChunkRequested {
        peer_id: PeerId,
        transfer_id: TransferId,
        offset: u64,
        length: usize,
    },
    /// The peer delivered bytes of a download. Empty `data` marks the end.
    ChunkReceived {
        peer_id: PeerId,
        transfer_id: TransferId,
        offset: u64,
        data: Vec<u8>,
    },
    /// The peer paused, resumed or cancelled a transfer.
    ControlReceived {
        peer_id: PeerId,
        transfer_id: TransferId,
        control: Control,
    },
    /// The peer offers a new transfer.
    SendRequest {
        peer_id: PeerId,
        transfer_id: TransferId,
        kind: FileKind,
        name: String,
        size: u64,
        fingerprint: Option<Fingerprint>,
    },
    /// The peer's connection status changed.
    Connectivity { peer_id: PeerId, online: bool },
}

impl PeerEvent {
    /// Returns the peer this event concerns.
    pub fn peer_id(&self) -> PeerId {
        match self {
            PeerEvent::ChunkRequested { peer_id, .. }
            | PeerEvent::ChunkReceived { peer_id, .. }
            | PeerEvent::ControlReceived { peer_id, .. }
            | PeerEvent::SendRequest { peer_id, .. }
            | PeerEvent::Connectivity { peer_id, .. } => *peer_id,
        }
    }

    /// Returns the transfer key, if the event concerns a single transfer.
    pub fn transfer_key(&self) -> Option<TransferKey> {
        match self {
            PeerEvent::ChunkRequested {
                peer_id,
                transfer_id,
                ..
            }
            | PeerEvent::ChunkReceived {
                peer_id,
                transfer_id,
                ..
            }
            | PeerEvent::ControlReceived {
                peer_id,
                transfer_id,
                ..
            }
            | PeerEvent::SendRequest {
                peer_id,
                transfer_id,
                ..
            } => Some(TransferKey::new(*peer_id, *transfer_id)),
            PeerEvent::Connectivity { .. } => None,
        }
    }
}
