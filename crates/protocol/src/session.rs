//! Outbound side of the peer session.
//!
//! The transfer core never talks to the network itself. It issues commands
//! through [`PeerSession`], which the application implements on top of the
//! real protocol engine.

use crate::types::{Control, FileKind, Fingerprint, PeerId, TransferId};

/// Errors reported by the peer protocol layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("peer {0} not found")]
    PeerNotFound(PeerId),

    #[error("peer {0} is not connected")]
    PeerOffline(PeerId),

    #[error("transfer {transfer_id} not found for peer {peer_id}")]
    TransferNotFound {
        peer_id: PeerId,
        transfer_id: TransferId,
    },

    #[error("too many concurrent transfers")]
    TooMany,

    #[error("send queue full")]
    SendQueueFull,

    #[error("rejected: {0}")]
    Rejected(String),
}

/// Commands accepted by the peer protocol engine.
///
/// Every call is expected to return promptly; the transport owns any
/// network waiting. Implementations must tolerate calls from several
/// threads at once.
pub trait PeerSession: Send + Sync {
    /// Asks the peer to accept a new transfer. Returns the id the protocol
    /// assigned to it.
    fn request_send(
        &self,
        peer_id: PeerId,
        kind: FileKind,
        size: u64,
        name: &str,
        fingerprint: Option<&Fingerprint>,
    ) -> Result<TransferId, SessionError>;

    /// Sends one chunk of an upload.
    fn send_chunk(
        &self,
        peer_id: PeerId,
        transfer_id: TransferId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), SessionError>;

    /// Sends a pause, resume or cancel control for a transfer.
    fn send_control(
        &self,
        peer_id: PeerId,
        transfer_id: TransferId,
        control: Control,
    ) -> Result<(), SessionError>;

    /// Moves the protocol-level position of an incoming transfer, so the
    /// peer starts sending from `offset`.
    fn seek(
        &self,
        peer_id: PeerId,
        transfer_id: TransferId,
        offset: u64,
    ) -> Result<(), SessionError>;

    /// Returns the fingerprint the protocol associates with a transfer.
    fn fingerprint(&self, peer_id: PeerId, transfer_id: TransferId) -> Option<Fingerprint>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages() {
        assert_eq!(SessionError::PeerOffline(4).to_string(), "peer 4 is not connected");
        assert_eq!(
            SessionError::TransferNotFound {
                peer_id: 1,
                transfer_id: 2
            }
            .to_string(),
            "transfer 2 not found for peer 1"
        );
    }
}
