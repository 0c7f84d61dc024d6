//! Peer-session types for OneTox file transfers.
//!
//! Defines the identity types shared by every transfer, the commands the
//! transfer core issues to the peer protocol engine ([`PeerSession`]) and the
//! events the engine raises back ([`PeerEvent`]).

pub mod events;
pub mod session;
pub mod types;

pub use events::PeerEvent;
pub use session::{PeerSession, SessionError};
pub use types::{Control, Direction, FileKind, Fingerprint, PeerId, TransferId, TransferKey};

/// Largest chunk payload the peer protocol carries in one packet.
pub const MAX_CHUNK_SIZE: usize = 1371;

/// Largest avatar the peer protocol accepts, in bytes.
pub const MAX_AVATAR_SIZE: u64 = 65536;
