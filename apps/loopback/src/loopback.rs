//! In-process peer session connecting two transfer managers.
//!
//! Each node has an inbox drained by a pump task that feeds its manager.
//! Session calls never call into a manager directly, they only queue
//! messages, so a manager can call its session while holding record locks.
//!
//! The sending node generates chunk requests for its own uploads, one at a
//! time, while the transfer runs, the way a peer protocol engine does.
//! Transfer ids seen by the receiver have [`INCOMING_BIT`] flipped, so ids
//! for each direction never collide.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use onetox_protocol::{
    Control, FileKind, Fingerprint, PeerEvent, PeerId, PeerSession, SessionError, TransferId,
};
use onetox_transfer::TransferManager;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Flipped on transfer ids crossing to the other node.
pub const INCOMING_BIT: TransferId = 1 << 16;

/// Messages between nodes.
#[derive(Debug)]
enum Wire {
    Event(PeerEvent),
    /// The receiver asks the sender to start from `offset`.
    Seek { transfer_id: TransferId, offset: u64 },
}

#[derive(Debug)]
struct Outgoing {
    size: u64,
    position: u64,
    running: bool,
    in_flight: bool,
}

#[derive(Default)]
struct SessionState {
    next_id: TransferId,
    outgoing: HashMap<TransferId, Outgoing>,
    fingerprints: HashMap<TransferId, Fingerprint>,
    online: bool,
}

/// One side of the loopback.
pub struct LoopbackSession {
    /// How the other node addresses us.
    local_id: PeerId,
    /// How we address the other node.
    remote_id: PeerId,
    chunk_size: usize,
    own_tx: mpsc::UnboundedSender<Wire>,
    remote_tx: mpsc::UnboundedSender<Wire>,
    state: Mutex<SessionState>,
}

impl LoopbackSession {
    fn check_peer(&self, peer_id: PeerId) -> Result<(), SessionError> {
        if peer_id != self.remote_id {
            return Err(SessionError::PeerNotFound(peer_id));
        }
        if !self.state.lock().unwrap().online {
            return Err(SessionError::PeerOffline(peer_id));
        }
        Ok(())
    }

    fn to_remote(&self, event: PeerEvent) -> Result<(), SessionError> {
        self.remote_tx
            .send(Wire::Event(event))
            .map_err(|_| SessionError::PeerOffline(self.remote_id))
    }

    /// Queues the next chunk request of an upload, if it should run.
    fn kick(&self, state: &mut SessionState, transfer_id: TransferId) {
        let Some(out) = state.outgoing.get_mut(&transfer_id) else {
            return;
        };
        if !out.running || out.in_flight || out.position >= out.size {
            return;
        }
        let length = (out.size - out.position).min(self.chunk_size as u64) as usize;
        out.in_flight = true;
        let event = PeerEvent::ChunkRequested {
            peer_id: self.remote_id,
            transfer_id,
            offset: out.position,
            length,
        };
        if self.own_tx.send(Wire::Event(event)).is_err() {
            tracing::debug!(transfer = transfer_id, "inbox closed, chunk request dropped");
        }
    }

    /// Applies a control to an upload, whichever side issued it.
    fn control_outgoing(&self, transfer_id: TransferId, control: Control) {
        let mut state = self.state.lock().unwrap();
        match control {
            Control::Resume => {
                if let Some(out) = state.outgoing.get_mut(&transfer_id) {
                    out.running = true;
                    // A request queued before a pause may have been dropped.
                    out.in_flight = false;
                }
                self.kick(&mut state, transfer_id);
            }
            Control::Pause => {
                if let Some(out) = state.outgoing.get_mut(&transfer_id) {
                    out.running = false;
                }
            }
            Control::Cancel => {
                state.outgoing.remove(&transfer_id);
                state.fingerprints.remove(&transfer_id);
            }
        }
    }

    fn set_online(&self, online: bool) {
        let mut state = self.state.lock().unwrap();
        state.online = online;
        if !online {
            // The protocol engine forgets running transfers on disconnect.
            state.outgoing.clear();
            state.fingerprints.clear();
        }
    }
}

impl PeerSession for LoopbackSession {
    fn request_send(
        &self,
        peer_id: PeerId,
        kind: FileKind,
        size: u64,
        name: &str,
        fingerprint: Option<&Fingerprint>,
    ) -> Result<TransferId, SessionError> {
        self.check_peer(peer_id)?;
        let transfer_id = {
            let mut state = self.state.lock().unwrap();
            let id = state.next_id;
            state.next_id += 1;
            state.outgoing.insert(
                id,
                Outgoing {
                    size,
                    position: 0,
                    running: false,
                    in_flight: false,
                },
            );
            if let Some(fp) = fingerprint {
                state.fingerprints.insert(id, fp.clone());
            }
            id
        };
        self.to_remote(PeerEvent::SendRequest {
            peer_id: self.local_id,
            transfer_id: transfer_id ^ INCOMING_BIT,
            kind,
            name: name.to_string(),
            size,
            fingerprint: fingerprint.cloned(),
        })?;
        Ok(transfer_id)
    }

    fn send_chunk(
        &self,
        peer_id: PeerId,
        transfer_id: TransferId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), SessionError> {
        self.check_peer(peer_id)?;
        {
            let mut state = self.state.lock().unwrap();
            let out = state
                .outgoing
                .get_mut(&transfer_id)
                .ok_or(SessionError::TransferNotFound { peer_id, transfer_id })?;
            out.position = offset + data.len() as u64;
            out.in_flight = false;
            self.kick(&mut state, transfer_id);
        }
        self.to_remote(PeerEvent::ChunkReceived {
            peer_id: self.local_id,
            transfer_id: transfer_id ^ INCOMING_BIT,
            offset,
            data: data.to_vec(),
        })
    }

    fn send_control(
        &self,
        peer_id: PeerId,
        transfer_id: TransferId,
        control: Control,
    ) -> Result<(), SessionError> {
        self.check_peer(peer_id)?;
        self.control_outgoing(transfer_id, control);
        self.to_remote(PeerEvent::ControlReceived {
            peer_id: self.local_id,
            transfer_id: transfer_id ^ INCOMING_BIT,
            control,
        })
    }

    fn seek(&self, peer_id: PeerId, transfer_id: TransferId, offset: u64) -> Result<(), SessionError> {
        self.check_peer(peer_id)?;
        self.remote_tx
            .send(Wire::Seek {
                transfer_id: transfer_id ^ INCOMING_BIT,
                offset,
            })
            .map_err(|_| SessionError::PeerOffline(peer_id))
    }

    fn fingerprint(&self, _peer_id: PeerId, transfer_id: TransferId) -> Option<Fingerprint> {
        self.state
            .lock()
            .unwrap()
            .fingerprints
            .get(&transfer_id)
            .cloned()
    }
}

/// A manager plus the session and pump that feed it.
pub struct Node {
    pub name: &'static str,
    pub session: Arc<LoopbackSession>,
    inbox: Option<mpsc::UnboundedReceiver<Wire>>,
}

impl Node {
    /// Starts the pump delivering this node's inbox to `manager`.
    pub fn spawn_pump(&mut self, manager: Arc<TransferManager>) -> Option<JoinHandle<()>> {
        let mut inbox = self.inbox.take()?;
        let session = Arc::clone(&self.session);
        let name = self.name;
        Some(tokio::spawn(async move {
            while let Some(wire) = inbox.recv().await {
                match wire {
                    Wire::Event(event) => {
                        if let PeerEvent::ControlReceived {
                            transfer_id,
                            control,
                            ..
                        } = &event
                        {
                            session.control_outgoing(*transfer_id, *control);
                        }
                        tracing::trace!(node = name, ?event, "delivering");
                        manager.handle_event(event);
                    }
                    Wire::Seek {
                        transfer_id,
                        offset,
                    } => {
                        let mut state = session.state.lock().unwrap();
                        if let Some(out) = state.outgoing.get_mut(&transfer_id) {
                            out.position = offset;
                        }
                    }
                }
            }
            tracing::debug!(node = name, "pump stopped");
        }))
    }

    /// Tells this node's manager the other side went on- or offline.
    pub fn set_peer_online(&self, online: bool) {
        self.session.set_online(online);
        let event = PeerEvent::Connectivity {
            peer_id: self.session.remote_id,
            online,
        };
        if self.session.own_tx.send(Wire::Event(event)).is_err() {
            tracing::debug!(node = self.name, "inbox closed, connectivity change dropped");
        }
    }

    /// How this node addresses the other one.
    pub fn remote_id(&self) -> PeerId {
        self.session.remote_id
    }
}

/// Builds two connected nodes. `a` is peer 1 to `b`; `b` is peer 2 to `a`.
pub fn pair(chunk_size: usize) -> (Node, Node) {
    const A_ID: PeerId = 1;
    const B_ID: PeerId = 2;

    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let session = |local_id, remote_id, own_tx, remote_tx| {
        Arc::new(LoopbackSession {
            local_id,
            remote_id,
            chunk_size: chunk_size.max(1),
            own_tx,
            remote_tx,
            state: Mutex::new(SessionState::default()),
        })
    };

    let a = Node {
        name: "alice",
        session: session(A_ID, B_ID, a_tx.clone(), b_tx.clone()),
        inbox: Some(a_rx),
    };
    let b = Node {
        name: "bob",
        session: session(B_ID, A_ID, b_tx, a_tx),
        inbox: Some(b_rx),
    };
    (a, b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use onetox_transfer::{BackingStore, ResumeLedger, TransferConfig, TransferEvent};

    fn manager(node: &Node) -> Arc<TransferManager> {
        Arc::new(TransferManager::new(
            node.session.clone(),
            ResumeLedger::in_memory(8),
            TransferConfig::default(),
        ))
    }

    #[test]
    fn ids_flip_between_sides() {
        assert_eq!(3 ^ INCOMING_BIT ^ INCOMING_BIT, 3);
        assert_ne!(3 ^ INCOMING_BIT, 3);
    }

    #[test]
    fn offline_peer_rejects_requests() {
        let (a, _b) = pair(16);
        let err = a
            .session
            .request_send(a.remote_id(), FileKind::Data, 4, "x", None)
            .unwrap_err();
        assert_eq!(err, SessionError::PeerOffline(2));
        assert_eq!(
            a.session.request_send(99, FileKind::Data, 4, "x", None),
            Err(SessionError::PeerNotFound(99))
        );
    }

    #[tokio::test]
    async fn file_moves_between_nodes() {
        let (mut a, mut b) = pair(7);
        let alice = manager(&a);
        let bob = manager(&b);
        let mut bob_events = bob.take_events().unwrap();
        a.spawn_pump(Arc::clone(&alice)).unwrap();
        b.spawn_pump(Arc::clone(&bob)).unwrap();
        a.set_peer_online(true);
        b.set_peer_online(true);
        tokio::task::yield_now().await;

        let payload: Vec<u8> = (0..100u8).collect();
        alice
            .send_data(a.remote_id(), FileKind::Data, "p.bin", BackingStore::memory(payload.clone()), None)
            .unwrap();

        let received = loop {
            match bob_events.recv().await.unwrap() {
                TransferEvent::IncomingRequest { key, .. } => {
                    bob.accept_incoming(key, BackingStore::memory(Vec::new())).unwrap();
                }
                TransferEvent::Finished { store: Some(store), .. } => break store,
                _ => {}
            }
        };
        assert_eq!(received.into_bytes().unwrap(), payload);
    }
}
