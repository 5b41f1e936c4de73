//! Fan-out of relayed frames to the N-1 other peers of a room.
//!
//! Uses a tokio broadcast channel for O(1) send to all subscribers. Each
//! peer gets an independent receiver that buffers up to `capacity` frames;
//! a peer that falls further behind sees `RecvError::Lagged` and has to be
//! resynced by its connection task.
//!
//! Frames are tagged with the sending connection so every receiver can drop
//! its own frames: a peer never gets its own update echoed back.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// A frame queued for fan-out.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Connection the frame arrived on.
    pub from: Uuid,
    /// Encoded `SyncMessage`, shared by all receivers.
    pub frame: Arc<Vec<u8>>,
}

impl Envelope {
    pub fn is_from(&self, peer: Uuid) -> bool {
        self.from == peer
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    /// Sum over all sends of the number of peers a frame was queued for.
    pub deliveries: u64,
    pub active_peers: usize,
}

/// Broadcast group for a single room.
///
/// Not internally synchronized: the owning room serializes access so that
/// joins and fan-outs are ordered with respect to each other.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    peers: HashSet<Uuid>,
    messages_sent: u64,
    deliveries: u64,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given per-peer buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: HashSet::new(),
            messages_sent: 0,
            deliveries: 0,
        }
    }

    /// Add a peer and return its receiver.
    ///
    /// The receiver sees every frame broadcast after this call.
    pub fn add_peer(&mut self, peer: Uuid) -> broadcast::Receiver<Envelope> {
        self.peers.insert(peer);
        self.sender.subscribe()
    }

    /// Remove a peer. Its receiver stops counting once dropped.
    pub fn remove_peer(&mut self, peer: &Uuid) -> bool {
        self.peers.remove(peer)
    }

    /// Queue `frame` for every peer of the group.
    ///
    /// Returns the number of peers other than `from` that will see it.
    pub fn broadcast(&mut self, from: Uuid, frame: Arc<Vec<u8>>) -> usize {
        let receivers = self.sender.send(Envelope { from, frame }).unwrap_or(0);
        let own = usize::from(self.peers.contains(&from));
        let reached = receivers.saturating_sub(own);

        self.messages_sent += 1;
        self.deliveries += reached as u64;
        reached
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent,
            deliveries: self.deliveries,
            active_peers: self.peers.len(),
        }
    }
}
