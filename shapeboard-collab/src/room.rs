//! Rooms: one merged replica plus one broadcast group per room name.
//!
//! ```text
//!            RoomManager (RwLock<HashMap<name, Arc<Room>>>)
//!                 │  join / leave / evict serialized here
//!                 ▼
//!   Room ── Mutex<RoomState> ──┬── ShapeStore   (server-side replica)
//!                              └── BroadcastGroup (fan-out)
//! ```
//!
//! The room mutex is the per-room critical section: merging an update and
//! fanning it out happen under the same lock as a join, so a joining peer
//! either finds an update in the replica or receives it from the channel.
//! Rooms never share locks, so they proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use shapeboard_core::{Shape, ShapeStore, StoreError};

use crate::broadcast::{BroadcastGroup, BroadcastStats, Envelope};
use crate::error::SyncError;

/// Room used when the connection target names none.
pub const DEFAULT_ROOM: &str = "shapeboard";

struct RoomState {
    replica: ShapeStore,
    group: BroadcastGroup,
}

/// What a peer gets on joining a room.
pub struct Joined {
    /// Every frame broadcast in the room from now on.
    pub receiver: broadcast::Receiver<Envelope>,
    /// The replica's state vector at join time.
    pub state_vector: Vec<u8>,
}

pub struct Room {
    name: String,
    state: Mutex<RoomState>,
}

impl Room {
    pub fn new(name: impl Into<String>, broadcast_capacity: usize) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(RoomState {
                replica: ShapeStore::new(),
                group: BroadcastGroup::new(broadcast_capacity),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn join(&self, peer: Uuid, max_peers: usize) -> Result<Joined, SyncError> {
        let mut state = self.state.lock().await;
        if state.group.peer_count() >= max_peers {
            return Err(SyncError::RoomFull {
                room: self.name.clone(),
                limit: max_peers,
            });
        }
        let receiver = state.group.add_peer(peer);
        let state_vector = state.replica.state_vector();
        Ok(Joined {
            receiver,
            state_vector,
        })
    }

    /// Remove `peer`; returns the number of peers left.
    async fn leave(&self, peer: &Uuid) -> usize {
        let mut state = self.state.lock().await;
        state.group.remove_peer(peer);
        state.group.peer_count()
    }

    /// What the holder of `remote_state_vector` is missing.
    pub async fn diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, StoreError> {
        self.state.lock().await.replica.encode_diff(remote_state_vector)
    }

    /// The whole replica as one update.
    pub async fn full_state(&self) -> Vec<u8> {
        self.state.lock().await.replica.encode_state()
    }

    /// Merge `update` into the replica, then queue `frame` for every other
    /// peer. Nothing is forwarded if the merge fails.
    ///
    /// Returns the number of peers the frame was queued for.
    pub async fn merge_and_broadcast(
        &self,
        from: Uuid,
        update: &[u8],
        frame: Arc<Vec<u8>>,
    ) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        state.replica.apply_update(update)?;
        Ok(state.group.broadcast(from, frame))
    }

    /// Current contents of the room replica.
    pub async fn snapshot(&self) -> Vec<Shape> {
        self.state.lock().await.replica.to_array()
    }

    pub async fn peer_count(&self) -> usize {
        self.state.lock().await.group.peer_count()
    }

    pub async fn stats(&self) -> BroadcastStats {
        self.state.lock().await.group.stats()
    }
}

/// Room manager: maps room names to rooms.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    broadcast_capacity: usize,
    max_peers_per_room: usize,
    evict_empty_rooms: bool,
}

impl RoomManager {
    pub fn new(broadcast_capacity: usize, max_peers_per_room: usize, evict_empty_rooms: bool) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            broadcast_capacity,
            max_peers_per_room,
            evict_empty_rooms,
        }
    }

    /// Add `peer` to room `name`, creating the room on first use.
    pub async fn join(&self, name: &str, peer: Uuid) -> Result<(Arc<Room>, Joined), SyncError> {
        let mut rooms = self.rooms.write().await;
        let room = rooms
            .entry(name.to_string())
            .or_insert_with(|| {
                log::info!("Room '{name}' created");
                Arc::new(Room::new(name, self.broadcast_capacity))
            })
            .clone();

        match room.join(peer, self.max_peers_per_room).await {
            Ok(joined) => Ok((room, joined)),
            Err(e) => {
                if self.evict_empty_rooms && room.peer_count().await == 0 {
                    rooms.remove(name);
                }
                Err(e)
            }
        }
    }

    /// Remove `peer` from `room`. Returns `true` if the room was evicted.
    pub async fn leave(&self, room: &Arc<Room>, peer: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        let remaining = room.leave(peer).await;
        if remaining > 0 || !self.evict_empty_rooms {
            return false;
        }

        let registered = rooms
            .get(room.name())
            .is_some_and(|current| Arc::ptr_eq(current, room));
        if registered {
            rooms.remove(room.name());
            log::info!("Room '{}' evicted (empty)", room.name());
        }
        registered
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(name).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shapeboard_core::ShapeKind;

    fn update_with(ids: &[&str]) -> Vec<u8> {
        let store = ShapeStore::new();
        let shapes: Vec<_> = ids
            .iter()
            .map(|id| Shape::new(*id, ShapeKind::Square, 0.0, 0.0))
            .collect();
        store.push(&shapes).unwrap();
        store.encode_state()
    }

    #[tokio::test]
    async fn test_join_creates_and_leave_evicts() {
        let manager = RoomManager::new(16, 10, true);
        let peer = Uuid::new_v4();

        let (room, _joined) = manager.join("board", peer).await.unwrap();
        assert_eq!(manager.room_count().await, 1);
        assert_eq!(room.peer_count().await, 1);

        assert!(manager.leave(&room, &peer).await);
        assert_eq!(manager.room_count().await, 0);
        assert!(manager.get("board").await.is_none());
    }

    #[tokio::test]
    async fn test_rooms_kept_when_eviction_disabled() {
        let manager = RoomManager::new(16, 10, false);
        let peer = Uuid::new_v4();
        let (room, _joined) = manager.join("board", peer).await.unwrap();

        assert!(!manager.leave(&room, &peer).await);
        assert_eq!(manager.room_count().await, 1);
        assert!(manager.get("board").await.is_some());
    }

    #[tokio::test]
    async fn test_room_not_evicted_while_peers_remain() {
        let manager = RoomManager::new(16, 10, true);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (room, _ja) = manager.join("board", a).await.unwrap();
        let (same, _jb) = manager.join("board", b).await.unwrap();
        assert!(Arc::ptr_eq(&room, &same));

        assert!(!manager.leave(&room, &a).await);
        assert_eq!(manager.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_room_full() {
        let manager = RoomManager::new(16, 1, true);
        let _first = manager.join("board", Uuid::new_v4()).await.unwrap();
        let err = manager.join("board", Uuid::new_v4()).await.err().unwrap();
        assert!(matches!(err, SyncError::RoomFull { limit: 1, .. }));
    }

    #[tokio::test]
    async fn test_merge_and_broadcast_reaches_others_only() {
        let manager = RoomManager::new(16, 10, true);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (room, mut joined_a) = manager.join("board", a).await.unwrap();
        let (_, mut joined_b) = manager.join("board", b).await.unwrap();

        let update = update_with(&["s1"]);
        let frame = Arc::new(vec![9, 9, 9]);
        assert_eq!(room.merge_and_broadcast(a, &update, frame).await.unwrap(), 1);

        assert_eq!(room.snapshot().await.len(), 1);
        assert!(!joined_b.receiver.recv().await.unwrap().is_from(b));
        assert!(joined_a.receiver.recv().await.unwrap().is_from(a));
    }

    #[tokio::test]
    async fn test_malformed_update_not_forwarded() {
        let manager = RoomManager::new(16, 10, true);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let (room, _ja) = manager.join("board", a).await.unwrap();
        let (_, mut joined_b) = manager.join("board", b).await.unwrap();

        let result = room
            .merge_and_broadcast(a, &[0xFF, 0xFE, 0xFD], Arc::new(vec![1]))
            .await;
        assert!(result.is_err());
        assert!(joined_b.receiver.try_recv().is_err());
        assert_eq!(room.stats().await.messages_sent, 0);
    }

    #[tokio::test]
    async fn test_late_joiner_diff_matches_replica() {
        let manager = RoomManager::new(16, 10, true);
        let (room, _j) = manager.join("board", Uuid::new_v4()).await.unwrap();
        room.merge_and_broadcast(Uuid::new_v4(), &update_with(&["a", "b", "c"]), Arc::new(vec![]))
            .await
            .unwrap();

        let joiner = ShapeStore::new();
        let diff = room.diff(&joiner.state_vector()).await.unwrap();
        joiner.apply_update(&diff).unwrap();
        assert_eq!(joiner.to_array(), room.snapshot().await);

        let fresh = ShapeStore::new();
        fresh.apply_update(&room.full_state().await).unwrap();
        assert_eq!(fresh.to_array().len(), 3);
    }
}
