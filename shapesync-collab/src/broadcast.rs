//! Per-room fan-out for the relay.
//!
//! Each room owns one tokio broadcast channel. A frame is encoded once and
//! shared by every receiver; each connection filters out its own frames.
//! Receivers buffer up to `capacity` frames before they start lagging.

use shapesync_core::{ReplicaId, RoomId};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::error::{ProtocolError, TransportError};
use crate::protocol::SyncMessage;

/// An encoded frame tagged with the replica that sent it.
#[derive(Debug, Clone)]
pub struct RelayFrame {
    pub sender: ReplicaId,
    pub bytes: Arc<Vec<u8>>,
}

/// Snapshot of one group's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_lagged: u64,
    pub active_peers: usize,
}

/// Peers of one room sharing a broadcast channel.
pub struct BroadcastGroup {
    sender: broadcast::Sender<RelayFrame>,
    peers: RwLock<HashSet<ReplicaId>>,
    max_peers: usize,
    frames_sent: AtomicU64,
    frames_lagged: AtomicU64,
}

impl BroadcastGroup {
    pub fn new(capacity: usize, max_peers: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashSet::new()),
            max_peers,
            frames_sent: AtomicU64::new(0),
            frames_lagged: AtomicU64::new(0),
        }
    }

    /// Add a peer and hand back its receiver. Re-adding a present peer
    /// just returns a fresh receiver.
    pub async fn add_peer(
        &self,
        room: &RoomId,
        peer: ReplicaId,
    ) -> Result<broadcast::Receiver<RelayFrame>, TransportError> {
        let mut peers = self.peers.write().await;
        if !peers.contains(&peer) && peers.len() >= self.max_peers {
            return Err(TransportError::RoomFull(room.clone()));
        }
        peers.insert(peer);
        Ok(self.sender.subscribe())
    }

    pub async fn remove_peer(&self, peer: &ReplicaId) -> bool {
        self.peers.write().await.remove(peer)
    }

    /// Encode and send to every receiver. Returns the receiver count.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let bytes = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(RelayFrame {
            sender: msg.sender,
            bytes,
        }))
    }

    /// Send an already encoded frame.
    pub fn broadcast_raw(&self, frame: RelayFrame) -> usize {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        // No receivers is not an error for a relay.
        self.sender.send(frame).unwrap_or(0)
    }

    /// Account for frames a slow receiver skipped.
    pub fn record_lag(&self, skipped: u64) {
        self.frames_lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, peer: &ReplicaId) -> bool {
        self.peers.read().await.contains(peer)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_lagged: self.frames_lagged.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }
}

/// Room id to broadcast group.
pub struct RoomManager {
    rooms: RwLock<HashMap<RoomId, Arc<BroadcastGroup>>>,
    capacity: usize,
    max_peers: usize,
}

impl RoomManager {
    pub fn new(capacity: usize, max_peers: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
            max_peers,
        }
    }

    /// Add `peer` to `room`, creating the room if needed.
    ///
    /// The rooms lock is held across the peer insert, so a concurrent
    /// `remove_if_empty` cannot drop the group between lookup and join.
    pub async fn join(
        &self,
        room: &RoomId,
        peer: ReplicaId,
    ) -> Result<(Arc<BroadcastGroup>, broadcast::Receiver<RelayFrame>), TransportError> {
        let mut rooms = self.rooms.write().await;
        let group = rooms
            .entry(room.clone())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.capacity, self.max_peers)))
            .clone();
        match group.add_peer(room, peer).await {
            Ok(rx) => Ok((group, rx)),
            Err(e) => {
                if group.peer_count().await == 0 {
                    rooms.remove(room);
                }
                Err(e)
            }
        }
    }

    pub async fn get(&self, room: &RoomId) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(room).cloned()
    }

    /// Drop the room if nobody is left in it.
    pub async fn remove_if_empty(&self, room: &RoomId) -> bool {
        let mut rooms = self.rooms.write().await;
        let empty = match rooms.get(room) {
            Some(group) => group.peer_count().await == 0,
            None => false,
        };
        if empty {
            rooms.remove(room);
            log::info!("Room {room} removed (empty)");
        }
        empty
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<RoomId> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
