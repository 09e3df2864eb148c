//! Per-room publish/subscribe transport.
//!
//! Contract: unordered, at-most-once, no acknowledgements. `publish` is
//! fire-and-forget. A subscription is an [`Inbox`] of [`Envelope`]s; dropping
//! the inbox (or calling `unsubscribe`) ends it.
//!
//! [`LocalHub`] is the in-process implementation: every replica gets a
//! [`HubTransport`] handle onto one shared hub, and each published batch is
//! fanned out to every subscriber of the room, the sender included.

use shapesync_core::{DiffBatch, ReplicaId, RoomId};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::error::TransportError;

/// A batch as delivered to a subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub sender: ReplicaId,
    pub batch: DiffBatch,
}

impl Envelope {
    pub fn new(sender: ReplicaId, batch: DiffBatch) -> Self {
        Self { sender, batch }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

/// The inbox side was closed by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboxClosed;

/// Receiving end of one room subscription.
#[derive(Debug)]
pub struct Inbox {
    id: SubscriptionId,
    room: RoomId,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Inbox {
    pub fn new(id: SubscriptionId, room: RoomId, rx: mpsc::UnboundedReceiver<Envelope>) -> Self {
        Self { id, room, rx }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    /// Wait for the next envelope. `None` once the transport closed the inbox.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Result<Option<Envelope>, InboxClosed> {
        match self.rx.try_recv() {
            Ok(envelope) => Ok(Some(envelope)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(InboxClosed),
        }
    }
}

/// Narrow transport interface the session drives.
pub trait Transport: Send + Sync {
    /// Identity this transport publishes under.
    fn replica_id(&self) -> ReplicaId;

    fn join(&self, room: &RoomId) -> Result<(), TransportError>;

    fn leave(&self, room: &RoomId) -> Result<(), TransportError>;

    /// Fire-and-forget broadcast to the room.
    fn publish(&self, room: &RoomId, batch: &DiffBatch) -> Result<(), TransportError>;

    fn subscribe(&self, room: &RoomId) -> Result<Inbox, TransportError>;

    fn unsubscribe(&self, room: &RoomId, id: SubscriptionId);

    /// Re-establish a lost connection so that `join` can succeed again.
    /// Transports that cannot lose their connection have nothing to do.
    fn reconnect(&self) -> impl Future<Output = Result<(), TransportError>> + Send {
        async { Ok(()) }
    }
}

struct Subscriber {
    id: SubscriptionId,
    owner: ReplicaId,
    tx: mpsc::UnboundedSender<Envelope>,
}

#[derive(Default)]
struct HubRoom {
    members: HashSet<ReplicaId>,
    subscribers: Vec<Subscriber>,
}

struct HubState {
    rooms: HashMap<RoomId, HubRoom>,
    max_peers_per_room: usize,
}

/// In-process pub/sub hub shared by several replicas.
#[derive(Clone)]
pub struct LocalHub {
    state: Arc<Mutex<HubState>>,
    next_subscription: Arc<AtomicU64>,
    published: Arc<AtomicU64>,
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new(100)
    }
}

impl LocalHub {
    pub fn new(max_peers_per_room: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                rooms: HashMap::new(),
                max_peers_per_room,
            })),
            next_subscription: Arc::new(AtomicU64::new(1)),
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Transport handle for one replica.
    pub fn transport(&self, replica: ReplicaId) -> HubTransport {
        HubTransport {
            hub: self.clone(),
            replica,
        }
    }

    /// Drop every membership and subscription of `replica`, closing its inboxes.
    pub fn disconnect(&self, replica: ReplicaId) {
        let mut state = self.lock();
        for room in state.rooms.values_mut() {
            room.members.remove(&replica);
            room.subscribers.retain(|s| s.owner != replica);
        }
        state.rooms.retain(|_, room| !room.members.is_empty() || !room.subscribers.is_empty());
        log::info!("Hub: replica {replica} disconnected");
    }

    pub fn member_count(&self, room: &RoomId) -> usize {
        self.lock().rooms.get(room).map_or(0, |r| r.members.len())
    }

    pub fn subscriber_count(&self, room: &RoomId) -> usize {
        self.lock().rooms.get(room).map_or(0, |r| r.subscribers.len())
    }

    pub fn room_count(&self) -> usize {
        self.lock().rooms.len()
    }

    /// Total batches published through the hub.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One replica's handle onto a [`LocalHub`].
#[derive(Clone)]
pub struct HubTransport {
    hub: LocalHub,
    replica: ReplicaId,
}

impl Transport for HubTransport {
    fn replica_id(&self) -> ReplicaId {
        self.replica
    }

    fn join(&self, room: &RoomId) -> Result<(), TransportError> {
        let mut state = self.hub.lock();
        let max = state.max_peers_per_room;
        let entry = state.rooms.entry(room.clone()).or_default();
        if !entry.members.contains(&self.replica) && entry.members.len() >= max {
            return Err(TransportError::RoomFull(room.clone()));
        }
        entry.members.insert(self.replica);
        log::debug!("Hub: {} joined room {room}", self.replica);
        Ok(())
    }

    fn leave(&self, room: &RoomId) -> Result<(), TransportError> {
        let mut state = self.hub.lock();
        let Some(entry) = state.rooms.get_mut(room) else {
            return Err(TransportError::NotJoined(room.clone()));
        };
        if !entry.members.remove(&self.replica) {
            return Err(TransportError::NotJoined(room.clone()));
        }
        if entry.members.is_empty() && entry.subscribers.is_empty() {
            state.rooms.remove(room);
        }
        log::debug!("Hub: {} left room {room}", self.replica);
        Ok(())
    }

    fn publish(&self, room: &RoomId, batch: &DiffBatch) -> Result<(), TransportError> {
        let mut state = self.hub.lock();
        let entry = match state.rooms.get_mut(room) {
            Some(entry) if entry.members.contains(&self.replica) => entry,
            _ => return Err(TransportError::NotJoined(room.clone())),
        };
        // Closed inboxes are pruned as a side effect of delivery.
        entry.subscribers.retain(|s| {
            s.tx.send(Envelope::new(self.replica, batch.clone())).is_ok()
        });
        self.hub.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn subscribe(&self, room: &RoomId) -> Result<Inbox, TransportError> {
        let id = SubscriptionId(self.hub.next_subscription.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.hub.lock();
        state.rooms.entry(room.clone()).or_default().subscribers.push(Subscriber {
            id,
            owner: self.replica,
            tx,
        });
        Ok(Inbox::new(id, room.clone(), rx))
    }

    fn unsubscribe(&self, room: &RoomId, id: SubscriptionId) {
        let mut state = self.hub.lock();
        if let Some(entry) = state.rooms.get_mut(room) {
            entry.subscribers.retain(|s| s.id != id);
            if entry.members.is_empty() && entry.subscribers.is_empty() {
                state.rooms.remove(room);
            }
        }
    }
}
