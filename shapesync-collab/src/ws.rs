//! WebSocket client transport talking to a [`RelayServer`](crate::relay::RelayServer).
//!
//! Each connection runs two tasks: a writer draining the outgoing frame queue
//! into the socket, and a reader routing incoming `Batch` frames to the
//! inboxes subscribed to the frame's room. Frames carrying our own replica
//! id are skipped. When the socket closes every inbox is closed, which the
//! session treats as a disconnect. [`WsTransport::redial`] opens a fresh
//! connection to the same relay; the session then joins and subscribes again.
//!
//! The relay tracks one room per connection, so joining a second room moves
//! this transport out of the first.

use futures_util::{SinkExt, StreamExt};
use shapesync_core::{DiffBatch, ReplicaId, RoomId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::TransportError;
use crate::protocol::{MessageType, SyncMessage};
use crate::transport::{Envelope, Inbox, SubscriptionId, Transport};

/// Frames buffered for the writer task before `publish` starts failing.
const OUTGOING_CAPACITY: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Default)]
struct Routes {
    /// Bumped on every redial; a reader only tears down its own connection.
    generation: u64,
    joined: Option<RoomId>,
    subscribers: HashMap<RoomId, Vec<(SubscriptionId, mpsc::UnboundedSender<Envelope>)>>,
}

impl Routes {
    fn deliver(&mut self, room: &RoomId, envelope: Envelope) {
        if let Some(subs) = self.subscribers.get_mut(room) {
            subs.retain(|(_, tx)| tx.send(envelope.clone()).is_ok());
        }
    }
}

pub struct WsTransport {
    replica: ReplicaId,
    url: String,
    outgoing: Mutex<mpsc::Sender<Vec<u8>>>,
    routes: Arc<Mutex<Routes>>,
    connected: Arc<AtomicBool>,
    seq: AtomicU64,
    next_subscription: AtomicU64,
}

impl WsTransport {
    /// Open a connection to the relay at `url` (e.g. `ws://127.0.0.1:9090`).
    pub async fn connect(url: impl Into<String>, replica: ReplicaId) -> Result<Self, TransportError> {
        let url = url.into();
        let stream = dial(&url).await?;
        log::info!("Connected to relay {url} as {replica}");

        let routes = Arc::new(Mutex::new(Routes::default()));
        let connected = Arc::new(AtomicBool::new(true));
        let outgoing = spawn_link(stream, replica, 0, routes.clone(), connected.clone());

        Ok(Self {
            replica,
            url,
            outgoing: Mutex::new(outgoing),
            routes,
            connected,
            seq: AtomicU64::new(0),
            next_subscription: AtomicU64::new(1),
        })
    }

    /// Open a new connection to the same relay after the previous one closed.
    ///
    /// A no-op while connected. Room membership and subscriptions are not
    /// carried over.
    pub async fn redial(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        let stream = dial(&self.url).await?;

        let mut routes = lock(&self.routes);
        routes.generation += 1;
        *lock(&self.outgoing) = spawn_link(
            stream,
            self.replica,
            routes.generation,
            self.routes.clone(),
            self.connected.clone(),
        );
        self.connected.store(true, Ordering::Release);
        log::info!(
            "Reconnected to relay {} as {} (generation {})",
            self.url,
            self.replica,
            routes.generation
        );
        Ok(())
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Room currently joined through this connection.
    pub fn joined_room(&self) -> Option<RoomId> {
        lock(&self.routes).joined.clone()
    }

    /// Heartbeat; the relay answers with a `Pong`.
    pub fn ping(&self) -> Result<(), TransportError> {
        self.send(&SyncMessage::ping(self.replica))
    }

    fn send(&self, msg: &SyncMessage) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::ConnectionClosed);
        }
        let bytes = msg.encode()?;
        lock(&self.outgoing).try_send(bytes).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::Io("outgoing queue full".to_string()),
            TrySendError::Closed(_) => TransportError::ConnectionClosed,
        })
    }
}

impl Transport for WsTransport {
    fn replica_id(&self) -> ReplicaId {
        self.replica
    }

    fn join(&self, room: &RoomId) -> Result<(), TransportError> {
        self.send(&SyncMessage::join(self.replica, room.clone()))?;
        lock(&self.routes).joined = Some(room.clone());
        Ok(())
    }

    fn leave(&self, room: &RoomId) -> Result<(), TransportError> {
        let mut routes = lock(&self.routes);
        if routes.joined.as_ref() != Some(room) {
            return Err(TransportError::NotJoined(room.clone()));
        }
        routes.joined = None;
        drop(routes);
        self.send(&SyncMessage::leave(self.replica, room.clone()))
    }

    fn publish(&self, room: &RoomId, batch: &DiffBatch) -> Result<(), TransportError> {
        if lock(&self.routes).joined.as_ref() != Some(room) {
            return Err(TransportError::NotJoined(room.clone()));
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.send(&SyncMessage::batch(self.replica, room.clone(), seq, batch)?)
    }

    fn subscribe(&self, room: &RoomId) -> Result<Inbox, TransportError> {
        let mut routes = lock(&self.routes);
        // Checked under the lock so a closing reader cannot miss this inbox.
        if !self.is_connected() {
            return Err(TransportError::ConnectionClosed);
        }
        let id = SubscriptionId::new(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        routes.subscribers.entry(room.clone()).or_default().push((id, tx));
        Ok(Inbox::new(id, room.clone(), rx))
    }

    fn unsubscribe(&self, room: &RoomId, id: SubscriptionId) {
        let mut routes = lock(&self.routes);
        if let Some(subs) = routes.subscribers.get_mut(room) {
            subs.retain(|(sub, _)| *sub != id);
            if subs.is_empty() {
                routes.subscribers.remove(room);
            }
        }
    }

    fn reconnect(&self) -> impl Future<Output = Result<(), TransportError>> + Send {
        self.redial()
    }
}

async fn dial(url: &str) -> Result<WsStream, TransportError> {
    let (stream, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    Ok(stream)
}

/// Spawn the writer and reader tasks for one socket and return the writer's queue.
fn spawn_link(
    stream: WsStream,
    replica: ReplicaId,
    generation: u64,
    routes: Arc<Mutex<Routes>>,
    connected: Arc<AtomicBool>,
) -> mpsc::Sender<Vec<u8>> {
    let (mut ws_writer, mut ws_reader) = stream.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(OUTGOING_CAPACITY);

    tokio::spawn(async move {
        while let Some(data) = out_rx.recv().await {
            if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                break;
            }
        }
        // Transport dropped, redialed, or socket broken.
        let _ = ws_writer.close().await;
    });

    tokio::spawn(async move {
        while let Some(msg) = ws_reader.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    let bytes: Vec<u8> = data.into();
                    let frame = match SyncMessage::decode(&bytes) {
                        Ok(frame) => frame,
                        Err(e) => {
                            log::warn!("Undecodable frame from relay: {e}");
                            continue;
                        }
                    };
                    if frame.sender == replica {
                        continue;
                    }
                    match frame.msg_type {
                        MessageType::Batch => match frame.diff_batch() {
                            Ok(batch) => {
                                let envelope = Envelope::new(frame.sender, batch);
                                lock(&routes).deliver(&frame.room, envelope);
                            }
                            Err(e) => log::warn!("Bad batch from {}: {e}", frame.sender),
                        },
                        MessageType::Pong => log::trace!("Pong from relay"),
                        other => log::debug!("Ignoring {other:?} frame from relay"),
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }

        let mut routes = lock(&routes);
        if routes.generation != generation {
            return;
        }
        connected.store(false, Ordering::Release);
        routes.joined = None;
        // Dropping the senders closes every inbox.
        routes.subscribers.clear();
        log::info!("Relay connection for {replica} closed");
    });

    out_tx
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
