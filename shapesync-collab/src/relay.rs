//! WebSocket relay: forwards diff batches between the replicas of a room.
//!
//! ```text
//! WsTransport A ──┐                        ┌──► WsTransport B
//!                 ├── Room ── BroadcastGroup┤
//! WsTransport C ──┘                        └──► WsTransport C (own frames skipped)
//! ```
//!
//! The relay keeps no shape state. A connection serves one replica in one
//! room at a time: `Join` places it in a room (leaving any previous one),
//! `Batch` frames for that room are fanned out to every other member, and
//! `Leave` or disconnect removes it. Empty rooms are dropped.

use futures_util::{SinkExt, StreamExt};
use shapesync_core::{ReplicaId, RoomId};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::{BroadcastGroup, RelayFrame, RoomManager};
use crate::config::RelayConfig;
use crate::protocol::{MessageType, SyncMessage};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Relay counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub batches_relayed: u64,
    pub rejected_joins: u64,
    pub active_rooms: usize,
}

/// The room a connection currently belongs to.
struct Membership {
    peer: ReplicaId,
    room: RoomId,
    group: Arc<BroadcastGroup>,
}

pub struct RelayServer {
    config: RelayConfig,
    id: ReplicaId,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(
            config.broadcast_capacity,
            config.max_peers_per_room,
        ));
        Self {
            config,
            id: ReplicaId::new(),
            rooms,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Bind to the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let relay_id = self.id;
            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, relay_id, rooms, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    relay_id: ReplicaId,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<RelayStats>>,
) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("WebSocket connection established from {addr}");

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut membership: Option<Membership> = None;
    let mut room_rx: Option<broadcast::Receiver<RelayFrame>> = None;

    let result: Result<(), BoxError> = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = stats.write().await;
                                s.frames_received += 1;
                                s.bytes_received += bytes.len() as u64;
                            }
                            let frame = match SyncMessage::decode(&bytes) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::warn!("Failed to decode frame from {addr}: {e}");
                                    continue;
                                }
                            };

                            match frame.msg_type {
                                MessageType::Join => {
                                    if let Some(previous) = membership.take() {
                                        room_rx = None;
                                        leave_room(previous, &rooms, &stats).await;
                                    }
                                    match rooms.join(&frame.room, frame.sender).await {
                                        Ok((group, rx)) => {
                                            log::info!("Peer {} joined room {}", frame.sender, frame.room);
                                            room_rx = Some(rx);
                                            membership = Some(Membership {
                                                peer: frame.sender,
                                                room: frame.room,
                                                group,
                                            });
                                            refresh_active_rooms(&rooms, &stats).await;
                                        }
                                        Err(e) => {
                                            log::warn!("Rejecting {} from {addr}: {e}", frame.sender);
                                            stats.write().await.rejected_joins += 1;
                                            ws_sender.send(Message::Close(None)).await?;
                                            break;
                                        }
                                    }
                                }

                                MessageType::Leave => {
                                    if let Some(current) = membership.take() {
                                        room_rx = None;
                                        leave_room(current, &rooms, &stats).await;
                                    }
                                }

                                MessageType::Batch => match &membership {
                                    Some(m) if m.room == frame.room && m.peer == frame.sender => {
                                        let receivers = m.group.broadcast_raw(RelayFrame {
                                            sender: frame.sender,
                                            bytes: Arc::new(bytes),
                                        });
                                        log::trace!(
                                            "Relayed batch seq {} from {} to {receivers} receivers",
                                            frame.seq,
                                            frame.sender
                                        );
                                        stats.write().await.batches_relayed += 1;
                                    }
                                    _ => {
                                        log::warn!(
                                            "Dropping batch from {} for room {} it has not joined",
                                            frame.sender,
                                            frame.room
                                        );
                                    }
                                },

                                MessageType::Ping => {
                                    let pong = SyncMessage::pong(relay_id).encode()?;
                                    ws_sender.send(Message::Binary(pong.into())).await?;
                                }

                                MessageType::Pong => {}
                            }
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                frame = async {
                    match room_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match frame {
                        Ok(frame) => {
                            // Never echo a frame back to its sender.
                            if membership.as_ref().is_some_and(|m| m.peer == frame.sender) {
                                continue;
                            }
                            ws_sender.send(Message::Binary(frame.bytes.to_vec().into())).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Connection {addr} lagged by {n} frames");
                            if let Some(m) = &membership {
                                m.group.record_lag(n);
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        Ok(())
    }
    .await;

    if let Some(current) = membership.take() {
        leave_room(current, &rooms, &stats).await;
    }
    {
        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }
    result
}

async fn leave_room(membership: Membership, rooms: &RoomManager, stats: &RwLock<RelayStats>) {
    membership.group.remove_peer(&membership.peer).await;
    rooms.remove_if_empty(&membership.room).await;
    refresh_active_rooms(rooms, stats).await;
    log::info!("Peer {} left room {}", membership.peer, membership.room);
}

async fn refresh_active_rooms(rooms: &RoomManager, stats: &RwLock<RelayStats>) {
    let active_rooms = rooms.room_count().await;
    stats.write().await.active_rooms = active_rooms;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_uses_config() {
        let relay = RelayServer::new(RelayConfig {
            bind_addr: "0.0.0.0:8080".to_string(),
            ..RelayConfig::default()
        });
        assert_eq!(relay.bind_addr(), "0.0.0.0:8080");
    }

    #[tokio::test]
    async fn test_initial_stats() {
        let relay = RelayServer::with_defaults();
        assert_eq!(relay.stats().await, RelayStats::default());
        assert_eq!(relay.rooms().room_count().await, 0);
    }

    #[tokio::test]
    async fn test_serve_accepts_websocket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let relay = Arc::new(RelayServer::with_defaults());
        let server = relay.clone();
        tokio::spawn(async move { server.serve(listener).await });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}")).await.unwrap();
        let ping = SyncMessage::ping(ReplicaId::new()).encode().unwrap();
        ws.send(Message::Binary(ping.into())).await.unwrap();

        let reply = tokio::time::timeout(std::time::Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let data = match reply {
            Message::Binary(data) => data,
            other => panic!("expected a binary pong, got {other:?}"),
        };
        let pong = SyncMessage::decode(&data).unwrap();
        assert_eq!(pong.msg_type, MessageType::Pong);
        assert_eq!(relay.stats().await.total_connections, 1);
    }
}
