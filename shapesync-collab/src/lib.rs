//! # shapesync-collab: Replicated shape synchronization engine
//!
//! Keeps the shape stores of several replicas converged over an unordered,
//! at-most-once pub/sub transport, without a CRDT library.
//!
//! ## Architecture
//!
//! ```text
//!  local edit                                             remote peers
//!      │                                                       ▲
//!      ▼                                                       │
//! ┌────────────┐ notify ┌─────────────────────┐ publish ┌─────────────┐
//! │ ShapeStore │───────►│ LocalChangeObserver │────────►│  Transport  │
//! │            │        │ (33 ms throttle)    │         │ (per room)  │
//! │            │        └─────────────────────┘         └──────┬──────┘
//! │            │ apply  ┌─────────────────────┐  inbox         │
//! │            │◄───────│  RemoteReconciler   │◄───────────────┘
//! └────────────┘        │  + TombstoneTable   │
//!                       └─────────────────────┘
//! ```
//!
//! A [`SyncSession`] ties one store, one transport and one room together
//! and owns the lifecycle (`Init → Active ⇄ Suspended → Disposed`).
//! [`SessionDriver`] runs a session on a tokio task.
//!
//! ## Modules
//!
//! - [`tombstone`]: short-lived delete markers (delete wins within the TTL)
//! - [`throttle`]: single-shot cooperative flush timer
//! - [`observer`]: local change observer and diff computation
//! - [`reconciler`]: remote batch application under a reentrancy guard
//! - [`session`]: sans-IO session state machine
//! - [`driver`]: async session driver and control handle
//! - [`transport`]: `Transport` trait and the in-process `LocalHub`
//! - [`protocol`]: binary wire protocol (bincode-encoded `SyncMessage`)
//! - [`broadcast`]: per-room fan-out for the relay
//! - [`relay`]: WebSocket relay server
//! - [`ws`]: WebSocket client transport

pub mod broadcast;
pub mod config;
pub mod driver;
pub mod error;
pub mod observer;
pub mod protocol;
pub mod reconciler;
pub mod relay;
pub mod session;
pub mod throttle;
pub mod tombstone;
pub mod transport;
pub mod ws;

pub use broadcast::{BroadcastGroup, BroadcastStats, RelayFrame, RoomManager};
pub use config::{RelayConfig, SyncConfig, DEFAULT_THROTTLE_INTERVAL, DEFAULT_TOMBSTONE_TTL};
pub use driver::{SessionCommand, SessionDriver, SessionHandle};
pub use error::{ApplyError, ProtocolError, SessionError, TransportError};
pub use observer::LocalChangeObserver;
pub use protocol::{MessageType, SyncMessage};
pub use reconciler::{ApplyReport, GuardToken, ReentrancyGuard, RemoteReconciler};
pub use relay::{RelayServer, RelayStats};
pub use session::{SessionInput, SessionState, SessionStats, SuspendReason, SyncSession};
pub use throttle::{FlushThrottle, ThrottleDecision};
pub use tombstone::TombstoneTable;
pub use transport::{Envelope, HubTransport, Inbox, InboxClosed, LocalHub, SubscriptionId, Transport};
pub use ws::WsTransport;
