//! Error taxonomy for the synchronization engine.
//!
//! - [`ApplyError`]: one remote record could not be applied. Recovered
//!   locally; the rest of the batch still applies.
//! - [`TransportError`]: publish/subscribe failure, surfaced to the session
//!   layer without touching store or tombstone state.
//! - [`SessionError::ReentrancyViolation`]: a flush was attempted while a
//!   remote batch was being applied. A logic fault, never a runtime condition.

use shapesync_core::{RoomId, ShapeId, StoreError};

use crate::session::SessionState;

/// Wire encoding errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("invalid message type")]
    InvalidMessageType,
}

/// A single remote record failed to apply.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("failed to apply shape {id}: {source}")]
pub struct ApplyError {
    pub id: ShapeId,
    #[source]
    pub source: StoreError,
}

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("not joined to room {0}")]
    NotJoined(RoomId),

    #[error("room {0} is full")]
    RoomFull(RoomId),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("i/o error: {0}")]
    Io(String),
}

/// Session lifecycle failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("session is disposed")]
    Disposed,

    #[error("invalid session transition {from:?} -> {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("local flush attempted while a remote batch is being applied")]
    ReentrancyViolation,
}
