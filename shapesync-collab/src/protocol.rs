//! Binary wire protocol for diff batch exchange.
//!
//! Envelope (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ sender    │ room     │ seq      │ payload  │
//! │ 1 byte   │ 16 bytes  │ varlen   │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! A `Batch` payload is the JSON form of a [`DiffBatch`]. Shape props are
//! self-describing values, which bincode cannot round-trip, so only the
//! envelope is bincode. `seq` counts frames per sender for diagnostics; it
//! carries no ordering semantics.

use serde::{Deserialize, Serialize};
use shapesync_core::{DiffBatch, ReplicaId, RoomId, ShapeId, ShapeRecord};

use crate::error::ProtocolError;

/// Message types for the relay protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Sender joins a room
    Join = 1,
    /// Sender leaves its room
    Leave = 2,
    /// One diff batch for a room
    Batch = 3,
    /// Heartbeat ping
    Ping = 4,
    /// Heartbeat pong
    Pong = 5,
}

/// Top-level protocol frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub sender: ReplicaId,
    pub room: RoomId,
    pub seq: u64,
    pub payload: Vec<u8>,
}

/// Lenient batch shape: upserts stay raw until each one is parsed on its own.
#[derive(Deserialize)]
struct WireBatch {
    #[serde(default)]
    upserts: Vec<serde_json::Value>,
    #[serde(default)]
    deletes: Vec<ShapeId>,
}

impl SyncMessage {
    pub fn join(sender: ReplicaId, room: RoomId) -> Self {
        Self {
            msg_type: MessageType::Join,
            sender,
            room,
            seq: 0,
            payload: Vec::new(),
        }
    }

    pub fn leave(sender: ReplicaId, room: RoomId) -> Self {
        Self {
            msg_type: MessageType::Leave,
            sender,
            room,
            seq: 0,
            payload: Vec::new(),
        }
    }

    /// Wrap a diff batch for `room`.
    pub fn batch(
        sender: ReplicaId,
        room: RoomId,
        seq: u64,
        batch: &DiffBatch,
    ) -> Result<Self, ProtocolError> {
        let payload =
            serde_json::to_vec(batch).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            msg_type: MessageType::Batch,
            sender,
            room,
            seq,
            payload,
        })
    }

    pub fn ping(sender: ReplicaId) -> Self {
        Self {
            msg_type: MessageType::Ping,
            sender,
            room: RoomId::new(""),
            seq: 0,
            payload: Vec::new(),
        }
    }

    pub fn pong(sender: ReplicaId) -> Self {
        Self {
            msg_type: MessageType::Pong,
            sender,
            room: RoomId::new(""),
            seq: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the batch payload.
    ///
    /// Upserts that do not parse as a shape record are dropped one by one;
    /// the remaining records still come through.
    pub fn diff_batch(&self) -> Result<DiffBatch, ProtocolError> {
        if self.msg_type != MessageType::Batch {
            return Err(ProtocolError::InvalidMessageType);
        }
        let wire: WireBatch = serde_json::from_slice(&self.payload)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;

        let mut upserts = Vec::with_capacity(wire.upserts.len());
        for raw in wire.upserts {
            match serde_json::from_value::<ShapeRecord>(raw) {
                Ok(record) => upserts.push(record),
                Err(e) => log::warn!(
                    "Dropping malformed shape from {} (seq {}): {e}",
                    self.sender,
                    self.seq
                ),
            }
        }
        Ok(DiffBatch::new(upserts, wire.deletes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_batch() -> DiffBatch {
        DiffBatch::new(
            vec![
                ShapeRecord::new("s1", "geo").at(10.0, 20.0).with_prop("w", json!(100)),
                ShapeRecord::new("s2", "text").with_parent("s1"),
            ],
            vec![ShapeId::from("gone")],
        )
    }

    #[test]
    fn test_batch_message_roundtrip() {
        let sender = ReplicaId::new();
        let batch = sample_batch();

        let msg = SyncMessage::batch(sender, RoomId::from("room-a"), 42, &batch).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Batch);
        assert_eq!(decoded.sender, sender);
        assert_eq!(decoded.room, RoomId::from("room-a"));
        assert_eq!(decoded.seq, 42);
        assert_eq!(decoded.diff_batch().unwrap(), batch);
    }

    #[test]
    fn test_join_leave_carry_room() {
        let sender = ReplicaId::new();
        let join = SyncMessage::decode(&SyncMessage::join(sender, "r".into()).encode().unwrap()).unwrap();
        let leave = SyncMessage::decode(&SyncMessage::leave(sender, "r".into()).encode().unwrap()).unwrap();

        assert_eq!(join.msg_type, MessageType::Join);
        assert_eq!(leave.msg_type, MessageType::Leave);
        assert_eq!(join.room, RoomId::from("r"));
        assert!(leave.payload.is_empty());
    }

    #[test]
    fn test_diff_batch_on_wrong_type() {
        let msg = SyncMessage::ping(ReplicaId::new());
        assert_eq!(msg.diff_batch(), Err(ProtocolError::InvalidMessageType));
    }

    #[test]
    fn test_malformed_upsert_isolated() {
        let payload = serde_json::to_vec(&json!({
            "upserts": [
                {"id": "ok", "type": "geo", "x": 1.0, "y": 1.0},
                {"id": "broken", "x": "not a number"},
                {"id": "ok2", "type": "geo", "x": 2.0, "y": 2.0}
            ],
            "deletes": ["d1"]
        }))
        .unwrap();
        let msg = SyncMessage {
            msg_type: MessageType::Batch,
            sender: ReplicaId::new(),
            room: RoomId::from("r"),
            seq: 1,
            payload,
        };

        let batch = msg.diff_batch().unwrap();
        let ids: Vec<&str> = batch.upserts.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["ok", "ok2"]);
        assert_eq!(batch.deletes, vec![ShapeId::from("d1")]);
    }

    #[test]
    fn test_garbage_payload_rejected() {
        let msg = SyncMessage {
            msg_type: MessageType::Batch,
            sender: ReplicaId::new(),
            room: RoomId::from("r"),
            seq: 1,
            payload: b"{not json".to_vec(),
        };
        assert!(matches!(msg.diff_batch(), Err(ProtocolError::Deserialization(_))));
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(SyncMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::Join as u8, 1);
        assert_eq!(MessageType::Leave as u8, 2);
        assert_eq!(MessageType::Batch as u8, 3);
        assert_eq!(MessageType::Ping as u8, 4);
        assert_eq!(MessageType::Pong as u8, 5);
    }
}
