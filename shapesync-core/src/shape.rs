//! Replicated shape records and the batch format exchanged between replicas.
//!
//! A [`ShapeRecord`] is immutable-by-replacement: every update carries the
//! full record, never a partial patch.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use uuid::Uuid;

/// Opaque key → value bag carried by every shape (fill, text, size, ...).
pub type Props = serde_json::Map<String, serde_json::Value>;

/// Globally unique shape id within a room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShapeId(String);

impl ShapeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShapeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShapeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ShapeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identity of one participant's local copy of the shape set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(Uuid);

impl ReplicaId {
    /// Draw a fresh random replica id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ReplicaId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Logical partition of the shared canvas. All sync traffic is room-scoped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(room: impl Into<String>) -> Self {
        Self(room.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(room: &str) -> Self {
        Self(room.to_string())
    }
}

/// Reasons a record is rejected before it reaches a store.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ShapeError {
    #[error("shape id is empty")]
    EmptyId,

    #[error("shape {0} has an empty type")]
    EmptyKind(ShapeId),

    #[error("shape {id} has a non-finite {field}")]
    NonFinite { id: ShapeId, field: &'static str },

    #[error("shape {0} lists itself as parent")]
    SelfParent(ShapeId),
}

/// A graphical node in the shared diagram; the unit of replication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeRecord {
    pub id: ShapeId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, rename = "parentId", skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<ShapeId>,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub rotation: f64,
    #[serde(default, rename = "index")]
    pub order_index: String,
    #[serde(default)]
    pub props: Props,
}

impl ShapeRecord {
    pub fn new(id: impl Into<ShapeId>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            parent_id: None,
            x: 0.0,
            y: 0.0,
            rotation: 0.0,
            order_index: String::from("a1"),
            props: Props::new(),
        }
    }

    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.x = x;
        self.y = y;
        self
    }

    pub fn with_parent(mut self, parent: impl Into<ShapeId>) -> Self {
        self.parent_id = Some(parent.into());
        self
    }

    pub fn with_rotation(mut self, rotation: f64) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.order_index = index.into();
        self
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.props.insert(key.into(), value);
        self
    }

    /// Structural checks every store applies before accepting a record.
    pub fn validate(&self) -> Result<(), ShapeError> {
        if self.id.as_str().is_empty() {
            return Err(ShapeError::EmptyId);
        }
        if self.kind.is_empty() {
            return Err(ShapeError::EmptyKind(self.id.clone()));
        }
        for (field, value) in [("x", self.x), ("y", self.y), ("rotation", self.rotation)] {
            if !value.is_finite() {
                return Err(ShapeError::NonFinite { id: self.id.clone(), field });
            }
        }
        if self.parent_id.as_ref() == Some(&self.id) {
            return Err(ShapeError::SelfParent(self.id.clone()));
        }
        Ok(())
    }
}

/// One emission cycle's worth of changes.
///
/// Receivers apply every upsert before any delete.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffBatch {
    pub upserts: Vec<ShapeRecord>,
    pub deletes: Vec<ShapeId>,
}

impl DiffBatch {
    pub fn new(upserts: Vec<ShapeRecord>, deletes: Vec<ShapeId>) -> Self {
        Self { upserts, deletes }
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty()
    }

    /// Total number of upserts and deletes.
    pub fn len(&self) -> usize {
        self.upserts.len() + self.deletes.len()
    }
}

/// Collect the id set of a record list.
pub fn ids<'a>(records: impl IntoIterator<Item = &'a ShapeRecord>) -> HashSet<ShapeId> {
    records.into_iter().map(|r| r.id.clone()).collect()
}
