//! # shapesync-core: Shape data model for replicated canvases
//!
//! Holds the types every replica agrees on and the store interface the
//! synchronization engine drives:
//!
//! - [`shape`]: `ShapeRecord`, `DiffBatch` and the id newtypes
//! - [`store`]: the `ShapeStore` trait and `MemoryShapeStore`
//!
//! The engine itself lives in `shapesync-collab`.

pub mod shape;
pub mod store;

pub use shape::{ids, DiffBatch, Props, ReplicaId, RoomId, ShapeError, ShapeId, ShapeRecord};
pub use store::{
    ChangeEvent, ChangeKind, ChangeListener, ChangeOrigin, ListenerId, MemoryShapeStore,
    OriginFilter, ShapeStore, StoreError,
};
