//! The shape store: authoritative in-memory shape collection for one room.
//!
//! Every mutation is tagged with a [`ChangeOrigin`] so that subscribers can
//! tell edits made by this replica apart from edits applied on behalf of
//! remote peers.
//!
//! ```text
//!  local edit ──► create/replace/delete(origin = Local) ──► listeners(Local|Any)
//!  remote batch ─► create/replace/delete(origin = Remote) ─► listeners(Remote|Any)
//! ```

use indexmap::IndexMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::shape::{ShapeError, ShapeId, ShapeRecord};

/// Who caused a store mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOrigin {
    /// Edit made by the user of this replica.
    Local,
    /// Edit applied on behalf of a remote replica.
    Remote,
}

/// Which origins a listener wants to hear about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginFilter {
    Local,
    Remote,
    Any,
}

impl OriginFilter {
    pub fn matches(self, origin: ChangeOrigin) -> bool {
        match self {
            OriginFilter::Any => true,
            OriginFilter::Local => origin == ChangeOrigin::Local,
            OriginFilter::Remote => origin == ChangeOrigin::Remote,
        }
    }
}

/// What happened to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Created(ShapeId),
    Replaced(ShapeId),
    Deleted(Vec<ShapeId>),
}

/// A single store notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub origin: ChangeOrigin,
    pub kind: ChangeKind,
}

/// Handle returned by [`ShapeStore::on_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Change callback. Invoked synchronously after the store lock is released.
pub type ChangeListener = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Store errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("shape {0} already exists")]
    AlreadyExists(ShapeId),

    #[error("shape {0} not found")]
    NotFound(ShapeId),

    #[error("invalid shape: {0}")]
    Invalid(#[from] ShapeError),
}

/// Narrow interface the synchronization engine needs from a shape store.
pub trait ShapeStore: Send + Sync {
    /// All records in stable order.
    fn enumerate(&self) -> Vec<ShapeRecord>;

    fn get(&self, id: &ShapeId) -> Option<ShapeRecord>;

    /// Insert a record whose id is not yet present.
    fn create(&self, record: ShapeRecord, origin: ChangeOrigin) -> Result<(), StoreError>;

    /// Substitute the full record for an id that is already present.
    fn replace(&self, record: ShapeRecord, origin: ChangeOrigin) -> Result<(), StoreError>;

    /// Remove the given ids, ignoring absent ones. Returns the ids actually removed.
    fn delete(&self, ids: &[ShapeId], origin: ChangeOrigin) -> Vec<ShapeId>;

    fn on_change(&self, filter: OriginFilter, listener: ChangeListener) -> ListenerId;

    fn remove_listener(&self, id: ListenerId) -> bool;

    fn ids(&self) -> HashSet<ShapeId> {
        crate::shape::ids(&self.enumerate())
    }

    fn contains(&self, id: &ShapeId) -> bool {
        self.get(id).is_some()
    }

    fn len(&self) -> usize {
        self.enumerate().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Registration {
    id: ListenerId,
    filter: OriginFilter,
    listener: ChangeListener,
}

/// Thread-safe in-memory [`ShapeStore`] preserving insertion order.
pub struct MemoryShapeStore {
    records: RwLock<IndexMap<ShapeId, ShapeRecord>>,
    listeners: Mutex<Vec<Registration>>,
    next_listener: AtomicU64,
}

impl Default for MemoryShapeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryShapeStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(IndexMap::new()),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    /// Build a store pre-populated with records. No events are emitted.
    pub fn with_records(records: impl IntoIterator<Item = ShapeRecord>) -> Self {
        let store = Self::new();
        {
            let mut map = store.records.write().unwrap_or_else(PoisonError::into_inner);
            for record in records {
                map.insert(record.id.clone(), record);
            }
        }
        store
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn emit(&self, event: ChangeEvent) {
        // Snapshot the matching listeners so callbacks may re-enter the store.
        let targets: Vec<ChangeListener> = {
            let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            listeners
                .iter()
                .filter(|r| r.filter.matches(event.origin))
                .map(|r| r.listener.clone())
                .collect()
        };
        for listener in targets {
            listener(&event);
        }
    }
}

impl ShapeStore for MemoryShapeStore {
    fn enumerate(&self) -> Vec<ShapeRecord> {
        let map = self.records.read().unwrap_or_else(PoisonError::into_inner);
        map.values().cloned().collect()
    }

    fn get(&self, id: &ShapeId) -> Option<ShapeRecord> {
        let map = self.records.read().unwrap_or_else(PoisonError::into_inner);
        map.get(id).cloned()
    }

    fn create(&self, record: ShapeRecord, origin: ChangeOrigin) -> Result<(), StoreError> {
        record.validate()?;
        let id = record.id.clone();
        {
            let mut map = self.records.write().unwrap_or_else(PoisonError::into_inner);
            if map.contains_key(&id) {
                return Err(StoreError::AlreadyExists(id));
            }
            map.insert(id.clone(), record);
        }
        self.emit(ChangeEvent { origin, kind: ChangeKind::Created(id) });
        Ok(())
    }

    fn replace(&self, record: ShapeRecord, origin: ChangeOrigin) -> Result<(), StoreError> {
        record.validate()?;
        let id = record.id.clone();
        {
            let mut map = self.records.write().unwrap_or_else(PoisonError::into_inner);
            match map.get_mut(&id) {
                Some(slot) => *slot = record,
                None => return Err(StoreError::NotFound(id)),
            }
        }
        self.emit(ChangeEvent { origin, kind: ChangeKind::Replaced(id) });
        Ok(())
    }

    fn delete(&self, ids: &[ShapeId], origin: ChangeOrigin) -> Vec<ShapeId> {
        let removed: Vec<ShapeId> = {
            let mut map = self.records.write().unwrap_or_else(PoisonError::into_inner);
            ids.iter()
                .filter(|id| map.shift_remove(*id).is_some())
                .cloned()
                .collect()
        };
        if !removed.is_empty() {
            self.emit(ChangeEvent { origin, kind: ChangeKind::Deleted(removed.clone()) });
        }
        removed
    }

    fn on_change(&self, filter: OriginFilter, listener: ChangeListener) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.push(Registration { id, filter, listener });
        log::trace!("Store listener {id:?} registered ({filter:?})");
        id
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        listeners.len() != before
    }

    fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn contains(&self, id: &ShapeId) -> bool {
        self.records.read().unwrap_or_else(PoisonError::into_inner).contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(store: &MemoryShapeStore, filter: OriginFilter) -> Arc<Mutex<Vec<ChangeEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        store.on_change(filter, Arc::new(move |e: &ChangeEvent| {
            sink.lock().unwrap().push(e.clone());
        }));
        seen
    }

    #[test]
    fn test_create_and_get() {
        let store = MemoryShapeStore::new();
        store.create(ShapeRecord::new("s1", "geo").at(1.0, 2.0), ChangeOrigin::Local).unwrap();

        let shape = store.get(&ShapeId::from("s1")).unwrap();
        assert_eq!(shape.x, 1.0);
        assert_eq!(store.len(), 1);
        assert!(store.contains(&ShapeId::from("s1")));
    }

    #[test]
    fn test_create_duplicate_rejected() {
        let store = MemoryShapeStore::new();
        store.create(ShapeRecord::new("s1", "geo"), ChangeOrigin::Local).unwrap();
        let err = store.create(ShapeRecord::new("s1", "geo"), ChangeOrigin::Local).unwrap_err();
        assert_eq!(err, StoreError::AlreadyExists(ShapeId::from("s1")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_replace_missing_rejected() {
        let store = MemoryShapeStore::new();
        let err = store.replace(ShapeRecord::new("s1", "geo"), ChangeOrigin::Remote).unwrap_err();
        assert_eq!(err, StoreError::NotFound(ShapeId::from("s1")));
    }

    #[test]
    fn test_replace_substitutes_full_record() {
        let store = MemoryShapeStore::new();
        store
            .create(
                ShapeRecord::new("s1", "geo").with_prop("fill", serde_json::json!("red")),
                ChangeOrigin::Local,
            )
            .unwrap();
        store.replace(ShapeRecord::new("s1", "geo").at(5.0, 5.0), ChangeOrigin::Local).unwrap();

        let shape = store.get(&ShapeId::from("s1")).unwrap();
        assert_eq!(shape.x, 5.0);
        assert!(shape.props.is_empty(), "replace must not merge old props");
    }

    #[test]
    fn test_invalid_record_rejected() {
        let store = MemoryShapeStore::new();
        let err = store
            .create(ShapeRecord::new("s1", "geo").with_parent("s1"), ChangeOrigin::Remote)
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(ShapeError::SelfParent(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_delete_ignores_absent_ids() {
        let store = MemoryShapeStore::with_records([
            ShapeRecord::new("a", "geo"),
            ShapeRecord::new("b", "geo"),
        ]);
        let removed = store.delete(&[ShapeId::from("a"), ShapeId::from("zzz")], ChangeOrigin::Local);
        assert_eq!(removed, vec![ShapeId::from("a")]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_enumerate_preserves_insertion_order() {
        let store = MemoryShapeStore::new();
        for id in ["c", "a", "b"] {
            store.create(ShapeRecord::new(id, "geo"), ChangeOrigin::Local).unwrap();
        }
        store.delete(&[ShapeId::from("a")], ChangeOrigin::Local);
        let order: Vec<String> = store.enumerate().into_iter().map(|r| r.id.to_string()).collect();
        assert_eq!(order, vec!["c", "b"]);
    }

    #[test]
    fn test_listeners_filtered_by_origin() {
        let store = MemoryShapeStore::new();
        let local = recorder(&store, OriginFilter::Local);
        let remote = recorder(&store, OriginFilter::Remote);
        let any = recorder(&store, OriginFilter::Any);

        store.create(ShapeRecord::new("l", "geo"), ChangeOrigin::Local).unwrap();
        store.create(ShapeRecord::new("r", "geo"), ChangeOrigin::Remote).unwrap();

        assert_eq!(local.lock().unwrap().len(), 1);
        assert_eq!(remote.lock().unwrap().len(), 1);
        assert_eq!(any.lock().unwrap().len(), 2);
        assert_eq!(
            local.lock().unwrap()[0],
            ChangeEvent { origin: ChangeOrigin::Local, kind: ChangeKind::Created(ShapeId::from("l")) }
        );
    }

    #[test]
    fn test_empty_delete_emits_nothing() {
        let store = MemoryShapeStore::new();
        let seen = recorder(&store, OriginFilter::Any);
        store.delete(&[ShapeId::from("missing")], ChangeOrigin::Local);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_listener_may_read_store() {
        let store = Arc::new(MemoryShapeStore::new());
        let counts = Arc::new(Mutex::new(Vec::new()));
        let (reader, sink) = (store.clone(), counts.clone());
        store.on_change(OriginFilter::Any, Arc::new(move |_: &ChangeEvent| {
            sink.lock().unwrap().push(reader.len());
        }));

        store.create(ShapeRecord::new("a", "geo"), ChangeOrigin::Local).unwrap();
        store.create(ShapeRecord::new("b", "geo"), ChangeOrigin::Local).unwrap();
        assert_eq!(*counts.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_remove_listener() {
        let store = MemoryShapeStore::new();
        let id = store.on_change(OriginFilter::Any, Arc::new(|_: &ChangeEvent| {}));
        assert_eq!(store.listener_count(), 1);
        assert!(store.remove_listener(id));
        assert!(!store.remove_listener(id));
        assert_eq!(store.listener_count(), 0);
    }
}
