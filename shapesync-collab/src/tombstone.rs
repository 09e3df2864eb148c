//! Short-lived delete markers.
//!
//! While a tombstone for an id is unexpired, no remote upsert for that id
//! may be applied, so a stale "resurrect" message arriving after a delete
//! cannot undo it. Entries are purged lazily on lookup; there is no sweep
//! timer. [`TombstoneTable::purge_expired`] is available for hosts that want
//! to bound the table in long sessions.

use shapesync_core::ShapeId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct TombstoneTable {
    ttl: Duration,
    entries: HashMap<ShapeId, Instant>,
}

impl TombstoneTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Set or refresh the tombstone for `id` to expire at `now + ttl`.
    pub fn insert(&mut self, id: ShapeId, now: Instant) {
        self.entries.insert(id, now + self.ttl);
    }

    /// True iff an entry exists and `now < expires_at`. Expired entries are
    /// evicted on the way out.
    pub fn is_active(&mut self, id: &ShapeId, now: Instant) -> bool {
        match self.entries.get(id) {
            Some(&expires_at) if now < expires_at => true,
            Some(_) => {
                self.entries.remove(id);
                false
            }
            None => false,
        }
    }

    /// Expiry of the entry for `id`, expired or not.
    pub fn expires_at(&self, id: &ShapeId) -> Option<Instant> {
        self.entries.get(id).copied()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, expires_at| now < *expires_at);
        before - self.entries.len()
    }

    /// Number of stored entries, including expired ones not yet looked up.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
