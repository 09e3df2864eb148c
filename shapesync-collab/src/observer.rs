//! Local change observer: turns local store mutations into diff batches.
//!
//! ```text
//! local edit ─► notify() ─► FlushThrottle ─(deadline)─► flush()
//!                                                       │
//!                     deletes = baseline − ids(store)   │
//!                     upserts = store.enumerate()  ◄────┘
//!                     baseline = ids(store)
//! ```
//!
//! Every flush broadcasts the full current shape list as upserts rather
//! than a per-field delta. That costs bandwidth, not correctness.
//!
//! Local deletes seen since the last flush are also remembered on their own:
//! a remote batch resets the baseline to the store's ids, which would
//! otherwise hide a delete that has not been published yet.

use shapesync_core::{ids, DiffBatch, ShapeId, ShapeStore};
use std::collections::{BTreeSet, HashSet};
use std::time::{Duration, Instant};

use crate::throttle::{FlushThrottle, ThrottleDecision};
use crate::tombstone::TombstoneTable;

pub struct LocalChangeObserver {
    /// Ids known as of the last diff cycle.
    baseline: HashSet<ShapeId>,
    /// Locally deleted ids not yet published.
    pending_deletes: BTreeSet<ShapeId>,
    throttle: FlushThrottle,
    flushes: u64,
}

impl LocalChangeObserver {
    pub fn new(interval: Duration) -> Self {
        Self {
            baseline: HashSet::new(),
            pending_deletes: BTreeSet::new(),
            throttle: FlushThrottle::new(interval),
            flushes: 0,
        }
    }

    pub fn baseline(&self) -> &HashSet<ShapeId> {
        &self.baseline
    }

    /// Replace the baseline, e.g. on join or after a remote batch.
    pub fn reset_baseline(&mut self, ids: HashSet<ShapeId>) {
        self.baseline = ids;
    }

    /// Record that a local mutation happened.
    pub fn notify(&mut self, now: Instant) -> ThrottleDecision {
        self.throttle.notify(now)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.throttle.deadline()
    }

    pub fn has_pending(&self) -> bool {
        self.throttle.is_pending()
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.throttle.is_due(now)
    }

    /// Remember ids removed by a local edit until the next flush.
    pub fn record_local_deletes<'a>(&mut self, deleted: impl IntoIterator<Item = &'a ShapeId>) {
        self.pending_deletes.extend(deleted.into_iter().cloned());
    }

    /// Put the deletes of an unpublished batch back in line for the next flush.
    pub fn requeue_deletes(&mut self, deletes: Vec<ShapeId>) {
        self.pending_deletes.extend(deletes);
    }

    pub fn pending_deletes(&self) -> &BTreeSet<ShapeId> {
        &self.pending_deletes
    }

    /// Drop the scheduled flush and any unpublished local deletes.
    pub fn cancel_pending(&mut self) {
        self.throttle.cancel();
        self.pending_deletes.clear();
    }

    /// Number of flushes since creation.
    pub fn flush_count(&self) -> u64 {
        self.flushes
    }

    /// Diff of the store against the baseline. Leaves the baseline untouched.
    pub fn compute_diff<S: ShapeStore + ?Sized>(&self, store: &S) -> DiffBatch {
        let upserts = store.enumerate();
        let current = ids(&upserts);
        let deletes: BTreeSet<ShapeId> = self
            .baseline
            .iter()
            .chain(&self.pending_deletes)
            .filter(|id| !current.contains(*id))
            .cloned()
            .collect();
        DiffBatch::new(upserts, deletes.into_iter().collect())
    }

    /// Flush if the scheduled deadline has passed.
    pub fn poll<S: ShapeStore + ?Sized>(
        &mut self,
        store: &S,
        tombstones: &mut TombstoneTable,
        now: Instant,
    ) -> Option<DiffBatch> {
        if self.throttle.take_due(now) {
            Some(self.flush(store, tombstones, now))
        } else {
            None
        }
    }

    /// Compute the diff, advance the baseline and tombstone the deletes.
    pub fn flush<S: ShapeStore + ?Sized>(
        &mut self,
        store: &S,
        tombstones: &mut TombstoneTable,
        now: Instant,
    ) -> DiffBatch {
        let batch = self.compute_diff(store);
        for id in &batch.deletes {
            tombstones.insert(id.clone(), now);
        }
        self.baseline = ids(&batch.upserts);
        self.pending_deletes.clear();
        self.throttle.mark_flushed(now);
        self.flushes += 1;
        log::debug!(
            "Local flush #{}: {} upserts, {} deletes",
            self.flushes,
            batch.upserts.len(),
            batch.deletes.len()
        );
        batch
    }
}
