//! Remote reconciler: merges a remote diff batch into the local store.
//!
//! ```text
//! Envelope ─► self-echo? ─► guard.enter()
//!                              │
//!          upserts (in order) ─┤  tombstoned → skip (delete wins)
//!                              │  otherwise  → create-or-replace
//!          deletes ────────────┤  remove if present, refresh tombstone
//!                              │
//!          baseline = ids(store), guard released
//! ```
//!
//! A record that fails to apply is logged and collected in the report; the
//! rest of the batch still goes through.

use shapesync_core::{ChangeOrigin, ReplicaId, ShapeRecord, ShapeStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::ApplyError;
use crate::observer::LocalChangeObserver;
use crate::tombstone::TombstoneTable;
use crate::transport::Envelope;

/// Set while a remote batch is being applied.
///
/// Shared between the reconciler and the local store listener so that
/// store notifications fired mid-application do not trigger a local flush.
#[derive(Debug, Clone, Default)]
pub struct ReentrancyGuard(Arc<AtomicBool>);

impl ReentrancyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_applying(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Raise the flag until the returned token is dropped.
    pub fn enter(&self) -> GuardToken {
        self.0.store(true, Ordering::Release);
        GuardToken(self.0.clone())
    }
}

/// Clears the reentrancy flag on drop.
#[must_use = "the guard is released as soon as the token is dropped"]
pub struct GuardToken(Arc<AtomicBool>);

impl Drop for GuardToken {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// What one `apply` call did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    /// Records created or replaced
    pub upserted: usize,
    /// Upserts identical to the stored record
    pub unchanged: usize,
    /// Upserts dropped because of an active tombstone
    pub skipped_tombstoned: usize,
    /// Ids actually removed from the store
    pub deleted: usize,
    /// Per-record failures
    pub failed: Vec<ApplyError>,
    /// The batch was our own and was ignored
    pub ignored_self_echo: bool,
}

impl ApplyReport {
    /// True if the store was modified.
    pub fn changed(&self) -> bool {
        self.upserted > 0 || self.deleted > 0
    }
}

pub struct RemoteReconciler {
    local: ReplicaId,
    applied: u64,
}

impl RemoteReconciler {
    pub fn new(local: ReplicaId) -> Self {
        Self { local, applied: 0 }
    }

    pub fn local_replica(&self) -> ReplicaId {
        self.local
    }

    /// Number of batches applied (self-echoes excluded).
    pub fn applied_count(&self) -> u64 {
        self.applied
    }

    pub fn apply<S: ShapeStore + ?Sized>(
        &mut self,
        envelope: &Envelope,
        store: &S,
        observer: &mut LocalChangeObserver,
        tombstones: &mut TombstoneTable,
        guard: &ReentrancyGuard,
        now: Instant,
    ) -> ApplyReport {
        let mut report = ApplyReport::default();
        if envelope.sender == self.local {
            log::trace!("Ignoring self-echo batch");
            report.ignored_self_echo = true;
            return report;
        }

        let _token = guard.enter();
        let batch = &envelope.batch;

        for record in &batch.upserts {
            if tombstones.is_active(&record.id, now) {
                log::trace!("Dropping upsert for tombstoned shape {}", record.id);
                report.skipped_tombstoned += 1;
                continue;
            }
            match upsert(store, record.clone()) {
                Ok(true) => report.upserted += 1,
                Ok(false) => report.unchanged += 1,
                Err(e) => {
                    log::warn!("Skipping remote shape from {}: {e}", envelope.sender);
                    report.failed.push(e);
                }
            }
        }

        if !batch.deletes.is_empty() {
            report.deleted = store.delete(&batch.deletes, ChangeOrigin::Remote).len();
            for id in &batch.deletes {
                tombstones.insert(id.clone(), now);
            }
        }

        observer.reset_baseline(store.ids());
        self.applied += 1;

        log::debug!(
            "Applied batch from {}: {} upserted, {} unchanged, {} tombstoned, {} deleted, {} failed",
            envelope.sender,
            report.upserted,
            report.unchanged,
            report.skipped_tombstoned,
            report.deleted,
            report.failed.len()
        );
        report
    }
}

/// Create-or-replace. `Ok(false)` when the stored record is already identical.
fn upsert<S: ShapeStore + ?Sized>(store: &S, record: ShapeRecord) -> Result<bool, ApplyError> {
    let id = record.id.clone();
    let result = match store.get(&id) {
        Some(existing) if existing == record => return Ok(false),
        Some(_) => store.replace(record, ChangeOrigin::Remote),
        None => store.create(record, ChangeOrigin::Remote),
    };
    result.map(|()| true).map_err(|source| ApplyError { id, source })
}
