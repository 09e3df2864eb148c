//! Per-room sync session: the lifecycle state machine around the observer
//! and the reconciler.
//!
//! ```text
//!            join                 disconnect / leave
//!   Init ───────────► Active ─────────────────────► Suspended
//!     │                 ▲  │                           │
//!     │                 │  └── resume (fresh baseline) ┘
//!     │                 │ dispose                      │ dispose
//!     └─────────────────┴──────────► Disposed ◄────────┘
//! ```
//!
//! The session does no I/O scheduling of its own. Every entry point takes
//! the current instant, and the caller (normally a
//! [`SessionDriver`](crate::driver::SessionDriver)) decides when to call
//! [`SyncSession::poll`]. Local store notifications are forwarded into an
//! internal queue by a store listener and drained by
//! [`SyncSession::pump`] or [`SyncSession::next_input`].

use shapesync_core::{
    ChangeEvent, ChangeKind, ChangeListener, ChangeOrigin, DiffBatch, ListenerId, OriginFilter,
    ReplicaId, RoomId, ShapeId, ShapeStore,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use crate::config::SyncConfig;
use crate::error::SessionError;
use crate::observer::LocalChangeObserver;
use crate::reconciler::{ApplyReport, ReentrancyGuard, RemoteReconciler};
use crate::throttle::ThrottleDecision;
use crate::tombstone::TombstoneTable;
use crate::transport::{Envelope, Inbox, InboxClosed, Transport};

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created, no baseline yet.
    Init,
    /// Observing local edits and applying remote batches.
    Active,
    /// Room left or transport lost; nothing flows until `resume`.
    Suspended,
    /// Terminal. All subscriptions released.
    Disposed,
}

/// Why a session is being suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendReason {
    /// The transport went away. No `leave` is sent.
    Disconnected,
    /// The user left the room.
    Left,
}

/// One unit of work for the session.
#[derive(Debug)]
pub enum SessionInput {
    Local(ChangeEvent),
    Remote(Envelope),
    InboxClosed,
}

/// Running counters for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub local_changes: u64,
    pub batches_published: u64,
    pub publish_failures: u64,
    pub batches_applied: u64,
    pub records_failed: u64,
    pub self_echoes: u64,
}

pub struct SyncSession<S: ShapeStore + ?Sized, T: Transport> {
    store: Arc<S>,
    transport: T,
    room: RoomId,
    state: SessionState,
    observer: LocalChangeObserver,
    reconciler: RemoteReconciler,
    tombstones: TombstoneTable,
    guard: ReentrancyGuard,
    local_tx: mpsc::UnboundedSender<ChangeEvent>,
    local_rx: mpsc::UnboundedReceiver<ChangeEvent>,
    listener: Option<ListenerId>,
    inbox: Option<Inbox>,
    stats: SessionStats,
}

impl<S: ShapeStore + ?Sized, T: Transport> SyncSession<S, T> {
    pub fn new(store: Arc<S>, transport: T, room: RoomId, config: &SyncConfig) -> Self {
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let replica = transport.replica_id();
        Self {
            store,
            transport,
            room,
            state: SessionState::Init,
            observer: LocalChangeObserver::new(config.throttle_interval),
            reconciler: RemoteReconciler::new(replica),
            tombstones: TombstoneTable::new(config.tombstone_ttl),
            guard: ReentrancyGuard::new(),
            local_tx,
            local_rx,
            listener: None,
            inbox: None,
            stats: SessionStats::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.reconciler.local_replica()
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn baseline(&self) -> &HashSet<ShapeId> {
        self.observer.baseline()
    }

    pub fn tombstones(&self) -> &TombstoneTable {
        &self.tombstones
    }

    /// Mutable access, e.g. to call `purge_expired` in long sessions.
    pub fn tombstones_mut(&mut self) -> &mut TombstoneTable {
        &mut self.tombstones
    }

    pub fn guard(&self) -> &ReentrancyGuard {
        &self.guard
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Deadline of the pending local flush, if one is scheduled.
    pub fn next_flush_deadline(&self) -> Option<Instant> {
        match self.state {
            SessionState::Active => self.observer.next_deadline(),
            _ => None,
        }
    }

    /// `Init -> Active`: join the room, subscribe and take the baseline.
    pub fn join(&mut self, now: Instant) -> Result<(), SessionError> {
        self.transition_check(SessionState::Init, SessionState::Active)?;
        self.connect(now)?;
        log::info!("Session {} joined room {}", self.replica_id(), self.room);
        Ok(())
    }

    /// `Suspended -> Active`: rejoin as if freshly joined.
    ///
    /// A transport whose connection was lost needs
    /// [`Transport::reconnect`] first; the driver does this on `Reconnect`.
    pub fn resume(&mut self, now: Instant) -> Result<(), SessionError> {
        self.transition_check(SessionState::Suspended, SessionState::Active)?;
        self.connect(now)?;
        log::info!("Session {} resumed in room {}", self.replica_id(), self.room);
        Ok(())
    }

    /// `Active -> Suspended`.
    ///
    /// Local teardown always completes. With [`SuspendReason::Left`] a
    /// failing `leave` is reported after the session is already suspended.
    pub fn suspend(&mut self, reason: SuspendReason) -> Result<(), SessionError> {
        self.transition_check(SessionState::Active, SessionState::Suspended)?;
        self.disconnect();
        self.state = SessionState::Suspended;
        log::info!("Session {} suspended ({reason:?})", self.replica_id());

        match reason {
            SuspendReason::Left => self.transport.leave(&self.room).map_err(SessionError::from),
            SuspendReason::Disconnected => Ok(()),
        }
    }

    /// Release everything. Terminal.
    pub fn dispose(&mut self) -> Result<(), SessionError> {
        let was_active = match self.state {
            SessionState::Disposed => return Err(SessionError::Disposed),
            SessionState::Active => true,
            SessionState::Init | SessionState::Suspended => false,
        };
        self.disconnect();
        if was_active {
            if let Err(e) = self.transport.leave(&self.room) {
                log::warn!("Leave on dispose failed for room {}: {e}", self.room);
            }
        }
        self.state = SessionState::Disposed;
        log::info!("Session {} disposed", self.replica_id());
        Ok(())
    }

    /// Feed one local store notification.
    ///
    /// Ignored unless the session is active, and while a remote batch is
    /// being applied.
    pub fn handle_local_change(&mut self, event: &ChangeEvent, now: Instant) -> Result<(), SessionError> {
        self.ensure_alive()?;
        if self.state != SessionState::Active || event.origin != ChangeOrigin::Local {
            return Ok(());
        }
        if self.guard.is_applying() {
            log::trace!("Suppressing local notification during remote apply");
            return Ok(());
        }

        if let ChangeKind::Deleted(ids) = &event.kind {
            for id in ids {
                self.tombstones.insert(id.clone(), now);
            }
            self.observer.record_local_deletes(ids);
        }
        self.stats.local_changes += 1;
        if let ThrottleDecision::Scheduled(deadline) = self.observer.notify(now) {
            log::trace!("Local flush scheduled in {:?}", deadline.saturating_duration_since(now));
        }
        Ok(())
    }

    /// Feed one remote envelope. `None` when the session is not active.
    pub fn handle_remote(
        &mut self,
        envelope: &Envelope,
        now: Instant,
    ) -> Result<Option<ApplyReport>, SessionError> {
        self.ensure_alive()?;
        if self.state != SessionState::Active {
            log::trace!("Dropping remote batch while {:?}", self.state);
            return Ok(None);
        }

        let report = self.reconciler.apply(
            envelope,
            &*self.store,
            &mut self.observer,
            &mut self.tombstones,
            &self.guard,
            now,
        );
        if report.ignored_self_echo {
            self.stats.self_echoes += 1;
        } else {
            self.stats.batches_applied += 1;
            self.stats.records_failed += report.failed.len() as u64;
        }
        Ok(Some(report))
    }

    /// Flush and publish if the throttle deadline has passed.
    ///
    /// On a publish failure the batch's deletes are queued for the next
    /// flush and the error is returned; nothing is retried automatically.
    pub fn poll(&mut self, now: Instant) -> Result<Option<DiffBatch>, SessionError> {
        self.ensure_alive()?;
        if self.state != SessionState::Active || !self.observer.is_due(now) {
            return Ok(None);
        }
        if self.guard.is_applying() {
            log::error!("Local flush attempted while applying a remote batch");
            return Err(SessionError::ReentrancyViolation);
        }

        let Some(batch) = self.observer.poll(&*self.store, &mut self.tombstones, now) else {
            return Ok(None);
        };
        match self.transport.publish(&self.room, &batch) {
            Ok(()) => {
                self.stats.batches_published += 1;
                Ok(Some(batch))
            }
            Err(e) => {
                log::warn!("Publish to room {} failed: {e}", self.room);
                self.stats.publish_failures += 1;
                self.observer.requeue_deletes(batch.deletes);
                Err(e.into())
            }
        }
    }

    /// Drain queued local notifications and remote envelopes without
    /// blocking, then poll once.
    pub fn pump(&mut self, now: Instant) -> Result<Option<DiffBatch>, SessionError> {
        self.ensure_alive()?;
        while let Ok(event) = self.local_rx.try_recv() {
            self.handle_local_change(&event, now)?;
        }
        while let Some(inbox) = self.inbox.as_mut() {
            match inbox.try_recv() {
                Ok(Some(envelope)) => {
                    self.handle_remote(&envelope, now)?;
                }
                Ok(None) => break,
                Err(InboxClosed) => {
                    log::warn!("Inbox for room {} closed", self.room);
                    self.suspend(SuspendReason::Disconnected)?;
                }
            }
        }
        self.poll(now)
    }

    /// Wait for the next local notification or remote envelope.
    ///
    /// Pending forever when nothing can arrive (no inbox and no listener).
    pub async fn next_input(&mut self) -> SessionInput {
        let Self { local_rx, inbox, .. } = self;
        tokio::select! {
            biased;
            Some(event) = local_rx.recv() => SessionInput::Local(event),
            remote = async {
                match inbox.as_mut() {
                    Some(inbox) => inbox.recv().await,
                    None => std::future::pending().await,
                }
            } => match remote {
                Some(envelope) => SessionInput::Remote(envelope),
                None => SessionInput::InboxClosed,
            },
        }
    }

    fn connect(&mut self, now: Instant) -> Result<(), SessionError> {
        self.transport.join(&self.room)?;
        let inbox = match self.transport.subscribe(&self.room) {
            Ok(inbox) => inbox,
            Err(e) => {
                if let Err(leave_err) = self.transport.leave(&self.room) {
                    log::debug!("Leave after failed subscribe: {leave_err}");
                }
                return Err(e.into());
            }
        };
        self.inbox = Some(inbox);

        // Changes queued before the baseline are already part of it.
        while self.local_rx.try_recv().is_ok() {}
        self.observer.reset_baseline(self.store.ids());
        self.register_listener();
        self.state = SessionState::Active;
        log::debug!(
            "Baseline for room {} taken with {} shapes at {:?}",
            self.room,
            self.observer.baseline().len(),
            now
        );
        Ok(())
    }

    fn disconnect(&mut self) {
        self.observer.cancel_pending();
        if let Some(id) = self.listener.take() {
            self.store.remove_listener(id);
        }
        if let Some(inbox) = self.inbox.take() {
            self.transport.unsubscribe(&self.room, inbox.id());
        }
        while self.local_rx.try_recv().is_ok() {}
    }

    fn register_listener(&mut self) {
        let tx = self.local_tx.clone();
        let guard = self.guard.clone();
        let listener: ChangeListener = Arc::new(move |event: &ChangeEvent| {
            if !guard.is_applying() {
                // The receiver lives as long as the session.
                let _ = tx.send(event.clone());
            }
        });
        self.listener = Some(self.store.on_change(OriginFilter::Local, listener));
    }

    fn ensure_alive(&self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Disposed => Err(SessionError::Disposed),
            _ => Ok(()),
        }
    }

    fn transition_check(&self, from: SessionState, to: SessionState) -> Result<(), SessionError> {
        self.ensure_alive()?;
        if self.state == from {
            Ok(())
        } else {
            Err(SessionError::InvalidTransition { from: self.state, to })
        }
    }
}

impl<S: ShapeStore + ?Sized, T: Transport> Drop for SyncSession<S, T> {
    fn drop(&mut self) {
        if let Some(id) = self.listener.take() {
            self.store.remove_listener(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::transport::LocalHub;
    use shapesync_core::{MemoryShapeStore, ShapeRecord};
    use std::time::Duration;

    type HubSession = SyncSession<MemoryShapeStore, crate::transport::HubTransport>;

    fn session(hub: &LocalHub, store: Arc<MemoryShapeStore>) -> HubSession {
        SyncSession::new(
            store,
            hub.transport(ReplicaId::new()),
            RoomId::from("room"),
            &SyncConfig::default(),
        )
    }

    #[test]
    fn test_join_takes_baseline() {
        let hub = LocalHub::default();
        let store = Arc::new(MemoryShapeStore::with_records([ShapeRecord::new("a", "geo")]));
        let mut s = session(&hub, store.clone());

        s.join(Instant::now()).unwrap();
        assert_eq!(s.state(), SessionState::Active);
        assert_eq!(s.baseline(), &store.ids());
        assert_eq!(store.listener_count(), 1);
        assert_eq!(hub.member_count(&RoomId::from("room")), 1);
    }

    #[test]
    fn test_local_edit_published_on_pump() {
        let hub = LocalHub::default();
        let store = Arc::new(MemoryShapeStore::new());
        let mut s = session(&hub, store.clone());
        let t0 = Instant::now();
        s.join(t0).unwrap();

        store.create(ShapeRecord::new("s1", "geo"), ChangeOrigin::Local).unwrap();
        let batch = s.pump(t0).unwrap().expect("flush due immediately");
        assert_eq!(batch.upserts.len(), 1);
        assert_eq!(hub.published(), 1);
        assert_eq!(s.stats().batches_published, 1);
    }

    #[test]
    fn test_second_flush_waits_for_window() {
        let hub = LocalHub::default();
        let store = Arc::new(MemoryShapeStore::new());
        let mut s = session(&hub, store.clone());
        let t0 = Instant::now();
        s.join(t0).unwrap();

        store.create(ShapeRecord::new("a", "geo"), ChangeOrigin::Local).unwrap();
        s.pump(t0).unwrap();
        store.create(ShapeRecord::new("b", "geo"), ChangeOrigin::Local).unwrap();

        assert!(s.pump(t0 + Duration::from_millis(10)).unwrap().is_none());
        assert_eq!(s.next_flush_deadline(), Some(t0 + Duration::from_millis(33)));
        assert!(s.pump(t0 + Duration::from_millis(33)).unwrap().is_some());
    }

    #[test]
    fn test_suspend_stops_flow_and_resume_rebaselines() {
        let hub = LocalHub::default();
        let store = Arc::new(MemoryShapeStore::with_records([ShapeRecord::new("a", "geo")]));
        let mut s = session(&hub, store.clone());
        let t0 = Instant::now();
        s.join(t0).unwrap();

        store.create(ShapeRecord::new("b", "geo"), ChangeOrigin::Local).unwrap();
        s.suspend(SuspendReason::Left).unwrap();
        assert_eq!(s.state(), SessionState::Suspended);
        assert_eq!(store.listener_count(), 0);
        assert_eq!(s.next_flush_deadline(), None);
        assert_eq!(hub.member_count(&RoomId::from("room")), 0);

        store.delete(&[ShapeId::from("a")], ChangeOrigin::Local);
        assert!(s.pump(t0 + Duration::from_secs(1)).unwrap().is_none());

        s.resume(t0 + Duration::from_secs(2)).unwrap();
        assert_eq!(s.baseline(), &[ShapeId::from("b")].into_iter().collect());

        store.replace(ShapeRecord::new("b", "geo").at(1.0, 1.0), ChangeOrigin::Local).unwrap();
        let batch = s.pump(t0 + Duration::from_secs(2)).unwrap().unwrap();
        assert!(batch.deletes.is_empty(), "no false deletes after resume");
    }

    #[test]
    fn test_remote_dropped_while_suspended() {
        let hub = LocalHub::default();
        let store = Arc::new(MemoryShapeStore::new());
        let mut s = session(&hub, store.clone());
        s.join(Instant::now()).unwrap();
        s.suspend(SuspendReason::Disconnected).unwrap();

        let envelope = Envelope::new(
            ReplicaId::new(),
            DiffBatch::new(vec![ShapeRecord::new("x", "geo")], vec![]),
        );
        assert_eq!(s.handle_remote(&envelope, Instant::now()).unwrap(), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_invalid_transitions() {
        let hub = LocalHub::default();
        let mut s = session(&hub, Arc::new(MemoryShapeStore::new()));

        assert_eq!(
            s.suspend(SuspendReason::Left),
            Err(SessionError::InvalidTransition {
                from: SessionState::Init,
                to: SessionState::Suspended
            })
        );
        assert!(matches!(s.resume(Instant::now()), Err(SessionError::InvalidTransition { .. })));

        s.join(Instant::now()).unwrap();
        assert!(matches!(s.join(Instant::now()), Err(SessionError::InvalidTransition { .. })));
    }

    #[test]
    fn test_everything_fails_after_dispose() {
        let hub = LocalHub::default();
        let store = Arc::new(MemoryShapeStore::new());
        let mut s = session(&hub, store.clone());
        s.join(Instant::now()).unwrap();
        s.dispose().unwrap();

        assert_eq!(s.state(), SessionState::Disposed);
        assert_eq!(store.listener_count(), 0);
        assert_eq!(hub.room_count(), 0);
        assert_eq!(s.dispose(), Err(SessionError::Disposed));
        assert_eq!(s.pump(Instant::now()), Err(SessionError::Disposed));
        assert_eq!(s.join(Instant::now()), Err(SessionError::Disposed));
    }

    #[test]
    fn test_closed_inbox_suspends() {
        let hub = LocalHub::default();
        let mut s = session(&hub, Arc::new(MemoryShapeStore::new()));
        s.join(Instant::now()).unwrap();

        hub.disconnect(s.replica_id());
        s.pump(Instant::now()).unwrap();
        assert_eq!(s.state(), SessionState::Suspended);
    }

    #[test]
    fn test_publish_failure_requeues_deletes() {
        let hub = LocalHub::default();
        let store = Arc::new(MemoryShapeStore::with_records([ShapeRecord::new("a", "geo")]));
        let mut s = session(&hub, store.clone());
        let t0 = Instant::now();
        s.join(t0).unwrap();

        // Membership vanishes but the session has not noticed yet.
        s.transport().leave(&RoomId::from("room")).unwrap();
        store.delete(&[ShapeId::from("a")], ChangeOrigin::Local);
        let err = s.pump(t0).unwrap_err();
        assert_eq!(
            err,
            SessionError::Transport(TransportError::NotJoined(RoomId::from("room")))
        );
        assert_eq!(s.stats().publish_failures, 1);

        s.transport().join(&RoomId::from("room")).unwrap();
        store.create(ShapeRecord::new("b", "geo"), ChangeOrigin::Local).unwrap();
        let batch = s.pump(t0 + Duration::from_millis(40)).unwrap().unwrap();
        assert_eq!(batch.deletes, vec![ShapeId::from("a")]);
    }

    #[test]
    fn test_local_delete_seeds_tombstone() {
        let hub = LocalHub::default();
        let store = Arc::new(MemoryShapeStore::with_records([ShapeRecord::new("a", "geo")]));
        let mut s = session(&hub, store.clone());
        let t0 = Instant::now();
        s.join(t0).unwrap();

        store.delete(&[ShapeId::from("a")], ChangeOrigin::Local);
        s.pump(t0).unwrap();
        assert_eq!(
            s.tombstones().expires_at(&ShapeId::from("a")),
            Some(t0 + Duration::from_millis(2000))
        );
    }

    #[test]
    fn test_local_change_ignored_while_applying() {
        let hub = LocalHub::default();
        let store = Arc::new(MemoryShapeStore::new());
        let mut s = session(&hub, store.clone());
        let t0 = Instant::now();
        s.join(t0).unwrap();

        let token = s.guard().enter();
        let event = ChangeEvent {
            origin: ChangeOrigin::Local,
            kind: ChangeKind::Deleted(vec![ShapeId::from("a")]),
        };
        s.handle_local_change(&event, t0).unwrap();
        // The store listener is muted as well.
        store.create(ShapeRecord::new("b", "geo"), ChangeOrigin::Local).unwrap();
        drop(token);

        assert_eq!(s.next_flush_deadline(), None);
        assert_eq!(s.stats().local_changes, 0);
        assert!(s.tombstones().is_empty());
        assert!(s.pump(t0 + Duration::from_secs(1)).unwrap().is_none());
        assert_eq!(hub.published(), 0);
    }

    #[test]
    fn test_flush_during_apply_is_rejected() {
        let hub = LocalHub::default();
        let store = Arc::new(MemoryShapeStore::with_records([ShapeRecord::new("a", "geo")]));
        let mut s = session(&hub, store.clone());
        let t0 = Instant::now();
        s.join(t0).unwrap();

        let event = ChangeEvent {
            origin: ChangeOrigin::Local,
            kind: ChangeKind::Replaced(ShapeId::from("a")),
        };
        s.handle_local_change(&event, t0).unwrap();
        assert_eq!(s.next_flush_deadline(), Some(t0));

        let token = s.guard().enter();
        assert_eq!(s.poll(t0), Err(SessionError::ReentrancyViolation));
        assert_eq!(hub.published(), 0);
        assert_eq!(s.next_flush_deadline(), Some(t0), "the flush stays scheduled");
        drop(token);

        assert!(s.poll(t0).unwrap().is_some());
        assert_eq!(hub.published(), 1);
    }

    #[tokio::test]
    async fn test_next_input_yields_local_then_remote() {
        let hub = LocalHub::default();
        let store = Arc::new(MemoryShapeStore::new());
        let mut s = session(&hub, store.clone());
        s.join(Instant::now()).unwrap();

        let peer = hub.transport(ReplicaId::new());
        peer.join(&RoomId::from("room")).unwrap();
        peer.publish(&RoomId::from("room"), &DiffBatch::default()).unwrap();
        store.create(ShapeRecord::new("a", "geo"), ChangeOrigin::Local).unwrap();

        assert!(matches!(s.next_input().await, SessionInput::Local(_)));
        assert!(matches!(s.next_input().await, SessionInput::Remote(_)));
    }
}
