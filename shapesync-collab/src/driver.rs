//! Async driver: runs one [`SyncSession`] on a single tokio task.
//!
//! The task is the session's only event loop. It waits on, in priority
//! order, lifecycle commands from a [`SessionHandle`], local store
//! notifications and remote envelopes, and the flush deadline. Input is
//! preferred over the timer so that a burst of queued notifications is
//! drained before the one flush that covers it.

use shapesync_core::ShapeStore;
use std::time::Instant;
use tokio::sync::{mpsc, watch};

use crate::error::SessionError;
use crate::session::{SessionInput, SessionState, SuspendReason, SyncSession};
use crate::transport::Transport;

/// Lifecycle commands accepted by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// Transport lost: `Active -> Suspended` without leaving.
    Disconnect,
    /// `Suspended -> Active`, re-establishing the transport first.
    Reconnect,
    /// Leave the room: `Active -> Suspended`.
    Leave,
    /// Terminal; the driver task exits.
    Dispose,
}

/// Cloneable control handle for a running driver.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Disconnect).await
    }

    pub async fn reconnect(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Reconnect).await
    }

    pub async fn leave(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Leave).await
    }

    pub async fn dispose(&self) -> Result<(), SessionError> {
        self.send(SessionCommand::Dispose).await
    }

    /// Last state published by the driver.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Wait until the session reaches `target`. Errors if the driver exits first.
    pub async fn wait_for(&self, target: SessionState) -> Result<(), SessionError> {
        let mut rx = self.state.clone();
        rx.wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| SessionError::Disposed)
    }

    async fn send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.commands.send(command).await.map_err(|_| SessionError::Disposed)
    }
}

pub struct SessionDriver<S: ShapeStore + ?Sized, T: Transport> {
    session: SyncSession<S, T>,
    commands: mpsc::Receiver<SessionCommand>,
    state: watch::Sender<SessionState>,
}

impl<S: ShapeStore + ?Sized, T: Transport> SessionDriver<S, T> {
    pub fn new(session: SyncSession<S, T>, command_capacity: usize) -> (Self, SessionHandle) {
        let (command_tx, command_rx) = mpsc::channel(command_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(session.state());
        let driver = Self {
            session,
            commands: command_rx,
            state: state_tx,
        };
        let handle = SessionHandle {
            commands: command_tx,
            state: state_rx,
        };
        (driver, handle)
    }

    /// Join (if not joined yet) and run until disposed.
    ///
    /// Errors from individual events are logged and do not stop the loop.
    /// Dropping every handle disposes the session.
    pub async fn run(mut self) -> Result<(), SessionError> {
        if self.session.state() == SessionState::Init {
            self.session.join(Instant::now())?;
            self.publish_state();
        }

        loop {
            let deadline = self.session.next_flush_deadline();
            let flush_timer = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                command = self.commands.recv() => {
                    let command = command.unwrap_or(SessionCommand::Dispose);
                    if self.handle_command(command).await {
                        break;
                    }
                }
                input = self.session.next_input() => {
                    self.handle_input(input);
                }
                () = flush_timer => {
                    if let Err(e) = self.session.poll(Instant::now()) {
                        log::warn!("Flush failed: {e}");
                    }
                }
            }
            self.publish_state();
        }

        self.publish_state();
        Ok(())
    }

    /// Returns true when the loop should stop.
    async fn handle_command(&mut self, command: SessionCommand) -> bool {
        log::debug!("Session command {command:?}");
        let result = match command {
            SessionCommand::Disconnect => self.session.suspend(SuspendReason::Disconnected),
            SessionCommand::Leave => self.session.suspend(SuspendReason::Left),
            SessionCommand::Reconnect => self.reconnect().await,
            SessionCommand::Dispose => {
                if let Err(e) = self.session.dispose() {
                    log::debug!("Dispose: {e}");
                }
                return true;
            }
        };
        if let Err(e) = result {
            log::warn!("Command {command:?} failed: {e}");
        }
        false
    }

    /// Re-establish the transport if it was lost, then resume.
    async fn reconnect(&mut self) -> Result<(), SessionError> {
        if self.session.state() == SessionState::Suspended {
            self.session.transport().reconnect().await?;
        }
        self.session.resume(Instant::now())
    }

    fn handle_input(&mut self, input: SessionInput) {
        let now = Instant::now();
        let result = match input {
            SessionInput::Local(event) => self.session.handle_local_change(&event, now),
            SessionInput::Remote(envelope) => self.session.handle_remote(&envelope, now).map(|_| ()),
            SessionInput::InboxClosed => {
                log::warn!("Transport closed the inbox for room {}", self.session.room());
                self.session.suspend(SuspendReason::Disconnected)
            }
        };
        if let Err(e) = result {
            log::warn!("Session input failed: {e}");
        }
    }

    fn publish_state(&self) {
        let current = self.session.state();
        self.state.send_if_modified(|state| {
            if *state == current {
                false
            } else {
                *state = current;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::transport::LocalHub;
    use shapesync_core::{MemoryShapeStore, ReplicaId, RoomId};
    use std::sync::Arc;
    use tokio::time::{timeout, Duration};

    fn spawn_driver(hub: &LocalHub) -> (SessionHandle, tokio::task::JoinHandle<Result<(), SessionError>>) {
        let session = SyncSession::new(
            Arc::new(MemoryShapeStore::new()),
            hub.transport(ReplicaId::new()),
            RoomId::from("room"),
            &SyncConfig::for_testing(),
        );
        let (driver, handle) = SessionDriver::new(session, 8);
        (handle, tokio::spawn(driver.run()))
    }

    #[tokio::test]
    async fn test_driver_joins_and_follows_commands() {
        let hub = LocalHub::default();
        let (handle, task) = spawn_driver(&hub);

        timeout(Duration::from_secs(2), handle.wait_for(SessionState::Active))
            .await
            .unwrap()
            .unwrap();

        handle.leave().await.unwrap();
        timeout(Duration::from_secs(2), handle.wait_for(SessionState::Suspended))
            .await
            .unwrap()
            .unwrap();

        handle.reconnect().await.unwrap();
        timeout(Duration::from_secs(2), handle.wait_for(SessionState::Active))
            .await
            .unwrap()
            .unwrap();

        handle.dispose().await.unwrap();
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap().unwrap();
        assert_eq!(handle.state(), SessionState::Disposed);
        assert!(handle.leave().await.is_err());
    }

    #[tokio::test]
    async fn test_dropping_handles_disposes() {
        let hub = LocalHub::default();
        let (handle, task) = spawn_driver(&hub);
        timeout(Duration::from_secs(2), handle.wait_for(SessionState::Active))
            .await
            .unwrap()
            .unwrap();

        drop(handle);
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap().unwrap();
        assert_eq!(hub.room_count(), 0);
    }

    #[tokio::test]
    async fn test_hub_disconnect_suspends() {
        let hub = LocalHub::default();
        let replica = ReplicaId::new();
        let session = SyncSession::new(
            Arc::new(MemoryShapeStore::new()),
            hub.transport(replica),
            RoomId::from("room"),
            &SyncConfig::for_testing(),
        );
        let (driver, handle) = SessionDriver::new(session, 8);
        tokio::spawn(driver.run());
        timeout(Duration::from_secs(2), handle.wait_for(SessionState::Active))
            .await
            .unwrap()
            .unwrap();

        hub.disconnect(replica);
        timeout(Duration::from_secs(2), handle.wait_for(SessionState::Suspended))
            .await
            .unwrap()
            .unwrap();
    }
}
