//! The shared session state cell.
//!
//! [`SessionContext`] is the single source of truth for the session state,
//! connection status, active mode and safety qualifier. Only the orchestrator
//! writes to it; every other component holds an `Arc` and re-reads the value
//! at the moment it acts, never a copy taken when a task was spawned.

use crate::mode::Mode;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Paused,
    Stopping,
    Error,
}

impl SessionState {
    /// States in which the session owns devices and wants a connection.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Starting | SessionState::Running | SessionState::Paused
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

/// Reconnection attempt counter driving exponential backoff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    attempt: u32,
}

impl RetryState {
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Consumes one attempt and returns its delay (`2^attempt` seconds), or
    /// `None` once `max_retries` attempts have been used.
    pub fn next_delay(&mut self, max_retries: u32) -> Option<Duration> {
        if self.attempt >= max_retries {
            return None;
        }
        let delay = Duration::from_secs(1u64 << self.attempt.min(63));
        self.attempt += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

pub struct SessionContext {
    state: watch::Sender<SessionState>,
    status: watch::Sender<ConnectionStatus>,
    mode: watch::Sender<Mode>,
    safety: watch::Sender<bool>,
    tearing_down: watch::Sender<bool>,
    mounted: AtomicBool,
    epoch: AtomicU64,
}

impl SessionContext {
    pub fn new(mode: Mode, safety: bool) -> Self {
        Self {
            state: watch::channel(SessionState::Idle).0,
            status: watch::channel(ConnectionStatus::Disconnected).0,
            mode: watch::channel(mode).0,
            safety: watch::channel(safety).0,
            tearing_down: watch::channel(false).0,
            mounted: AtomicBool::new(true),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn mode(&self) -> Mode {
        *self.mode.borrow()
    }

    pub fn safety(&self) -> bool {
        *self.safety.borrow()
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Identifier of the current connect attempt.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// True while a connect attempt started at `epoch` may still wire devices
    /// into a transport.
    pub fn accepts(&self, epoch: u64) -> bool {
        self.is_mounted() && self.state().is_active() && self.epoch() == epoch
    }

    /// Resolves once no teardown is in progress.
    pub async fn teardown_finished(&self) {
        let mut rx = self.tearing_down.subscribe();
        let _ = rx.wait_for(|busy| !*busy).await;
    }

    pub(crate) fn set_state(&self, state: SessionState) -> bool {
        self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        })
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) -> bool {
        self.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        })
    }

    pub(crate) fn set_mode(&self, mode: Mode) -> bool {
        self.mode.send_if_modified(|current| {
            let changed = *current != mode;
            *current = mode;
            changed
        })
    }

    pub(crate) fn set_safety(&self, safety: bool) {
        self.safety.send_replace(safety);
    }

    pub(crate) fn set_tearing_down(&self, busy: bool) {
        self.tearing_down.send_replace(busy);
    }

    pub(crate) fn unmount(&self) {
        self.mounted.store(false, Ordering::SeqCst);
    }

    /// Invalidates any in-flight connect attempt and returns the new epoch.
    pub(crate) fn advance_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }
}
