//! Shared connection state.
//!
//! One [`ConnectionState`] per client. Written by the health monitor and the
//! reconnection controller, read by the facade and status UI. Status changes
//! are published on a `tokio::sync::watch` channel.

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::models::{ConnectionStatus, ReconnectState};

struct ReconnectRun {
    id: u64,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    reconnect: ReconnectState,
    reconnect_attempts: u32,
    run: Option<ReconnectRun>,
    next_run_id: u64,
    offline: bool,
}

/// Connection status plus reconnection bookkeeping.
pub struct ConnectionState {
    status: watch::Sender<ConnectionStatus>,
    max_reconnect_attempts: u32,
    inner: Mutex<Inner>,
}

impl ConnectionState {
    /// Create a disconnected state with the given retry budget.
    pub fn new(max_reconnect_attempts: u32) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            status,
            max_reconnect_attempts,
            inner: Mutex::new(Inner {
                reconnect: ReconnectState::Idle,
                reconnect_attempts: 0,
                run: None,
                next_run_id: 1,
                offline: false,
            }),
        }
    }

    // ========== Status ==========

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Subscribe to status changes.
    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Set the status, logging actual transitions.
    pub fn set_status(&self, next: ConnectionStatus) {
        let mut previous = next;
        let changed = self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            previous = *current;
            *current = next;
            true
        });
        if changed {
            tracing::info!(from = %previous, to = %next, "Realtime connection status changed");
        }
    }

    /// Record whether the host reported the network as gone.
    pub fn set_offline(&self, offline: bool) {
        self.inner.lock().offline = offline;
    }

    /// Whether the network is reported offline.
    pub fn is_offline(&self) -> bool {
        self.inner.lock().offline
    }

    // ========== Reconnection ==========

    /// Current reconnection state.
    pub fn reconnect_state(&self) -> ReconnectState {
        self.inner.lock().reconnect
    }

    /// Attempt number of the running or last failed reconnection.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.lock().reconnect_attempts
    }

    /// Whether a reconnection task is registered.
    pub fn has_reconnect_task(&self) -> bool {
        self.inner.lock().run.as_ref().is_some_and(|run| run.task.is_some())
    }

    /// Start a new run, cancelling the previous one. Enters `Reconnecting(1)`.
    pub(crate) fn begin_run(&self) -> (u64, CancellationToken) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.run.take() {
            old.cancel.cancel();
        }
        let id = inner.next_run_id;
        inner.next_run_id += 1;
        let cancel = CancellationToken::new();
        inner.run = Some(ReconnectRun { id, cancel: cancel.clone(), task: None });
        inner.reconnect = ReconnectState::Reconnecting { attempt: 1 };
        inner.reconnect_attempts = 1;
        (id, cancel)
    }

    /// Store the task driving run `run_id`.
    pub(crate) fn attach_task(&self, run_id: u64, task: JoinHandle<()>) {
        let mut inner = self.inner.lock();
        match inner.run.as_mut() {
            Some(run) if run.id == run_id => run.task = Some(task),
            _ => drop(task),
        }
    }

    /// Record the start of an attempt. Returns false if the run was superseded.
    pub(crate) fn begin_attempt(&self, run_id: u64, attempt: u32) -> bool {
        {
            let mut inner = self.inner.lock();
            if !is_current(&inner, run_id) {
                return false;
            }
            let attempt = attempt.min(self.max_reconnect_attempts);
            inner.reconnect = ReconnectState::Reconnecting { attempt };
            inner.reconnect_attempts = attempt;
        }
        self.set_status(ConnectionStatus::Connecting);
        true
    }

    /// Finish run `run_id` successfully: back to idle and connected.
    pub(crate) fn finish_success(&self, run_id: u64) -> bool {
        {
            let mut inner = self.inner.lock();
            if !is_current(&inner, run_id) {
                return false;
            }
            inner.reconnect = ReconnectState::Idle;
            inner.reconnect_attempts = 0;
            inner.run = None;
        }
        self.set_status(ConnectionStatus::Connected);
        true
    }

    /// Finish run `run_id` with the budget exhausted.
    pub(crate) fn finish_failure(&self, run_id: u64) -> bool {
        {
            let mut inner = self.inner.lock();
            if !is_current(&inner, run_id) {
                return false;
            }
            inner.reconnect = ReconnectState::Failed;
            inner.run = None;
        }
        self.set_status(ConnectionStatus::Disconnected);
        true
    }

    /// Cancel any running reconnection. A failed state stays failed.
    pub(crate) fn cancel_run(&self) -> bool {
        let mut inner = self.inner.lock();
        let Some(run) = inner.run.take() else {
            return false;
        };
        run.cancel.cancel();
        if inner.reconnect.is_reconnecting() {
            inner.reconnect = ReconnectState::Idle;
        }
        true
    }
}

fn is_current(inner: &Inner, run_id: u64) -> bool {
    inner.run.as_ref().is_some_and(|run| run.id == run_id && !run.cancel.is_cancelled())
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ConnectionState")
            .field("status", &self.status())
            .field("reconnect", &inner.reconnect)
            .field("reconnect_attempts", &inner.reconnect_attempts)
            .field("offline", &inner.offline)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .finish()
    }
}
