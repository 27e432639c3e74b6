//! Reconnection controller.
//!
//! Restores every wanted subscription after a connection loss. Each run
//! snapshots what callers want (registrations plus declared multi-table
//! channels), closes all peer channels, and recreates them. Failed attempts
//! back off exponentially until the retry budget is spent.

use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::error::{RealtimeError, Result};
use crate::models::{normalize_subscriptions, ReconnectState, TableSubscription};
use crate::services::dispatch::DispatchTable;
use crate::services::registry::ChannelRegistry;
use crate::state::ConnectionState;

/// Exponential backoff with a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max_delay: Duration,
    max_attempts: u32,
}

impl BackoffPolicy {
    /// Create a policy.
    pub fn new(base: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self { base, max_delay, max_attempts }
    }

    /// Attempts per run.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after failed attempt `attempt` (1-based): `min(base * 2^(attempt-1), max)`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max_delay)
    }

    /// Delays between consecutive attempts of one full run.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.max_attempts).map(|attempt| self.delay_after(attempt)).collect()
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 5)
    }
}

/// Why a reconnection was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectTrigger {
    /// Caller asked for it; always restarts at attempt 1.
    Explicit,
    /// Environment went back online; ignored while a run is active.
    Online,
    /// A live channel was dropped; ignored unless idle.
    TransportLoss,
}

/// Drives the `Idle -> Reconnecting(n) -> Idle | Failed` state machine.
pub struct ReconnectController {
    registry: Arc<ChannelRegistry>,
    dispatch: Arc<DispatchTable>,
    state: Arc<ConnectionState>,
    policy: BackoffPolicy,
    handle: Handle,
}

impl ReconnectController {
    /// Create a controller.
    pub fn new(
        registry: Arc<ChannelRegistry>,
        dispatch: Arc<DispatchTable>,
        state: Arc<ConnectionState>,
        policy: BackoffPolicy,
        handle: Handle,
    ) -> Self {
        Self { registry, dispatch, state, policy, handle }
    }

    /// Start a run if the trigger allows it from the current state.
    ///
    /// Returns whether a new run was started.
    pub fn start(self: &Arc<Self>, trigger: ReconnectTrigger) -> bool {
        let current = self.state.reconnect_state();
        let allowed = match trigger {
            ReconnectTrigger::Explicit => true,
            ReconnectTrigger::Online => !current.is_reconnecting(),
            ReconnectTrigger::TransportLoss => current == ReconnectState::Idle,
        };
        if !allowed {
            tracing::debug!(?trigger, state = ?current, "Reconnect request ignored");
            return false;
        }

        let (run_id, cancel) = self.state.begin_run();
        tracing::info!(?trigger, run_id, "Starting realtime reconnection");
        let controller = Arc::clone(self);
        let task = self.handle.spawn(async move {
            controller.run(run_id, cancel).await;
        });
        self.state.attach_task(run_id, task);
        true
    }

    /// Stop the running reconnection, if any.
    pub fn halt(&self) -> bool {
        let halted = self.state.cancel_run();
        if halted {
            tracing::debug!("Reconnection halted");
        }
        halted
    }

    async fn run(&self, run_id: u64, cancel: CancellationToken) {
        let max = self.policy.max_attempts();
        for attempt in 1..=max {
            if cancel.is_cancelled() || !self.state.begin_attempt(run_id, attempt) {
                return;
            }
            tracing::debug!(attempt, max, "Reconnection attempt");

            let outcome = self.rebuild().await;
            if cancel.is_cancelled() {
                tracing::debug!(attempt, "Reconnection halted during rebuild");
                return;
            }
            match outcome {
                Ok(restored) => {
                    if self.state.finish_success(run_id) {
                        tracing::info!(attempt, channels = restored, "Realtime subscriptions restored");
                    }
                    return;
                }
                Err(e) => {
                    tracing::warn!(attempt, max, error = %e, "Reconnection attempt failed");
                }
            }

            if attempt == max {
                break;
            }
            let delay = self.policy.delay_after(attempt);
            tracing::debug!(next_attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "Backing off");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if self.state.finish_failure(run_id) {
            let err = RealtimeError::reconnect_exhausted(max);
            tracing::error!(error = %err, "Giving up on realtime reconnection");
        }
    }

    /// One recreation pass. Returns the number of channels restored.
    async fn rebuild(&self) -> Result<usize> {
        let snapshot = self.snapshot();
        self.registry.close_all_for_rebuild().await;

        let results = join_all(snapshot.into_iter().map(|(name, subscriptions)| {
            let registry = Arc::clone(&self.registry);
            async move {
                let result = registry.create_channel(&name, subscriptions).await;
                (name, result)
            }
        }))
        .await;

        let mut restored = 0;
        let mut first_error = None;
        for (name, result) in results {
            match result {
                Ok(()) => restored += 1,
                Err(e) => {
                    tracing::warn!(channel = %name, error = %e, "Channel not restored");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(restored),
        }
    }

    /// What callers want right now: registrations grouped by channel, merged
    /// with declared multi-table channels.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<TableSubscription>> {
        let mut snapshot = self.dispatch.snapshot();
        for (name, declared) in self.registry.declared() {
            let entry = snapshot.entry(name).or_default();
            let mut merged = declared;
            merged.append(entry);
            *entry = normalize_subscriptions(merged);
        }
        snapshot
    }
}
