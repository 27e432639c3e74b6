//! Channel registry.
//!
//! Single owner of every live peer channel. A channel enters the registry only
//! after its handshake reports `SUBSCRIBED`; a failed creation leaves no entry.
//! Creating a channel under an existing name replaces the old one.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

use crate::error::{RealtimeError, Result};
use crate::models::{normalize_subscriptions, ChannelStatus, TableSubscription};
use crate::services::dispatch::DispatchTable;
use crate::transport::{ChangeHandler, PeerChannel, RealtimeTransport, StatusHandler};

/// Lifecycle notifications the registry emits for the health monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A channel finished its handshake.
    Subscribed {
        /// Channel name
        channel: String,
    },
    /// A live channel was dropped by the peer.
    Lost {
        /// Channel name
        channel: String,
        /// Status the peer reported
        status: ChannelStatus,
    },
}

/// Receiver of [`RegistryEvent`]s.
pub type RegistryEventHook = Arc<dyn Fn(RegistryEvent) + Send + Sync>;

/// Caller-supplied hook told about a failed channel creation.
pub type ErrorCallback = Arc<dyn Fn(&RealtimeError) + Send + Sync>;

struct LiveChannel {
    generation: u64,
    subscriptions: Vec<TableSubscription>,
    peer: Box<dyn PeerChannel>,
    created_at: DateTime<Utc>,
}

struct PendingCreation {
    generation: u64,
    teardown_requested: bool,
    failure_hooks: Vec<ErrorCallback>,
}

impl PendingCreation {
    fn new(generation: u64) -> Self {
        Self { generation, teardown_requested: false, failure_hooks: Vec::new() }
    }
}

/// Read-only view of a live channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Channel name
    pub name: String,
    /// Table subscriptions carried by the channel
    pub subscriptions: Vec<TableSubscription>,
    /// When the handshake completed
    pub created_at: DateTime<Utc>,
}

/// Owner of all live channels.
pub struct ChannelRegistry {
    transport: Arc<dyn RealtimeTransport>,
    dispatch: Arc<DispatchTable>,
    handle: Handle,
    handshake_timeout: Option<Duration>,
    channels: Mutex<HashMap<String, LiveChannel>>,
    pending: Mutex<HashMap<String, PendingCreation>>,
    declared: Mutex<HashMap<String, Vec<TableSubscription>>>,
    next_generation: AtomicU64,
    event_hook: RwLock<Option<RegistryEventHook>>,
}

impl ChannelRegistry {
    /// Create an empty registry.
    pub fn new(
        transport: Arc<dyn RealtimeTransport>,
        dispatch: Arc<DispatchTable>,
        handle: Handle,
        handshake_timeout: Option<Duration>,
    ) -> Self {
        Self {
            transport,
            dispatch,
            handle,
            handshake_timeout,
            channels: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            declared: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            event_hook: RwLock::new(None),
        }
    }

    /// Install the receiver of lifecycle notifications.
    pub fn set_event_hook(&self, hook: RegistryEventHook) {
        *self.event_hook.write() = Some(hook);
    }

    fn emit(&self, event: RegistryEvent) {
        let hook = self.event_hook.read().clone();
        if let Some(hook) = hook {
            hook(event);
        }
    }

    // ========== Creation ==========

    /// Open, wire and subscribe a channel; replaces any channel with the same name.
    ///
    /// Resolves once the peer reports `SUBSCRIBED`. On any other outcome the
    /// registry is left without an entry for `name` and the error is returned.
    pub async fn create_channel(
        self: &Arc<Self>,
        name: &str,
        subscriptions: Vec<TableSubscription>,
    ) -> Result<()> {
        let generation = self.begin_creation(name);
        self.complete_creation(name, subscriptions, generation).await
    }

    /// Mark a creation as pending unless the channel is live or already pending.
    ///
    /// Returns the generation to pass to [`Self::complete_creation`].
    pub fn try_begin_creation(&self, name: &str) -> Option<u64> {
        if self.channels.lock().contains_key(name) {
            return None;
        }
        let mut pending = self.pending.lock();
        if pending.contains_key(name) {
            return None;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        pending.insert(name.to_string(), PendingCreation::new(generation));
        Some(generation)
    }

    /// Supersedes any pending creation of `name`, inheriting its failure hooks.
    fn begin_creation(&self, name: &str) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut entry = PendingCreation::new(generation);
        let mut pending = self.pending.lock();
        if let Some(previous) = pending.remove(name) {
            entry.failure_hooks = previous.failure_hooks;
        }
        pending.insert(name.to_string(), entry);
        generation
    }

    /// Have `hook` told if the pending creation of `name` fails.
    ///
    /// Returns false when no creation of `name` is pending.
    pub fn add_failure_hook(&self, name: &str, hook: ErrorCallback) -> bool {
        match self.pending.lock().get_mut(name) {
            Some(entry) => {
                entry.failure_hooks.push(hook);
                true
            }
            None => false,
        }
    }

    /// Second half of creation for a generation obtained from `try_begin_creation`.
    pub async fn complete_creation(
        self: &Arc<Self>,
        name: &str,
        subscriptions: Vec<TableSubscription>,
        generation: u64,
    ) -> Result<()> {
        let subscriptions = normalize_subscriptions(subscriptions);
        if subscriptions.is_empty() {
            let err = RealtimeError::config(format!(
                "channel '{name}' needs at least one table subscription"
            ));
            return Err(self.fail_creation(name, generation, err));
        }

        let replaced = self.channels.lock().remove(name);
        if let Some(old) = replaced {
            tracing::debug!(
                channel = %name,
                old = ?old.subscriptions,
                new = ?subscriptions,
                "Replacing existing channel"
            );
            close_peer(name, old.peer).await;
        }

        let mut peer = self.transport.open(name);
        for subscription in &subscriptions {
            peer.on_change(subscription, self.change_handler(name, subscription));
        }

        let (status_tx, status_rx) = oneshot::channel();
        peer.subscribe(self.status_handler(name, generation, status_tx));

        tracing::debug!(
            channel = %name,
            generation,
            tables = subscriptions.len(),
            "Channel handshake started"
        );

        let outcome = match self.handshake_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, status_rx).await {
                Ok(received) => received,
                Err(_) => {
                    tracing::warn!(channel = %name, timeout_ms = timeout.as_millis() as u64, "Channel handshake timed out");
                    let err = self.fail_creation(name, generation, RealtimeError::handshake_timeout(name, timeout));
                    close_peer(name, peer).await;
                    return Err(err);
                }
            },
            None => status_rx.await,
        };

        let status = match outcome {
            Ok(status) => status,
            Err(e) => {
                let err = RealtimeError::transport_with_source(
                    format!("peer dropped the handshake for channel '{name}'"),
                    e,
                );
                let err = self.fail_creation(name, generation, err);
                close_peer(name, peer).await;
                return Err(err);
            }
        };

        if !status.is_subscribed() {
            let err = RealtimeError::handshake(name, status);
            tracing::warn!(
                channel = %name,
                tables = ?subscriptions.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
                error = %err,
                "Channel handshake failed"
            );
            let err = self.fail_creation(name, generation, err);
            close_peer(name, peer).await;
            return Err(err);
        }

        let teardown_requested = self
            .settle_pending(name, generation)
            .is_some_and(|entry| entry.teardown_requested);
        let stale = {
            let mut channels = self.channels.lock();
            let superseded =
                channels.get(name).is_some_and(|existing| existing.generation > generation);
            if superseded {
                Some(peer)
            } else {
                let previous = channels.insert(
                    name.to_string(),
                    LiveChannel {
                        generation,
                        subscriptions: subscriptions.clone(),
                        peer,
                        created_at: Utc::now(),
                    },
                );
                previous.map(|old| old.peer)
            }
        };
        if let Some(stale) = stale {
            close_peer(name, stale).await;
        }

        tracing::debug!(channel = %name, generation, "Channel subscribed");

        if teardown_requested && !self.dispatch.has_registrations(name) {
            tracing::debug!(channel = %name, "Applying teardown deferred during handshake");
            self.remove_channel(name).await;
            return Ok(());
        }

        self.emit(RegistryEvent::Subscribed { channel: name.to_string() });
        Ok(())
    }

    /// Clear the pending marker if it still belongs to `generation`.
    fn settle_pending(&self, name: &str, generation: u64) -> Option<PendingCreation> {
        let mut pending = self.pending.lock();
        if pending.get(name).is_some_and(|entry| entry.generation == generation) {
            pending.remove(name)
        } else {
            None
        }
    }

    /// Settle a failed creation and tell every subscriber that joined it.
    fn fail_creation(&self, name: &str, generation: u64, err: RealtimeError) -> RealtimeError {
        let hooks = self
            .settle_pending(name, generation)
            .map(|entry| entry.failure_hooks)
            .unwrap_or_default();
        for hook in &hooks {
            hook(&err);
        }
        err
    }

    fn change_handler(&self, name: &str, subscription: &TableSubscription) -> ChangeHandler {
        let dispatch = Arc::downgrade(&self.dispatch);
        let channel = name.to_string();
        let listener = subscription.clone();
        Arc::new(move |event| {
            if let Some(dispatch) = dispatch.upgrade() {
                dispatch.route(&channel, &listener, event);
            }
        })
    }

    fn status_handler(
        self: &Arc<Self>,
        name: &str,
        generation: u64,
        status_tx: oneshot::Sender<ChannelStatus>,
    ) -> StatusHandler {
        let registry: Weak<Self> = Arc::downgrade(self);
        let channel = name.to_string();
        let first = Mutex::new(Some(status_tx));
        Arc::new(move |status| {
            if let Some(tx) = first.lock().take() {
                let _ = tx.send(status);
                return;
            }
            if let Some(registry) = registry.upgrade() {
                registry.on_peer_status(&channel, generation, status);
            }
        })
    }

    /// Status reported after the handshake.
    fn on_peer_status(&self, name: &str, generation: u64, status: ChannelStatus) {
        if status.is_subscribed() {
            return;
        }
        let is_current = self
            .channels
            .lock()
            .get(name)
            .is_some_and(|live| live.generation == generation);
        if !is_current {
            tracing::trace!(channel = %name, %status, "Ignoring status for retired channel");
            return;
        }
        tracing::warn!(channel = %name, %status, "Live channel reported by peer as down");
        self.emit(RegistryEvent::Lost { channel: name.to_string(), status });
    }

    // ========== Teardown ==========

    /// Tear a channel down and forget its callback registrations.
    ///
    /// Unknown names are a no-op. Peer errors are logged and swallowed. A
    /// channel still in its handshake is torn down once the handshake settles.
    pub async fn remove_channel(&self, name: &str) {
        self.dispatch.remove_channel(name);
        self.declared.lock().remove(name);
        if let Some(entry) = self.pending.lock().get_mut(name) {
            entry.teardown_requested = true;
        }
        let live = self.channels.lock().remove(name);
        if let Some(live) = live {
            close_peer(name, live.peer).await;
            tracing::debug!(channel = %name, "Channel removed");
        }
    }

    /// Remove every channel, live or pending, and every registration, including
    /// those whose channel never finished its handshake.
    pub async fn remove_all_channels(&self) {
        let mut names: Vec<String> = self.channels.lock().keys().cloned().collect();
        names.extend(self.pending.lock().keys().cloned());
        names.extend(self.declared.lock().keys().cloned());
        names.extend(self.dispatch.channel_names());
        names.sort();
        names.dedup();
        for name in &names {
            self.remove_channel(name).await;
        }
        tracing::debug!(count = names.len(), "All channels removed");
    }

    /// Tear down the channel once nobody listens on it any more.
    ///
    /// Called from synchronous code; the peer teardown runs on the runtime.
    pub fn release_if_unused(&self, name: &str) {
        if self.dispatch.has_registrations(name) {
            return;
        }
        self.declared.lock().remove(name);
        if let Some(entry) = self.pending.lock().get_mut(name) {
            tracing::debug!(channel = %name, "Deferring teardown until handshake settles");
            entry.teardown_requested = true;
        }
        let live = self.channels.lock().remove(name);
        if let Some(live) = live {
            let name = name.to_string();
            self.handle.spawn(async move {
                close_peer(&name, live.peer).await;
                tracing::debug!(channel = %name, "Unused channel removed");
            });
        }
    }

    /// Close every live peer channel but keep registrations and declarations,
    /// so the channels can be rebuilt from them.
    pub async fn close_all_for_rebuild(&self) -> usize {
        let drained: Vec<(String, LiveChannel)> = self.channels.lock().drain().collect();
        let count = drained.len();
        for (name, live) in drained {
            close_peer(&name, live.peer).await;
        }
        tracing::debug!(count, "Closed channels for rebuild");
        count
    }

    // ========== Declarations ==========

    /// Remember an explicitly created multi-table channel so reconnection
    /// restores all of its tables.
    pub fn declare(&self, name: &str, subscriptions: Vec<TableSubscription>) {
        self.declared.lock().insert(name.to_string(), normalize_subscriptions(subscriptions));
    }

    /// Explicit multi-table declarations.
    pub fn declared(&self) -> HashMap<String, Vec<TableSubscription>> {
        self.declared.lock().clone()
    }

    // ========== Introspection ==========

    /// Number of live channels.
    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    /// Sorted names of live channels.
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a channel with this name is live.
    pub fn contains(&self, name: &str) -> bool {
        self.channels.lock().contains_key(name)
    }

    /// Whether a creation for this name is in flight.
    pub fn is_pending(&self, name: &str) -> bool {
        self.pending.lock().contains_key(name)
    }

    /// Details of a live channel.
    pub fn channel_info(&self, name: &str) -> Option<ChannelInfo> {
        self.channels.lock().get(name).map(|live| ChannelInfo {
            name: name.to_string(),
            subscriptions: live.subscriptions.clone(),
            created_at: live.created_at,
        })
    }
}

async fn close_peer(name: &str, mut peer: Box<dyn PeerChannel>) {
    if let Err(e) = peer.unsubscribe().await {
        tracing::debug!(channel = %name, error = %e, "Peer unsubscribe failed; ignoring");
    }
}
