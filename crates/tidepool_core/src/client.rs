//! Public subscription facade.
//!
//! [`RealtimeClient`] is the only entry point UI code uses. It owns the
//! registry, dispatch table, connection state, health monitor and
//! reconnection controller for one realtime connection; independent clients
//! share nothing.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::RealtimeConfig;
use crate::error::{RealtimeError, Result};
use crate::models::{
    ChangeEvent, ConnectionStatus, EventSelector, ReconnectState, TableSubscription,
};
use crate::services::{
    ChannelInfo, ChannelRegistry, DispatchTable, HealthMonitor, NetworkSignal,
    ReconnectController, ReconnectTrigger, RegistryEvent,
};

pub use crate::services::ErrorCallback;
use crate::state::ConnectionState;
use crate::transport::RealtimeTransport;

/// What a [`RealtimeClient::subscribe`] call listens for.
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    /// Schema; the client's default schema when `None`
    pub schema: Option<String>,
    /// Table name
    pub table: String,
    /// Change kinds of interest
    pub event: EventSelector,
    /// Opaque peer-side row filter
    pub filter: Option<String>,
    /// Channel to join; derived from table, event and filter when `None`
    pub channel_name: Option<String>,
    /// Called if creating the channel fails
    pub on_error: Option<ErrorCallback>,
}

impl SubscribeOptions {
    /// Listen for every change on a table.
    pub fn new(table: impl Into<String>) -> Self {
        Self { table: table.into(), ..Self::default() }
    }

    /// Set the change kinds.
    pub fn event(mut self, event: EventSelector) -> Self {
        self.event = event;
        self
    }

    /// Set the schema.
    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    /// Set the row filter, e.g. `user_id=eq.42`.
    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Join a named channel instead of the derived one.
    pub fn channel(mut self, name: impl Into<String>) -> Self {
        self.channel_name = Some(name.into());
        self
    }

    /// Set the creation failure hook.
    pub fn on_error<F>(mut self, on_error: F) -> Self
    where
        F: Fn(&RealtimeError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    fn table_subscription(&self, default_schema: &str) -> TableSubscription {
        TableSubscription {
            schema: self.schema.clone().unwrap_or_else(|| default_schema.to_string()),
            table: self.table.clone(),
            event: self.event,
            filter: self.filter.clone(),
        }
    }
}

impl std::fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("schema", &self.schema)
            .field("table", &self.table)
            .field("event", &self.event)
            .field("filter", &self.filter)
            .field("channel_name", &self.channel_name)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Handle returned by [`RealtimeClient::subscribe`].
///
/// Valid immediately, even while the channel handshake is in flight. Dropping
/// it does not unsubscribe.
#[must_use = "keep the subscription to be able to unsubscribe"]
#[derive(Clone)]
pub struct Subscription {
    id: Uuid,
    channel: String,
    dispatch: Weak<DispatchTable>,
}

impl Subscription {
    fn closed(channel: String) -> Self {
        Self { id: Uuid::nil(), channel, dispatch: Weak::new() }
    }

    /// Registration id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Channel the callback is registered on.
    pub fn channel_name(&self) -> &str {
        &self.channel
    }

    /// Whether the callback is still registered.
    pub fn is_active(&self) -> bool {
        self.dispatch
            .upgrade()
            .is_some_and(|dispatch| dispatch.channel_of(self.id).is_some())
    }

    /// Remove this callback. Tears the channel down if it was the last one.
    ///
    /// Safe to call more than once. Returns whether anything was removed.
    pub fn unsubscribe(&self) -> bool {
        match self.dispatch.upgrade() {
            Some(dispatch) => dispatch.unregister_callback(self.id),
            None => false,
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .finish()
    }
}

struct ClientInner {
    config: RealtimeConfig,
    registry: Arc<ChannelRegistry>,
    dispatch: Arc<DispatchTable>,
    state: Arc<ConnectionState>,
    controller: Arc<ReconnectController>,
    monitor: Arc<HealthMonitor>,
    handle: Handle,
    shutdown: CancellationToken,
    signal_task: Mutex<Option<JoinHandle<()>>>,
}

/// Realtime subscription client.
///
/// Cheap to clone; clones share the same channels and state.
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<ClientInner>,
}

impl RealtimeClient {
    /// Create a client on the current tokio runtime.
    pub fn new(transport: Arc<dyn RealtimeTransport>, config: RealtimeConfig) -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| {
            RealtimeError::internal(format!("RealtimeClient needs a tokio runtime: {e}"))
        })?;
        Self::with_handle(transport, config, handle)
    }

    /// Create a client that spawns its background work on `handle`.
    pub fn with_handle(
        transport: Arc<dyn RealtimeTransport>,
        config: RealtimeConfig,
        handle: Handle,
    ) -> Result<Self> {
        config.validate()?;

        let dispatch = Arc::new(DispatchTable::new());
        let registry = Arc::new(ChannelRegistry::new(
            transport,
            dispatch.clone(),
            handle.clone(),
            config.handshake_timeout(),
        ));
        let state = Arc::new(ConnectionState::new(config.max_reconnect_attempts));
        let controller = Arc::new(ReconnectController::new(
            registry.clone(),
            dispatch.clone(),
            state.clone(),
            config.backoff(),
            handle.clone(),
        ));
        let monitor =
            Arc::new(HealthMonitor::new(state.clone(), controller.clone(), config.auto_reconnect));

        let weak_registry = Arc::downgrade(&registry);
        dispatch.set_empty_channel_hook(Arc::new(move |channel: &str| {
            if let Some(registry) = weak_registry.upgrade() {
                registry.release_if_unused(channel);
            }
        }));

        let weak_monitor = Arc::downgrade(&monitor);
        registry.set_event_hook(Arc::new(move |event: RegistryEvent| {
            if let Some(monitor) = weak_monitor.upgrade() {
                monitor.handle_registry_event(event);
            }
        }));

        tracing::debug!(
            max_reconnect_attempts = config.max_reconnect_attempts,
            auto_reconnect = config.auto_reconnect,
            "RealtimeClient initialized"
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                registry,
                dispatch,
                state,
                controller,
                monitor,
                handle,
                shutdown: CancellationToken::new(),
                signal_task: Mutex::new(None),
            }),
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &RealtimeConfig {
        &self.inner.config
    }

    // ========== Subscribing ==========

    /// Register `callback` for changes matching `options`.
    ///
    /// Creates the channel in the background if it does not exist yet. Never
    /// fails synchronously; creation errors go to `options.on_error` and the log,
    /// also when this call joins a creation another subscriber started.
    pub fn subscribe<F>(&self, options: SubscribeOptions, callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let subscription = options.table_subscription(&self.inner.config.default_schema);
        let channel =
            options.channel_name.clone().unwrap_or_else(|| subscription.default_channel_name());

        if self.inner.shutdown.is_cancelled() {
            tracing::warn!(channel = %channel, "Subscribe after shutdown ignored");
            return Subscription::closed(channel);
        }

        let id = self.inner.dispatch.register_callback(&channel, subscription.clone(), Arc::new(callback));
        tracing::debug!(
            registration_id = %id,
            channel = %channel,
            table = %subscription.table,
            event = %subscription.event,
            "Subscribed"
        );

        let started = self.inner.registry.try_begin_creation(&channel);
        if let Some(on_error) = options.on_error.clone() {
            self.inner.registry.add_failure_hook(&channel, on_error);
        }

        if let Some(generation) = started {
            let registry = self.inner.registry.clone();
            let name = channel.clone();
            self.inner.handle.spawn(async move {
                let table = subscription.table.clone();
                let event = subscription.event;
                if let Err(e) = registry.complete_creation(&name, vec![subscription], generation).await {
                    tracing::warn!(
                        channel = %name,
                        table = %table,
                        event = %event,
                        error = %e,
                        "Channel creation for subscription failed"
                    );
                }
            });
        } else if let Some(info) = self.inner.registry.channel_info(&channel) {
            if !info.subscriptions.iter().any(|s| s.covers(&subscription)) {
                tracing::warn!(
                    channel = %channel,
                    wanted = %subscription,
                    carried = ?info.subscriptions.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
                    "Channel does not carry this table subscription; events for it will not arrive"
                );
            }
        }

        Subscription { id, channel, dispatch: Arc::downgrade(&self.inner.dispatch) }
    }

    /// Subscribe to inserts on a table.
    pub fn on_insert<F>(&self, table: &str, callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.subscribe(SubscribeOptions::new(table).event(EventSelector::Insert), callback)
    }

    /// Subscribe to updates on a table.
    pub fn on_update<F>(&self, table: &str, callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.subscribe(SubscribeOptions::new(table).event(EventSelector::Update), callback)
    }

    /// Subscribe to deletes on a table.
    pub fn on_delete<F>(&self, table: &str, callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.subscribe(SubscribeOptions::new(table).event(EventSelector::Delete), callback)
    }

    /// Subscribe to every change on a table.
    pub fn on_all<F>(&self, table: &str, callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.subscribe(SubscribeOptions::new(table).event(EventSelector::Any), callback)
    }

    /// Create one channel carrying several table subscriptions.
    ///
    /// Callbacks join it with [`SubscribeOptions::channel`]. Its tables are
    /// restored on reconnection even before anyone subscribes.
    pub async fn create_multi_table_channel(
        &self,
        name: &str,
        tables: Vec<TableSubscription>,
    ) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(RealtimeError::ShutDown);
        }
        self.inner.registry.create_channel(name, tables.clone()).await?;
        self.inner.registry.declare(name, tables);
        Ok(())
    }

    // ========== Administration ==========

    /// Tear down every channel and forget every callback.
    pub async fn unsubscribe_all(&self) {
        self.inner.registry.remove_all_channels().await;
    }

    /// Tear down one channel and forget its callbacks.
    pub async fn unsubscribe_channel(&self, name: &str) {
        self.inner.registry.remove_channel(name).await;
    }

    /// Rebuild every channel now, restarting at attempt 1.
    pub fn reconnect(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(RealtimeError::ShutDown);
        }
        self.inner.controller.start(ReconnectTrigger::Explicit);
        Ok(())
    }

    /// Feed an environment connectivity signal.
    pub fn handle_network_signal(&self, signal: NetworkSignal) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.monitor.handle_signal(signal);
    }

    /// The host went online.
    pub fn notify_online(&self) {
        self.handle_network_signal(NetworkSignal::Online);
    }

    /// The host went offline.
    pub fn notify_offline(&self) {
        self.handle_network_signal(NetworkSignal::Offline);
    }

    /// Consume connectivity signals from a channel, replacing any previous source.
    pub fn attach_network_signals(&self, signals: mpsc::Receiver<NetworkSignal>) {
        let task = self.inner.monitor.spawn_listener(&self.inner.handle, signals);
        if let Some(old) = self.inner.signal_task.lock().replace(task) {
            old.abort();
        }
    }

    /// Stop reconnecting, tear everything down and refuse new subscriptions.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        if let Some(task) = self.inner.signal_task.lock().take() {
            task.abort();
        }
        self.inner.controller.halt();
        self.inner.registry.remove_all_channels().await;
        self.inner.state.set_status(ConnectionStatus::Disconnected);
        tracing::info!("RealtimeClient shut down");
    }

    /// Whether [`Self::shutdown`] was called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    // ========== Introspection ==========

    /// Current connection status.
    pub fn connection_status(&self) -> ConnectionStatus {
        self.inner.state.status()
    }

    /// Receiver that observes every status change.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.state.watch()
    }

    /// Reconnection state machine position.
    pub fn reconnect_state(&self) -> ReconnectState {
        self.inner.state.reconnect_state()
    }

    /// Current reconnection attempt number (0 when idle after success).
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.state.reconnect_attempts()
    }

    /// Number of live channels.
    pub fn channel_count(&self) -> usize {
        self.inner.registry.channel_count()
    }

    /// Sorted names of live channels.
    pub fn channel_names(&self) -> Vec<String> {
        self.inner.registry.channel_names()
    }

    /// Table subscriptions of a live channel.
    pub fn channel_subscriptions(&self, name: &str) -> Option<Vec<TableSubscription>> {
        self.inner.registry.channel_info(name).map(|info| info.subscriptions)
    }

    /// Details of a live channel.
    pub fn channel_info(&self, name: &str) -> Option<ChannelInfo> {
        self.inner.registry.channel_info(name)
    }

    /// Whether a channel handshake is in flight.
    pub fn is_channel_pending(&self, name: &str) -> bool {
        self.inner.registry.is_pending(name)
    }

    /// Total number of registered callbacks.
    pub fn registration_count(&self) -> usize {
        self.inner.dispatch.registration_count()
    }

    /// Callback invocations that completed.
    pub fn delivered_callback_count(&self) -> u64 {
        self.inner.dispatch.delivered_count()
    }

    /// Callback invocations that panicked.
    pub fn failed_callback_count(&self) -> u64 {
        self.inner.dispatch.failed_count()
    }
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("status", &self.connection_status())
            .field("channels", &self.channel_names())
            .field("registrations", &self.registration_count())
            .finish()
    }
}
