//! Connection health monitor.
//!
//! Normalizes environment connectivity signals and peer channel reports into
//! the shared [`ConnectionState`]. Going offline is reported immediately;
//! coming back online only starts a reconnection, since IP-level
//! connectivity says nothing about the realtime peer.

use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::models::{ConnectionStatus, ReconnectState};
use crate::services::reconnect::{ReconnectController, ReconnectTrigger};
use crate::services::registry::RegistryEvent;
use crate::state::ConnectionState;

/// Environment connectivity signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkSignal {
    /// The host regained network access.
    Online,
    /// The host lost network access.
    Offline,
}

/// Watches connectivity and feeds the reconnection controller.
pub struct HealthMonitor {
    state: Arc<ConnectionState>,
    controller: Arc<ReconnectController>,
    auto_reconnect: bool,
}

impl HealthMonitor {
    /// Create a monitor.
    pub fn new(
        state: Arc<ConnectionState>,
        controller: Arc<ReconnectController>,
        auto_reconnect: bool,
    ) -> Self {
        Self { state, controller, auto_reconnect }
    }

    /// Handle one environment signal.
    pub fn handle_signal(&self, signal: NetworkSignal) {
        match signal {
            NetworkSignal::Offline => {
                tracing::info!("Network offline");
                self.state.set_offline(true);
                self.controller.halt();
                self.state.set_status(ConnectionStatus::Disconnected);
            }
            NetworkSignal::Online => {
                tracing::info!("Network online");
                self.state.set_offline(false);
                if !self.state.status().is_disconnected() {
                    return;
                }
                if self.auto_reconnect {
                    self.controller.start(ReconnectTrigger::Online);
                }
            }
        }
    }

    /// Handle a lifecycle notification from the channel registry.
    pub fn handle_registry_event(&self, event: RegistryEvent) {
        match event {
            RegistryEvent::Subscribed { channel } => {
                if self.state.is_offline() {
                    tracing::debug!(channel = %channel, "Ignoring handshake while offline");
                    return;
                }
                if self.state.reconnect_state() == ReconnectState::Idle
                    && !self.state.status().is_connected()
                {
                    tracing::debug!(channel = %channel, "Handshake confirms peer connectivity");
                    self.state.set_status(ConnectionStatus::Connected);
                }
            }
            RegistryEvent::Lost { channel, status } => {
                if self.state.reconnect_state().is_reconnecting() {
                    return;
                }
                tracing::warn!(channel = %channel, %status, "Realtime transport lost");
                self.state.set_status(ConnectionStatus::Disconnected);
                if self.auto_reconnect && !self.state.is_offline() {
                    self.controller.start(ReconnectTrigger::TransportLoss);
                }
            }
        }
    }

    /// Consume environment signals from a channel until it closes.
    pub fn spawn_listener(
        self: &Arc<Self>,
        handle: &Handle,
        mut signals: mpsc::Receiver<NetworkSignal>,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        handle.spawn(async move {
            while let Some(signal) = signals.recv().await {
                monitor.handle_signal(signal);
            }
            tracing::debug!("Network signal source closed");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChannelStatus;
    use crate::services::dispatch::DispatchTable;
    use crate::services::reconnect::BackoffPolicy;
    use crate::services::registry::ChannelRegistry;
    use crate::transport::InMemoryTransport;

    fn monitor(auto_reconnect: bool) -> (Arc<HealthMonitor>, Arc<ConnectionState>) {
        let handle = Handle::current();
        let dispatch = Arc::new(DispatchTable::new());
        let registry = Arc::new(ChannelRegistry::new(
            Arc::new(InMemoryTransport::new()),
            dispatch.clone(),
            handle.clone(),
            None,
        ));
        let state = Arc::new(ConnectionState::new(3));
        let controller = Arc::new(ReconnectController::new(
            registry,
            dispatch,
            state.clone(),
            BackoffPolicy::default(),
            handle,
        ));
        (Arc::new(HealthMonitor::new(state.clone(), controller, auto_reconnect)), state)
    }

    #[tokio::test]
    async fn test_offline_is_reported_immediately() {
        let (monitor, state) = monitor(true);
        state.set_status(ConnectionStatus::Connected);

        monitor.handle_signal(NetworkSignal::Offline);

        assert_eq!(state.status(), ConnectionStatus::Disconnected);
        assert_eq!(state.reconnect_state(), ReconnectState::Idle);
    }

    #[tokio::test]
    async fn test_online_starts_reconnection_not_connected() {
        let (monitor, state) = monitor(true);

        monitor.handle_signal(NetworkSignal::Online);

        assert_ne!(state.status(), ConnectionStatus::Connected);
        assert!(state.reconnect_state().is_reconnecting());
    }

    #[tokio::test]
    async fn test_online_without_auto_reconnect_stays_idle() {
        let (monitor, state) = monitor(false);
        monitor.handle_signal(NetworkSignal::Online);
        assert_eq!(state.reconnect_state(), ReconnectState::Idle);
    }

    #[tokio::test]
    async fn test_subscribed_marks_connected_only_when_idle() {
        let (monitor, state) = monitor(true);
        monitor.handle_registry_event(RegistryEvent::Subscribed { channel: "a".into() });
        assert_eq!(state.status(), ConnectionStatus::Connected);

        state.set_status(ConnectionStatus::Disconnected);
        let _run = state.begin_run();
        monitor.handle_registry_event(RegistryEvent::Subscribed { channel: "a".into() });
        assert_eq!(state.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_handshake_while_offline_keeps_disconnected() {
        let (monitor, state) = monitor(true);
        monitor.handle_signal(NetworkSignal::Offline);

        monitor.handle_registry_event(RegistryEvent::Subscribed { channel: "a".into() });
        assert_eq!(state.status(), ConnectionStatus::Disconnected);

        monitor.handle_registry_event(RegistryEvent::Lost {
            channel: "a".into(),
            status: ChannelStatus::Closed,
        });
        assert_eq!(state.reconnect_state(), ReconnectState::Idle);

        monitor.handle_signal(NetworkSignal::Online);
        assert!(!state.is_offline());
        assert!(state.reconnect_state().is_reconnecting());
    }

    #[tokio::test]
    async fn test_lost_channel_triggers_reconnection_once() {
        let (monitor, state) = monitor(true);
        state.set_status(ConnectionStatus::Connected);

        let lost = |channel: &str| RegistryEvent::Lost {
            channel: channel.to_string(),
            status: ChannelStatus::Closed,
        };
        monitor.handle_registry_event(lost("a"));
        assert_eq!(state.status(), ConnectionStatus::Disconnected);
        assert!(state.reconnect_state().is_reconnecting());
        assert!(state.has_reconnect_task());

        monitor.handle_registry_event(lost("b"));
        assert!(state.reconnect_state().is_reconnecting());
    }
}
