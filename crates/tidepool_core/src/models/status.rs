//! Connection, channel and reconnection status models.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Overall realtime connection status shown to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Channels are subscribed and receiving events
    Connected,
    /// Reconnection in progress
    Connecting,
    /// No working connection
    #[default]
    Disconnected,
}

impl ConnectionStatus {
    /// Check if the connection is active.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if the connection is connecting.
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting)
    }

    /// Check if the connection is disconnected.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Connecting => "connecting",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status a peer channel reports through its subscribe callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Handshake complete, events flowing
    Subscribed,
    /// Peer rejected or dropped the channel
    ChannelError(String),
    /// Peer gave up waiting
    TimedOut,
    /// Channel closed
    Closed,
}

impl ChannelStatus {
    /// Whether this status means the channel is receiving events.
    pub fn is_subscribed(&self) -> bool {
        matches!(self, Self::Subscribed)
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subscribed => f.write_str("SUBSCRIBED"),
            Self::ChannelError(_) => f.write_str("CHANNEL_ERROR"),
            Self::TimedOut => f.write_str("TIMED_OUT"),
            Self::Closed => f.write_str("CLOSED"),
        }
    }
}

/// Reconnection controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectState {
    /// No reconnection running
    #[default]
    Idle,
    /// Running attempt `attempt` (1-based)
    Reconnecting {
        /// Current attempt number
        attempt: u32,
    },
    /// Retry budget exhausted; waits for an explicit reconnect or online signal
    Failed,
}

impl ReconnectState {
    /// Check if a reconnection is running.
    pub fn is_reconnecting(&self) -> bool {
        matches!(self, Self::Reconnecting { .. })
    }

    /// Check if the retry budget is exhausted.
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed)
    }
}
