//! Realtime subscription core for Tidepool.
//!
//! Manages pub/sub channels to a realtime database-change peer on behalf of
//! UI code:
//!
//! - **client**: `RealtimeClient`, the subscription facade
//! - **error**: Error handling with actionable hints
//! - **models**: Subscriptions, change events and status types
//! - **services**: Channel registry, callback dispatch, health monitor, reconnection
//! - **state**: Shared connection state
//! - **transport**: Peer channel abstraction and an in-memory peer
//! - **config**: Reconnection and handshake settings
//! - **logging**: Structured logging setup

pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod services;
pub mod state;
pub mod transport;

#[cfg(test)]
mod verification_tests;

pub use client::{ErrorCallback, RealtimeClient, SubscribeOptions, Subscription};
pub use config::RealtimeConfig;
pub use error::{ErrorInfo, RealtimeError, Result};
pub use models::{
    ChangeEvent, ChangeType, ChannelStatus, ConnectionStatus, EventSelector, ReconnectState,
    TableSubscription,
};
pub use services::{BackoffPolicy, ChannelInfo, NetworkSignal};
pub use state::ConnectionState;
pub use transport::{HandshakeScript, InMemoryTransport, PeerChannel, RealtimeTransport};
