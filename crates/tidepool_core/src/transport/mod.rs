//! Capability interface to the realtime peer.
//!
//! The core never talks to the network directly. A host supplies a
//! [`RealtimeTransport`] that opens [`PeerChannel`] handles; each handle takes
//! change listeners, performs the subscribe handshake and reports its status
//! through a callback, and can be torn down.
//!
//! [`memory::InMemoryTransport`] is an in-process peer for tests and offline use.

pub mod memory;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::models::{ChangeEvent, ChannelStatus, TableSubscription};

/// Listener invoked by the peer for every change matching one subscription.
pub type ChangeHandler = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Listener invoked by the peer on every channel status change.
///
/// The first status reported after [`PeerChannel::subscribe`] is the handshake
/// outcome; later ones describe the channel's health.
pub type StatusHandler = Arc<dyn Fn(ChannelStatus) + Send + Sync>;

/// Factory for peer channels, usually backed by one persistent socket.
pub trait RealtimeTransport: Send + Sync {
    /// Create a local handle for the named channel. No network traffic yet.
    fn open(&self, name: &str) -> Box<dyn PeerChannel>;
}

/// One peer-side channel handle.
#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Register a change listener for one table subscription.
    fn on_change(&mut self, subscription: &TableSubscription, handler: ChangeHandler);

    /// Start the handshake; outcome and later status changes go to `on_status`.
    fn subscribe(&mut self, on_status: StatusHandler);

    /// Tear the channel down on the peer.
    async fn unsubscribe(&mut self) -> Result<()>;
}

pub use memory::{HandshakeScript, InMemoryTransport};
