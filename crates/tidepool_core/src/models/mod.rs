//! Data models for the realtime core.
//!
//! - `subscription` - TableSubscription and the event selector
//! - `event` - ChangeEvent delivered by the peer
//! - `status` - connection, channel and reconnection states

pub mod event;
pub mod status;
pub mod subscription;

pub use event::{ChangeEvent, ChangeType};
pub use status::{ChannelStatus, ConnectionStatus, ReconnectState};
pub use subscription::{normalize_subscriptions, EventSelector, TableSubscription, DEFAULT_SCHEMA};
