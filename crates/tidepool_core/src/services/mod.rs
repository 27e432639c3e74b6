//! Services behind the realtime facade.
//!
//! - `registry` - live channel ownership, creation and teardown
//! - `dispatch` - callback registrations and event routing
//! - `health` - connectivity signals and peer status normalization
//! - `reconnect` - snapshot-and-rebuild with exponential backoff

pub mod dispatch;
pub mod health;
pub mod reconnect;
pub mod registry;

pub use dispatch::{ChangeCallback, DispatchTable};
pub use health::{HealthMonitor, NetworkSignal};
pub use reconnect::{BackoffPolicy, ReconnectController, ReconnectTrigger};
pub use registry::{ChannelInfo, ChannelRegistry, ErrorCallback, RegistryEvent};
