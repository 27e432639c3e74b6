//! Runtime configuration for the realtime core.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{RealtimeError, Result};
use crate::models::DEFAULT_SCHEMA;
use crate::services::reconnect::BackoffPolicy;

/// Tunables for channel creation and reconnection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Reconnection attempts before giving up
    pub max_reconnect_attempts: u32,
    /// Delay after the first failed attempt, in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound for the backoff delay, in milliseconds
    pub max_delay_ms: u64,
    /// Local bound on a handshake; `None` waits for the peer indefinitely
    pub handshake_timeout_ms: Option<u64>,
    /// Schema used when a subscription does not name one
    pub default_schema: String,
    /// Recover automatically on transport loss and online transitions
    pub auto_reconnect: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            handshake_timeout_ms: Some(10_000),
            default_schema: DEFAULT_SCHEMA.to_string(),
            auto_reconnect: true,
        }
    }
}

impl RealtimeConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the retry budget.
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Set base and maximum backoff delays.
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay_ms = base.as_millis() as u64;
        self.max_delay_ms = max.as_millis() as u64;
        self
    }

    /// Set or clear the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    /// Set the default schema.
    pub fn with_default_schema(mut self, schema: impl Into<String>) -> Self {
        self.default_schema = schema.into();
        self
    }

    /// Enable or disable automatic reconnection.
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Handshake timeout as a `Duration`.
    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_ms.map(Duration::from_millis)
    }

    /// Backoff policy derived from this configuration.
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.max_reconnect_attempts,
        )
    }

    /// Check the configuration for values the controller cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_reconnect_attempts == 0 {
            return Err(RealtimeError::config("max_reconnect_attempts must be at least 1"));
        }
        if self.base_delay_ms == 0 {
            return Err(RealtimeError::config("base_delay_ms must be greater than 0"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(RealtimeError::config("max_delay_ms must not be below base_delay_ms"));
        }
        if self.handshake_timeout_ms == Some(0) {
            return Err(RealtimeError::config("handshake_timeout_ms must be greater than 0"));
        }
        if self.default_schema.trim().is_empty() {
            return Err(RealtimeError::config("default_schema must not be empty"));
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            RealtimeError::config(format!("Failed to read {}: {e}", path.display()))
        })?;
        let config = Self::from_json_str(&contents)?;
        tracing::debug!(path = %path.display(), "Realtime config loaded");
        Ok(config)
    }
}

/// Default data directory for logs and local state.
pub fn default_data_dir() -> PathBuf {
    #[cfg(debug_assertions)]
    {
        PathBuf::from("./tidepool_data")
    }

    #[cfg(not(debug_assertions))]
    {
        dirs::data_dir()
            .map(|d| d.join("tidepool"))
            .unwrap_or_else(|| PathBuf::from("./tidepool_data"))
    }
}
