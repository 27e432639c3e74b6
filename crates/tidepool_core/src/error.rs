//! Error types for the realtime core.
//!
//! Every fallible operation returns [`RealtimeError`]. Handshake failures are
//! values, not panics, so callers see them in signatures.

use std::time::Duration;

use thiserror::Error;

use crate::models::ChannelStatus;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, RealtimeError>;

/// Main error type for the realtime core.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// The peer refused or dropped the subscribe handshake.
    #[error("Handshake failed for channel '{channel}': {reason}")]
    Handshake {
        /// Channel whose handshake failed.
        channel: String,
        /// Status the peer reported.
        status: ChannelStatus,
        /// Human-readable reason.
        reason: String,
    },

    /// The peer never answered the handshake within the local timeout.
    #[error("Handshake for channel '{channel}' timed out after {}ms", timeout.as_millis())]
    HandshakeTimeout {
        /// Channel whose handshake hung.
        channel: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// Transport-level failure talking to the peer.
    #[error("Transport error: {message}")]
    Transport {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Automatic reconnection gave up.
    #[error("Reconnection failed after {attempts} attempts")]
    ReconnectExhausted {
        /// Number of attempts made.
        attempts: u32,
    },

    /// The client was shut down.
    #[error("Realtime client is shut down")]
    ShutDown,

    /// Invalid configuration.
    #[error("Config error: {message}")]
    Config {
        /// Human-readable error message.
        message: String,
    },

    /// Unexpected internal error.
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl RealtimeError {
    // ========== Constructors ==========

    /// Create a handshake error from the status the peer reported.
    pub fn handshake(channel: impl Into<String>, status: ChannelStatus) -> Self {
        let reason = match &status {
            ChannelStatus::ChannelError(reason) => reason.clone(),
            other => format!("peer reported {other}"),
        };
        Self::Handshake { channel: channel.into(), status, reason }
    }

    /// Create a handshake timeout error.
    pub fn handshake_timeout(channel: impl Into<String>, timeout: Duration) -> Self {
        Self::HandshakeTimeout { channel: channel.into(), timeout }
    }

    /// Create a new transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into(), source: None }
    }

    /// Create a new transport error with source.
    pub fn transport_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a reconnect exhaustion error.
    pub fn reconnect_exhausted(attempts: u32) -> Self {
        Self::ReconnectExhausted { attempts }
    }

    /// Create a new config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Create a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    // ========== Methods ==========

    /// Check if this error is a handshake failure (peer-reported or local timeout).
    pub fn is_handshake_failure(&self) -> bool {
        matches!(self, Self::Handshake { .. } | Self::HandshakeTimeout { .. })
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Handshake { .. } | Self::HandshakeTimeout { .. } | Self::Transport { .. }
        )
    }

    /// Channel the error refers to, if any.
    pub fn channel(&self) -> Option<&str> {
        match self {
            Self::Handshake { channel, .. } | Self::HandshakeTimeout { channel, .. } => {
                Some(channel)
            }
            _ => None,
        }
    }

    /// Get the error category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Handshake { .. } | Self::HandshakeTimeout { .. } => "Handshake",
            Self::Transport { .. } => "Transport",
            Self::ReconnectExhausted { .. } => "Reconnect",
            Self::ShutDown => "Lifecycle",
            Self::Config { .. } => "Config",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Get actionable hint for the user.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Handshake { status: ChannelStatus::ChannelError(_), .. } => {
                Some("Check that realtime is enabled for the table and the filter is valid")
            }
            Self::Handshake { .. } => Some("The realtime server may be unavailable"),
            Self::HandshakeTimeout { .. } => Some("Check your network connection"),
            Self::Transport { .. } => Some("Check your network connection"),
            Self::ReconnectExhausted { .. } => Some("Use reconnect to try again"),
            Self::ShutDown => None,
            Self::Config { .. } => None,
            Self::Internal { .. } => Some("Please report this issue"),
        }
    }

    /// Convert to status-UI displayable error info.
    pub fn to_error_info(&self) -> ErrorInfo {
        let technical_detail = match self {
            Self::Handshake { status, .. } => Some(format!("Status: {status}")),
            Self::HandshakeTimeout { timeout, .. } => {
                Some(format!("Timeout: {}ms", timeout.as_millis()))
            }
            Self::Transport { source: Some(source), .. }
            | Self::Internal { source: Some(source), .. } => Some(source.to_string()),
            _ => None,
        };

        ErrorInfo {
            error_type: format!("{} Error", self.category()),
            message: self.to_string(),
            hint: self.hint().map(String::from),
            technical_detail,
            recoverable: self.is_retryable() || matches!(self, Self::ReconnectExhausted { .. }),
        }
    }
}

/// Displayable error information for status reporting.
#[derive(Debug, Clone)]
pub struct ErrorInfo {
    /// Category name (e.g., "Handshake Error").
    pub error_type: String,
    /// User-friendly message.
    pub message: String,
    /// Actionable suggestion.
    pub hint: Option<String>,
    /// Technical detail for "Show Details" expansion.
    pub technical_detail: Option<String>,
    /// Whether a retry or manual reconnect can fix it.
    pub recoverable: bool,
}

// ========== Error Conversions ==========

/// Convert from serde_json::Error to RealtimeError.
impl From<serde_json::Error> for RealtimeError {
    fn from(err: serde_json::Error) -> Self {
        RealtimeError::Config { message: format!("JSON error: {err}") }
    }
}

/// Convert from std::io::Error to RealtimeError.
impl From<std::io::Error> for RealtimeError {
    fn from(err: std::io::Error) -> Self {
        RealtimeError::Internal { message: err.to_string(), source: Some(Box::new(err)) }
    }
}
