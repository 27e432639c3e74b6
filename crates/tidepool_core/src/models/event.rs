//! Change events pushed by the realtime peer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::subscription::DEFAULT_SCHEMA;

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
}

impl ChangeType {
    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single row change delivered on a channel.
///
/// `new` is present for inserts and updates, `old` for updates and deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Change kind
    #[serde(rename = "eventType")]
    pub event_type: ChangeType,
    /// Database schema
    #[serde(default = "default_schema")]
    pub schema: String,
    /// Table name
    pub table: String,
    /// Row after the change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new: Option<Value>,
    /// Row before the change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
    /// Commit time reported by the peer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_timestamp: Option<DateTime<Utc>>,
}

fn default_schema() -> String {
    DEFAULT_SCHEMA.to_string()
}

impl ChangeEvent {
    /// Create an insert event on the default schema.
    pub fn insert(table: impl Into<String>, new: Value) -> Self {
        Self::build(ChangeType::Insert, table, Some(new), None)
    }

    /// Create an update event on the default schema.
    pub fn update(table: impl Into<String>, new: Value, old: Value) -> Self {
        Self::build(ChangeType::Update, table, Some(new), Some(old))
    }

    /// Create a delete event on the default schema.
    pub fn delete(table: impl Into<String>, old: Value) -> Self {
        Self::build(ChangeType::Delete, table, None, Some(old))
    }

    fn build(
        event_type: ChangeType,
        table: impl Into<String>,
        new: Option<Value>,
        old: Option<Value>,
    ) -> Self {
        Self {
            event_type,
            schema: default_schema(),
            table: table.into(),
            new,
            old,
            commit_timestamp: None,
        }
    }

    /// Set the schema.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// The row this event is about: `new` if present, otherwise `old`.
    pub fn record(&self) -> Option<&Value> {
        self.new.as_ref().or(self.old.as_ref())
    }
}
