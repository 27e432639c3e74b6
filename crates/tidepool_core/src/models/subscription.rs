//! Table subscription models.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::event::{ChangeEvent, ChangeType};

/// Schema used when a subscription does not name one.
pub const DEFAULT_SCHEMA: &str = "public";

/// Which change kinds a subscription or callback wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EventSelector {
    /// Row inserts
    #[serde(rename = "INSERT")]
    Insert,
    /// Row updates
    #[serde(rename = "UPDATE")]
    Update,
    /// Row deletes
    #[serde(rename = "DELETE")]
    Delete,
    /// Every change kind
    #[default]
    #[serde(rename = "*")]
    Any,
}

impl EventSelector {
    /// Wire representation understood by the peer.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Any => "*",
        }
    }

    /// Parse from the wire representation. Unknown values select everything.
    pub fn parse(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "INSERT" => Self::Insert,
            "UPDATE" => Self::Update,
            "DELETE" => Self::Delete,
            _ => Self::Any,
        }
    }

    /// Whether a change of the given kind passes this selector.
    pub fn accepts(&self, change: ChangeType) -> bool {
        match self {
            Self::Any => true,
            Self::Insert => change == ChangeType::Insert,
            Self::Update => change == ChangeType::Update,
            Self::Delete => change == ChangeType::Delete,
        }
    }
}

impl fmt::Display for EventSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One table-level interest within a channel.
///
/// Immutable once attached to a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableSubscription {
    /// Database schema
    #[serde(default = "default_schema")]
    pub schema: String,
    /// Table name
    pub table: String,
    /// Change kinds of interest
    #[serde(default)]
    pub event: EventSelector,
    /// Opaque peer-side row filter, e.g. `user_id=eq.42`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

fn default_schema() -> String {
    DEFAULT_SCHEMA.to_string()
}

impl TableSubscription {
    /// Create a subscription on the default schema without a filter.
    pub fn new(table: impl Into<String>, event: EventSelector) -> Self {
        Self { schema: default_schema(), table: table.into(), event, filter: None }
    }

    /// Set the schema.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Set the row filter. The filter is passed through to the peer untouched.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Whether a change event belongs to this subscription's table and event kinds.
    ///
    /// The filter is evaluated by the peer and is not checked here.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        self.schema == event.schema && self.table == event.table && self.event.accepts(event.event_type)
    }

    /// Whether both subscriptions watch the same rows (schema, table and filter).
    pub fn same_source(&self, other: &TableSubscription) -> bool {
        self.schema == other.schema && self.table == other.table && self.filter == other.filter
    }

    /// Whether every change delivered for `other` is also delivered for `self`.
    pub fn covers(&self, other: &TableSubscription) -> bool {
        self.same_source(other) && (self.event == EventSelector::Any || self.event == other.event)
    }

    /// Channel name used when the caller does not pick one.
    pub fn default_channel_name(&self) -> String {
        match &self.filter {
            Some(filter) => format!("{}:{}:{}:{}", self.schema, self.table, self.event, filter),
            None => format!("{}:{}:{}", self.schema, self.table, self.event),
        }
    }
}

impl fmt::Display for TableSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} [{}]", self.schema, self.table, self.event)?;
        if let Some(filter) = &self.filter {
            write!(f, " where {filter}")?;
        }
        Ok(())
    }
}

/// Remove duplicate and redundant subscriptions, keeping first-seen order.
///
/// A concrete-event subscription is dropped when an `Any` subscription on the
/// same schema, table and filter exists, so each change reaches one listener.
pub fn normalize_subscriptions(subscriptions: Vec<TableSubscription>) -> Vec<TableSubscription> {
    let mut normalized: Vec<TableSubscription> = Vec::with_capacity(subscriptions.len());
    for candidate in &subscriptions {
        let redundant = subscriptions.iter().any(|other| {
            other.event == EventSelector::Any
                && candidate.event != EventSelector::Any
                && other.covers(candidate)
        });
        if redundant || normalized.contains(candidate) {
            continue;
        }
        normalized.push(candidate.clone());
    }
    normalized
}
