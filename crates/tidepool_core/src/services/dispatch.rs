//! Callback dispatch table.
//!
//! Maps channel names to ordered callback registrations and routes incoming
//! change events to them. Callbacks run outside the table lock, so a callback
//! may subscribe or unsubscribe re-entrantly. A panicking callback is caught
//! and logged; its siblings still receive the event.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{normalize_subscriptions, ChangeEvent, TableSubscription};

/// Caller-supplied change callback.
pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Hook run when the last registration of a channel goes away.
pub type EmptyChannelHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone)]
struct Registration {
    id: Uuid,
    subscription: TableSubscription,
    callback: ChangeCallback,
}

#[derive(Default)]
struct Tables {
    by_channel: HashMap<String, Vec<Registration>>,
    channel_of: HashMap<Uuid, String>,
}

/// Routes change events to registered callbacks.
#[derive(Default)]
pub struct DispatchTable {
    tables: RwLock<Tables>,
    on_empty: Mutex<Option<EmptyChannelHook>>,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl DispatchTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the hook that tears a channel down once nobody listens on it.
    pub fn set_empty_channel_hook(&self, hook: EmptyChannelHook) {
        *self.on_empty.lock() = Some(hook);
    }

    /// Append a callback to the channel's registration list.
    ///
    /// Does not create the channel.
    pub fn register_callback(
        &self,
        channel: &str,
        subscription: TableSubscription,
        callback: ChangeCallback,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let registration = Registration { id, subscription, callback };

        let mut tables = self.tables.write();
        tables.by_channel.entry(channel.to_string()).or_default().push(registration);
        tables.channel_of.insert(id, channel.to_string());
        tracing::trace!(registration_id = %id, channel = %channel, "Callback registered");
        id
    }

    /// Remove exactly one registration.
    ///
    /// Unknown ids are ignored. When the channel's list becomes empty the
    /// empty-channel hook runs. Returns whether something was removed.
    pub fn unregister_callback(&self, id: Uuid) -> bool {
        let emptied = {
            let mut tables = self.tables.write();
            let Some(channel) = tables.channel_of.remove(&id) else {
                return false;
            };
            let now_empty = match tables.by_channel.get_mut(&channel) {
                Some(list) => {
                    list.retain(|registration| registration.id != id);
                    list.is_empty()
                }
                None => false,
            };
            if now_empty {
                tables.by_channel.remove(&channel);
            }
            tracing::trace!(registration_id = %id, channel = %channel, "Callback unregistered");
            now_empty.then_some(channel)
        };

        if let Some(channel) = emptied {
            tracing::debug!(channel = %channel, "Last callback removed from channel");
            let hook = self.on_empty.lock().clone();
            if let Some(hook) = hook {
                hook(&channel);
            }
        }
        true
    }

    /// Drop every registration of a channel without running the empty hook.
    pub fn remove_channel(&self, channel: &str) -> usize {
        let mut tables = self.tables.write();
        let removed = tables.by_channel.remove(channel).unwrap_or_default();
        for registration in &removed {
            tables.channel_of.remove(&registration.id);
        }
        removed.len()
    }

    /// Deliver an event to every registration on the channel whose table and
    /// event kind match. Returns the number of callbacks that completed.
    pub fn dispatch(&self, channel: &str, event: &ChangeEvent) -> usize {
        self.deliver(channel, event, |registration| registration.subscription.matches(event))
    }

    /// Deliver an event that arrived through the listener for `listener`.
    ///
    /// Only registrations watching the same rows (schema, table and filter)
    /// as the listener receive it, so overlapping listeners on one channel
    /// never deliver twice.
    pub fn route(&self, channel: &str, listener: &TableSubscription, event: &ChangeEvent) -> usize {
        self.deliver(channel, event, |registration| {
            registration.subscription.same_source(listener) && registration.subscription.matches(event)
        })
    }

    fn deliver<F>(&self, channel: &str, event: &ChangeEvent, wanted: F) -> usize
    where
        F: Fn(&Registration) -> bool,
    {
        let targets: Vec<(Uuid, ChangeCallback)> = {
            let tables = self.tables.read();
            match tables.by_channel.get(channel) {
                Some(list) => list
                    .iter()
                    .filter(|registration| wanted(registration))
                    .map(|registration| (registration.id, registration.callback.clone()))
                    .collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for (id, callback) in targets {
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        registration_id = %id,
                        channel = %channel,
                        table = %event.table,
                        event = %event.event_type,
                        error = %panic_message(panic.as_ref()),
                        "Change callback panicked"
                    );
                }
            }
        }
        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Current subscriptions wanted per channel, derived from registrations.
    ///
    /// Grouped by channel and deduplicated; this is what reconnection replays.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<TableSubscription>> {
        let tables = self.tables.read();
        tables
            .by_channel
            .iter()
            .map(|(channel, list)| {
                let subs = list.iter().map(|r| r.subscription.clone()).collect();
                (channel.clone(), normalize_subscriptions(subs))
            })
            .collect()
    }

    /// Channels with at least one registration.
    pub fn channel_names(&self) -> Vec<String> {
        self.tables.read().by_channel.keys().cloned().collect()
    }

    /// Whether any callback is registered on the channel.
    pub fn has_registrations(&self, channel: &str) -> bool {
        self.tables.read().by_channel.contains_key(channel)
    }

    /// Channel a registration belongs to.
    pub fn channel_of(&self, id: Uuid) -> Option<String> {
        self.tables.read().channel_of.get(&id).cloned()
    }

    /// Total number of registrations.
    pub fn registration_count(&self) -> usize {
        self.tables.read().channel_of.len()
    }

    /// Callbacks that completed since creation.
    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Callbacks that panicked since creation.
    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
