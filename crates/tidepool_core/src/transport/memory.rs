//! In-process realtime peer.
//!
//! Handshake outcomes are scripted per channel name, change events are pushed
//! with [`InMemoryTransport::emit`], and post-handshake status changes are
//! injected with [`InMemoryTransport::report_status`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{ChangeHandler, PeerChannel, RealtimeTransport, StatusHandler};
use crate::error::{RealtimeError, Result};
use crate::models::{ChangeEvent, ChannelStatus, TableSubscription};

/// How the peer answers a subscribe handshake.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HandshakeScript {
    /// Report `SUBSCRIBED`
    #[default]
    Accept,
    /// Report `CHANNEL_ERROR` with the given reason
    Reject(String),
    /// Report `TIMED_OUT`
    TimeOut,
    /// Never answer until [`InMemoryTransport::complete_handshake`] is called
    Hold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    Opened,
    Pending,
    Subscribed,
    Failed,
}

struct PeerEntry {
    name: String,
    listeners: Vec<(TableSubscription, ChangeHandler)>,
    on_status: Option<StatusHandler>,
    state: PeerState,
}

#[derive(Default)]
struct MemoryState {
    peers: HashMap<u64, PeerEntry>,
    default_script: HandshakeScript,
    scripts: HashMap<String, HandshakeScript>,
    opened: Vec<String>,
    handshakes: HashMap<String, usize>,
    fail_unsubscribe: bool,
}

/// In-memory [`RealtimeTransport`].
///
/// Cheap to clone; clones share the same peer state.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    state: Arc<Mutex<MemoryState>>,
    next_id: Arc<AtomicU64>,
}

impl InMemoryTransport {
    /// Create a peer that accepts every handshake.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script used for channels without a per-name script.
    pub fn set_default_handshake(&self, script: HandshakeScript) {
        self.state.lock().default_script = script;
    }

    /// Script handshakes of one channel name.
    pub fn set_handshake(&self, channel: &str, script: HandshakeScript) {
        self.state.lock().scripts.insert(channel.to_string(), script);
    }

    /// Remove a per-name script so the default applies again.
    pub fn clear_handshake(&self, channel: &str) {
        self.state.lock().scripts.remove(channel);
    }

    /// Make peer-side teardown report an error.
    pub fn set_fail_unsubscribe(&self, fail: bool) {
        self.state.lock().fail_unsubscribe = fail;
    }

    /// Names of every channel opened so far, in order.
    pub fn opened_channels(&self) -> Vec<String> {
        self.state.lock().opened.clone()
    }

    /// Number of handshakes started for a channel name.
    pub fn handshake_count(&self, channel: &str) -> usize {
        self.state.lock().handshakes.get(channel).copied().unwrap_or(0)
    }

    /// Total number of handshakes started.
    pub fn total_handshakes(&self) -> usize {
        self.state.lock().handshakes.values().sum()
    }

    /// Sorted names of channels currently subscribed on the peer.
    pub fn subscribed_channels(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut names: Vec<String> = state
            .peers
            .values()
            .filter(|peer| peer.state == PeerState::Subscribed)
            .map(|peer| peer.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Subscriptions registered on the subscribed channel with this name.
    pub fn listeners_of(&self, channel: &str) -> Vec<TableSubscription> {
        let state = self.state.lock();
        state
            .peers
            .values()
            .filter(|peer| peer.name == channel && peer.state == PeerState::Subscribed)
            .flat_map(|peer| peer.listeners.iter().map(|(sub, _)| sub.clone()))
            .collect()
    }

    /// Push a change to every subscribed channel with a matching listener.
    ///
    /// Returns the number of listeners invoked.
    pub fn emit(&self, event: &ChangeEvent) -> usize {
        self.deliver(None, event)
    }

    /// Push a change to one channel only.
    pub fn emit_to(&self, channel: &str, event: &ChangeEvent) -> usize {
        self.deliver(Some(channel), event)
    }

    fn deliver(&self, channel: Option<&str>, event: &ChangeEvent) -> usize {
        let handlers: Vec<ChangeHandler> = {
            let state = self.state.lock();
            state
                .peers
                .values()
                .filter(|peer| peer.state == PeerState::Subscribed)
                .filter(|peer| channel.map_or(true, |name| peer.name == name))
                .flat_map(|peer| peer.listeners.iter())
                .filter(|(sub, _)| sub.matches(event) && filter_passes(sub.filter.as_deref(), event))
                .map(|(_, handler)| handler.clone())
                .collect()
        };
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    /// Answer held handshakes of a channel with the given status.
    ///
    /// Returns the number of handshakes completed.
    pub fn complete_handshake(&self, channel: &str, status: ChannelStatus) -> usize {
        let handlers: Vec<StatusHandler> = {
            let mut state = self.state.lock();
            state
                .peers
                .values_mut()
                .filter(|peer| peer.name == channel && peer.state == PeerState::Pending)
                .filter_map(|peer| {
                    peer.state = if status.is_subscribed() {
                        PeerState::Subscribed
                    } else {
                        PeerState::Failed
                    };
                    peer.on_status.clone()
                })
                .collect()
        };
        for handler in &handlers {
            handler(status.clone());
        }
        handlers.len()
    }

    /// Report a status change on subscribed channels, e.g. to simulate a drop.
    ///
    /// Any status other than `SUBSCRIBED` takes the channel off the peer.
    pub fn report_status(&self, channel: &str, status: ChannelStatus) -> usize {
        let handlers: Vec<StatusHandler> = {
            let mut state = self.state.lock();
            state
                .peers
                .values_mut()
                .filter(|peer| peer.name == channel && peer.state == PeerState::Subscribed)
                .filter_map(|peer| {
                    if !status.is_subscribed() {
                        peer.state = PeerState::Failed;
                    }
                    peer.on_status.clone()
                })
                .collect()
        };
        for handler in &handlers {
            handler(status.clone());
        }
        handlers.len()
    }

    /// Drop every subscribed channel with the given status, as a lost socket would.
    pub fn drop_all(&self, status: ChannelStatus) -> usize {
        self.subscribed_channels()
            .iter()
            .map(|name| self.report_status(name, status.clone()))
            .sum()
    }
}

impl RealtimeTransport for InMemoryTransport {
    fn open(&self, name: &str) -> Box<dyn PeerChannel> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.state.lock();
            state.opened.push(name.to_string());
            state.peers.insert(
                id,
                PeerEntry {
                    name: name.to_string(),
                    listeners: Vec::new(),
                    on_status: None,
                    state: PeerState::Opened,
                },
            );
        }
        Box::new(MemoryChannel { id, name: name.to_string(), state: self.state.clone() })
    }
}

struct MemoryChannel {
    id: u64,
    name: String,
    state: Arc<Mutex<MemoryState>>,
}

#[async_trait]
impl PeerChannel for MemoryChannel {
    fn on_change(&mut self, subscription: &TableSubscription, handler: ChangeHandler) {
        if let Some(peer) = self.state.lock().peers.get_mut(&self.id) {
            peer.listeners.push((subscription.clone(), handler));
        }
    }

    fn subscribe(&mut self, on_status: StatusHandler) {
        let answer = {
            let mut state = self.state.lock();
            let script = state
                .scripts
                .get(&self.name)
                .cloned()
                .unwrap_or_else(|| state.default_script.clone());
            *state.handshakes.entry(self.name.clone()).or_default() += 1;

            let Some(peer) = state.peers.get_mut(&self.id) else {
                return;
            };
            peer.on_status = Some(on_status.clone());
            match script {
                HandshakeScript::Accept => {
                    peer.state = PeerState::Subscribed;
                    Some(ChannelStatus::Subscribed)
                }
                HandshakeScript::Reject(reason) => {
                    peer.state = PeerState::Failed;
                    Some(ChannelStatus::ChannelError(reason))
                }
                HandshakeScript::TimeOut => {
                    peer.state = PeerState::Failed;
                    Some(ChannelStatus::TimedOut)
                }
                HandshakeScript::Hold => {
                    peer.state = PeerState::Pending;
                    None
                }
            }
        };

        if let Some(status) = answer {
            on_status(status);
        }
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        let (handler, fail) = {
            let mut state = self.state.lock();
            let fail = state.fail_unsubscribe;
            let handler = state.peers.remove(&self.id).and_then(|peer| peer.on_status);
            (handler, fail)
        };
        if let Some(handler) = handler {
            handler(ChannelStatus::Closed);
        }
        if fail {
            return Err(RealtimeError::transport(format!(
                "peer refused to close channel '{}'",
                self.name
            )));
        }
        Ok(())
    }
}

/// Evaluate `column=eq.value` filters; other operators are let through.
fn filter_passes(filter: Option<&str>, event: &ChangeEvent) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    let Some((column, predicate)) = filter.split_once('=') else {
        return true;
    };
    let Some(expected) = predicate.strip_prefix("eq.") else {
        return true;
    };
    match event.record().and_then(|row| row.get(column)) {
        Some(serde_json::Value::String(s)) => s == expected,
        Some(other) => other.to_string() == expected,
        None => false,
    }
}
