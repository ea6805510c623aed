//! Connection state store and the derived health summary.
//!
//! The store is written only by the manager's background actor; handles read
//! snapshots. Every mutation republishes a [`ConnectionHealthSummary`] on a
//! `watch` channel.

use serde::Serialize;
use tokio::{sync::watch, time::Instant};

use crate::{events::unix_millis, types::ConnectionId};

/// Lifecycle status of one logical connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Socket handshake in progress.
    Connecting,
    /// Socket open.
    Connected,
    /// No socket.
    Disconnected,
    /// The socket reported an error; a close normally follows.
    Error,
    /// A retry timer is armed.
    Reconnecting,
}

impl ConnectionStatus {
    /// Status name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
            Self::Reconnecting => "reconnecting",
        }
    }

    /// Returns true if the socket is open.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Lifecycle record for one [`ConnectionId`].
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    /// Endpoint path the socket connects to.
    pub endpoint: String,
    /// Current status.
    pub status: ConnectionStatus,
    /// Consecutive scheduled retries since the last successful open.
    pub reconnect_attempts: u32,
    /// Last open, milliseconds since the epoch.
    pub last_connected: Option<u64>,
    /// Last close, milliseconds since the epoch.
    pub last_disconnected: Option<u64>,
    /// Most recent error message.
    pub last_error: Option<String>,
    /// Inbound frames successfully decoded.
    pub message_count: u64,
    /// Set when the reconnect policy ran out of attempts.
    pub reconnect_exhausted: bool,
    /// Last open or inbound message, on the runtime clock.
    #[serde(skip)]
    pub last_activity: Option<Instant>,
}

impl ConnectionState {
    /// Fresh state for a connection that is about to dial.
    pub fn connecting(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            status: ConnectionStatus::Connecting,
            reconnect_attempts: 0,
            last_connected: None,
            last_disconnected: None,
            last_error: None,
            message_count: 0,
            reconnect_exhausted: false,
            last_activity: Some(Instant::now()),
        }
    }

    pub(crate) fn mark_connected(&mut self) {
        self.status = ConnectionStatus::Connected;
        self.reconnect_attempts = 0;
        self.reconnect_exhausted = false;
        self.last_connected = Some(unix_millis());
        self.last_activity = Some(Instant::now());
    }

    pub(crate) fn mark_disconnected(&mut self) {
        self.status = ConnectionStatus::Disconnected;
        self.last_disconnected = Some(unix_millis());
    }

    pub(crate) fn mark_error(&mut self, message: impl Into<String>) {
        self.status = ConnectionStatus::Error;
        self.last_error = Some(message.into());
    }

    pub(crate) fn record_message(&mut self) {
        self.message_count += 1;
        self.last_activity = Some(Instant::now());
    }
}

/// Health row for one connection.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionHealth {
    /// Connection id.
    pub connection_id: ConnectionId,
    /// Current status.
    pub status: ConnectionStatus,
    /// Retry attempts since the last open.
    pub reconnect_count: u32,
    /// Most recent error.
    pub last_error: Option<String>,
}

/// Read-only projection of every connection state.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ConnectionHealthSummary {
    /// One row per known connection, ordered by id.
    pub connections: Vec<ConnectionHealth>,
    /// Connections currently open.
    pub active: usize,
    /// Connections known to the manager.
    pub total: usize,
}

impl ConnectionHealthSummary {
    fn from_states(states: &[(ConnectionId, ConnectionState)]) -> Self {
        let mut connections: Vec<ConnectionHealth> = states
            .iter()
            .map(|(id, state)| ConnectionHealth {
                connection_id: id.clone(),
                status: state.status,
                reconnect_count: state.reconnect_attempts,
                last_error: state.last_error.clone(),
            })
            .collect();
        connections.sort_by_cached_key(|row| row.connection_id.to_string());

        let active = connections
            .iter()
            .filter(|row| row.status.is_connected())
            .count();
        let total = connections.len();

        Self {
            connections,
            active,
            total,
        }
    }
}

/// The parts of a state that show up in the summary.
#[derive(PartialEq)]
struct HealthFields {
    status: ConnectionStatus,
    reconnect_attempts: u32,
    last_error: Option<String>,
}

impl HealthFields {
    fn of(state: &ConnectionState) -> Self {
        Self {
            status: state.status,
            reconnect_attempts: state.reconnect_attempts,
            last_error: state.last_error.clone(),
        }
    }
}

/// Registry of [`ConnectionState`] keyed by [`ConnectionId`].
pub struct ConnectionStateStore {
    states: scc::HashMap<ConnectionId, ConnectionState>,
    summary_tx: watch::Sender<ConnectionHealthSummary>,
}

impl Default for ConnectionStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (summary_tx, _) = watch::channel(ConnectionHealthSummary::default());
        Self {
            states: scc::HashMap::new(),
            summary_tx,
        }
    }

    /// Insert or replace a state.
    pub fn insert(&self, id: ConnectionId, state: ConnectionState) {
        if let Err((id, state)) = self.states.insert_sync(id, state) {
            let _ = self.states.update_sync(&id, |_, existing| *existing = state);
        }
        self.publish();
    }

    /// Mutate a state in place. Returns `false` if the id is unknown.
    ///
    /// The summary is republished only when a field it shows changed.
    pub fn update<F>(&self, id: &ConnectionId, f: F) -> bool
    where
        F: FnOnce(&mut ConnectionState),
    {
        let changed = self.states.update_sync(id, |_, state| {
            let before = HealthFields::of(state);
            f(state);
            before != HealthFields::of(state)
        });
        match changed {
            Some(changed) => {
                if changed {
                    self.publish();
                }
                true
            }
            None => false,
        }
    }

    /// Snapshot of one state.
    pub fn get(&self, id: &ConnectionId) -> Option<ConnectionState> {
        self.states.read_sync(id, |_, state| state.clone())
    }

    /// Returns true if the id has a state.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.states.read_sync(id, |_, _| ()).is_some()
    }

    /// Remove a state.
    pub fn remove(&self, id: &ConnectionId) -> Option<ConnectionState> {
        let removed = self.states.remove_sync(id).map(|(_, state)| state);
        if removed.is_some() {
            self.publish();
        }
        removed
    }

    /// Snapshot of every state.
    pub fn snapshot(&self) -> Vec<(ConnectionId, ConnectionState)> {
        let mut states = Vec::with_capacity(self.states.len());
        self.states.retain_sync(|id, state| {
            states.push((id.clone(), state.clone()));
            true
        });
        states
    }

    /// Every known id.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.snapshot().into_iter().map(|(id, _)| id).collect()
    }

    /// Number of known connections.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Remove every state.
    pub fn clear(&self) {
        self.states.clear_sync();
        self.publish();
    }

    /// Current summary.
    pub fn summary(&self) -> ConnectionHealthSummary {
        self.summary_tx.borrow().clone()
    }

    /// Receiver that observes every summary change.
    pub fn watch(&self) -> watch::Receiver<ConnectionHealthSummary> {
        self.summary_tx.subscribe()
    }

    fn publish(&self) {
        let summary = ConnectionHealthSummary::from_states(&self.snapshot());
        self.summary_tx.send_if_modified(|current| {
            if *current == summary {
                false
            } else {
                *current = summary;
                true
            }
        });
    }
}
