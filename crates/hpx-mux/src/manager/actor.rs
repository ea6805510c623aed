//! Background actor that owns every socket, queue and timer.
//!
//! The actor handles, in order of arrival:
//! - Commands from [`super::ConnectionManager`] handles
//! - Lifecycle reports from per-socket drivers, tagged with an epoch
//! - Retry timer and health tick expiries
//!
//! Nothing here awaits network I/O; drivers do that. Every handler runs to
//! completion before the next message is looked at.

use std::{collections::HashMap, sync::Arc};

use serde_json::json;
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, error, info, warn};
use url::Url;

use super::{
    IsolatedOptions, Shared,
    driver::{DriverContext, SocketCommand, run_socket},
};
use crate::{
    collab::{CredentialProvider, UrlResolver},
    config::ManagerConfig,
    error::{TransportError, TransportResult},
    events::{EventKind, TransportEvent},
    frame::{Frame, Inbound, Outbound},
    health::{HealthMonitor, is_stale},
    queue::{FlushStep, OutboundQueue},
    reconnect::{RetryPlan, Timers, plan_retry},
    socket::{CLOSE_NORMAL, Connector, SocketRequest},
    state::{ConnectionState, ConnectionStatus},
    types::{ConnectionId, SharedFeed},
};

/// Requests from manager handles.
#[derive(Debug)]
pub(crate) enum Command {
    /// A router was attached to a shared feed.
    EnsureShared(SharedFeed),
    /// The last router of a shared feed was detached.
    ReleaseShared(SharedFeed),
    /// Open (or reuse) an isolated connection.
    OpenIsolated {
        id: ConnectionId,
        options: IsolatedOptions,
    },
    /// Close an isolated connection and forget it.
    CloseIsolated(ConnectionId),
    /// Write or queue a message.
    Send {
        id: ConnectionId,
        payload: Outbound,
    },
    /// Manual reconnection.
    Reconnect(ConnectionId),
    /// Tear everything down.
    CloseAll,
}

/// Lifecycle of one socket, as seen by its driver.
#[derive(Debug)]
pub(crate) enum SocketEvent {
    Open,
    Message(Inbound),
    Error(String),
    Closed { code: u16, reason: String },
}

/// Internal wake-ups.
#[derive(Debug)]
pub(crate) enum Signal {
    Socket {
        id: ConnectionId,
        epoch: u64,
        event: SocketEvent,
    },
    RetryDue {
        id: ConnectionId,
        token: u64,
    },
    HealthTick {
        id: ConnectionId,
    },
}

struct LiveSocket {
    epoch: u64,
    open: bool,
    tx: mpsc::UnboundedSender<SocketCommand>,
}

pub(crate) struct ManagerActor {
    config: ManagerConfig,
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    resolver: Arc<dyn UrlResolver>,
    credentials: Arc<dyn CredentialProvider>,
    commands: mpsc::UnboundedReceiver<Command>,
    signal_tx: mpsc::UnboundedSender<Signal>,
    signal_rx: mpsc::UnboundedReceiver<Signal>,
    sockets: HashMap<ConnectionId, LiveSocket>,
    isolated: HashMap<ConnectionId, IsolatedOptions>,
    queue: OutboundQueue,
    timers: Timers,
    health: HealthMonitor,
    next_epoch: u64,
}

impl ManagerActor {
    pub(crate) fn new(
        config: ManagerConfig,
        shared: Arc<Shared>,
        connector: Arc<dyn Connector>,
        resolver: Arc<dyn UrlResolver>,
        credentials: Arc<dyn CredentialProvider>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        Self {
            queue: OutboundQueue::new(config.queue_capacity),
            health: HealthMonitor::new(config.health_check_interval),
            config,
            shared,
            connector,
            resolver,
            credentials,
            commands,
            signal_tx,
            signal_rx,
            sockets: HashMap::new(),
            isolated: HashMap::new(),
            timers: Timers::default(),
            next_epoch: 0,
        }
    }

    /// Run until every manager handle is dropped.
    pub(crate) async fn run(mut self) {
        info!("Connection manager started");

        loop {
            tokio::select! {
                biased;
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        info!("All manager handles dropped; shutting down");
                        self.close_all();
                        break;
                    }
                },
                Some(signal) = self.signal_rx.recv() => self.handle_signal(signal),
            }
        }

        info!("Connection manager stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::EnsureShared(feed) => self.ensure_shared(feed),
            Command::ReleaseShared(feed) => self.release_shared(feed),
            Command::OpenIsolated { id, options } => self.open_isolated(id, options),
            Command::CloseIsolated(id) => self.close_isolated(&id),
            Command::Send { id, payload } => self.send(&id, payload),
            Command::Reconnect(id) => self.reconnect(&id),
            Command::CloseAll => self.close_all(),
        }
    }

    fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::Socket { id, epoch, event } => {
                if self.sockets.get(&id).is_none_or(|s| s.epoch != epoch) {
                    debug!(connection_id = %id, epoch, "Ignoring event from superseded socket");
                    return;
                }
                match event {
                    SocketEvent::Open => self.on_open(&id),
                    SocketEvent::Message(inbound) => self.on_message(&id, inbound),
                    SocketEvent::Error(message) => self.on_error(&id, message),
                    SocketEvent::Closed { code, reason } => self.on_closed(&id, code, reason),
                }
            }
            Signal::RetryDue { id, token } => self.on_retry_due(&id, token),
            Signal::HealthTick { id } => self.on_health_tick(&id),
        }
    }

    fn emit(&self, event: TransportEvent) {
        self.shared.events.emit(event);
    }

    // ------------------------------------------------------------------
    // Connection creation
    // ------------------------------------------------------------------

    fn ensure_shared(&mut self, feed: SharedFeed) {
        let id = feed.connection_id();
        if self.shared.routes.subscriber_count(&id) == 0 {
            return;
        }
        if self.sockets.contains_key(&id) || self.timers.is_armed(&id) {
            debug!(connection_id = %id, "Reusing shared connection");
            return;
        }
        self.create(&id, true);
    }

    fn open_isolated(&mut self, id: ConnectionId, options: IsolatedOptions) {
        if self.sockets.contains_key(&id) || self.timers.is_armed(&id) {
            debug!(connection_id = %id, "Reusing isolated connection");
            return;
        }
        self.isolated.insert(id.clone(), options);
        self.create(&id, true);
    }

    fn is_long_lived(&self, id: &ConnectionId) -> bool {
        match id {
            ConnectionId::Shared(_) => true,
            ConnectionId::Isolated { kind, .. } => self
                .isolated
                .get(id)
                .and_then(|options| options.long_lived)
                .unwrap_or_else(|| kind.is_long_lived()),
        }
    }

    fn build_request(&self, id: &ConnectionId, endpoint: &str) -> TransportResult<SocketRequest> {
        let mut url = Url::parse(&self.resolver.resolve(endpoint))?;
        let mut protocols = Vec::new();

        if let Some(options) = self.isolated.get(id) {
            if !options.params.is_empty() {
                let mut query = url.query_pairs_mut();
                for (key, value) in &options.params {
                    query.append_pair(key, value);
                }
            }
            protocols.clone_from(&options.protocols);
        }

        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(TransportError::config(format!(
                    "Unsupported URL scheme '{other}' for {id}"
                )));
            }
        }

        Ok(SocketRequest {
            connection_id: id.clone(),
            url,
            protocols,
        })
    }

    /// Dial a fresh socket for `id`.
    ///
    /// `reset_attempts` is false only for timer-driven re-creation, so that
    /// backoff keeps growing across consecutive failures.
    fn create(&mut self, id: &ConnectionId, reset_attempts: bool) {
        if let Some(previous) = self.sockets.remove(id) {
            warn!(connection_id = %id, epoch = previous.epoch, "Replacing live socket");
            let _ = previous.tx.send(SocketCommand::Close {
                code: CLOSE_NORMAL,
                reason: "Superseded".to_string(),
            });
        }

        let endpoint = id.endpoint_path();
        let updated = self.shared.states.update(id, |state| {
            state.status = ConnectionStatus::Connecting;
            state.endpoint.clone_from(&endpoint);
            state.last_activity = Some(Instant::now());
            if reset_attempts {
                state.reconnect_attempts = 0;
                state.reconnect_exhausted = false;
            }
        });
        if !updated {
            self.shared
                .states
                .insert(id.clone(), ConnectionState::connecting(endpoint.clone()));
        }

        let policy = self.config.policies.for_connection(id);
        let request = self.build_request(id, &endpoint);

        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = DriverContext {
            id: id.clone(),
            epoch,
            connector: Arc::clone(&self.connector),
            connect_timeout: policy.connect_timeout_duration(),
            signals: self.signal_tx.clone(),
        };
        tokio::spawn(run_socket(ctx, request, rx));
        self.sockets.insert(
            id.clone(),
            LiveSocket {
                epoch,
                open: false,
                tx,
            },
        );

        info!(connection_id = %id, epoch, endpoint = %endpoint, "Connecting");

        if self.is_long_lived(id) && !self.health.is_monitored(id) {
            let signals = self.signal_tx.clone();
            let target = id.clone();
            self.health.start(id.clone(), move || {
                let _ = signals.send(Signal::HealthTick { id: target.clone() });
            });
        }
    }

    // ------------------------------------------------------------------
    // Socket lifecycle
    // ------------------------------------------------------------------

    fn write(&self, id: &ConnectionId, text: String) -> bool {
        self.sockets
            .get(id)
            .is_some_and(|socket| socket.open && socket.tx.send(SocketCommand::Send(text)).is_ok())
    }

    fn on_open(&mut self, id: &ConnectionId) {
        self.timers.disarm(id);
        let Some(socket) = self.sockets.get_mut(id) else {
            return;
        };
        socket.open = true;
        let epoch = socket.epoch;
        let tx = socket.tx.clone();

        self.shared.states.update(id, ConnectionState::mark_connected);
        info!(connection_id = %id, epoch, "WebSocket connected");

        if self.credentials.is_authenticated()
            && let Some(token) = self.credentials.token()
        {
            match Frame::auth(token).to_text() {
                Ok(text) => {
                    if self.write(id, text) {
                        debug!(connection_id = %id, "Auth frame sent");
                    }
                }
                Err(err) => warn!(connection_id = %id, error = %err, "Failed to encode auth frame"),
            }
        }

        let report = self.queue.flush(id, |payload| match payload.to_text() {
            Ok(text) => {
                if tx.send(SocketCommand::Send(text)).is_ok() {
                    FlushStep::Sent
                } else {
                    FlushStep::NotOpen
                }
            }
            Err(err) => FlushStep::Rejected(err),
        });

        self.emit(
            TransportEvent::new(EventKind::Connected, id.clone())
                .with_data(json!({ "flushed": report.sent, "queued": report.remaining })),
        );
    }

    fn on_message(&mut self, id: &ConnectionId, inbound: Inbound) {
        let frame = match inbound.decode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(connection_id = %id, error = %err, "Dropping malformed frame");
                return;
            }
        };

        self.shared.states.update(id, ConnectionState::record_message);

        let report = self.shared.routes.dispatch(id, &frame);
        if report.failed > 0 {
            debug!(
                connection_id = %id,
                delivered = report.delivered,
                failed = report.failed,
                "Dispatch finished with failures"
            );
        }

        let mut event = TransportEvent::new(EventKind::Message, id.clone());
        if let Ok(value) = frame.to_value() {
            event = event.with_data(value);
        }
        self.emit(event);
    }

    fn on_error(&mut self, id: &ConnectionId, message: String) {
        warn!(connection_id = %id, error = %message, "WebSocket error");
        self.shared
            .states
            .update(id, |state| state.mark_error(message.clone()));
        self.emit(TransportEvent::new(EventKind::Error, id.clone()).with_error(message));
    }

    fn on_closed(&mut self, id: &ConnectionId, code: u16, reason: String) {
        self.sockets.remove(id);
        self.shared
            .states
            .update(id, ConnectionState::mark_disconnected);
        info!(connection_id = %id, code, reason = %reason, "WebSocket closed");
        let mut event = TransportEvent::new(EventKind::Disconnected, id.clone())
            .with_data(json!({ "code": code, "reason": reason }));
        if code == CLOSE_NORMAL {
            self.emit(event);
            return;
        }

        event = event.with_error(TransportError::connection_closed(code, reason).to_string());
        self.emit(event);
        self.schedule_retry(id);
    }

    // ------------------------------------------------------------------
    // Reconnection
    // ------------------------------------------------------------------

    fn arm_retry(&mut self, id: &ConnectionId, delay: std::time::Duration) {
        let signals = self.signal_tx.clone();
        let target = id.clone();
        self.timers.arm(id.clone(), delay, move |token| {
            let _ = signals.send(Signal::RetryDue { id: target, token });
        });
    }

    fn schedule_retry(&mut self, id: &ConnectionId) {
        let Some(state) = self.shared.states.get(id) else {
            return;
        };
        let policy = self.config.policies.for_connection(id);

        match plan_retry(&state, &policy) {
            RetryPlan::Exhausted { attempts } => {
                self.shared
                    .states
                    .update(id, |state| state.reconnect_exhausted = true);
                self.health.stop(id);
                let err = TransportError::ReconnectExhausted { attempts };
                error!(connection_id = %id, attempts, "Reconnection attempts exhausted");
                self.emit(
                    TransportEvent::new(EventKind::ReconnectExhausted, id.clone())
                        .with_data(json!({ "attempts": attempts }))
                        .with_error(err.to_string()),
                );
            }
            RetryPlan::Retry { attempt, delay } => {
                self.shared.states.update(id, |state| {
                    state.reconnect_attempts = attempt;
                    state.status = ConnectionStatus::Reconnecting;
                });
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                debug!(connection_id = %id, attempt, delay_ms, "Scheduling reconnect");
                self.emit(
                    TransportEvent::new(EventKind::Reconnecting, id.clone())
                        .with_data(json!({ "attempt": attempt, "delayMs": delay_ms })),
                );
                self.arm_retry(id, delay);
            }
        }
    }

    fn on_retry_due(&mut self, id: &ConnectionId, token: u64) {
        if !self.timers.take_if_current(id, token) {
            debug!(connection_id = %id, token, "Ignoring superseded retry timer");
            return;
        }
        if !self.shared.states.contains(id) || self.sockets.contains_key(id) {
            return;
        }
        if id.is_shared() && self.shared.routes.subscriber_count(id) == 0 {
            debug!(connection_id = %id, "No subscribers left; not reconnecting");
            return;
        }
        self.create(id, false);
    }

    /// Tear down now and re-create after the grace delay, with a fresh
    /// attempt budget.
    fn reconnect(&mut self, id: &ConnectionId) {
        if !self.shared.states.contains(id) {
            debug!(connection_id = %id, "Reconnect requested for unknown connection");
            return;
        }

        self.timers.disarm(id);
        if self.close_socket(id, "Manual reconnection") {
            self.shared
                .states
                .update(id, ConnectionState::mark_disconnected);
            self.emit(
                TransportEvent::new(EventKind::Disconnected, id.clone())
                    .with_data(json!({ "code": CLOSE_NORMAL, "reason": "Manual reconnection" })),
            );
        }
        self.shared.states.update(id, |state| {
            state.reconnect_attempts = 0;
            state.reconnect_exhausted = false;
        });

        info!(connection_id = %id, grace_ms = self.config.reconnect_grace.as_millis(), "Manual reconnect");
        self.arm_retry(id, self.config.reconnect_grace);
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    fn on_health_tick(&mut self, id: &ConnectionId) {
        let Some(state) = self.shared.states.get(id) else {
            self.health.stop(id);
            return;
        };
        let Some(socket) = self.sockets.get(id) else {
            return;
        };

        if socket.open
            && let Ok(text) = Frame::ping().to_text()
        {
            self.write(id, text);
        }

        let threshold = self.config.staleness_threshold;
        if is_stale(state.last_activity, Instant::now(), threshold) && !self.timers.is_armed(id) {
            warn!(
                connection_id = %id,
                threshold_ms = threshold.as_millis(),
                "No activity within staleness window; forcing reconnect"
            );
            self.reconnect(id);
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    fn send(&mut self, id: &ConnectionId, payload: Outbound) {
        if !id.is_shared() && !self.shared.states.contains(id) {
            warn!(connection_id = %id, "Dropping message for closed isolated connection");
            let err =
                TransportError::connection_closed(CLOSE_NORMAL, "Connection closed by client");
            self.emit(
                TransportEvent::new(EventKind::Error, id.clone()).with_error(err.to_string()),
            );
            return;
        }

        if self.sockets.get(id).is_some_and(|socket| socket.open) {
            match payload.to_text() {
                Ok(text) => {
                    if self.write(id, text) {
                        return;
                    }
                }
                Err(err) => {
                    warn!(connection_id = %id, error = %err, "Dropping unserializable message");
                    self.emit(
                        TransportEvent::new(EventKind::Error, id.clone())
                            .with_error(err.to_string()),
                    );
                    return;
                }
            }
        }

        if let Some(evicted) = self.queue.enqueue(id, payload) {
            let capacity = self.queue.capacity();
            let err = TransportError::QueueOverflow {
                connection_id: id.to_string(),
                capacity,
            };
            self.emit(
                TransportEvent::new(EventKind::QueueFull, id.clone())
                    .with_data(json!({
                        "capacity": capacity,
                        "droppedEnqueuedAt": evicted.enqueued_at,
                    }))
                    .with_error(err.to_string()),
            );
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Ask the driver to close with a normal code. Returns true if a socket
    /// existed.
    fn close_socket(&mut self, id: &ConnectionId, reason: &str) -> bool {
        match self.sockets.remove(id) {
            Some(socket) => {
                let _ = socket.tx.send(SocketCommand::Close {
                    code: CLOSE_NORMAL,
                    reason: reason.to_string(),
                });
                true
            }
            None => false,
        }
    }

    fn release_shared(&mut self, feed: SharedFeed) {
        let id = feed.connection_id();
        if self.shared.routes.subscriber_count(&id) > 0 {
            return;
        }

        self.timers.disarm(&id);
        self.health.stop(&id);
        let had_socket = self.close_socket(&id, "No subscribers");
        self.queue.remove(&id);

        let was_disconnected = self
            .shared
            .states
            .get(&id)
            .is_none_or(|state| state.status == ConnectionStatus::Disconnected);
        self.shared
            .states
            .update(&id, ConnectionState::mark_disconnected);

        info!(connection_id = %id, "Last subscriber left; shared connection closed");
        if had_socket || !was_disconnected {
            self.emit(
                TransportEvent::new(EventKind::Disconnected, id)
                    .with_data(json!({ "code": CLOSE_NORMAL, "reason": "No subscribers" })),
            );
        }
    }

    fn close_isolated(&mut self, id: &ConnectionId) {
        self.timers.disarm(id);
        self.health.stop(id);
        self.close_socket(id, "Connection closed by client");
        self.queue.remove(id);
        self.shared.routes.remove(id);
        self.isolated.remove(id);

        if self.shared.states.remove(id).is_some() {
            info!(connection_id = %id, "Isolated connection closed");
            self.emit(
                TransportEvent::new(EventKind::Disconnected, id.clone()).with_data(
                    json!({ "code": CLOSE_NORMAL, "reason": "Connection closed by client" }),
                ),
            );
        }
    }

    fn close_all(&mut self) {
        self.timers.clear();
        self.health.clear();

        let sockets: Vec<ConnectionId> = self.sockets.keys().cloned().collect();
        for id in &sockets {
            self.close_socket(id, "Session closed");
        }

        self.queue.clear();
        self.shared.routes.clear();
        self.isolated.clear();

        let mut closed = Vec::new();
        for (id, state) in self.shared.states.snapshot() {
            if state.status != ConnectionStatus::Disconnected {
                closed.push(id.clone());
            }
            if id.is_shared() {
                self.shared
                    .states
                    .update(&id, ConnectionState::mark_disconnected);
            } else {
                self.shared.states.remove(&id);
            }
        }

        info!(sockets = sockets.len(), connections = closed.len(), "All connections closed");
        for id in closed {
            self.emit(
                TransportEvent::new(EventKind::Disconnected, id)
                    .with_data(json!({ "code": CLOSE_NORMAL, "reason": "Session closed" })),
            );
        }
    }
}
