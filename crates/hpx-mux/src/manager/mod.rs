//! The connection manager handle.
//!
//! [`ConnectionManager`] is a cheap, cloneable handle. Every call either
//! touches the shared router table and state store synchronously or posts a
//! command to the background actor and returns immediately; nothing waits
//! on the network. When the last handle is dropped the actor closes every
//! socket and exits.

mod actor;
mod driver;

use std::{
    fmt,
    sync::{Arc, Weak},
};

use tokio::sync::{broadcast, mpsc, watch};
use tracing::debug;

use self::actor::{Command, ManagerActor};
use crate::{
    collab::{CredentialProvider, UrlResolver},
    config::ManagerConfig,
    error::{TransportError, TransportResult},
    events::{EventBus, EventKind, ListenerGuard, TransportEvent},
    frame::Outbound,
    router::{RouteKey, Router, RouterTable},
    socket::{Connector, TungsteniteConnector},
    state::{ConnectionHealthSummary, ConnectionState, ConnectionStateStore},
    types::{ConnectionId, IsolatedKind, SharedFeed},
};

/// Structures readable from any handle.
pub(crate) struct Shared {
    pub(crate) routes: RouterTable,
    pub(crate) states: ConnectionStateStore,
    pub(crate) events: EventBus,
}

struct Inner {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Inner {
    fn command(&self, cmd: Command) {
        if let Err(err) = self.commands.send(cmd) {
            debug!(command = ?err.0, "Manager stopped; command dropped");
        }
    }
}

/// Options for [`ConnectionManager::open_isolated`].
#[derive(Clone, Debug, Default)]
pub struct IsolatedOptions {
    /// Extra query parameters appended to the endpoint URL.
    pub params: Vec<(String, String)>,
    /// Sub-protocols offered during the handshake.
    pub protocols: Vec<String>,
    /// Override whether the connection is health-monitored.
    pub long_lived: Option<bool>,
}

impl IsolatedOptions {
    /// Options with nothing set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a query parameter.
    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Offer a sub-protocol.
    #[must_use]
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocols.push(protocol.into());
        self
    }

    /// Force health monitoring on or off.
    #[must_use]
    pub fn long_lived(mut self, long_lived: bool) -> Self {
        self.long_lived = Some(long_lived);
        self
    }
}

/// Multiplexes shared feeds and isolated sessions over WebSocket
/// connections.
///
/// # Example
///
/// ```no_run
/// use hpx_mux::{BaseUrl, ConnectionManager, ManagerConfig, Router, SharedFeed, StaticToken};
///
/// # async fn run() -> hpx_mux::TransportResult<()> {
/// let manager = ConnectionManager::new(
///     ManagerConfig::default(),
///     BaseUrl::new("wss://console.example"),
///     StaticToken::new("token"),
/// )?;
///
/// let _metrics = manager.subscribe_shared(
///     SharedFeed::Metrics,
///     Router::new("dashboard", |frame| {
///         println!("{}", frame.payload());
///         Ok(())
///     })
///     .message_type("data"),
/// );
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connections", &self.inner.shared.states.len())
            .field("routes", &self.inner.shared.routes.len())
            .finish()
    }
}

impl ConnectionManager {
    /// Create a manager that dials with `tokio-tungstenite`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<R, C>(config: ManagerConfig, resolver: R, credentials: C) -> TransportResult<Self>
    where
        R: UrlResolver,
        C: CredentialProvider,
    {
        Self::with_connector(config, resolver, credentials, TungsteniteConnector)
    }

    /// Create a manager with a custom [`Connector`].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_connector<R, C, K>(
        config: ManagerConfig,
        resolver: R,
        credentials: C,
        connector: K,
    ) -> TransportResult<Self>
    where
        R: UrlResolver,
        C: CredentialProvider,
        K: Connector,
    {
        config.validate().map_err(TransportError::config)?;

        let shared = Arc::new(Shared {
            routes: RouterTable::new(),
            states: ConnectionStateStore::new(),
            events: EventBus::new(config.event_channel_capacity),
        });
        let (commands, rx) = mpsc::unbounded_channel();

        let actor = ManagerActor::new(
            config,
            Arc::clone(&shared),
            Arc::new(connector),
            Arc::new(resolver),
            Arc::new(credentials),
            rx,
        );
        tokio::spawn(actor.run());

        Ok(Self {
            inner: Arc::new(Inner { shared, commands }),
        })
    }

    /// A handle that does not keep the manager alive.
    pub fn downgrade(&self) -> WeakConnectionManager {
        WeakConnectionManager {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Attach a router to a shared feed, opening the feed's socket if none
    /// is live or pending.
    ///
    /// Dropping the returned guard detaches the router; when the feed has no
    /// routers left its socket is closed normally and never retried.
    pub fn subscribe_shared(&self, feed: SharedFeed, router: Router) -> Subscription {
        let id = feed.connection_id();
        let route_id = router.route_id().to_string();
        let (key, first) = self.inner.shared.routes.attach(&id, router);
        debug!(connection_id = %id, route_id = %route_id, first, "Router attached");

        self.inner.command(Command::EnsureShared(feed));
        Subscription::new(id, key, Arc::downgrade(&self.inner))
    }

    /// Open a per-session connection, or reuse the live one for the same
    /// kind and instance.
    ///
    /// The connection stays open until [`Self::close_isolated`] (or
    /// [`IsolatedConnection::close`]) is called.
    pub fn open_isolated(
        &self,
        kind: IsolatedKind,
        instance: impl Into<String>,
        options: IsolatedOptions,
    ) -> IsolatedConnection {
        let id = ConnectionId::isolated(kind, instance);
        self.inner.command(Command::OpenIsolated {
            id: id.clone(),
            options,
        });
        IsolatedConnection {
            id,
            manager: self.downgrade(),
        }
    }

    /// Close a per-session connection and forget everything about it.
    pub fn close_isolated(&self, kind: IsolatedKind, instance: &str) {
        self.inner
            .command(Command::CloseIsolated(ConnectionId::isolated(kind, instance)));
    }

    /// Attach a router to any connection id.
    ///
    /// Unlike [`Self::subscribe_shared`] this never opens or closes sockets.
    pub fn route(&self, id: &ConnectionId, router: Router) -> Subscription {
        let (key, _) = self.inner.shared.routes.attach(id, router);
        Subscription::new(id.clone(), key, Arc::downgrade(&self.inner))
    }

    /// Write a message now if the socket is open, otherwise queue it.
    pub fn send(&self, id: &ConnectionId, message: impl Into<Outbound>) {
        self.inner.command(Command::Send {
            id: id.clone(),
            payload: message.into(),
        });
    }

    /// Close the socket for `id` and re-create it after a short grace
    /// delay, with a fresh retry budget.
    pub fn reconnect(&self, id: &ConnectionId) {
        self.inner.command(Command::Reconnect(id.clone()));
    }

    /// Close every connection, cancel every timer, and drop all routers and
    /// queued messages.
    pub fn close_all(&self) {
        self.inner.command(Command::CloseAll);
    }

    // ------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------

    /// Call `listener` for every event of `kind`.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerGuard
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.inner.shared.events.on(kind, listener)
    }

    /// Call `listener` for every event.
    pub fn on_any<F>(&self, listener: F) -> ListenerGuard
    where
        F: Fn(&TransportEvent) + Send + Sync + 'static,
    {
        self.inner.shared.events.on_any(listener)
    }

    /// Async stream of every event from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.shared.events.subscribe()
    }

    /// Snapshot of one connection's state.
    pub fn connection_state(&self, id: &ConnectionId) -> Option<ConnectionState> {
        self.inner.shared.states.get(id)
    }

    /// Snapshot of every connection's state.
    pub fn connection_states(&self) -> Vec<(ConnectionId, ConnectionState)> {
        self.inner.shared.states.snapshot()
    }

    /// Current health summary.
    pub fn health(&self) -> ConnectionHealthSummary {
        self.inner.shared.states.summary()
    }

    /// Receiver notified on every health summary change.
    pub fn watch_health(&self) -> watch::Receiver<ConnectionHealthSummary> {
        self.inner.shared.states.watch()
    }

    /// Routers attached to `id`.
    pub fn subscriber_count(&self, id: &ConnectionId) -> usize {
        self.inner.shared.routes.subscriber_count(id)
    }

    /// Routers attached to `id`, counted from the router set itself.
    pub fn router_count(&self, id: &ConnectionId) -> usize {
        self.inner.shared.routes.router_count(id)
    }
}

/// Non-owning manager handle.
#[derive(Clone, Debug, Default)]
pub struct WeakConnectionManager {
    inner: Weak<Inner>,
}

impl WeakConnectionManager {
    /// Upgrade if the manager is still alive.
    pub fn upgrade(&self) -> Option<ConnectionManager> {
        self.inner.upgrade().map(|inner| ConnectionManager { inner })
    }
}

/// An attached router. Dropping it detaches the router.
#[must_use = "dropping the subscription detaches the router immediately"]
pub struct Subscription {
    id: ConnectionId,
    key: RouteKey,
    manager: Weak<Inner>,
    active: bool,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}

impl Subscription {
    fn new(id: ConnectionId, key: RouteKey, manager: Weak<Inner>) -> Self {
        Self {
            id,
            key,
            manager,
            active: true,
        }
    }

    /// Connection this router is attached to.
    pub fn connection_id(&self) -> &ConnectionId {
        &self.id
    }

    /// Detach the router now.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;

        let Some(inner) = self.manager.upgrade() else {
            return;
        };
        let remaining = inner.shared.routes.detach(&self.id, self.key);
        debug!(connection_id = %self.id, remaining = ?remaining, "Router detached");

        if remaining == Some(0)
            && let Some(feed) = self.id.shared_feed()
        {
            inner.command(Command::ReleaseShared(feed));
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

/// Handle to one isolated connection.
///
/// Holds the manager weakly; calls after the manager is gone are no-ops.
#[derive(Clone, Debug)]
pub struct IsolatedConnection {
    id: ConnectionId,
    manager: WeakConnectionManager,
}

impl IsolatedConnection {
    /// Connection id.
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Write now or queue.
    pub fn send(&self, message: impl Into<Outbound>) {
        if let Some(manager) = self.manager.upgrade() {
            manager.send(&self.id, message);
        }
    }

    /// Attach a router to this connection.
    pub fn route(&self, router: Router) -> Option<Subscription> {
        self.manager
            .upgrade()
            .map(|manager| manager.route(&self.id, router))
    }

    /// Current state.
    pub fn state(&self) -> Option<ConnectionState> {
        self.manager
            .upgrade()
            .and_then(|manager| manager.connection_state(&self.id))
    }

    /// Manual reconnection.
    pub fn reconnect(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.reconnect(&self.id);
        }
    }

    /// Close and forget the connection.
    pub fn close(self) {
        if let (Some(manager), ConnectionId::Isolated { kind, instance }) =
            (self.manager.upgrade(), &self.id)
        {
            manager.close_isolated(*kind, instance);
        }
    }
}
