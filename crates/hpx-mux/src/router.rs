//! Message routers and the per-connection router table.
//!
//! Each connection id owns an unordered set of independent [`Router`]s.
//! Dispatch runs every matching router; a router that returns an error or
//! panics is reported to its own error callback and never stops its
//! siblings.

use std::{
    any::Any,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::warn;

use crate::{
    error::{TransportError, TransportResult},
    frame::Frame,
    types::ConnectionId,
};

type HandlerFn = dyn Fn(&Frame) -> TransportResult<()> + Send + Sync;
type PredicateFn = dyn Fn(&Frame) -> bool + Send + Sync;
type ErrorFn = dyn Fn(&TransportError) + Send + Sync;

/// Which frame types a router accepts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum TypeFilter {
    /// Every frame.
    #[default]
    Any,
    /// Exactly one type.
    One(String),
    /// Any of several types.
    Many(Vec<String>),
}

impl TypeFilter {
    /// Returns true if `kind` passes the filter.
    pub fn matches(&self, kind: &str) -> bool {
        match self {
            Self::Any => true,
            Self::One(expected) => expected == kind,
            Self::Many(expected) => expected.iter().any(|t| t == kind),
        }
    }
}

/// An independent subscriber over inbound frames.
#[derive(Clone)]
pub struct Router {
    route_id: String,
    filter: TypeFilter,
    predicate: Option<Arc<PredicateFn>>,
    handler: Arc<HandlerFn>,
    on_error: Option<Arc<ErrorFn>>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("route_id", &self.route_id)
            .field("filter", &self.filter)
            .field("has_predicate", &self.predicate.is_some())
            .field("has_error_handler", &self.on_error.is_some())
            .finish()
    }
}

impl Router {
    /// Router that passes every frame to `handler`.
    pub fn new<F>(route_id: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Frame) -> TransportResult<()> + Send + Sync + 'static,
    {
        Self {
            route_id: route_id.into(),
            filter: TypeFilter::Any,
            predicate: None,
            handler: Arc::new(handler),
            on_error: None,
        }
    }

    /// Router with a generated route id.
    pub fn anonymous<F>(handler: F) -> Self
    where
        F: Fn(&Frame) -> TransportResult<()> + Send + Sync + 'static,
    {
        Self::new(ulid::Ulid::new().to_string(), handler)
    }

    /// Accept only frames of this type.
    #[must_use]
    pub fn message_type(mut self, kind: impl Into<String>) -> Self {
        self.filter = TypeFilter::One(kind.into());
        self
    }

    /// Accept only frames of these types.
    #[must_use]
    pub fn message_types<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.filter = TypeFilter::Many(kinds.into_iter().map(Into::into).collect());
        self
    }

    /// Additional predicate applied after the type filter.
    #[must_use]
    pub fn filter<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&Frame) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Callback for handler failures.
    #[must_use]
    pub fn on_error<E>(mut self, on_error: E) -> Self
    where
        E: Fn(&TransportError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    /// Route identifier.
    pub fn route_id(&self) -> &str {
        &self.route_id
    }

    /// Type filter.
    pub fn type_filter(&self) -> &TypeFilter {
        &self.filter
    }

    /// Returns true if the frame passes the type filter and predicate.
    pub fn accepts(&self, frame: &Frame) -> bool {
        if !self.filter.matches(frame.kind()) {
            return false;
        }
        match &self.predicate {
            Some(predicate) => guarded(|| predicate(frame)).unwrap_or(false),
            None => true,
        }
    }

    /// Run the handler, catching errors and panics.
    fn deliver(&self, frame: &Frame) -> Result<(), TransportError> {
        match guarded(|| (self.handler)(frame)) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(panic) => Err(TransportError::handler(&self.route_id, panic)),
        }
    }

    fn report(&self, err: &TransportError) {
        if let Some(on_error) = &self.on_error
            && let Err(panic) = guarded(|| on_error(err))
        {
            warn!(route_id = %self.route_id, panic = %panic, "Router error callback panicked");
        }
    }
}

fn guarded<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_message(payload.as_ref()))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Key identifying one attached router, used for detaching.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RouteKey(u64);

/// Outcome counters for one dispatch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Routers whose handler completed.
    pub delivered: usize,
    /// Routers filtered out.
    pub skipped: usize,
    /// Routers whose handler failed.
    pub failed: usize,
}

struct RouteSet {
    routers: Vec<(RouteKey, Arc<Router>)>,
    subscriber_count: usize,
}

/// Router sets keyed by connection id.
///
/// `subscriber_count` is tracked explicitly alongside each set and always
/// equals the set size.
pub struct RouterTable {
    routes: scc::HashMap<ConnectionId, RouteSet>,
    next_key: AtomicU64,
}

impl Default for RouterTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouterTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            routes: scc::HashMap::new(),
            next_key: AtomicU64::new(1),
        }
    }

    /// Attach a router. Returns its key and whether it is the first router
    /// for the id.
    pub fn attach(&self, id: &ConnectionId, router: Router) -> (RouteKey, bool) {
        let key = RouteKey(self.next_key.fetch_add(1, Ordering::Relaxed));
        let router = Arc::new(router);

        let existing = self.routes.update_sync(id, |_, set| {
            set.routers.push((key, Arc::clone(&router)));
            set.subscriber_count += 1;
            set.subscriber_count
        });
        if let Some(count) = existing {
            return (key, count == 1);
        }

        let set = RouteSet {
            routers: vec![(key, Arc::clone(&router))],
            subscriber_count: 1,
        };
        if let Err((_, _set)) = self.routes.insert_sync(id.clone(), set) {
            // Another thread inserted first.
            let count = self.routes.update_sync(id, |_, set| {
                set.routers.push((key, Arc::clone(&router)));
                set.subscriber_count += 1;
                set.subscriber_count
            });
            return (key, count == Some(1));
        }

        (key, true)
    }

    /// Detach a router. Returns the remaining count, or `None` if the router
    /// was not attached.
    pub fn detach(&self, id: &ConnectionId, key: RouteKey) -> Option<usize> {
        let remaining = self.routes.update_sync(id, |_, set| {
            let before = set.routers.len();
            set.routers.retain(|(k, _)| *k != key);
            if set.routers.len() == before {
                return None;
            }
            set.subscriber_count = set.subscriber_count.saturating_sub(1);
            Some(set.subscriber_count)
        })??;

        if remaining == 0 {
            let _ = self
                .routes
                .remove_if_sync(id, |set| set.subscriber_count == 0);
        }
        Some(remaining)
    }

    /// Snapshot of the routers for an id.
    pub fn routers(&self, id: &ConnectionId) -> Vec<Arc<Router>> {
        self.routes
            .update_sync(id, |_, set| {
                set.routers
                    .iter()
                    .map(|(_, router)| Arc::clone(router))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Explicit subscriber count for an id.
    pub fn subscriber_count(&self, id: &ConnectionId) -> usize {
        self.routes
            .update_sync(id, |_, set| set.subscriber_count)
            .unwrap_or(0)
    }

    /// Number of routers in the set for an id.
    pub fn router_count(&self, id: &ConnectionId) -> usize {
        self.routes
            .update_sync(id, |_, set| set.routers.len())
            .unwrap_or(0)
    }

    /// Drop every router for an id.
    pub fn remove(&self, id: &ConnectionId) -> usize {
        self.routes
            .remove_sync(id)
            .map_or(0, |(_, set)| set.routers.len())
    }

    /// Drop every router.
    pub fn clear(&self) {
        self.routes.clear_sync();
    }

    /// Number of ids with routers.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Deliver a frame to every matching router of `id`.
    ///
    /// Handlers run outside the table lock, so they may attach or detach
    /// routers themselves.
    pub fn dispatch(&self, id: &ConnectionId, frame: &Frame) -> DispatchReport {
        let mut report = DispatchReport::default();

        for router in self.routers(id) {
            if !router.accepts(frame) {
                report.skipped += 1;
                continue;
            }
            match router.deliver(frame) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        connection_id = %id,
                        route_id = %router.route_id(),
                        error = %err,
                        "Router handler failed"
                    );
                    router.report(&err);
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Mutex, atomic::AtomicUsize};

    use serde_json::json;

    use super::*;
    use crate::types::SharedFeed;

    fn frame(kind: &str) -> Frame {
        Frame::opaque(kind, json!({"n": 1}))
    }

    fn counting_router(route_id: &str, counter: &Arc<AtomicUsize>) -> Router {
        let counter = Arc::clone(counter);
        Router::new(route_id, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_type_filter() {
        assert!(TypeFilter::Any.matches("anything"));
        assert!(TypeFilter::One("event".into()).matches("event"));
        assert!(!TypeFilter::One("event".into()).matches("data"));
        let many = TypeFilter::Many(vec!["output".into(), "exit".into()]);
        assert!(many.matches("exit"));
        assert!(!many.matches("input"));
    }

    #[test]
    fn test_attach_and_detach_track_count() {
        let table = RouterTable::new();
        let id = SharedFeed::Metrics.connection_id();
        let counter = Arc::new(AtomicUsize::new(0));

        let (a, first) = table.attach(&id, counting_router("a", &counter));
        assert!(first);
        let (b, first) = table.attach(&id, counting_router("b", &counter));
        assert!(!first);
        assert_eq!(table.subscriber_count(&id), 2);
        assert_eq!(table.router_count(&id), table.subscriber_count(&id));

        assert_eq!(table.detach(&id, a), Some(1));
        assert_eq!(table.router_count(&id), table.subscriber_count(&id));
        assert_eq!(table.detach(&id, a), None);
        assert_eq!(table.detach(&id, b), Some(0));
        assert!(table.is_empty());
    }

    #[test]
    fn test_anonymous_routers_get_distinct_ids() {
        let table = RouterTable::new();
        let id = SharedFeed::Notifications.connection_id();
        let counter = Arc::new(AtomicUsize::new(0));

        let make = |counter: &Arc<AtomicUsize>| {
            let counter = Arc::clone(counter);
            Router::anonymous(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        let first = make(&counter);
        let second = make(&counter);
        assert_eq!(first.route_id().len(), 26);
        assert!(first.route_id().parse::<ulid::Ulid>().is_ok());
        assert_ne!(first.route_id(), second.route_id());

        table.attach(&id, first);
        table.attach(&id, second);
        let report = table.dispatch(&id, &frame("notification"));
        assert_eq!(report.delivered, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dispatch_respects_filters() {
        let table = RouterTable::new();
        let id = SharedFeed::Events.connection_id();
        let events = Arc::new(AtomicUsize::new(0));
        let everything = Arc::new(AtomicUsize::new(0));
        let filtered = Arc::new(AtomicUsize::new(0));

        table.attach(&id, counting_router("events", &events).message_type("event"));
        table.attach(&id, counting_router("all", &everything));
        table.attach(
            &id,
            counting_router("pred", &filtered)
                .message_types(["event", "data"])
                .filter(|f| f.payload()["n"] == json!(2)),
        );

        let report = table.dispatch(&id, &frame("event"));
        assert_eq!(report.delivered, 2);
        assert_eq!(report.skipped, 1);

        table.dispatch(&id, &frame("data"));
        table.dispatch(&id, &Frame::opaque("data", json!({"n": 2})));

        assert_eq!(events.load(Ordering::SeqCst), 1);
        assert_eq!(everything.load(Ordering::SeqCst), 3);
        assert_eq!(filtered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failing_router_does_not_block_siblings() {
        let table = RouterTable::new();
        let id = SharedFeed::Metrics.connection_id();
        let good = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&errors);
        table.attach(
            &id,
            Router::new("erroring", |_| Err(TransportError::internal("nope"))).on_error(
                move |err| {
                    seen.lock().unwrap().push(err.to_string());
                },
            ),
        );
        table.attach(&id, Router::new("panicking", |_| panic!("boom")));
        table.attach(&id, counting_router("good", &good));

        for _ in 0..3 {
            let report = table.dispatch(&id, &frame("data"));
            assert_eq!(report.delivered, 1);
            assert_eq!(report.failed, 2);
        }

        assert_eq!(good.load(Ordering::SeqCst), 3);
        assert_eq!(errors.lock().unwrap().len(), 3);
        assert_eq!(errors.lock().unwrap()[0], "Internal error: nope");
    }

    #[test]
    fn test_panic_reported_as_handler_error() {
        let table = RouterTable::new();
        let id = SharedFeed::Metrics.connection_id();
        let errors = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&errors);
        table.attach(
            &id,
            Router::new("panicking", |_| panic!("boom")).on_error(move |err| {
                seen.lock().unwrap().push(err.to_string());
            }),
        );

        table.dispatch(&id, &frame("data"));
        assert_eq!(
            errors.lock().unwrap().as_slice(),
            ["Router 'panicking' failed: boom".to_string()]
        );
    }

    #[test]
    fn test_dispatch_unknown_id_is_empty() {
        let table = RouterTable::new();
        let report = table.dispatch(&SharedFeed::Notifications.connection_id(), &frame("x"));
        assert_eq!(report, DispatchReport::default());
    }

    #[test]
    fn test_handler_may_detach_itself() {
        let table = Arc::new(RouterTable::new());
        let id = SharedFeed::Events.connection_id();
        let key_slot: Arc<Mutex<Option<RouteKey>>> = Arc::new(Mutex::new(None));

        let table_in = Arc::clone(&table);
        let slot = Arc::clone(&key_slot);
        let id_in = id.clone();
        let (key, _) = table.attach(
            &id,
            Router::new("once", move |_| {
                if let Some(key) = slot.lock().unwrap().take() {
                    table_in.detach(&id_in, key);
                }
                Ok(())
            }),
        );
        *key_slot.lock().unwrap() = Some(key);

        table.dispatch(&id, &frame("event"));
        assert_eq!(table.subscriber_count(&id), 0);
    }
}
