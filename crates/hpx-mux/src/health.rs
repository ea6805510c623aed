//! Periodic liveness pings for long-lived connections.
//!
//! The monitor only owns the recurring ticks. Each tick calls back into the
//! manager, which sends the `ping` and applies [`is_stale`].

use std::{collections::HashMap, time::Duration};

use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::debug;

use crate::types::ConnectionId;

/// Default ping period.
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Default silence tolerated before a connection counts as stale.
pub const DEFAULT_STALENESS_THRESHOLD: Duration = Duration::from_secs(60);

/// Returns true if no activity was observed within `threshold` of `now`.
///
/// A connection that has never seen activity is stale.
pub fn is_stale(last_activity: Option<Instant>, now: Instant, threshold: Duration) -> bool {
    match last_activity {
        Some(at) => now.saturating_duration_since(at) > threshold,
        None => true,
    }
}

/// Recurring tick tasks, one per monitored connection.
#[derive(Debug)]
pub struct HealthMonitor {
    period: Duration,
    tasks: HashMap<ConnectionId, JoinHandle<()>>,
}

impl HealthMonitor {
    /// Create a monitor that ticks every `period`.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            tasks: HashMap::new(),
        }
    }

    /// Tick period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Start ticking for `id`. Any existing ticker for the id is replaced.
    ///
    /// The first tick fires one full period from now.
    pub fn start<F>(&mut self, id: ConnectionId, on_tick: F)
    where
        F: Fn() + Send + 'static,
    {
        self.stop(&id);

        let period = self.period;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                on_tick();
            }
        });

        debug!(connection_id = %id, period_ms = period.as_millis(), "Health monitoring started");
        self.tasks.insert(id, handle);
    }

    /// Stop ticking for `id`.
    pub fn stop(&mut self, id: &ConnectionId) -> bool {
        match self.tasks.remove(id) {
            Some(handle) => {
                handle.abort();
                debug!(connection_id = %id, "Health monitoring stopped");
                true
            }
            None => false,
        }
    }

    /// Returns true if `id` has a ticker.
    pub fn is_monitored(&self, id: &ConnectionId) -> bool {
        self.tasks.contains_key(id)
    }

    /// Number of monitored connections.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Check if nothing is monitored.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Stop every ticker.
    pub fn clear(&mut self) {
        for (_, handle) in self.tasks.drain() {
            handle.abort();
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_HEALTH_CHECK_INTERVAL)
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.clear();
    }
}
