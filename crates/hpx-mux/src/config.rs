//! Connection manager configuration.

use std::time::Duration;

use crate::{
    health::{DEFAULT_HEALTH_CHECK_INTERVAL, DEFAULT_STALENESS_THRESHOLD},
    queue::DEFAULT_QUEUE_CAPACITY,
    reconnect::{ReconnectPolicies, ReconnectPolicy},
};

/// Configuration for a [`crate::ConnectionManager`].
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    // Buffering
    /// Messages buffered per connection while its socket is not open.
    pub queue_capacity: usize,

    // Health monitoring
    /// Period of the liveness ping on long-lived connections.
    pub health_check_interval: Duration,
    /// Silence tolerated before a connection is forcibly reconnected.
    pub staleness_threshold: Duration,

    // Reconnection
    /// Pause between tearing down and re-creating on manual reconnect.
    pub reconnect_grace: Duration,
    /// Backoff policies keyed by connection type.
    pub policies: ReconnectPolicies,

    // Channels
    /// Buffer of the broadcast event channel.
    pub event_channel_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            staleness_threshold: DEFAULT_STALENESS_THRESHOLD,
            reconnect_grace: Duration::from_millis(100),
            policies: ReconnectPolicies::default(),
            event_channel_capacity: 256,
        }
    }
}

impl ManagerConfig {
    /// Configuration with every default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-connection queue capacity.
    #[must_use]
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the health ping period.
    #[must_use]
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Set the staleness threshold.
    #[must_use]
    pub fn staleness_threshold(mut self, threshold: Duration) -> Self {
        self.staleness_threshold = threshold;
        self
    }

    /// Set the manual reconnect grace delay.
    #[must_use]
    pub fn reconnect_grace(mut self, grace: Duration) -> Self {
        self.reconnect_grace = grace;
        self
    }

    /// Replace the whole policy registry.
    #[must_use]
    pub fn policies(mut self, policies: ReconnectPolicies) -> Self {
        self.policies = policies;
        self
    }

    /// Register or replace one named policy.
    #[must_use]
    pub fn policy(mut self, name: impl Into<String>, policy: ReconnectPolicy) -> Self {
        self.policies = self.policies.with_policy(name, policy);
        self
    }

    /// Set the broadcast event buffer.
    #[must_use]
    pub fn event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.queue_capacity == 0 {
            return Err("Queue capacity must be > 0".to_string());
        }
        if self.health_check_interval.is_zero() {
            return Err("Health check interval must be > 0".to_string());
        }
        if self.staleness_threshold.is_zero() {
            return Err("Staleness threshold must be > 0".to_string());
        }
        if self.event_channel_capacity == 0 {
            return Err("Event channel capacity must be > 0".to_string());
        }
        self.policies.validate()
    }
}
