//! Reconnect policies, backoff maths and one-shot retry timers.

use std::{collections::HashMap, sync::Arc, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::{state::ConnectionState, types::ConnectionId};

/// Name of the fallback policy.
pub const DEFAULT_POLICY: &str = "default";

/// Retry behaviour for one connection type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPolicy {
    /// Maximum scheduled retries (None = unbounded).
    pub max_attempts: Option<u32>,
    /// Delay before the first retry.
    pub initial_delay_ms: u64,
    /// Upper bound for any single delay.
    pub max_delay_ms: u64,
    /// Growth factor per attempt.
    pub backoff_multiplier: f64,
    /// Scale each delay by a random factor in `[0.5, 1.0]`.
    pub use_jitter: bool,
    /// Socket handshake timeout.
    pub connect_timeout_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(10),
            initial_delay_ms: 2_000,
            max_delay_ms: 20_000,
            backoff_multiplier: 1.5,
            use_jitter: true,
            connect_timeout_ms: 10_000,
        }
    }
}

impl ReconnectPolicy {
    /// Policy for the metrics feed: retries forever.
    pub fn metrics() -> Self {
        Self {
            max_attempts: None,
            initial_delay_ms: 3_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 1.5,
            use_jitter: true,
            connect_timeout_ms: 10_000,
        }
    }

    /// Policy for terminals: few, quick retries without jitter.
    pub fn terminal() -> Self {
        Self {
            max_attempts: Some(5),
            initial_delay_ms: 1_000,
            max_delay_ms: 5_000,
            backoff_multiplier: 1.2,
            use_jitter: false,
            connect_timeout_ms: 5_000,
        }
    }

    /// Set the maximum attempts.
    #[must_use]
    pub fn max_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the initial delay.
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = duration_ms(delay);
        self
    }

    /// Set the maximum delay.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = duration_ms(delay);
        self
    }

    /// Set the backoff multiplier.
    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.use_jitter = enabled;
        self
    }

    /// Set the handshake timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = duration_ms(timeout);
        self
    }

    /// Handshake timeout as a duration.
    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Returns true if `attempts` retries already used up the budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }

    /// Validate the policy.
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_delay_ms == 0 {
            return Err("Initial reconnect delay must be > 0".to_string());
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err("Max reconnect delay must be >= initial reconnect delay".to_string());
        }
        if self.backoff_multiplier < 1.0 || !self.backoff_multiplier.is_finite() {
            return Err("Backoff multiplier must be >= 1.0".to_string());
        }
        if self.connect_timeout_ms == 0 {
            return Err("Connect timeout must be > 0".to_string());
        }
        Ok(())
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// `min(initial * multiplier^attempt, max)`, scaled by `[0.5, 1.0]` when
/// jitter is enabled.
pub fn calculate_backoff(policy: &ReconnectPolicy, attempt: u32) -> Duration {
    let initial = policy.initial_delay_ms as f64;
    let max = policy.max_delay_ms as f64;
    let exponent = policy
        .backoff_multiplier
        .powi(i32::try_from(attempt).unwrap_or(i32::MAX));
    let mut delay = (initial * exponent).min(max);

    if policy.use_jitter {
        let mut rng = rand::rng();
        delay *= rng.random_range(0.5..=1.0);
    }

    Duration::from_secs_f64(delay / 1_000.0)
}

/// Policies selected by connection-type name, with a fallback.
#[derive(Clone, Debug)]
pub struct ReconnectPolicies {
    policies: HashMap<String, Arc<ReconnectPolicy>>,
    fallback: Arc<ReconnectPolicy>,
}

impl Default for ReconnectPolicies {
    fn default() -> Self {
        Self::new()
            .with_policy("metrics", ReconnectPolicy::metrics())
            .with_policy("terminal", ReconnectPolicy::terminal())
    }
}

impl ReconnectPolicies {
    /// Registry holding only the default fallback.
    pub fn new() -> Self {
        Self {
            policies: HashMap::new(),
            fallback: Arc::new(ReconnectPolicy::default()),
        }
    }

    /// Register a named policy. The name `default` replaces the fallback.
    #[must_use]
    pub fn with_policy(mut self, name: impl Into<String>, policy: ReconnectPolicy) -> Self {
        let name = name.into();
        if name == DEFAULT_POLICY {
            self.fallback = Arc::new(policy);
        } else {
            self.policies.insert(name, Arc::new(policy));
        }
        self
    }

    /// Policy for `name`, or the fallback.
    pub fn get(&self, name: &str) -> Arc<ReconnectPolicy> {
        self.policies
            .get(name)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    /// Policy for a connection.
    pub fn for_connection(&self, id: &ConnectionId) -> Arc<ReconnectPolicy> {
        self.get(id.policy_key())
    }

    /// Validate every policy.
    pub fn validate(&self) -> Result<(), String> {
        self.fallback
            .validate()
            .map_err(|e| format!("{DEFAULT_POLICY}: {e}"))?;
        for (name, policy) in &self.policies {
            policy.validate().map_err(|e| format!("{name}: {e}"))?;
        }
        Ok(())
    }
}

/// What the scheduler decided for an abnormal close.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RetryPlan {
    /// Retry `attempt` (1-based) after `delay`.
    Retry {
        /// Attempt number being scheduled.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// The policy has no attempts left.
    Exhausted {
        /// Attempts already made.
        attempts: u32,
    },
}

/// Decide whether and when to retry a connection.
pub fn plan_retry(state: &ConnectionState, policy: &ReconnectPolicy) -> RetryPlan {
    if policy.is_exhausted(state.reconnect_attempts) {
        return RetryPlan::Exhausted {
            attempts: state.reconnect_attempts,
        };
    }
    RetryPlan::Retry {
        attempt: state.reconnect_attempts.saturating_add(1),
        delay: calculate_backoff(policy, state.reconnect_attempts),
    }
}

struct ArmedTimer {
    token: u64,
    task: JoinHandle<()>,
}

/// One pending one-shot timer per connection.
///
/// Arming replaces any timer already armed for the id. The firing callback
/// receives the token it was armed with; the owner must call
/// [`Timers::take_if_current`] before acting so a superseded or disarmed
/// timer does nothing.
#[derive(Default)]
pub(crate) struct Timers {
    armed: HashMap<ConnectionId, ArmedTimer>,
    next_token: u64,
}

impl Timers {
    pub(crate) fn arm<F>(&mut self, id: ConnectionId, delay: Duration, on_fire: F) -> u64
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.disarm(&id);
        self.next_token += 1;
        let token = self.next_token;
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            on_fire(token);
        });
        self.armed.insert(id, ArmedTimer { token, task });
        token
    }

    pub(crate) fn disarm(&mut self, id: &ConnectionId) -> bool {
        match self.armed.remove(id) {
            Some(timer) => {
                timer.task.abort();
                true
            }
            None => false,
        }
    }

    pub(crate) fn take_if_current(&mut self, id: &ConnectionId, token: u64) -> bool {
        if self.armed.get(id).is_some_and(|timer| timer.token == token) {
            self.armed.remove(id);
            return true;
        }
        false
    }

    pub(crate) fn is_armed(&self, id: &ConnectionId) -> bool {
        self.armed.contains_key(id)
    }

    pub(crate) fn clear(&mut self) {
        for (_, timer) in self.armed.drain() {
            timer.task.abort();
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.clear();
    }
}
