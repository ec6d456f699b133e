//! Bounded retry schedule for the signaling channel.
//!
//! The relay connection retries on a fixed interval with an attempt budget.
//! Once the budget is spent the session is terminally disconnected and the
//! caller must tell the user; there is no silent infinite retry.

use std::time::Duration;

use rand::Rng;
use tidemesh_config::SignalingConfig;

/// Retry schedule parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before each attempt.
    pub interval: Duration,
    /// Attempts allowed before giving up.
    pub max_attempts: u32,
    /// Jitter factor (0.0–1.0) applied as ±jitter to the interval. Default: 0.
    pub jitter: f64,
}

impl RetryPolicy {
    /// Fixed-interval policy without jitter.
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
            jitter: 0.0,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(2), 10)
    }
}

impl From<&SignalingConfig> for RetryPolicy {
    fn from(config: &SignalingConfig) -> Self {
        Self::fixed(config.reconnect_interval(), config.max_reconnect_attempts)
    }
}

/// Tracks how much of the retry budget has been used.
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    attempts: u32,
}

impl RetryState {
    /// Fresh state with the full budget.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Consume one attempt and return the delay to wait before it.
    /// Returns `None` once the budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        self.attempts += 1;

        let base = self.policy.interval;
        if self.policy.jitter > 0.0 {
            let jitter = self.policy.jitter.min(1.0);
            let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
            Some(base.mul_f64(factor))
        } else {
            Some(base)
        }
    }

    /// Restore the full budget (after a successful connection).
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Attempts consumed so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// `true` once no attempts remain.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.policy.max_attempts
    }
}
