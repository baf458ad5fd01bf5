//! Bounded reconnection policy for account connections.
//!
//! The reference behaviour is a fixed delay between attempts
//! (`multiplier == 1.0`). A multiplier above one turns it into capped
//! exponential backoff. Either way the number of consecutive failed
//! cycles is bounded by [`ReconnectPolicy::max_attempts`]; past that the
//! account is marked fatal instead of retrying forever.

use std::time::Duration;

/// Tunable parameters for the reconnect strategy.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Consecutive failures tolerated before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(5000),
            max_delay: Duration::from_secs(60),
            multiplier: 1.0,
            max_attempts: 5,
        }
    }
}

/// What to do after the `attempt`-th consecutive failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Wait this long, then go back to `Connecting`.
    RetryAfter(Duration),
    /// The bound is exhausted.
    GiveUp,
}

impl ReconnectPolicy {
    /// Decide on the next step after `attempt` consecutive failures
    /// (1-based). The failure that brings the count to `max_attempts`
    /// is the last one.
    pub fn decide(&self, attempt: u32) -> ReconnectDecision {
        if attempt >= self.max_attempts {
            ReconnectDecision::GiveUp
        } else {
            ReconnectDecision::RetryAfter(self.delay_for(attempt))
        }
    }

    /// Delay before retrying after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_delay;
        for _ in 1..attempt {
            delay = next_delay(delay, self);
        }
        delay
    }
}

/// Calculate the next backoff delay from the current delay and policy.
///
/// The result is clamped to [`ReconnectPolicy::max_delay`] when the
/// policy grows at all.
pub fn next_delay(current: Duration, policy: &ReconnectPolicy) -> Duration {
    if policy.multiplier <= 1.0 {
        return current;
    }
    let next_ms = (current.as_millis() as f64 * policy.multiplier) as u64;
    Duration::from_millis(next_ms).min(policy.max_delay)
}
