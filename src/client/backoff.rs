//! Reconnect delay policy

use std::time::Duration;

/// Exponential backoff: `base_delay * 2^min(attempt - 1, cap_exponent)`,
/// giving up after `max_attempts` consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub cap_exponent: u32,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            cap_exponent: 4,
            max_attempts: 10,
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect attempt `attempt` (1-based; 0 is treated as 1)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(self.cap_exponent);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// Longest delay the policy will ever produce
    pub fn max_delay(&self) -> Duration {
        self.delay_for(self.cap_exponent.saturating_add(1))
    }
}

/// Attempt counter driven by a [`BackoffPolicy`]
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Count one more failed attempt and return how long to wait before
    /// retrying, or `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.policy.delay_for(self.attempts))
    }

    /// Forget past failures. Only call once the hub has acknowledged
    /// registration; a bare TCP/WebSocket connect is not enough.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}
