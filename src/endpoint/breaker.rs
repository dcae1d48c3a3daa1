use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker settings shared by all endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker
    #[serde(default = "default_threshold")]
    pub threshold: u32,
    /// Base of the exponential suspension
    #[serde(default = "default_base_seconds")]
    pub base_seconds: u64,
    /// Upper bound on a single suspension
    #[serde(default = "default_cap_seconds")]
    pub cap_seconds: u64,
}

const fn default_threshold() -> u32 {
    2
}
const fn default_base_seconds() -> u64 {
    60
}
const fn default_cap_seconds() -> u64 {
    600
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            base_seconds: default_base_seconds(),
            cap_seconds: default_cap_seconds(),
        }
    }
}

impl BreakerConfig {
    /// Suspension length after `failures` consecutive failures:
    /// `min(base * 2^failures, cap)`
    #[must_use]
    pub fn suspension_for(&self, failures: u32) -> Duration {
        let factor = 1_u64.checked_shl(failures).unwrap_or(u64::MAX);
        let seconds = self.base_seconds.saturating_mul(factor).min(self.cap_seconds);
        Duration::from_secs(seconds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Active,
    Suspended { until: Instant },
}

/// Per-endpoint breaker with time-based reactivation only
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreaker {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: BreakerState::Active,
            consecutive_failures: 0,
        }
    }

    #[must_use]
    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    #[must_use]
    pub const fn state(&self) -> BreakerState {
        self.state
    }

    /// Closes the breaker once the suspension has elapsed.
    ///
    /// Returns the remaining suspension if still open.
    pub fn poll(&mut self, now: Instant) -> Option<Duration> {
        match self.state {
            BreakerState::Active => None,
            BreakerState::Suspended { until } if now >= until => {
                self.state = BreakerState::Active;
                self.consecutive_failures = 0;
                None
            }
            BreakerState::Suspended { until } => Some(until - now),
        }
    }

    /// Remaining suspension without changing state
    #[must_use]
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        match self.state {
            BreakerState::Suspended { until } if now < until => Some(until - now),
            _ => None,
        }
    }

    /// Records a failure and opens the breaker when the threshold is reached.
    ///
    /// Returns the suspension applied, if any.
    pub fn record_failure(&mut self, now: Instant, config: &BreakerConfig) -> Option<Duration> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.consecutive_failures < config.threshold {
            return None;
        }
        let suspension = config.suspension_for(self.consecutive_failures);
        let until = now + suspension;
        // a late failure from an in-flight request never shortens a suspension
        self.state = match self.state {
            BreakerState::Suspended { until: current } if current > until => {
                BreakerState::Suspended { until: current }
            }
            _ => BreakerState::Suspended { until },
        };
        Some(suspension)
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }
}
