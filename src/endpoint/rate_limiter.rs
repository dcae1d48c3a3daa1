use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::breaker::{BreakerConfig, BreakerState, CircuitBreaker};
use super::config::EndpointConfig;
use super::quota::{Quota, QuotaSnapshot, WindowKind};

/// Slowest pace an endpoint may be driven at, in requests per second
const RATE_FLOOR: f64 = 0.001;

/// Multiplicative pace adjustments applied after each response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacingConfig {
    #[serde(default = "default_increase_factor")]
    pub increase_factor: f64,
    #[serde(default = "default_decrease_factor")]
    pub decrease_factor: f64,
}

const fn default_increase_factor() -> f64 {
    1.05
}
const fn default_decrease_factor() -> f64 {
    0.8
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            increase_factor: default_increase_factor(),
            decrease_factor: default_decrease_factor(),
        }
    }
}

/// Result of asking an endpoint for permission to send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    Suspended { remaining: Duration },
    QuotaExhausted { window: WindowKind, resets_in: Duration },
}

impl Admission {
    #[must_use]
    pub const fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// Mutable per-endpoint state, guarded by the limiter's lock
#[derive(Debug)]
struct EndpointState {
    current_rate: f64,
    last_granted: Option<Instant>,
    quota: Quota,
    breaker: CircuitBreaker,
}

/// Read-only view of an endpoint used for reporting
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointStatus {
    pub name: String,
    pub url: String,
    pub priority: u32,
    pub current_rate: f64,
    pub consecutive_failures: u32,
    pub suspended_for: Option<Duration>,
    pub quota: QuotaSnapshot,
}

/// Paces, caps and suspends one endpoint.
///
/// All state lives behind a single mutex that is never held across an await
/// point, so a task waiting out its pacing interval does not block breaker
/// updates from other in-flight requests.
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    url: String,
    priority: u32,
    min_rate: f64,
    max_rate: f64,
    pacing: PacingConfig,
    breaker_config: BreakerConfig,
    state: Mutex<EndpointState>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        config: &EndpointConfig,
        pacing: PacingConfig,
        breaker_config: BreakerConfig,
    ) -> Self {
        let min_rate = config.min_rate().max(RATE_FLOOR);
        let max_rate = config.max_rate().max(min_rate);
        let now = Instant::now();
        Self {
            name: name.into(),
            url: config.url.clone(),
            priority: config.priority,
            min_rate,
            max_rate,
            pacing,
            breaker_config,
            state: Mutex::new(EndpointState {
                current_rate: config.base_rate.clamp(min_rate, max_rate),
                last_granted: None,
                quota: Quota::from_config(config, now),
                breaker: CircuitBreaker::new(),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub const fn priority(&self) -> u32 {
        self.priority
    }

    fn lock(&self) -> MutexGuard<'_, EndpointState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for this endpoint's pacing slot.
    ///
    /// Returns `false` straight away when the breaker is open or a quota
    /// window is exhausted.
    pub async fn try_acquire(&self) -> bool {
        self.acquire().await.is_granted()
    }

    /// Like [`try_acquire`](Self::try_acquire) but reports why an endpoint was refused
    pub async fn acquire(&self) -> Admission {
        loop {
            match self.check(Instant::now()) {
                Ok(admission) => return admission,
                Err(wait) => {
                    debug!("Endpoint {} pacing, waiting {:?}", self.name, wait);
                    sleep(wait).await;
                }
            }
        }
    }

    /// One atomic admission decision. `Err` carries the pacing wait.
    fn check(&self, now: Instant) -> Result<Admission, Duration> {
        let mut state = self.lock();

        let was_suspended = matches!(state.breaker.state(), BreakerState::Suspended { .. });
        if let Some(remaining) = state.breaker.poll(now) {
            return Ok(Admission::Suspended { remaining });
        }
        if was_suspended {
            info!("Endpoint {} reactivated", self.name);
        }

        state.quota.roll(now);
        if let Some(window) = state.quota.exhausted() {
            return Ok(Admission::QuotaExhausted {
                window: window.kind(),
                resets_in: window.resets_in(now),
            });
        }

        let interval = Duration::from_secs_f64(1.0 / state.current_rate);
        if let Some(ready_at) = state.last_granted.map(|last| last + interval) {
            if ready_at > now {
                return Err(ready_at - now);
            }
        }

        state.last_granted = Some(now);
        state.quota.record();
        Ok(Admission::Granted)
    }

    /// Healthy response: clear the failure streak and speed up
    pub fn on_success(&self) {
        let mut state = self.lock();
        state.breaker.record_success();
        state.current_rate = (state.current_rate * self.pacing.increase_factor).min(self.max_rate);
    }

    /// Throttle response: slow down and count towards the breaker
    pub fn on_throttled(&self) -> Option<Duration> {
        let mut state = self.lock();
        state.current_rate = (state.current_rate * self.pacing.decrease_factor).max(self.min_rate);
        let suspension = state
            .breaker
            .record_failure(Instant::now(), &self.breaker_config);
        if let Some(duration) = suspension {
            warn!(
                "Endpoint {} suspended for {}s after {} consecutive throttles",
                self.name,
                duration.as_secs(),
                state.breaker.consecutive_failures()
            );
        }
        suspension
    }

    /// Transport failure or unexpected status: counts towards the breaker only
    pub fn on_failure(&self) -> Option<Duration> {
        let mut state = self.lock();
        let suspension = state
            .breaker
            .record_failure(Instant::now(), &self.breaker_config);
        if let Some(duration) = suspension {
            warn!(
                "Endpoint {} suspended for {}s after {} consecutive failures",
                self.name,
                duration.as_secs(),
                state.breaker.consecutive_failures()
            );
        }
        suspension
    }

    /// How long until this endpoint could grant again, ignoring pacing.
    ///
    /// `None` means it is usable now.
    #[must_use]
    pub fn next_available(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut state = self.lock();
        state.quota.roll(now);
        let suspended = state.breaker.remaining(now);
        let blocked = state.quota.blocked_for(now);
        suspended.max(blocked)
    }

    #[must_use]
    pub fn current_rate(&self) -> f64 {
        self.lock().current_rate
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.lock().breaker.consecutive_failures()
    }

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.lock().breaker.remaining(Instant::now()).is_some()
    }

    #[must_use]
    pub fn quota_snapshot(&self) -> QuotaSnapshot {
        self.lock().quota.snapshot(Instant::now())
    }

    pub fn restore_quota(&self, snapshot: &QuotaSnapshot) {
        self.lock().quota.restore(snapshot, Instant::now());
    }

    #[must_use]
    pub fn status(&self) -> EndpointStatus {
        let now = Instant::now();
        let state = self.lock();
        EndpointStatus {
            name: self.name.clone(),
            url: self.url.clone(),
            priority: self.priority,
            current_rate: state.current_rate,
            consecutive_failures: state.breaker.consecutive_failures(),
            suspended_for: state.breaker.remaining(now),
            quota: state.quota.snapshot(now),
        }
    }
}
