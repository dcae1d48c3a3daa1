//! Global admission control.
//!
//! The controller sizes the pool of in-flight operations. It is slow to grow,
//! requiring a streak of successes and a cooldown since the last change, and
//! quick to shrink: a short streak of failures drops the level immediately
//! and pauses admission for a fixed period.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_min_level")]
    pub min_level: usize,
    #[serde(default = "default_max_level")]
    pub max_level: usize,
    /// Consecutive successes required before growing
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Consecutive failures that shrink the pool
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Minimum dwell between a change and the next increase
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    /// Global admission pause after a failure streak
    #[serde(default = "default_failure_pause_seconds")]
    pub failure_pause_seconds: u64,
}

const fn default_min_level() -> usize {
    1
}
const fn default_max_level() -> usize {
    8
}
const fn default_success_threshold() -> u32 {
    20
}
const fn default_failure_threshold() -> u32 {
    3
}
const fn default_cooldown_seconds() -> u64 {
    30
}
const fn default_failure_pause_seconds() -> u64 {
    10
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            min_level: default_min_level(),
            max_level: default_max_level(),
            success_threshold: default_success_threshold(),
            failure_threshold: default_failure_threshold(),
            cooldown_seconds: default_cooldown_seconds(),
            failure_pause_seconds: default_failure_pause_seconds(),
        }
    }
}

impl ConcurrencyConfig {
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }

    #[must_use]
    pub const fn failure_pause(&self) -> Duration {
        Duration::from_secs(self.failure_pause_seconds)
    }

    /// Clamps a level into `[min_level, max_level]`
    #[must_use]
    pub fn clamp(&self, level: usize) -> usize {
        let max = self.max_level.max(self.min_level);
        level.max(self.min_level).min(max)
    }
}

/// A change the controller made in response to an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelChange {
    Increased { from: usize, to: usize },
    Decreased { from: usize, to: usize, pause: Duration },
    /// Failure streak while already at the floor
    Paused { level: usize, pause: Duration },
}

/// The controller's state machine, free of locking and sleeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyState {
    level: usize,
    consecutive_successes: u32,
    consecutive_failures: u32,
    last_change: Instant,
    paused_until: Option<Instant>,
}

impl ConcurrencyState {
    #[must_use]
    pub fn new(level: usize, config: &ConcurrencyConfig, now: Instant) -> Self {
        Self {
            level: config.clamp(level),
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_change: now,
            paused_until: None,
        }
    }

    #[must_use]
    pub const fn level(&self) -> usize {
        self.level
    }

    #[must_use]
    pub const fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }

    #[must_use]
    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    #[must_use]
    pub const fn last_change(&self) -> Instant {
        self.last_change
    }

    #[must_use]
    pub fn pause_remaining(&self, now: Instant) -> Option<Duration> {
        self.paused_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    pub fn record_success(&mut self, config: &ConcurrencyConfig, now: Instant) -> Option<LevelChange> {
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;

        if self.consecutive_successes < config.success_threshold
            || now.saturating_duration_since(self.last_change) < config.cooldown()
            || self.level >= config.max_level
        {
            return None;
        }

        let from = self.level;
        self.level += 1;
        self.consecutive_successes = 0;
        self.last_change = now;
        Some(LevelChange::Increased {
            from,
            to: self.level,
        })
    }

    pub fn record_failure(&mut self, config: &ConcurrencyConfig, now: Instant) -> Option<LevelChange> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;

        if self.consecutive_failures < config.failure_threshold {
            return None;
        }

        self.consecutive_failures = 0;
        let pause = config.failure_pause();
        self.paused_until = Some(now + pause);

        if self.level > config.min_level {
            let from = self.level;
            self.level -= 1;
            self.last_change = now;
            Some(LevelChange::Decreased {
                from,
                to: self.level,
                pause,
            })
        } else {
            Some(LevelChange::Paused {
                level: self.level,
                pause,
            })
        }
    }
}

/// Shared admission controller, one per run
#[derive(Debug)]
pub struct ConcurrencyController {
    config: ConcurrencyConfig,
    state: Mutex<ConcurrencyState>,
}

impl ConcurrencyController {
    /// Starts at the minimum level
    #[must_use]
    pub fn new(config: ConcurrencyConfig) -> Self {
        let level = config.min_level;
        Self::with_level(config, level)
    }

    /// Resumes from a persisted level, clamped into the configured bounds
    #[must_use]
    pub fn with_level(config: ConcurrencyConfig, level: usize) -> Self {
        let state = ConcurrencyState::new(level, &config, Instant::now());
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ConcurrencyConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, ConcurrencyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn current_level(&self) -> usize {
        self.lock().level()
    }

    #[must_use]
    pub fn snapshot(&self) -> ConcurrencyState {
        self.lock().clone()
    }

    pub fn on_task_success(&self) -> Option<LevelChange> {
        let change = self.lock().record_success(&self.config, Instant::now());
        if let Some(LevelChange::Increased { from, to }) = change {
            info!("Increasing concurrency from {} to {}", from, to);
        }
        change
    }

    /// Records a saturation signal.
    ///
    /// When this completes a failure streak the calling task sleeps through
    /// the admission pause before returning.
    pub async fn on_task_failure(&self) -> Option<LevelChange> {
        let change = self.lock().record_failure(&self.config, Instant::now());
        match change {
            Some(LevelChange::Decreased { from, to, pause }) => {
                warn!(
                    "Reducing concurrency from {} to {}, pausing {}s",
                    from,
                    to,
                    pause.as_secs()
                );
                sleep(pause).await;
            }
            Some(LevelChange::Paused { level, pause }) => {
                warn!(
                    "Concurrency already at minimum ({}), pausing {}s",
                    level,
                    pause.as_secs()
                );
                sleep(pause).await;
            }
            _ => {}
        }
        change
    }

    /// Time left on the current admission pause
    #[must_use]
    pub fn pause_remaining(&self) -> Option<Duration> {
        self.lock().pause_remaining(Instant::now())
    }

    /// Suspends until no admission pause is in effect
    pub async fn wait_for_admission(&self) {
        while let Some(remaining) = self.pause_remaining() {
            sleep(remaining).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config() -> ConcurrencyConfig {
        ConcurrencyConfig {
            min_level: 2,
            max_level: 8,
            ..ConcurrencyConfig::default()
        }
    }

    #[test]
    fn test_increase_requires_streak_and_cooldown() {
        let config = config();
        let start = Instant::now();
        let mut state = ConcurrencyState::new(2, &config, start);

        for _ in 0..25 {
            assert_eq!(state.record_success(&config, start), None);
        }
        assert_eq!(state.level(), 2);

        let later = start + Duration::from_secs(30);
        assert_eq!(
            state.record_success(&config, later),
            Some(LevelChange::Increased { from: 2, to: 3 })
        );
        assert_eq!(state.consecutive_successes(), 0);
        assert_eq!(state.last_change(), later);
    }

    #[test]
    fn test_decrease_is_not_dwell_gated() {
        let config = config();
        let start = Instant::now();
        let mut state = ConcurrencyState::new(5, &config, start);

        assert_eq!(state.record_failure(&config, start), None);
        assert_eq!(state.record_failure(&config, start), None);
        let change = state.record_failure(&config, start);
        assert_eq!(
            change,
            Some(LevelChange::Decreased {
                from: 5,
                to: 4,
                pause: Duration::from_secs(10)
            })
        );
        assert_eq!(state.pause_remaining(start), Some(Duration::from_secs(10)));
        assert_eq!(state.pause_remaining(start + Duration::from_secs(10)), None);
    }

    #[test]
    fn test_floor_still_pauses() {
        let config = config();
        let now = Instant::now();
        let mut state = ConcurrencyState::new(2, &config, now);
        for _ in 0..2 {
            state.record_failure(&config, now);
        }
        assert_eq!(
            state.record_failure(&config, now),
            Some(LevelChange::Paused {
                level: 2,
                pause: Duration::from_secs(10)
            })
        );
        assert_eq!(state.level(), 2);
        assert_eq!(state.consecutive_failures(), 0);
    }

    #[test]
    fn test_success_breaks_failure_streak() {
        let config = config();
        let now = Instant::now();
        let mut state = ConcurrencyState::new(4, &config, now);
        state.record_failure(&config, now);
        state.record_failure(&config, now);
        state.record_success(&config, now);
        assert_eq!(state.consecutive_failures(), 0);
        assert_eq!(state.record_failure(&config, now), None);
        assert_eq!(state.level(), 4);
    }

    #[test]
    fn test_with_level_clamps() {
        assert_eq!(ConcurrencyController::with_level(config(), 0).current_level(), 2);
        assert_eq!(ConcurrencyController::with_level(config(), 50).current_level(), 8);
        assert_eq!(ConcurrencyController::new(config()).current_level(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_pause_blocks_admission() {
        let controller = ConcurrencyController::with_level(config(), 4);
        let start = Instant::now();
        controller.on_task_failure().await;
        controller.on_task_failure().await;
        assert_eq!(Instant::now(), start);

        controller.on_task_failure().await;
        assert_eq!(Instant::now() - start, Duration::from_secs(10));
        assert_eq!(controller.current_level(), 3);
        assert_eq!(controller.pause_remaining(), None);
    }
}
