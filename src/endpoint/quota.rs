//! Rolling hour/day/month request counters

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use super::config::{limit_cap, EndpointConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    Hour,
    Day,
    Month,
}

impl WindowKind {
    #[must_use]
    pub const fn duration(self) -> Duration {
        match self {
            Self::Hour => Duration::from_secs(3_600),
            Self::Day => Duration::from_secs(86_400),
            // months are treated as 30 days
            Self::Month => Duration::from_secs(2_592_000),
        }
    }
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hour => write!(f, "hour"),
            Self::Day => write!(f, "day"),
            Self::Month => write!(f, "month"),
        }
    }
}

/// A single counting window with an optional cap
#[derive(Debug, Clone)]
pub struct QuotaWindow {
    kind: WindowKind,
    limit: Option<u64>,
    count: u64,
    started: Instant,
}

impl QuotaWindow {
    #[must_use]
    pub const fn new(kind: WindowKind, limit: Option<u64>, now: Instant) -> Self {
        Self {
            kind,
            limit,
            count: 0,
            started: now,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> WindowKind {
        self.kind
    }

    #[must_use]
    pub const fn count(&self) -> u64 {
        self.count
    }

    /// Starts a fresh window if the current one has fully elapsed
    pub fn roll(&mut self, now: Instant) {
        if now.saturating_duration_since(self.started) > self.kind.duration() {
            self.count = 0;
            self.started = now;
        }
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.limit.is_some_and(|limit| self.count >= limit)
    }

    pub fn record(&mut self) {
        self.count = self.count.saturating_add(1);
    }

    /// Time until this window rolls over
    #[must_use]
    pub fn resets_in(&self, now: Instant) -> Duration {
        (self.started + self.kind.duration()).saturating_duration_since(now)
    }

    #[must_use]
    pub fn snapshot(&self, now: Instant) -> WindowSnapshot {
        WindowSnapshot {
            count: self.count,
            age_seconds: now.saturating_duration_since(self.started).as_secs(),
        }
    }

    /// Restores a persisted window, discarding it if it would already have rolled over
    pub fn restore(&mut self, snapshot: WindowSnapshot, now: Instant) {
        let age = Duration::from_secs(snapshot.age_seconds);
        match now.checked_sub(age) {
            Some(started) if age <= self.kind.duration() => {
                self.started = started;
                self.count = snapshot.count;
            }
            _ => {
                self.started = now;
                self.count = 0;
            }
        }
    }
}

/// The three windows tracked for every endpoint
#[derive(Debug, Clone)]
pub struct Quota {
    pub hour: QuotaWindow,
    pub day: QuotaWindow,
    pub month: QuotaWindow,
}

impl Quota {
    #[must_use]
    pub fn from_config(config: &EndpointConfig, now: Instant) -> Self {
        Self {
            hour: QuotaWindow::new(WindowKind::Hour, limit_cap(config.limit_hour), now),
            day: QuotaWindow::new(WindowKind::Day, limit_cap(config.limit_day), now),
            month: QuotaWindow::new(WindowKind::Month, limit_cap(config.limit_month), now),
        }
    }

    fn windows(&self) -> [&QuotaWindow; 3] {
        [&self.hour, &self.day, &self.month]
    }

    pub fn roll(&mut self, now: Instant) {
        self.hour.roll(now);
        self.day.roll(now);
        self.month.roll(now);
    }

    /// The first exhausted window, if any
    #[must_use]
    pub fn exhausted(&self) -> Option<&QuotaWindow> {
        self.windows().into_iter().find(|w| w.is_exhausted())
    }

    pub fn record(&mut self) {
        self.hour.record();
        self.day.record();
        self.month.record();
    }

    /// Time until every exhausted window has reset, if any is exhausted
    #[must_use]
    pub fn blocked_for(&self, now: Instant) -> Option<Duration> {
        self.windows()
            .into_iter()
            .filter(|w| w.is_exhausted())
            .map(|w| w.resets_in(now))
            .max()
    }

    #[must_use]
    pub fn snapshot(&self, now: Instant) -> QuotaSnapshot {
        QuotaSnapshot {
            hour: self.hour.snapshot(now),
            day: self.day.snapshot(now),
            month: self.month.snapshot(now),
        }
    }

    pub fn restore(&mut self, snapshot: &QuotaSnapshot, now: Instant) {
        self.hour.restore(snapshot.hour, now);
        self.day.restore(snapshot.day, now);
        self.month.restore(snapshot.month, now);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSnapshot {
    pub count: u64,
    pub age_seconds: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub hour: WindowSnapshot,
    pub day: WindowSnapshot,
    pub month: WindowSnapshot,
}

impl QuotaSnapshot {
    /// The same snapshot seen `elapsed` later
    #[must_use]
    pub const fn aged(self, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs();
        Self {
            hour: WindowSnapshot {
                count: self.hour.count,
                age_seconds: self.hour.age_seconds.saturating_add(secs),
            },
            day: WindowSnapshot {
                count: self.day.count,
                age_seconds: self.day.age_seconds.saturating_add(secs),
            },
            month: WindowSnapshot {
                count: self.month.count,
                age_seconds: self.month.age_seconds.saturating_add(secs),
            },
        }
    }
}
