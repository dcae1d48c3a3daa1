use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A quota limit value meaning "no cap for this window"
pub const UNLIMITED: i64 = -1;

#[derive(Debug, Error, PartialEq)]
pub enum EndpointConfigError {
    #[error("endpoint {0}: url must not be empty")]
    EmptyUrl(String),
    #[error("endpoint {name}: rate range [{min}, {max}] is invalid")]
    InvalidRateRange { name: String, min: f64, max: f64 },
    #[error("endpoint {name}: base rate {rate} is outside [{min}, {max}]")]
    BaseRateOutOfRange {
        name: String,
        rate: f64,
        min: f64,
        max: f64,
    },
    #[error("endpoint {name}: {window} limit {limit} must be -1 or non-negative")]
    InvalidLimit {
        name: String,
        window: &'static str,
        limit: i64,
    },
}

/// Configuration of a single rate-limited endpoint
///
/// ```toml
/// [endpoints.cloudflare]
/// url = "https://cloudflare-eth.com"
/// priority = 1
/// base_rate = 5.0
/// rate_range = [1.0, 10.0]
/// limit_hour = -1
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Target URL, treated as an opaque token by the dispatch core
    pub url: String,
    /// Lower values are tried first
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Starting pace in requests per second
    #[serde(default = "default_base_rate")]
    pub base_rate: f64,
    /// Bounds for the adaptive pace, `[min, max]`
    #[serde(default = "default_rate_range")]
    pub rate_range: [f64; 2],
    #[serde(default = "default_limit")]
    pub limit_hour: i64,
    #[serde(default = "default_limit")]
    pub limit_day: i64,
    #[serde(default = "default_limit")]
    pub limit_month: i64,
}

const fn default_priority() -> u32 {
    100
}

const fn default_base_rate() -> f64 {
    1.0
}

const fn default_rate_range() -> [f64; 2] {
    [0.5, 2.0]
}

const fn default_limit() -> i64 {
    UNLIMITED
}

impl EndpointConfig {
    #[must_use]
    pub fn new(url: impl Into<String>, base_rate: f64, rate_range: [f64; 2]) -> Self {
        Self {
            url: url.into(),
            priority: default_priority(),
            base_rate,
            rate_range,
            limit_hour: UNLIMITED,
            limit_day: UNLIMITED,
            limit_month: UNLIMITED,
        }
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub const fn with_limits(mut self, hour: i64, day: i64, month: i64) -> Self {
        self.limit_hour = hour;
        self.limit_day = day;
        self.limit_month = month;
        self
    }

    #[must_use]
    pub const fn min_rate(&self) -> f64 {
        self.rate_range[0]
    }

    #[must_use]
    pub const fn max_rate(&self) -> f64 {
        self.rate_range[1]
    }

    /// Validates the endpoint configuration
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The URL is empty
    /// - The rate range is non-positive or inverted
    /// - The base rate lies outside the rate range
    /// - A quota limit is below -1
    pub fn validate(&self, name: &str) -> Result<(), EndpointConfigError> {
        if self.url.trim().is_empty() {
            return Err(EndpointConfigError::EmptyUrl(name.to_string()));
        }

        let (min, max) = (self.min_rate(), self.max_rate());
        if !(min.is_finite() && max.is_finite()) || min <= 0.0 || min > max {
            return Err(EndpointConfigError::InvalidRateRange {
                name: name.to_string(),
                min,
                max,
            });
        }
        if !(min..=max).contains(&self.base_rate) {
            return Err(EndpointConfigError::BaseRateOutOfRange {
                name: name.to_string(),
                rate: self.base_rate,
                min,
                max,
            });
        }

        for (window, limit) in [
            ("hour", self.limit_hour),
            ("day", self.limit_day),
            ("month", self.limit_month),
        ] {
            if limit < UNLIMITED {
                return Err(EndpointConfigError::InvalidLimit {
                    name: name.to_string(),
                    window,
                    limit,
                });
            }
        }

        Ok(())
    }
}

/// Converts a configured limit into an optional cap
#[must_use]
pub fn limit_cap(limit: i64) -> Option<u64> {
    u64::try_from(limit).ok()
}
