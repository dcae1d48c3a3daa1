pub mod breaker;
pub mod config;
pub mod quota;
pub mod rate_limiter;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use config::{EndpointConfig, EndpointConfigError, UNLIMITED};
pub use quota::{QuotaSnapshot, WindowKind, WindowSnapshot};
pub use rate_limiter::{Admission, EndpointStatus, PacingConfig, RateLimiter};

/// What happened on a single attempt against one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    RateLimited,
    TransientError,
    QuotaExhausted,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::RateLimited => write!(f, "rate limited"),
            Self::TransientError => write!(f, "transient error"),
            Self::QuotaExhausted => write!(f, "quota exhausted"),
        }
    }
}
