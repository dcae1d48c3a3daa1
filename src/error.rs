use std::time::Duration;
use thiserror::Error;

/// Errors raised by a [`Transport`](crate::transport::Transport) while sending a request
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// The only error a caller of [`Distributor::execute`](crate::Distributor::execute) sees.
///
/// Throttling, transport failures and local quota exhaustion are absorbed per
/// endpoint. This variant means every endpoint is unusable right now and the
/// operation should be retried later.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("all endpoints exhausted{}", retry_hint(.retry_after))]
    AllEndpointsExhausted { retry_after: Option<Duration> },
}

impl DispatchError {
    /// How long the caller should wait before trying again, if known
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::AllEndpointsExhausted { retry_after } => *retry_after,
        }
    }
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    retry_after.map_or_else(String::new, |d| {
        format!(", retry in {:.1}s", d.as_secs_f64())
    })
}
