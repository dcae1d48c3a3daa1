//! Priority-ordered failover across endpoints.
//!
//! Each endpoint is a bulkhead: throttling, transport failures and quota
//! exhaustion are recorded against that endpoint and the controller, then
//! the next endpoint is tried. Only exhaustion of the whole chain reaches
//! the caller, and it is recoverable.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::controller::ConcurrencyController;
use crate::endpoint::{Admission, Outcome, RateLimiter};
use crate::error::{DispatchError, TransportError};
use crate::transport::{RequestSpec, Response, Transport, TransportConfig};

/// A response together with the endpoint that produced it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub endpoint: String,
    pub response: Response,
}

#[derive(Debug)]
pub struct Distributor<T: Transport> {
    endpoints: Vec<Arc<RateLimiter>>,
    controller: Arc<ConcurrencyController>,
    transport: T,
    config: TransportConfig,
}

impl<T: Transport> Distributor<T> {
    /// Endpoints are ordered by priority, then by name
    #[must_use]
    pub fn new(
        mut endpoints: Vec<Arc<RateLimiter>>,
        controller: Arc<ConcurrencyController>,
        transport: T,
        config: TransportConfig,
    ) -> Self {
        endpoints.sort_by(|a, b| {
            a.priority()
                .cmp(&b.priority())
                .then_with(|| a.name().cmp(b.name()))
        });
        Self {
            endpoints,
            controller,
            transport,
            config,
        }
    }

    #[must_use]
    pub fn endpoints(&self) -> &[Arc<RateLimiter>] {
        &self.endpoints
    }

    #[must_use]
    pub fn endpoint(&self, name: &str) -> Option<&Arc<RateLimiter>> {
        self.endpoints.iter().find(|e| e.name() == name)
    }

    #[must_use]
    pub const fn controller(&self) -> &Arc<ConcurrencyController> {
        &self.controller
    }

    #[must_use]
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Maps a transport result onto an attempt outcome
    #[must_use]
    pub fn classify(&self, result: &Result<Response, TransportError>) -> Outcome {
        match result {
            Ok(response) if self.config.is_throttle(response.status) => Outcome::RateLimited,
            Ok(response) if response.is_success() => Outcome::Success,
            _ => Outcome::TransientError,
        }
    }

    /// Performs `spec` against the first endpoint able to serve it
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::AllEndpointsExhausted`] when every endpoint is
    /// suspended, over quota, or failed this attempt. Callers should retry
    /// the operation later.
    pub async fn execute(&self, spec: &RequestSpec) -> Result<Dispatched, DispatchError> {
        for limiter in &self.endpoints {
            match limiter.acquire().await {
                Admission::Granted => {}
                Admission::Suspended { remaining } => {
                    debug!(
                        "Skipping {}: suspended for another {:.1}s",
                        limiter.name(),
                        remaining.as_secs_f64()
                    );
                    continue;
                }
                Admission::QuotaExhausted { window, resets_in } => {
                    debug!(
                        "Skipping {}: {} ({} quota, resets in {}s)",
                        limiter.name(),
                        Outcome::QuotaExhausted,
                        window,
                        resets_in.as_secs()
                    );
                    continue;
                }
            }

            let request = spec.to_request(limiter.url(), self.config.timeout());
            let result = self.transport.send(&request).await;

            match (self.classify(&result), result) {
                (Outcome::Success, Ok(response)) => {
                    limiter.on_success();
                    self.controller.on_task_success();
                    return Ok(Dispatched {
                        endpoint: limiter.name().to_string(),
                        response,
                    });
                }
                (Outcome::RateLimited, _) => {
                    warn!("Endpoint {} throttled the request", limiter.name());
                    limiter.on_throttled();
                    self.controller.on_task_failure().await;
                }
                (outcome, result) => {
                    match result {
                        Ok(response) => warn!(
                            "Endpoint {} {}: status {}",
                            limiter.name(),
                            outcome,
                            response.status
                        ),
                        Err(e) => warn!("Endpoint {} {}: {}", limiter.name(), outcome, e),
                    }
                    limiter.on_failure();
                    self.controller.on_task_failure().await;
                }
            }
        }

        let retry_after = self.retry_after();
        debug!("All endpoints exhausted, retry after {:?}", retry_after);
        Err(DispatchError::AllEndpointsExhausted { retry_after })
    }

    /// Shortest wait until some endpoint is usable again, `None` if one already is
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        let mut shortest: Option<Duration> = None;
        for limiter in &self.endpoints {
            let wait = limiter.next_available()?;
            shortest = Some(shortest.map_or(wait, |s| s.min(wait)));
        }
        shortest
    }
}
