// This module is only compiled when running tests
#![cfg(any(test, feature = "testing"))]

use std::sync::Arc;

use crate::controller::{ConcurrencyConfig, ConcurrencyController};
use crate::distributor::Distributor;
use crate::endpoint::{BreakerConfig, EndpointConfig, PacingConfig, RateLimiter};
use crate::transport::{MockTransport, TransportConfig};

/// URL used for the endpoint called `name`
#[must_use]
pub fn url_for(name: &str) -> String {
    format!("http://{name}.test")
}

/// A fast, unlimited endpoint so pacing never gets in the way of a test
#[must_use]
pub fn fast_limiter(name: &str, priority: u32) -> Arc<RateLimiter> {
    limiter(
        name,
        EndpointConfig::new(url_for(name), 100.0, [1.0, 100.0]).with_priority(priority),
    )
}

#[must_use]
pub fn limiter(name: &str, config: EndpointConfig) -> Arc<RateLimiter> {
    Arc::new(RateLimiter::new(
        name,
        &config,
        PacingConfig::default(),
        BreakerConfig::default(),
    ))
}

/// A distributor over `endpoints` talking to a shared mock transport.
///
/// The returned transport is a handle onto the same state, for scripting replies.
#[must_use]
pub fn mock_distributor(
    endpoints: Vec<Arc<RateLimiter>>,
    concurrency: ConcurrencyConfig,
) -> (Distributor<MockTransport>, MockTransport) {
    let transport = MockTransport::new();
    let distributor = Distributor::new(
        endpoints,
        Arc::new(ConcurrencyController::new(concurrency)),
        transport.clone(),
        TransportConfig::default(),
    );
    (distributor, transport)
}
