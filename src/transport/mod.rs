use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::error::TransportError;

pub mod http;
pub mod mock;

pub use http::HttpTransport;
pub use mock::MockTransport;

/// Trait defining how a request reaches an endpoint.
///
/// The dispatch core never interprets the protocol; it only looks at the
/// status code to tell throttling from failure from success.
#[async_trait]
pub trait Transport: std::fmt::Debug + Send + Sync {
    /// Send a single request
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The request could not be built
    /// - The connection failed
    /// - No response arrived within the request's timeout
    async fn send(&self, request: &Request) -> Result<Response, TransportError>;
}

/// Request timeout and the statuses treated as throttling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_throttle_statuses")]
    pub throttle_statuses: Vec<u16>,
}

const fn default_timeout_seconds() -> u64 {
    10
}

fn default_throttle_statuses() -> Vec<u16> {
    vec![429]
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            throttle_statuses: default_throttle_statuses(),
        }
    }
}

impl TransportConfig {
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    #[must_use]
    pub fn is_throttle(&self, status: u16) -> bool {
        self.throttle_statuses.contains(&status)
    }
}

/// A fully resolved request for one endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: String,
    pub url: String,
    pub payload: Option<Value>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

impl Response {
    #[must_use]
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// A logical operation, independent of which endpoint ends up serving it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSpec {
    #[serde(default = "default_method")]
    pub method: String,
    /// Appended to the endpoint URL
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub payload: Option<Value>,
}

fn default_method() -> String {
    "POST".to_string()
}

impl RequestSpec {
    #[must_use]
    pub fn post(payload: Value) -> Self {
        Self {
            method: default_method(),
            path: String::new(),
            payload: Some(payload),
        }
    }

    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.into(),
            payload: None,
        }
    }

    /// Resolves this operation against an endpoint's base URL
    #[must_use]
    pub fn to_request(&self, base_url: &str, timeout: Duration) -> Request {
        let url = if self.path.is_empty() {
            base_url.to_string()
        } else {
            format!(
                "{}/{}",
                base_url.trim_end_matches('/'),
                self.path.trim_start_matches('/')
            )
        };
        Request {
            method: self.method.clone(),
            url,
            payload: self.payload.clone(),
            timeout,
        }
    }
}
