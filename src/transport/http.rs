use async_trait::async_trait;
use reqwest::{Client, Method};

use super::{Request, Response, Transport};
use crate::error::TransportError;

/// Transport implementation over HTTP
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &Request) -> Result<Response, TransportError> {
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout);
        if let Some(payload) = &request.payload {
            builder = builder.json(payload);
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(classify)?;
        Ok(Response { status, body })
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_builder() {
        TransportError::InvalidRequest(err.to_string())
    } else {
        TransportError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_invalid_method_is_rejected() {
        let transport = HttpTransport::new();
        let request = Request {
            method: "NOT A METHOD".to_string(),
            url: "http://127.0.0.1:9".to_string(),
            payload: None,
            timeout: Duration::from_secs(1),
        };
        assert!(matches!(
            transport.send(&request).await,
            Err(TransportError::InvalidRequest(_))
        ));
    }
}
