//! HTTP delivery transport backed by reqwest

use crate::error::{Result, WatchError};
use crate::port::{DeliveryTransport, TransportResponse};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Production [`DeliveryTransport`] posting JSON over HTTP
pub struct HttpDeliveryTransport {
    client: reqwest::Client,
}

impl HttpDeliveryTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("valkey-watch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| WatchError::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DeliveryTransport for HttpDeliveryTransport {
    async fn post(
        &self,
        url: &str,
        body: &str,
        headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<TransportResponse> {
        let mut request = self
            .client
            .post(url)
            .timeout(timeout)
            .body(body.to_string());
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                WatchError::Timeout(format!("webhook request to {} timed out", url))
            } else {
                WatchError::Transport(format!("webhook request to {} failed: {}", url, e))
            }
        })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| WatchError::Transport(format!("failed to read response body: {}", e)))?;

        Ok(TransportResponse { status, body })
    }
}
