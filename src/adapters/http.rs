//! Decision system reached over HTTP.
//!
//! POSTs the request as JSON and classifies the reply:
//! - 2xx: success (body parsed as a response)
//! - 429: rate limited, honouring a `Retry-After` header in seconds
//! - 5xx, timeouts, connection errors: transient
//! - any other status: fatal

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use tracing::debug;

use super::{parse_response, DecisionSystem};
use crate::domain::{DecisionError, DecisionRequest, DecisionResponse};

pub struct HttpDecision {
    url: String,
    headers: BTreeMap<String, String>,
    client: reqwest::Client,
}

impl HttpDecision {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            url: url.into(),
            headers: BTreeMap::new(),
            client,
        })
    }

    /// Use a preconfigured client (proxy, TLS and timeout settings)
    pub fn with_client(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            client,
        }
    }

    /// Extra headers sent with every request (e.g. authorization)
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

/// Map a non-success status to a classified error
fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> DecisionError {
    let message = format!("HTTP {}: {}", status, body.trim());
    if status == StatusCode::TOO_MANY_REQUESTS {
        DecisionError::rate_limited(message, retry_after)
    } else if status.is_server_error() {
        DecisionError::transient(message)
    } else {
        DecisionError::fatal(message)
    }
}

fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl DecisionSystem for HttpDecision {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, request: &DecisionRequest) -> Result<DecisionResponse, DecisionError> {
        let mut builder = self.client.post(&self.url).json(request);
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_builder() {
                DecisionError::fatal(format!("Invalid request to {}: {}", self.url, e))
            } else {
                DecisionError::transient(format!("Request to {} failed: {}", self.url, e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(
                response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok()),
            );
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &body));
        }

        let value = response.json::<serde_json::Value>().await.map_err(|e| {
            DecisionError::fatal(format!("Invalid JSON from {}: {}", self.url, e))
        })?;

        debug!(url = %self.url, row = %request.row_key, "HTTP decision returned");
        Ok(parse_response(value))
    }
}
