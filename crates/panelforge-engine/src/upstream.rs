use std::fmt;
use std::future::Future;
use std::time::Duration;

use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

const BODY_EXCERPT_CHARS: usize = 400;

/// Backoff schedule shared by every upstream operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
        }
    }
}

impl RetryPolicy {
    /// Delay slept after failed attempt `attempt` (1-based) before the next one:
    /// `min(base * 2^(attempt-1), max)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCause {
    Timeout(Duration),
    Network(String),
    Status(u16),
    Stream(String),
}

impl fmt::Display for TransportCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout(limit) => write!(f, "timed out after {}ms", limit.as_millis()),
            Self::Network(detail) => write!(f, "network error: {detail}"),
            Self::Status(code) => write!(f, "HTTP {code}"),
            Self::Stream(detail) => write!(f, "stream interrupted: {detail}"),
        }
    }
}

/// Raised once every attempt against an endpoint has failed.
#[derive(Debug, Clone, Error)]
#[error("{endpoint} failed after {attempts} attempt(s): {cause}")]
pub struct UpstreamError {
    pub endpoint: String,
    pub attempts: u32,
    pub status: Option<u16>,
    pub body: String,
    pub cause: TransportCause,
}

impl UpstreamError {
    pub fn stream_interrupted(endpoint: &str, cause: TransportCause) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            attempts: 1,
            status: None,
            body: String::new(),
            cause,
        }
    }

    pub fn body_excerpt(&self) -> String {
        crate::error::truncate_text(self.body.trim(), BODY_EXCERPT_CHARS)
    }
}

#[derive(Debug)]
struct AttemptFailure {
    cause: TransportCause,
    status: Option<u16>,
    body: String,
}

impl AttemptFailure {
    fn network(err: reqwest::Error) -> Self {
        Self {
            cause: TransportCause::Network(err.to_string()),
            status: None,
            body: String::new(),
        }
    }

    fn timeout(limit: Duration) -> Self {
        Self {
            cause: TransportCause::Timeout(limit),
            status: None,
            body: String::new(),
        }
    }

    fn status(code: u16, body: String) -> Self {
        Self {
            cause: TransportCause::Status(code),
            status: Some(code),
            body,
        }
    }
}

/// HTTP client for the generation service. Every operation retries with
/// exponential backoff and bounds each attempt with its own timeout; dropping
/// a timed-out attempt cancels the in-flight request.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: Client,
    api_key: Option<String>,
    policy: RetryPolicy,
}

impl UpstreamClient {
    pub fn new(api_key: Option<String>, policy: RetryPolicy) -> Self {
        Self {
            http: Client::new(),
            api_key,
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// POSTs `body` as JSON and returns the response text of the first 2xx
    /// answer. `max_attempts` counts every attempt, the first included.
    pub async fn call(
        &self,
        url: &str,
        body: &Value,
        max_attempts: u32,
        timeout: Duration,
    ) -> Result<String, UpstreamError> {
        self.with_retries(url, max_attempts, move || async move {
            let exchange = async {
                let response = self
                    .authorized(self.http.post(url))
                    .json(body)
                    .send()
                    .await
                    .map_err(AttemptFailure::network)?;
                let status = response.status();
                let text = response.text().await.map_err(AttemptFailure::network)?;
                if !status.is_success() {
                    return Err(AttemptFailure::status(status.as_u16(), text));
                }
                Ok(text)
            };
            tokio::time::timeout(timeout, exchange)
                .await
                .unwrap_or_else(|_| Err(AttemptFailure::timeout(timeout)))
        })
        .await
    }

    /// Like [`call`](Self::call) but returns as soon as a 2xx response head
    /// arrives, leaving the body for the caller to stream.
    pub async fn open_stream(
        &self,
        url: &str,
        body: &Value,
        max_attempts: u32,
        timeout: Duration,
    ) -> Result<Response, UpstreamError> {
        self.with_retries(url, max_attempts, move || async move {
            let exchange = async {
                let response = self
                    .authorized(self.http.post(url))
                    .header(reqwest::header::ACCEPT, "text/event-stream")
                    .json(body)
                    .send()
                    .await
                    .map_err(AttemptFailure::network)?;
                let status = response.status();
                if !status.is_success() {
                    let text = response.text().await.unwrap_or_default();
                    return Err(AttemptFailure::status(status.as_u16(), text));
                }
                Ok(response)
            };
            tokio::time::timeout(timeout, exchange)
                .await
                .unwrap_or_else(|_| Err(AttemptFailure::timeout(timeout)))
        })
        .await
    }

    /// Downloads a generated asset. Asset URLs are pre-signed, so no
    /// credential is attached.
    pub async fn fetch_bytes(
        &self,
        url: &str,
        max_attempts: u32,
        timeout: Duration,
    ) -> Result<Vec<u8>, UpstreamError> {
        self.with_retries(url, max_attempts, move || async move {
            let exchange = async {
                let response = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .map_err(AttemptFailure::network)?;
                let status = response.status();
                if !status.is_success() {
                    let text = response.text().await.unwrap_or_default();
                    return Err(AttemptFailure::status(status.as_u16(), text));
                }
                let bytes = response.bytes().await.map_err(AttemptFailure::network)?;
                Ok(bytes.to_vec())
            };
            tokio::time::timeout(timeout, exchange)
                .await
                .unwrap_or_else(|_| Err(AttemptFailure::timeout(timeout)))
        })
        .await
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        match &self.api_key {
            Some(key) => request.header(AUTHORIZATION, format!("Bearer {key}")),
            None => request,
        }
    }

    async fn with_retries<T, F, Fut>(
        &self,
        endpoint: &str,
        max_attempts: u32,
        mut attempt_once: F,
    ) -> Result<T, UpstreamError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AttemptFailure>>,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let failure = match attempt_once().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(endpoint, attempt, "upstream call recovered");
                    }
                    return Ok(value);
                }
                Err(failure) => failure,
            };
            warn!(
                endpoint,
                attempt,
                max_attempts,
                status = ?failure.status,
                cause = %failure.cause,
                "upstream attempt failed"
            );
            if attempt >= max_attempts {
                return Err(UpstreamError {
                    endpoint: endpoint.to_string(),
                    attempts: attempt,
                    status: failure.status,
                    body: failure.body,
                    cause: failure.cause,
                });
            }
            tokio::time::sleep(self.policy.backoff(attempt)).await;
            attempt += 1;
        }
    }
}
