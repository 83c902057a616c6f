//! HTTP transport shared by the Zabbix and Cachet clients
//!
//! Classifies every failure into the bridge error taxonomy and retries the
//! retryable ones with exponential backoff.

use crate::errors::{BridgeError, Result};
use reqwest::{Client, Method, Response, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Which failures a request may be retried on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Reads and idempotent writes: retry anything retryable
    Always,
    /// Creates: only retry when the server told us it did not process the request
    RateLimitOnly,
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub verify_tls: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_backoff_ms: 1000,
            verify_tls: true,
        }
    }
}

/// JSON-over-HTTP transport with bearer auth and retries
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    timeout: Duration,
    max_retries: u32,
    retry_backoff_ms: u64,
    bearer_token: Arc<RwLock<Option<String>>>,
    metrics: Arc<TransportMetrics>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, options: TransportOptions) -> Result<Self> {
        let client = Client::builder()
            .timeout(options.timeout)
            .danger_accept_invalid_certs(!options.verify_tls)
            .user_agent(format!("zabbix_cachet/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BridgeError::Config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: options.timeout,
            max_retries: options.max_retries,
            retry_backoff_ms: options.retry_backoff_ms,
            bearer_token: Arc::new(RwLock::new(None)),
            metrics: Arc::new(TransportMetrics::default()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Same client and retry settings, but never sends the bearer token
    pub fn anonymous(&self) -> Self {
        Self {
            bearer_token: Arc::new(RwLock::new(None)),
            ..self.clone()
        }
    }

    pub async fn set_bearer_token(&self, token: Option<String>) {
        *self.bearer_token.write().await = token;
    }

    pub async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        self.send(Method::GET, path, query, None, RetryPolicy::Always).await
    }

    pub async fn post(&self, path: &str, body: &Value, policy: RetryPolicy) -> Result<Value> {
        self.send(Method::POST, path, &[], Some(body), policy).await
    }

    pub async fn put(&self, path: &str, body: &Value) -> Result<Value> {
        self.send(Method::PUT, path, &[], Some(body), RetryPolicy::Always).await
    }

    /// Send a request, retrying per `policy`
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
        policy: RetryPolicy,
    ) -> Result<Value> {
        let url = self.url(path);
        let mut attempt = 0;

        loop {
            let started = std::time::Instant::now();
            let result = self.send_attempt(method.clone(), &url, query, body).await;
            self.metrics.record(result.is_ok(), started.elapsed()).await;

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let retry_allowed = match policy {
                RetryPolicy::Always => err.is_retryable(),
                RetryPolicy::RateLimitOnly => matches!(err, BridgeError::RateLimited(_)),
            };

            attempt += 1;
            if !retry_allowed || attempt > self.max_retries {
                return Err(err);
            }

            let backoff_ms = backoff_delay_ms(self.retry_backoff_ms, attempt);
            let delay_ms = backoff_ms.saturating_add(rand::random_range(0..=backoff_ms / 4));
            warn!(
                "{} {} failed (attempt {}), retrying in {}ms: {}",
                method, url, attempt, delay_ms, err
            );
            sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    async fn send_attempt(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value> {
        debug!("Sending {} {}", method, url);

        let mut request = self
            .client
            .request(method, url)
            .header(reqwest::header::ACCEPT, "application/json");
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        if let Some(token) = self.bearer_token.read().await.as_deref() {
            request = request.bearer_auth(token);
        }

        let response = timeout(self.timeout, request.send())
            .await
            .map_err(|_| BridgeError::UpstreamUnavailable(format!("request to {} timed out", url)))?
            .map_err(|e| BridgeError::UpstreamUnavailable(format!("{}: {}", url, e)))?;

        handle_response(response, url).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub async fn metrics(&self) -> TransportMetricsSnapshot {
        self.metrics.snapshot().await
    }
}

/// Map the HTTP status onto the error taxonomy and decode a successful body
async fn handle_response(response: Response, url: &str) -> Result<Value> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| BridgeError::UpstreamUnavailable(format!("{}: {}", url, e)))?;

    if status.is_success() {
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        return serde_json::from_str(&body).map_err(|e| {
            BridgeError::UpstreamProtocolError(format!("invalid JSON from {}: {}", url, e))
        });
    }

    Err(classify_status(status, url, &body))
}

/// Longest wait between two attempts, before jitter
pub const MAX_BACKOFF_MS: u64 = 60_000;

/// Exponential delay before retry `attempt` (1-based), capped at `MAX_BACKOFF_MS`
pub fn backoff_delay_ms(base_ms: u64, attempt: u32) -> u64 {
    base_ms
        .saturating_mul(2_u64.saturating_pow(attempt.saturating_sub(1)))
        .min(MAX_BACKOFF_MS)
}

pub fn classify_status(status: StatusCode, url: &str, body: &str) -> BridgeError {
    let message = format!("{} returned {}: {}", url, status, body);
    match status.as_u16() {
        429 => BridgeError::RateLimited(message),
        400..=499 => BridgeError::UpstreamRejected(message),
        500..=599 => BridgeError::UpstreamUnavailable(message),
        _ => BridgeError::UpstreamProtocolError(message),
    }
}

/// Request outcome counters
#[derive(Debug, Default)]
struct TransportMetrics {
    attempts: RwLock<u64>,
    successes: RwLock<u64>,
    failures: RwLock<u64>,
    total_duration: RwLock<Duration>,
}

impl TransportMetrics {
    async fn record(&self, success: bool, duration: Duration) {
        *self.attempts.write().await += 1;
        if success {
            *self.successes.write().await += 1;
        } else {
            *self.failures.write().await += 1;
        }
        *self.total_duration.write().await += duration;
    }

    async fn snapshot(&self) -> TransportMetricsSnapshot {
        let attempts = *self.attempts.read().await;
        let successes = *self.successes.read().await;
        let failures = *self.failures.read().await;
        let total_duration = *self.total_duration.read().await;

        let success_rate = if attempts > 0 {
            (successes as f64 / attempts as f64) * 100.0
        } else {
            0.0
        };

        let avg_duration_ms = if attempts > 0 {
            (total_duration.as_millis() / attempts as u128) as u64
        } else {
            0
        };

        TransportMetricsSnapshot {
            attempts,
            successes,
            failures,
            success_rate,
            avg_duration_ms,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportMetricsSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub avg_duration_ms: u64,
}
