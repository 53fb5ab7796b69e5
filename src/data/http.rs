use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, RequestBuilder};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use crate::data::auth::AuthConfigError;
use crate::monitoring::metrics;

/// Provider call failure, classified by whether retrying can help
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Transient fetch error: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Permanent fetch error (status {status:?}): {message}")]
    Permanent {
        status: Option<u16>,
        message: String,
    },

    #[error("Auth config error: {0}")]
    Auth(#[from] AuthConfigError),

    #[error("Request cancelled")]
    Cancelled,
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }

    pub fn transient(message: impl Into<String>) -> Self {
        FetchError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn permanent(status: Option<u16>, message: impl Into<String>) -> Self {
        FetchError::Permanent {
            status,
            message: message.into(),
        }
    }

    /// 408, 429 and 5xx are worth retrying; any other non-success status is not
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        let message = format!("HTTP {}: {}", status, truncate(body, 200));
        if status == 408 || status == 429 || (500..600).contains(&status) {
            FetchError::Transient { message, retry_after }
        } else {
            FetchError::Permanent {
                status: Some(status),
                message,
            }
        }
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_builder() {
            FetchError::permanent(None, format!("Invalid request: {}", e))
        } else {
            FetchError::transient(format!("Network error: {}", e))
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub retry_after: Option<Duration>,
    pub body: String,
}

impl HttpResponse {
    /// Body of a 2xx response, or the classified error
    pub fn into_success_body(self) -> Result<String, FetchError> {
        if (200..300).contains(&self.status) {
            Ok(self.body)
        } else {
            Err(FetchError::from_status(self.status, &self.body, self.retry_after))
        }
    }
}

/// Seam between provider clients and the network
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<HttpResponse, FetchError>;

    async fn post_json(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &serde_json::Value,
    ) -> Result<HttpResponse, FetchError>;
}

pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    async fn execute(request: RequestBuilder) -> Result<HttpResponse, FetchError> {
        let response = request.send().await.map_err(FetchError::from_reqwest)?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let body = response.text().await.map_err(FetchError::from_reqwest)?;

        Ok(HttpResponse {
            status,
            retry_after,
            body,
        })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<HttpResponse, FetchError> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        Self::execute(request).await
    }

    async fn post_json(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &serde_json::Value,
    ) -> Result<HttpResponse, FetchError> {
        let mut request = self.client.post(url).json(body);
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        Self::execute(request).await
    }
}

/// Retry-After in delta-seconds form; HTTP-date hints are ignored
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Exponential backoff for transient failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    /// Extra random delay as a fraction of the backoff, 0.0 disables
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            max_attempts: 5,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based): base * 2^(attempt-1), capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        let delay = if self.jitter > 0.0 {
            let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
            delay.mul_f64(1.0 + extra)
        } else {
            delay
        };
        delay.min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails permanently, exhausts the policy or is cancelled.
///
/// A provider `retry_after` hint is honored as a minimum delay.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            result = op() => result,
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !err.is_transient() {
            return Err(err);
        }

        if attempt >= policy.max_attempts {
            warn!(what, attempts = attempt, error = %err, "Retry budget exhausted");
            return Err(err);
        }

        let mut delay = policy.backoff(attempt);
        if let FetchError::Transient {
            retry_after: Some(hint),
            ..
        } = &err
        {
            delay = delay.max(*hint);
        }

        warn!(
            what,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Transient failure, backing off"
        );
        metrics::record_fetch_retry();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
