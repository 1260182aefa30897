//! Rate-limited HTTP fetcher
//!
//! Every request attempt passes through a shared [`RateLimiter`]: a concurrency
//! permit is held while the request is in flight, and each attempt consumes a
//! slot of the rolling one-minute window. Timeouts, connection failures, 429
//! and 5xx are retried with jittered exponential backoff (or the server's
//! Retry-After). When attempts run out the last response is returned so the
//! caller can still record its status.

pub mod limiter;
pub mod retry;

pub use limiter::{RateLimiter, RequestPermit};
pub use retry::{classify_status, AttemptClass, RetryPolicy};

use crate::error::{BronzeError, Result};
use chrono::Utc;
use reqwest::header::{ACCEPT, RETRY_AFTER};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_USER_AGENT: &str = "SASP-ETL/1.0";

/// A response that ended the retry loop
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub url: String,
    pub status: u16,
    pub body: Vec<u8>,
    /// Attempts made, including this one
    pub attempts: u32,
}

impl FetchResponse {
    pub fn class(&self) -> AttemptClass {
        classify_status(self.status)
    }

    pub fn json(&self) -> std::result::Result<Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request to {url} failed after {attempts} attempt(s): {source}")]
    Transport {
        url: String,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    #[error("rate limiter closed")]
    LimiterClosed(#[from] tokio::sync::AcquireError),
}

/// HTTP client settings
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub user_agent: String,
    /// Per-request timeout
    pub timeout: Duration,
    pub max_concurrent: usize,
    pub requests_per_minute: usize,
    pub retry: RetryPolicy,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(30),
            max_concurrent: 5,
            requests_per_minute: 20,
            retry: RetryPolicy::default(),
        }
    }
}

pub struct RateLimitedFetcher {
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
}

impl RateLimitedFetcher {
    pub fn new(config: &FetcherConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .build()
            .map_err(BronzeError::Http)?;
        let limiter = Arc::new(RateLimiter::new(
            config.max_concurrent,
            config.requests_per_minute,
        ));
        Ok(Self::with_client(client, limiter, config.retry.clone()))
    }

    pub fn with_client(client: reqwest::Client, limiter: Arc<RateLimiter>, retry: RetryPolicy) -> Self {
        Self {
            client,
            limiter,
            retry,
        }
    }

    /// GET `url`, retrying transient failures
    ///
    /// Returns the final response whatever its status; errors only when no
    /// response was ever received.
    pub async fn fetch(&self, url: &str) -> std::result::Result<FetchResponse, FetchError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.attempt(url).await {
                Ok(raw) => {
                    let response = FetchResponse {
                        url: url.to_string(),
                        status: raw.status,
                        body: raw.body,
                        attempts: attempt,
                    };
                    if response.class() != AttemptClass::Retryable || attempt >= max_attempts {
                        debug!(url = %url, status = response.status, attempts = attempt, "Fetch finished");
                        return Ok(response);
                    }

                    let delay = self.retry.delay_for(attempt, raw.retry_after);
                    warn!(
                        url = %url,
                        status = response.status,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        honoring_retry_after = raw.retry_after.is_some(),
                        "Retryable response, backing off"
                    );
                    tokio::time::sleep(delay).await;
                },
                Err(AttemptError::Limiter(e)) => return Err(FetchError::LimiterClosed(e)),
                Err(AttemptError::Http(e)) => {
                    if !is_retryable_error(&e) || attempt >= max_attempts {
                        return Err(FetchError::Transport {
                            url: url.to_string(),
                            attempts: attempt,
                            source: e,
                        });
                    }

                    let delay = self.retry.delay_for(attempt, None);
                    warn!(
                        url = %url,
                        error = %e,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Request failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                },
            }
        }
    }

    /// One request under a limiter permit; the permit is released once the body is read
    async fn attempt(&self, url: &str) -> std::result::Result<RawResponse, AttemptError> {
        let _permit = self.limiter.acquire().await?;

        let response = self
            .client
            .get(url)
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| retry::parse_retry_after(v, Utc::now()));
        let body = response.bytes().await?.to_vec();

        Ok(RawResponse {
            status,
            retry_after,
            body,
        })
    }
}

struct RawResponse {
    status: u16,
    retry_after: Option<Duration>,
    body: Vec<u8>,
}

#[derive(Error, Debug)]
enum AttemptError {
    #[error(transparent)]
    Limiter(#[from] tokio::sync::AcquireError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

fn is_retryable_error(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
}
