//! HTTP transport shared by the directory listing and the JSON API fetcher.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 5xx, 429 and 408 are worth another attempt; other statuses are final.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => RetryDisposition::Retryable,
        s if s.is_server_error() => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// A server-provided `Retry-After` wins over the computed delay, within `max_delay`.
    fn delay_with_hint(&self, attempt: usize, hint: Option<Duration>) -> Duration {
        hint.map(|hint| hint.min(self.max_delay))
            .unwrap_or_else(|| self.delay_for_attempt(attempt))
    }
}

/// Parses a delta-seconds `Retry-After` header. HTTP-date values are ignored.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    /// Sent on every request. Some public data hosts answer 403 to anonymous agents.
    pub user_agent: String,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub pacing: Option<PacingConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: concat!("statsync/", env!("CARGO_PKG_VERSION")).to_string(),
            global_concurrency: 16,
            per_host_concurrency: 4,
            backoff: BackoffPolicy::default(),
            pacing: None,
        }
    }
}

/// At most `burst` requests back to back, then one per `interval`.
#[derive(Debug, Clone, Copy)]
pub struct PacingConfig {
    pub burst: u32,
    pub interval: Duration,
}

/// Request pacer based on a theoretical arrival time (GCRA).
#[derive(Debug)]
pub struct RequestPacer {
    interval: Duration,
    tolerance: Duration,
    arrival: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(config: PacingConfig) -> Self {
        Self {
            interval: config.interval,
            tolerance: config.interval.saturating_mul(config.burst.max(1) - 1),
            arrival: Mutex::new(None),
        }
    }

    /// Waits until the next request slot.
    pub async fn take(&self) {
        let start = {
            let mut arrival = self.arrival.lock().await;
            let now = Instant::now();
            let tat = arrival.unwrap_or(now).max(now);
            let earliest = tat.checked_sub(self.tolerance).unwrap_or(now);
            let start = earliest.max(now);
            *arrival = Some(tat.max(start) + self.interval);
            start
        };
        tokio::time::sleep_until(start.into()).await;
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

struct FailedAttempt {
    error: FetchError,
    disposition: RetryDisposition,
    retry_after: Option<Duration>,
}

/// Shared HTTP transport: bounded concurrency (global and per host), optional pacing,
/// and retries with exponential backoff for transient failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
    pacer: Option<RequestPacer>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_host_limit: config.per_host_concurrency.max(1),
            hosts: Mutex::new(HashMap::new()),
            pacer: config.pacing.map(RequestPacer::new),
            backoff: config.backoff,
        })
    }

    async fn host_limit(&self, host: &str) -> Arc<Semaphore> {
        self.hosts
            .lock()
            .await
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    /// GETs `url`, returning the body of a 2xx response. Any other final status is an error.
    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let host = host_of(url);
        let span = info_span!("http_fetch", url, host = host.as_str());
        self.fetch_with_retries(url, &host).instrument(span).await
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        host: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let host_limit = self.host_limit(host).await;
        let _host = host_limit.acquire().await.map_err(|_| FetchError::Closed)?;

        let mut attempt = 0usize;
        loop {
            if let Some(pacer) = &self.pacer {
                pacer.take().await;
            }
            let failed = match self.attempt(url).await {
                Ok(response) => return Ok(response),
                Err(failed) => failed,
            };
            if failed.disposition == RetryDisposition::NonRetryable
                || attempt >= self.backoff.max_retries
            {
                return Err(failed.error);
            }
            let delay = self.backoff.delay_with_hint(attempt, failed.retry_after);
            warn!(error = %failed.error, attempt, delay_ms = delay.as_millis() as u64, "retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn attempt(&self, url: &str) -> Result<FetchedResponse, FailedAttempt> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| FailedAttempt {
                disposition: classify_reqwest_error(&source),
                retry_after: None,
                error: FetchError::Request {
                    url: url.to_string(),
                    source,
                },
            })?;

        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(FailedAttempt {
                disposition: classify_status(status),
                retry_after: retry_after(response.headers()),
                error: FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                },
            });
        }

        let body = response.bytes().await.map_err(|source| FailedAttempt {
            disposition: classify_reqwest_error(&source),
            retry_after: None,
            error: FetchError::Request {
                url: final_url.clone(),
                source,
            },
        })?;
        debug!(status = status.as_u16(), bytes = body.len(), "fetched");
        Ok(FetchedResponse {
            status,
            final_url,
            body: body.to_vec(),
        })
    }
}

fn host_of(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(ToString::to_string))
        .unwrap_or_default()
}
