//! Polite HTTP GETs for open-data endpoints: bounded concurrency overall and per
//! source, optional request pacing, and retries for transient failures.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

/// Server errors and throttling are worth another attempt; other statuses are final.
pub fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

pub fn is_transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): doubles each time, capped.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Minimum spacing between request starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub interval: Duration,
}

impl RateLimit {
    pub fn per_second(requests: u32) -> Self {
        Self {
            interval: Duration::from_secs(1) / requests.max(1),
        }
    }
}

#[derive(Debug)]
struct Pacer {
    interval: Duration,
    next_start: Mutex<Instant>,
}

impl Pacer {
    fn new(limit: RateLimit) -> Self {
        Self {
            interval: limit.interval,
            next_start: Mutex::new(Instant::now()),
        }
    }

    /// Reserves the next start slot, then sleeps until it arrives.
    async fn wait_turn(&self) {
        let slot = {
            let mut next = self.next_start.lock().await;
            let slot = (*next).max(Instant::now());
            *next = slot + self.interval;
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub max_in_flight_per_source: usize,
    pub retry: RetryPolicy,
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            max_in_flight: 8,
            max_in_flight_per_source: 1,
            retry: RetryPolicy::default(),
            rate_limit: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PageResponse {
    pub url: String,
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
    #[error("{url} answered {status}")]
    Status { status: u16, url: String },
    #[error("request limiter shut down")]
    LimiterClosed,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Semaphore,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    pacer: Option<Pacer>,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }
        Ok(Self {
            client: builder.build().context("building http client")?,
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            per_source_limit: config.max_in_flight_per_source.max(1),
            per_source: Mutex::new(HashMap::new()),
            pacer: config.rate_limit.map(Pacer::new),
            retry: config.retry,
        })
    }

    async fn source_gate(&self, source_id: &str) -> Arc<Semaphore> {
        let mut gates = self.per_source.lock().await;
        Arc::clone(
            gates
                .entry(source_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit))),
        )
    }

    /// GETs one page. Only a 2xx body is returned; anything else that outlives the
    /// retry budget is an error.
    pub async fn get_page(&self, run_id: Uuid, source_id: &str, url: &str) -> Result<PageResponse, FetchError> {
        let gate = self.source_gate(source_id).await;
        let _source_permit = gate.acquire().await.map_err(|_| FetchError::LimiterClosed)?;
        let _permit = self.in_flight.acquire().await.map_err(|_| FetchError::LimiterClosed)?;

        let span = info_span!("http_get", %run_id, source_id, url);
        self.get_with_retries(url).instrument(span).await
    }

    async fn get_with_retries(&self, url: &str) -> Result<PageResponse, FetchError> {
        let mut retry = 0u32;
        loop {
            if let Some(pacer) = &self.pacer {
                pacer.wait_turn().await;
            }
            let failure = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let url = resp.url().to_string();
                    let body = resp
                        .bytes()
                        .await
                        .map_err(|source| FetchError::Request {
                            url: url.clone(),
                            source,
                        })?
                        .to_vec();
                    debug!(bytes = body.len(), "page received");
                    return Ok(PageResponse { url, body });
                }
                Ok(resp) => {
                    let status = resp.status();
                    let err = FetchError::Status {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    };
                    (is_transient_status(status), err)
                }
                Err(source) => (
                    is_transient_error(&source),
                    FetchError::Request {
                        url: url.to_string(),
                        source,
                    },
                ),
            };

            match failure {
                (true, err) if retry < self.retry.retries => {
                    let delay = self.retry.delay(retry);
                    warn!(error = %err, retry, ?delay, "transient failure; retrying");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                (_, err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_until_capped() {
        let policy = RetryPolicy {
            retries: 6,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(1),
        };
        let delays: Vec<_> = (0..5).map(|r| policy.delay(r)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(250),
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(1),
                Duration::from_secs(1),
            ]
        );
        assert_eq!(policy.delay(40), Duration::from_secs(1));
    }

    #[test]
    fn throttling_and_server_errors_are_transient() {
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_transient_status(StatusCode::BAD_GATEWAY));
        assert!(!is_transient_status(StatusCode::NOT_FOUND));
        assert!(!is_transient_status(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn rate_limit_spacing() {
        assert_eq!(RateLimit::per_second(4).interval, Duration::from_millis(250));
        assert_eq!(RateLimit::per_second(0).interval, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn pacer_spaces_request_starts() {
        let pacer = Pacer::new(RateLimit::per_second(20));
        let start = Instant::now();
        pacer.wait_turn().await;
        pacer.wait_turn().await;
        pacer.wait_turn().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn unreachable_host_reports_the_url() {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(2),
            retry: RetryPolicy {
                retries: 0,
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();
        let err = http
            .get_page(Uuid::new_v4(), "pluto", "http://127.0.0.1:9/query")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("http://127.0.0.1:9/query"));
    }
}
