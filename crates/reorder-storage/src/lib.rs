//! Persisted stores and HTTP fetch utilities for the reorder watch.

pub mod memory;
pub mod postgres;
pub mod store;

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub use memory::{MemoryReportStore, MemorySaleStore, MemorySyncCursor};
pub use postgres::{PgReportStore, PgSaleStore, PgSyncCursor};
pub use store::{ReportStore, SaleStore, StoreError, Stores, SyncCursor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
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
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// HTTP basic credentials sent with every request.
#[derive(Debug, Clone)]
pub struct BasicAuth {
    pub username: String,
    pub password: Option<String>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response body is not valid json: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET `url` with `query` and decode the body as JSON.
    ///
    /// Retryable statuses and connection errors are retried per the backoff
    /// policy; anything else, or the last failed attempt, is returned as is.
    pub async fn get_json(
        &self,
        url: &str,
        query: &[(String, String)],
        auth: Option<&BasicAuth>,
    ) -> Result<JsonValue, FetchError> {
        let span = info_span!("http_fetch", url);
        self.get_json_inner(url, query, auth).instrument(span).await
    }

    async fn get_json_inner(
        &self,
        url: &str,
        query: &[(String, String)],
        auth: Option<&BasicAuth>,
    ) -> Result<JsonValue, FetchError> {
        let mut attempt = 0usize;
        loop {
            let mut request = self.client.get(url).query(query);
            if let Some(auth) = auth {
                request = request.basic_auth(&auth.username, auth.password.as_ref());
            }

            let can_retry = attempt < self.backoff.max_retries;
            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?;
                        return Ok(serde_json::from_slice(&body)?);
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        debug!(status = status.as_u16(), attempt, "retrying after status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        debug!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
