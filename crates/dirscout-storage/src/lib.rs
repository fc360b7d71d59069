//! Polite HTTP retrieval + the persistence contract for dirscout.

pub mod politeness;
pub mod postgres;
pub mod robots;
pub mod store;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};

pub use politeness::{PolitenessGate, PolitenessStats};
pub use postgres::PgStore;
pub use robots::{capped_crawl_delay, RobotsRules, MAX_CRAWL_DELAY};
pub use store::{ListingKey, ListingQuery, ListingStore, LocationQuery, MemoryStore, StoreError};

pub const CRATE_NAME: &str = "dirscout-storage";

pub const DEFAULT_USER_AGENT: &str = "dirscout-bot/0.1 (+https://github.com/dirscout)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Html,
    Json,
}

/// A fetched page or API response, consumed by extractors as text or JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub url: String,
    pub kind: DocumentKind,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

impl Document {
    pub fn html(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: DocumentKind::Html,
            body: body.into(),
            fetched_at: Utc::now(),
        }
    }

    pub fn json(url: impl Into<String>, value: &JsonValue) -> Self {
        Self {
            url: url.into(),
            kind: DocumentKind::Json,
            body: value.to_string(),
            fetched_at: Utc::now(),
        }
    }

    /// Parsed JSON body; `None` for HTML documents or malformed JSON.
    pub fn json_value(&self) -> Option<JsonValue> {
        match self.kind {
            DocumentKind::Json => serde_json::from_str(&self.body).ok(),
            DocumentKind::Html => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("blocked by robots.txt: {url}")]
    RobotsBlocked { url: String },
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("fetch failed for {url} after {attempts} attempt(s): {last_error}")]
    FetchFailed {
        url: String,
        attempts: usize,
        last_error: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Any client or server error status is worth another attempt.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_client_error() || status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_builder() || err.is_redirect() {
        RetryDisposition::NonRetryable
    } else {
        RetryDisposition::Retryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// `base * 2^attempt`, capped at `max_delay`; attempt indices start at 0.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub min_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            min_interval: Duration::from_secs(2),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Default)]
struct FetchCounters {
    rate_limit_delays: AtomicU64,
    robots_blocked: AtomicU64,
}

/// HTTP client that consults a [`PolitenessGate`] before every request.
///
/// Cloning is cheap and clones share the client and gate. [`for_run`](Self::for_run)
/// hands a run its own interval and counters while still sharing the gate,
/// so parallel runs never burst the same domain.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    gate: Arc<PolitenessGate>,
    min_interval: Duration,
    backoff: BackoffPolicy,
    counters: Arc<FetchCounters>,
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

        let gate = Arc::new(PolitenessGate::new(
            client.clone(),
            config.user_agent,
            config.min_interval,
        ));

        Ok(Self {
            client,
            gate,
            min_interval: config.min_interval,
            backoff: config.backoff,
            counters: Arc::default(),
        })
    }

    /// Handle for one orchestrator run: own interval and counters, shared gate.
    pub fn for_run(&self, min_interval: Duration) -> Self {
        Self {
            client: self.client.clone(),
            gate: self.gate.clone(),
            min_interval,
            backoff: self.backoff,
            counters: Arc::default(),
        }
    }

    pub fn gate(&self) -> &PolitenessGate {
        &self.gate
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Politeness counters accumulated through this handle.
    pub fn stats(&self) -> PolitenessStats {
        PolitenessStats {
            rate_limit_delays: self.counters.rate_limit_delays.load(Ordering::Relaxed),
            robots_blocked: self.counters.robots_blocked.load(Ordering::Relaxed),
        }
    }

    pub async fn fetch(&self, url: &str) -> Result<Document, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_inner(url).instrument(span).await
    }

    async fn fetch_inner(&self, url: &str) -> Result<Document, FetchError> {
        if let Err(err) = url::Url::parse(url) {
            return Err(FetchError::InvalidUrl {
                url: url.to_string(),
                reason: err.to_string(),
            });
        }

        if !self.gate.allowed(url).await {
            self.counters.robots_blocked.fetch_add(1, Ordering::Relaxed);
            return Err(FetchError::RobotsBlocked {
                url: url.to_string(),
            });
        }

        if self.gate.wait_at_least(url, self.min_interval).await {
            self.counters.rate_limit_delays.fetch_add(1, Ordering::Relaxed);
        }

        let max_attempts = self.backoff.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            let disposition = match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let is_json = resp
                            .headers()
                            .get(CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .map(|v| v.to_ascii_lowercase().contains("json"))
                            .unwrap_or(false);
                        match resp.text().await {
                            Ok(body) => {
                                return Ok(Document {
                                    url: url.to_string(),
                                    kind: if is_json {
                                        DocumentKind::Json
                                    } else {
                                        DocumentKind::Html
                                    },
                                    body,
                                    fetched_at: Utc::now(),
                                });
                            }
                            Err(err) => {
                                last_error = format!("reading body: {err}");
                                classify_reqwest_error(&err)
                            }
                        }
                    } else {
                        last_error = format!("http status {}", status.as_u16());
                        classify_status(status)
                    }
                }
                Err(err) => {
                    last_error = err.to_string();
                    classify_reqwest_error(&err)
                }
            };

            warn!(
                url,
                attempt = attempt + 1,
                max_attempts,
                error = %last_error,
                "fetch attempt failed"
            );

            if disposition == RetryDisposition::NonRetryable {
                return Err(FetchError::FetchFailed {
                    url: url.to_string(),
                    attempts: attempt + 1,
                    last_error,
                });
            }
            if attempt + 1 < max_attempts {
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            }
        }

        Err(FetchError::FetchFailed {
            url: url.to_string(),
            attempts: max_attempts,
            last_error,
        })
    }
}
