//! Per-domain courtesy: robots.txt compliance and minimum request spacing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::robots::{RobotsRules, MAX_CRAWL_DELAY};

#[derive(Debug, Default)]
struct DomainState {
    last_request: Mutex<Option<Instant>>,
    robots: OnceCell<RobotsRules>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolitenessStats {
    pub rate_limit_delays: u64,
    pub robots_blocked: u64,
}

/// Gate consulted before every outbound request.
///
/// State is an arena keyed by domain (`host[:port]`). Each domain has its own
/// timestamp lock, so waits for different domains never block each other
/// while two callers hitting the same domain are serialized.
#[derive(Debug)]
pub struct PolitenessGate {
    client: reqwest::Client,
    user_agent: String,
    min_interval: Duration,
    domains: Mutex<HashMap<String, Arc<DomainState>>>,
    rate_limit_delays: AtomicU64,
    robots_blocked: AtomicU64,
}

impl PolitenessGate {
    pub fn new(client: reqwest::Client, user_agent: impl Into<String>, min_interval: Duration) -> Self {
        Self {
            client,
            user_agent: user_agent.into(),
            min_interval,
            domains: Mutex::new(HashMap::new()),
            rate_limit_delays: AtomicU64::new(0),
            robots_blocked: AtomicU64::new(0),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn stats(&self) -> PolitenessStats {
        PolitenessStats {
            rate_limit_delays: self.rate_limit_delays.load(Ordering::Relaxed),
            robots_blocked: self.robots_blocked.load(Ordering::Relaxed),
        }
    }

    async fn domain(&self, domain: &str) -> Arc<DomainState> {
        let mut map = self.domains.lock().await;
        map.entry(domain.to_string())
            .or_insert_with(|| Arc::new(DomainState::default()))
            .clone()
    }

    /// Whether robots.txt for the URL's domain permits fetching it.
    ///
    /// robots.txt is fetched lazily, once per domain. Unparseable URLs are
    /// reported as allowed; the request itself will fail later.
    pub async fn allowed(&self, url: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return true;
        };
        let Some(domain) = domain_of(&parsed) else {
            return true;
        };
        let state = self.domain(&domain).await;
        let rules = state
            .robots
            .get_or_init(|| self.load_robots(&parsed, &domain))
            .await;

        let allowed = rules.is_allowed(parsed.as_str());
        if !allowed {
            warn!(url, "blocked by robots.txt");
            self.robots_blocked.fetch_add(1, Ordering::Relaxed);
        }
        allowed
    }

    async fn load_robots(&self, page: &Url, domain: &str) -> RobotsRules {
        let robots_url = format!("{}://{}/robots.txt", page.scheme(), domain);
        let response = match self.client.get(&robots_url).send().await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(domain, error = %err, "robots.txt unreachable; allowing domain");
                return RobotsRules::allow_all();
            }
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            warn!(domain, %status, "robots.txt is access-restricted; treating domain as disallowed");
            return RobotsRules::disallow_all();
        }
        if !status.is_success() {
            debug!(domain, %status, "no robots.txt; allowing domain");
            return RobotsRules::allow_all();
        }

        match response.text().await {
            Ok(body) => {
                let rules = RobotsRules::parse(&body, &self.user_agent);
                if let Some(secs) = rules.crawl_delay().filter(|secs| *secs > MAX_CRAWL_DELAY.as_secs_f64()) {
                    warn!(
                        domain,
                        crawl_delay = secs,
                        max_secs = MAX_CRAWL_DELAY.as_secs(),
                        "robots.txt crawl-delay capped"
                    );
                }
                rules
            }
            Err(err) => {
                warn!(domain, error = %err, "failed reading robots.txt body; allowing domain");
                RobotsRules::allow_all()
            }
        }
    }

    /// Block until the gate's minimum interval has elapsed for the URL's domain.
    pub async fn wait(&self, url: &str) -> bool {
        self.wait_at_least(url, self.min_interval).await
    }

    /// Like [`wait`](Self::wait) with a caller-chosen interval.
    ///
    /// The effective interval is the larger of `interval` and the domain's
    /// robots.txt `Crawl-delay`. Returns whether the caller was delayed.
    pub async fn wait_at_least(&self, url: &str, interval: Duration) -> bool {
        let Some(domain) = Url::parse(url).ok().as_ref().and_then(domain_of) else {
            return false;
        };
        let state = self.domain(&domain).await;

        let crawl_delay = state
            .robots
            .get()
            .map(RobotsRules::crawl_interval)
            .unwrap_or_default();
        let interval = interval.max(crawl_delay);

        // Held across the sleep so a second caller for this domain queues behind us.
        let mut last = state.last_request.lock().await;
        let mut delayed = false;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < interval {
                let pause = interval - elapsed;
                debug!(domain, pause_ms = pause.as_millis() as u64, "rate limiting");
                tokio::time::sleep(pause).await;
                self.rate_limit_delays.fetch_add(1, Ordering::Relaxed);
                delayed = true;
            }
        }
        *last = Some(Instant::now());
        delayed
    }
}

/// `host[:port]` of a URL, lowercased.
pub fn domain_of(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_ascii_lowercase();
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    })
}
