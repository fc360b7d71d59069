//! robots.txt rules for one domain, parsed with `texting_robots`.

use std::fmt;
use std::time::Duration;

use texting_robots::Robot;
use tracing::warn;

/// Longest `Crawl-delay` honoured; anything larger is capped to this.
pub const MAX_CRAWL_DELAY: Duration = Duration::from_secs(60);

enum Policy {
    AllowAll,
    DisallowAll,
    Parsed(Robot),
}

/// What robots.txt permits for our user agent on one domain.
pub struct RobotsRules {
    policy: Policy,
}

impl RobotsRules {
    /// No restrictions; used when robots.txt is absent or unreachable.
    pub fn allow_all() -> Self {
        Self { policy: Policy::AllowAll }
    }

    /// Everything blocked; used when robots.txt itself is access-restricted.
    pub fn disallow_all() -> Self {
        Self {
            policy: Policy::DisallowAll,
        }
    }

    /// Rules from `txt` for the product token of `user_agent` (the part
    /// before the first `/`). An unparseable file allows everything.
    pub fn parse(txt: &str, user_agent: &str) -> Self {
        let token = user_agent.split('/').next().unwrap_or_default().trim();
        let agent = if token.is_empty() { user_agent } else { token };
        match Robot::new(agent, txt.as_bytes()) {
            Ok(robot) => Self {
                policy: Policy::Parsed(robot),
            },
            Err(err) => {
                warn!(error = %err, "unparseable robots.txt; allowing domain");
                Self::allow_all()
            }
        }
    }

    /// Whether `url` (absolute, or a path) may be fetched.
    pub fn is_allowed(&self, url: &str) -> bool {
        match &self.policy {
            Policy::AllowAll => true,
            Policy::DisallowAll => false,
            Policy::Parsed(robot) => robot.allowed(url),
        }
    }

    /// Raw `Crawl-delay` in seconds, as written.
    pub fn crawl_delay(&self) -> Option<f64> {
        match &self.policy {
            Policy::Parsed(robot) => robot.delay.map(f64::from),
            _ => None,
        }
    }

    /// `Crawl-delay` as a wait, capped at [`MAX_CRAWL_DELAY`].
    pub fn crawl_interval(&self) -> Duration {
        self.crawl_delay().map(capped_crawl_delay).unwrap_or_default()
    }

    pub fn sitemaps(&self) -> &[String] {
        match &self.policy {
            Policy::Parsed(robot) => &robot.sitemaps,
            _ => &[],
        }
    }
}

impl fmt::Debug for RobotsRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let policy = match self.policy {
            Policy::AllowAll => "allow_all",
            Policy::DisallowAll => "disallow_all",
            Policy::Parsed(_) => "parsed",
        };
        f.debug_struct("RobotsRules")
            .field("policy", &policy)
            .field("crawl_delay", &self.crawl_delay())
            .finish()
    }
}

/// Seconds to a [`Duration`]: zero for NaN or non-positive values, and
/// [`MAX_CRAWL_DELAY`] for anything larger, including values no `Duration` holds.
pub fn capped_crawl_delay(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    match Duration::try_from_secs_f64(secs) {
        Ok(delay) => delay.min(MAX_CRAWL_DELAY),
        Err(_) => MAX_CRAWL_DELAY,
    }
}
