use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use dirscout_adapters::AdapterConfig;
use dirscout_storage::{BackoffPolicy, HttpClientConfig, DEFAULT_USER_AGENT};
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Required for persisting runs; dry runs fall back to an in-memory store.
    pub database_url: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub rate_limit_secs: f64,
    pub workspace_root: PathBuf,
    pub run_deadline_secs: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout_secs: 15,
            rate_limit_secs: 2.0,
            workspace_root: PathBuf::from("."),
            run_deadline_secs: None,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            user_agent: std::env::var("DIRSCOUT_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("DIRSCOUT_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            rate_limit_secs: std::env::var("DIRSCOUT_RATE_LIMIT_SECS")
                .ok()
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| v.is_finite() && *v >= 0.0)
                .unwrap_or(defaults.rate_limit_secs),
            workspace_root: std::env::var("DIRSCOUT_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            run_deadline_secs: std::env::var("DIRSCOUT_RUN_DEADLINE_SECS")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
            min_interval: seconds(self.rate_limit_secs),
            backoff: BackoffPolicy::default(),
        }
    }
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("parsing source registry")
    }

    /// `<workspace_root>/sources.yaml`.
    pub async fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join("sources.yaml");
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn get(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub category_slug: String,
    #[serde(default)]
    pub rate_limit_seconds: Option<f64>,
    #[serde(default)]
    pub fallback_country: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(flatten)]
    pub adapter: AdapterConfig,
}

impl SourceConfig {
    pub fn run_config(&self, sync: &SyncConfig) -> RunConfig {
        RunConfig {
            category_slug: self.category_slug.clone(),
            source_name: self.display_name.clone(),
            rate_limit: seconds(self.rate_limit_seconds.unwrap_or(sync.rate_limit_secs)),
            limit: None,
            dry_run: false,
            fallback_country: self.fallback_country.clone(),
            deadline: sync.run_deadline_secs.map(Duration::from_secs),
        }
    }
}

/// Options for one orchestrator run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub category_slug: String,
    /// Label used in logs and reports.
    pub source_name: String,
    /// Minimum interval between requests to one domain.
    pub rate_limit: Duration,
    pub limit: Option<usize>,
    pub dry_run: bool,
    pub fallback_country: Option<String>,
    pub deadline: Option<Duration>,
}

impl RunConfig {
    pub fn new(category_slug: &str, source_name: &str) -> Self {
        Self {
            category_slug: category_slug.to_string(),
            source_name: source_name.to_string(),
            rate_limit: Duration::from_secs(2),
            limit: None,
            dry_run: false,
            fallback_country: None,
            deadline: None,
        }
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: Duration) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_fallback_country(mut self, country: Option<String>) -> Self {
        self.fallback_country = country;
        self
    }
}
