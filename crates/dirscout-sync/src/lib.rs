//! Ingestion orchestration: enumerate, fetch, extract, classify, resolve,
//! dedupe and persist listings for one source at a time.

pub mod config;
pub mod dedup;
pub mod location;
pub mod report;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use dirscout_adapters::{AdapterError, RulesError, SourceAdapter, TaxonomyRules};
use dirscout_core::{
    CategoryDefinition, CustomFieldDefinition, CustomFieldValue, FieldValue, NewListing,
    ScrapeStatistics, StandardFields,
};
use dirscout_storage::{FetchError, HttpFetcher, ListingStore, MemoryStore, PgStore, StoreError};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{RunConfig, SourceConfig, SourceRegistry, SyncConfig};
pub use dedup::DeduplicationGuard;
pub use location::{parse_address, AddressComponents, LocationResolver, ResolverStats};
pub use report::{recent_runs, write_reports, DryRunRecord, RunReport, RunSummaryFile};

pub const CRATE_NAME: &str = "dirscout-sync";

/// Errors that abort a run before any URL is processed.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("category {slug:?} not found")]
    CategoryNotFound { slug: String },
    #[error("DATABASE_URL is not set; only --dry-run works without a database")]
    MissingCredentials,
    #[error("unknown source {0:?}")]
    UnknownSource(String),
    #[error(transparent)]
    Rules(#[from] RulesError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Per-listing failures; counted and logged, never fatal to the run.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("disallowed by robots.txt: {url}")]
    RobotsBlocked { url: String },
    #[error("fetching {url} failed: {reason}")]
    FetchFailed { url: String, reason: String },
    #[error("no business name found at {url}")]
    ParseFailed { url: String },
    #[error("persisting {business_name:?} from {url} failed: {source}")]
    PersistenceFailed {
        url: String,
        business_name: String,
        website: String,
        source: StoreError,
    },
}

impl IngestError {
    fn from_adapter(url: &str, err: AdapterError) -> Self {
        match err {
            AdapterError::Fetch(FetchError::RobotsBlocked { url }) => Self::RobotsBlocked { url },
            other => Self::FetchFailed {
                url: url.to_string(),
                reason: other.to_string(),
            },
        }
    }

    fn persistence(url: &str, fields: &StandardFields, source: StoreError) -> Self {
        Self::PersistenceFailed {
            url: url.to_string(),
            business_name: fields.business_name.clone(),
            website: fields.website.clone(),
            source,
        }
    }
}

#[derive(Debug)]
pub enum ListingOutcome {
    Saved { listing_id: Uuid, custom_fields: usize },
    DryRun { record: Box<DryRunRecord>, custom_fields: usize },
    Duplicate { matched_on: &'static str },
}

/// Collaborators shared by every run in the process.
///
/// The fetcher's politeness gate and the location resolver are shared, so
/// concurrent runs neither burst one domain nor race on location creation.
pub struct PipelineContext {
    pub store: Arc<dyn ListingStore>,
    pub fetcher: HttpFetcher,
    pub resolver: Mutex<LocationResolver>,
    pub workspace_root: PathBuf,
}

impl PipelineContext {
    pub fn new(store: Arc<dyn ListingStore>, fetcher: HttpFetcher, workspace_root: PathBuf) -> Self {
        let resolver = LocationResolver::new(store.clone());
        Self {
            store,
            fetcher,
            resolver: Mutex::new(resolver),
            workspace_root,
        }
    }

    /// Resolve against existing locations only; nothing is created.
    pub fn with_read_only_locations(self) -> Self {
        let resolver = self.resolver.into_inner().read_only(true);
        Self {
            resolver: Mutex::new(resolver),
            ..self
        }
    }

    /// Build the context for `sync`.
    ///
    /// With `DATABASE_URL` the Postgres store is used (locations read-only for
    /// dry runs). Without it only dry runs are possible, against an in-memory
    /// store seeded from the taxonomy files of every registered category.
    pub async fn from_config(
        sync: &SyncConfig,
        registry: &SourceRegistry,
        dry_run: bool,
    ) -> Result<Self, SetupError> {
        let fetcher = HttpFetcher::new(sync.http_client_config())?;
        let root = sync.workspace_root.clone();

        if sync.database_url.is_some() {
            let store = connect_store(sync).await?;
            let mut ctx = Self::new(store, fetcher, root);
            if dry_run {
                ctx = ctx.with_read_only_locations();
            }
            ctx.resolver.get_mut().warm().await?;
            return Ok(ctx);
        }

        if !dry_run {
            return Err(SetupError::MissingCredentials);
        }

        let store = MemoryStore::new();
        let slugs: BTreeSet<&str> = registry.sources.iter().map(|s| s.category_slug.as_str()).collect();
        for slug in slugs {
            let rules = TaxonomyRules::for_category(&root, slug)?;
            seed_category(&store, slug, &rules).await;
        }
        info!("no DATABASE_URL; dry run uses an in-memory store");
        Ok(Self::new(Arc::new(store), fetcher, root))
    }
}

/// The persistent store named by `DATABASE_URL`, without any HTTP setup.
pub async fn connect_store(sync: &SyncConfig) -> Result<Arc<dyn ListingStore>, SetupError> {
    let Some(database_url) = &sync.database_url else {
        return Err(SetupError::MissingCredentials);
    };
    Ok(Arc::new(PgStore::connect(database_url).await?))
}

/// Register `slug` and the taxonomy's custom fields in a memory store.
pub async fn seed_category(store: &MemoryStore, slug: &str, rules: &TaxonomyRules) -> CategoryDefinition {
    let category = store.add_category(slug, &rules.category.name).await;
    for def in rules.field_definitions(category.id) {
        store
            .add_custom_field(category.id, &def.field_name, def.field_type, def.options)
            .await;
    }
    category
}

/// Category-scoped state resolved once at the start of a run.
struct RunScope {
    category: CategoryDefinition,
    rules: TaxonomyRules,
    definitions: HashMap<String, CustomFieldDefinition>,
    fetcher: HttpFetcher,
    dedup: DeduplicationGuard,
}

pub struct IngestionOrchestrator {
    ctx: Arc<PipelineContext>,
    adapter: Arc<dyn SourceAdapter>,
    config: RunConfig,
}

impl IngestionOrchestrator {
    pub fn new(ctx: Arc<PipelineContext>, adapter: Arc<dyn SourceAdapter>, config: RunConfig) -> Self {
        Self { ctx, adapter, config }
    }

    /// One complete run. Only setup problems are errors; per-listing failures
    /// end up in the report's statistics.
    pub async fn run(&self) -> Result<RunReport, SetupError> {
        let span = info_span!(
            "ingest_run",
            source_id = self.adapter.source_id(),
            category = %self.config.category_slug
        );
        self.run_inner().instrument(span).await
    }

    async fn setup(&self) -> Result<RunScope, SetupError> {
        let slug = &self.config.category_slug;
        let category = self
            .ctx
            .store
            .category_by_slug(slug)
            .await?
            .ok_or_else(|| SetupError::CategoryNotFound { slug: slug.clone() })?;
        let rules = TaxonomyRules::for_category(&self.ctx.workspace_root, slug)?;
        let definitions: HashMap<_, _> = self
            .ctx
            .store
            .custom_fields(category.id)
            .await?
            .into_iter()
            .map(|def| (def.field_name.clone(), def))
            .collect();
        if definitions.is_empty() {
            warn!(category = %slug, "category has no custom field definitions");
        }

        Ok(RunScope {
            category,
            rules,
            definitions,
            fetcher: self.ctx.fetcher.for_run(self.config.rate_limit),
            dedup: DeduplicationGuard::new(self.ctx.store.clone()),
        })
    }

    async fn run_inner(&self) -> Result<RunReport, SetupError> {
        let scope = self.setup().await?;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let clock = Instant::now();
        let cfg = &self.config;

        info!(
            %run_id,
            source = %cfg.source_name,
            category = %cfg.category_slug,
            limit = ?cfg.limit,
            dry_run = cfg.dry_run,
            rate_limit_secs = cfg.rate_limit.as_secs_f64(),
            "starting ingestion run"
        );

        let mut urls = match self.adapter.listing_urls(&scope.fetcher).await {
            Ok(urls) => urls,
            Err(err) => {
                error!(error = %err, "could not enumerate listing urls");
                Vec::new()
            }
        };
        if let Some(limit) = cfg.limit {
            urls.truncate(limit);
        }
        let urls_enumerated = urls.len();
        info!(urls = urls_enumerated, "listing urls enumerated");

        let mut stats = ScrapeStatistics::default();
        let mut dry_run_records = Vec::new();

        for (index, url) in urls.iter().enumerate() {
            if cfg.deadline.is_some_and(|deadline| clock.elapsed() >= deadline) {
                warn!(processed = index, remaining = urls.len() - index, "run deadline exceeded");
                stats.deadline_exceeded = true;
                break;
            }
            debug!(url = %url, n = index + 1, of = urls.len(), "processing listing");

            match self.ingest_one(&scope, url, &mut stats).await {
                Ok(ListingOutcome::Saved { listing_id, custom_fields }) => {
                    stats.listings_saved += 1;
                    stats.custom_fields_populated += custom_fields as u64;
                    debug!(url = %url, %listing_id, custom_fields, "listing saved");
                }
                Ok(ListingOutcome::DryRun { record, custom_fields }) => {
                    stats.custom_fields_populated += custom_fields as u64;
                    dry_run_records.push(*record);
                }
                Ok(ListingOutcome::Duplicate { matched_on }) => {
                    stats.listings_skipped_duplicate += 1;
                    debug!(url = %url, matched_on, "duplicate listing skipped");
                }
                Err(err @ IngestError::RobotsBlocked { .. }) => {
                    warn!(url = %url, error = %err, "listing skipped");
                }
                Err(err @ IngestError::FetchFailed { .. }) => {
                    stats.listings_failed += 1;
                    warn!(url = %url, error = %err, "listing failed");
                }
                Err(err @ IngestError::ParseFailed { .. }) => {
                    stats.listings_failed += 1;
                    stats.parse_failures += 1;
                    warn!(url = %url, error = %err, "listing failed");
                }
                Err(IngestError::PersistenceFailed {
                    url,
                    business_name,
                    website,
                    source,
                }) => {
                    stats.listings_failed += 1;
                    error!(
                        url = %url,
                        business_name = %business_name,
                        website = %website,
                        error = %source,
                        "persisting listing failed"
                    );
                }
            }
        }

        let politeness = scope.fetcher.stats();
        stats.rate_limit_delays = politeness.rate_limit_delays;
        stats.robots_blocked = politeness.robots_blocked;
        let resolver = self.ctx.resolver.lock().await.stats();

        info!(
            %run_id,
            fetched = stats.listings_fetched,
            saved = stats.listings_saved,
            duplicates = stats.listings_skipped_duplicate,
            failed = stats.listings_failed,
            parse_failures = stats.parse_failures,
            locations_unresolved = stats.locations_unresolved,
            custom_fields = stats.custom_fields_populated,
            rate_limit_delays = stats.rate_limit_delays,
            robots_blocked = stats.robots_blocked,
            deadline_exceeded = stats.deadline_exceeded,
            location_cache_hits = resolver.cache_hits,
            location_cache_misses = resolver.cache_misses,
            locations_created = resolver.created_locations,
            address_parse_errors = resolver.parse_errors,
            location_cache_hit_rate = resolver.cache_hit_rate,
            "ingestion run finished"
        );

        let report = RunReport {
            run_id,
            source_id: self.adapter.source_id().to_string(),
            source_name: cfg.source_name.clone(),
            category_slug: cfg.category_slug.clone(),
            dry_run: cfg.dry_run,
            started_at,
            finished_at: Utc::now(),
            urls_enumerated,
            statistics: stats,
            resolver,
            dry_run_records,
        };
        match write_reports(&self.ctx.workspace_root, &report).await {
            Ok(dir) => info!(reports = %dir.display(), "run reports written"),
            Err(err) => warn!(error = %format!("{err:#}"), "could not write run reports"),
        }
        Ok(report)
    }

    async fn ingest_one(
        &self,
        scope: &RunScope,
        url: &str,
        stats: &mut ScrapeStatistics,
    ) -> Result<ListingOutcome, IngestError> {
        let doc = self
            .adapter
            .load(&scope.fetcher, url)
            .await
            .map_err(|err| IngestError::from_adapter(url, err))?;
        stats.listings_fetched += 1;

        let fields = self.adapter.extract_standard_fields(&doc, url);
        if !fields.has_identity() {
            return Err(IngestError::ParseFailed { url: url.to_string() });
        }
        let custom = self.adapter.extract_custom_fields(&doc, url, &scope.rules);

        let location_id = {
            let mut resolver = self.ctx.resolver.lock().await;
            resolver
                .resolve(
                    &fields.address,
                    fields.latitude,
                    fields.longitude,
                    self.config.fallback_country.as_deref(),
                )
                .await
                .unwrap_or_else(|err| {
                    warn!(url = %url, error = %err, "location lookup failed");
                    None
                })
        };
        if location_id.is_none() {
            stats.locations_unresolved += 1;
            debug!(url = %url, address = %fields.address, "location unresolved");
        }

        let matched = scope
            .dedup
            .find_match(&fields.website, &fields.phone, &fields.business_name, scope.category.id)
            .await
            .map_err(|source| IngestError::persistence(url, &fields, source))?;
        if let Some(matched_on) = matched {
            return Ok(ListingOutcome::Duplicate { matched_on });
        }

        let values = self.coerce_custom_fields(scope, &custom);

        if self.config.dry_run {
            let custom_fields = values.len();
            return Ok(ListingOutcome::DryRun {
                record: Box::new(DryRunRecord {
                    url: url.to_string(),
                    fields,
                    custom_fields: custom,
                    location_id,
                }),
                custom_fields,
            });
        }

        let listing = NewListing::from_fields(&fields, scope.category.id, location_id);
        let saved = self
            .ctx
            .store
            .insert_listing(&listing)
            .await
            .map_err(|source| IngestError::persistence(url, &fields, source))?;

        let rows: Vec<CustomFieldValue> = values
            .into_iter()
            .map(|(custom_field_id, value)| CustomFieldValue {
                listing_id: saved.id,
                custom_field_id,
                value,
            })
            .collect();
        if !rows.is_empty() {
            self.ctx
                .store
                .insert_custom_field_values(&rows)
                .await
                .map_err(|source| IngestError::persistence(url, &fields, source))?;
        }

        Ok(ListingOutcome::Saved {
            listing_id: saved.id,
            custom_fields: rows.len(),
        })
    }

    /// Typed values for every classified field the category defines.
    fn coerce_custom_fields(
        &self,
        scope: &RunScope,
        custom: &BTreeMap<String, FieldValue>,
    ) -> Vec<(Uuid, serde_json::Value)> {
        let mut values = Vec::with_capacity(custom.len());
        for (name, value) in custom {
            if value.is_empty() {
                continue;
            }
            let Some(def) = scope.definitions.get(name) else {
                warn!(field = %name, category = %scope.category.slug, "no definition for custom field; skipped");
                continue;
            };
            if let Some(json) = value.coerce(def.field_type) {
                values.push((def.id, json));
            }
        }
        values
    }
}

/// Build the adapter for `source` and run it.
pub async fn run_source(
    ctx: Arc<PipelineContext>,
    source: &SourceConfig,
    config: RunConfig,
) -> Result<RunReport, SetupError> {
    let adapter: Arc<dyn SourceAdapter> = Arc::from(source.adapter.build(&source.source_id)?);
    IngestionOrchestrator::new(ctx, adapter, config).run().await
}

/// Overrides applied to every source of a `run_all`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOverrides {
    pub limit: Option<usize>,
    pub dry_run: bool,
}

#[derive(Debug)]
pub struct SourceRunResult {
    pub source_id: String,
    pub result: Result<RunReport, SetupError>,
}

/// Run every enabled source concurrently, one task per source.
pub async fn run_all(
    ctx: Arc<PipelineContext>,
    sync: &SyncConfig,
    registry: &SourceRegistry,
    overrides: RunOverrides,
) -> Vec<SourceRunResult> {
    let mut tasks = JoinSet::new();
    for source in registry.enabled() {
        let source = source.clone();
        let config = source
            .run_config(sync)
            .with_limit(overrides.limit)
            .with_dry_run(overrides.dry_run);
        let ctx = ctx.clone();
        tasks.spawn(async move {
            let result = run_source(ctx, &source, config).await;
            SourceRunResult {
                source_id: source.source_id,
                result,
            }
        });
    }

    let mut results = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => {
                if let Err(err) = &result.result {
                    error!(source_id = %result.source_id, error = %err, "source run aborted");
                }
                results.push(result);
            }
            Err(err) => error!(error = %err, "source run task failed"),
        }
    }
    results.sort_by(|a, b| a.source_id.cmp(&b.source_id));
    results
}
