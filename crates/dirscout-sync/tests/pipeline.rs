use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dirscout_adapters::{
    HtmlDirectoryAdapter, HtmlDirectoryConfig, JsonApiAdapter, JsonApiConfig, JsonFieldPointers,
    SourceAdapter, TaxonomyRules,
};
use dirscout_core::LocationLevel;
use dirscout_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher, ListingStore, MemoryStore};
use dirscout_sync::{
    run_all, seed_category, IngestionOrchestrator, PipelineContext, RunConfig, RunOverrides,
    SourceRegistry, SyncConfig,
};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CATEGORY: &str = "materials-testing";

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// Temp workspace holding the real materials taxonomy; reports land here.
fn workspace() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("rules")).unwrap();
    std::fs::copy(
        repo_root().join("rules").join(format!("{CATEGORY}.yaml")),
        dir.path().join("rules").join(format!("{CATEGORY}.yaml")),
    )
    .unwrap();
    dir
}

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(5),
        user_agent: "dirscout-test/0.1".into(),
        min_interval: Duration::ZERO,
        backoff: BackoffPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        },
    })
    .unwrap()
}

async fn seeded_store(root: &Path) -> MemoryStore {
    let store = MemoryStore::new();
    let rules = TaxonomyRules::for_category(root, CATEGORY).unwrap();
    seed_category(&store, CATEGORY, &rules).await;
    store
}

fn context(store: &MemoryStore, root: &Path) -> Arc<PipelineContext> {
    Arc::new(PipelineContext::new(
        Arc::new(store.clone()),
        fetcher(),
        root.to_path_buf(),
    ))
}

fn directory(server: &MockServer) -> Arc<dyn SourceAdapter> {
    Arc::new(
        HtmlDirectoryAdapter::new(
            "lab-directory",
            HtmlDirectoryConfig {
                index_urls: vec![format!("{}/labs", server.uri())],
                detail_link_selector: Some("a.lab".into()),
                ..HtmlDirectoryConfig::default()
            },
        )
        .unwrap(),
    )
}

fn run_config() -> RunConfig {
    RunConfig::new(CATEGORY, "Lab directory").with_rate_limit(Duration::ZERO)
}

async fn mount_directory(server: &MockServer) {
    let fixture = std::fs::read_to_string(repo_root().join("fixtures/lab_detail.html")).unwrap();
    Mock::given(method("GET"))
        .and(path("/labs"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<ul><li><a class="lab" href="/labs/gulf-coast">Gulf Coast</a></li>
               <li><a class="lab" href="/labs/alpine">Alpine</a></li></ul>"#,
        ))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/labs/gulf-coast"))
        .respond_with(ResponseTemplate::new(200).set_body_string(fixture))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/labs/alpine"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"<html><body><h1>Alpine Composites Testing</h1>
               <address>Bahnhofstrasse 1, 8001 Zurich, Switzerland</address>
               <p>Fatigue and tensile testing of carbon fiber laminates. Call +41 44 555 0100.</p>
               <a itemprop="url" href="https://alpine.test">alpine.test</a></body></html>"#,
        ))
        .mount(server)
        .await;
}

#[tokio::test]
async fn second_run_inserts_nothing() {
    let server = MockServer::start().await;
    mount_directory(&server).await;
    let dir = workspace();
    let store = seeded_store(dir.path()).await;
    let ctx = context(&store, dir.path());

    let first = IngestionOrchestrator::new(ctx.clone(), directory(&server), run_config())
        .run()
        .await
        .unwrap();
    assert_eq!(first.urls_enumerated, 2);
    assert_eq!(first.statistics.listings_fetched, 2);
    assert_eq!(first.statistics.listings_saved, 2);
    assert_eq!(first.statistics.listings_failed, 0);
    assert!(first.statistics.custom_fields_populated > 0);
    assert_eq!(store.listing_count().await, 2);
    let values_after_first = store.custom_values().await.len();
    let locations_after_first = store.location_count().await;

    let houston = store
        .listings()
        .await
        .into_iter()
        .find(|l| l.data.business_name == "Gulf Coast Materials Lab")
        .unwrap();
    let city = store.location(houston.data.location_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(city.name, "Houston");
    assert_eq!(city.level, LocationLevel::City);
    assert!(ctx
        .resolver
        .lock()
        .await
        .validate_hierarchy(city.id)
        .await
        .unwrap());

    let second = IngestionOrchestrator::new(ctx.clone(), directory(&server), run_config())
        .run()
        .await
        .unwrap();
    assert_eq!(second.statistics.listings_saved, 0);
    assert_eq!(second.statistics.listings_skipped_duplicate, 2);
    assert_eq!(store.listing_count().await, 2);
    assert_eq!(store.custom_values().await.len(), values_after_first);
    assert_eq!(store.location_count().await, locations_after_first);

    let summary = dir
        .path()
        .join("reports")
        .join(second.run_id.to_string())
        .join("summary.json");
    assert!(summary.is_file());
}

#[tokio::test]
async fn robots_disallow_skips_without_fetching() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /\n"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/labs/1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<h1>Never</h1>"))
        .expect(0)
        .mount(&server)
        .await;

    let dir = workspace();
    let store = seeded_store(dir.path()).await;
    let adapter: Arc<dyn SourceAdapter> = Arc::new(
        HtmlDirectoryAdapter::new(
            "blocked",
            HtmlDirectoryConfig {
                seed_urls: vec![format!("{}/labs/1", server.uri())],
                ..HtmlDirectoryConfig::default()
            },
        )
        .unwrap(),
    );

    let report = IngestionOrchestrator::new(context(&store, dir.path()), adapter, run_config())
        .run()
        .await
        .unwrap();
    assert_eq!(report.statistics.robots_blocked, 1);
    assert_eq!(report.statistics.listings_failed, 0);
    assert_eq!(report.statistics.listings_fetched, 0);
    assert_eq!(store.listing_count().await, 0);
}

#[tokio::test]
async fn per_listing_failures_are_counted_not_fatal() {
    let server = MockServer::start().await;
    mount_directory(&server).await;
    Mock::given(method("GET"))
        .and(path("/labs/broken"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/labs/blank"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html><body><p>coming soon</p></body></html>"))
        .mount(&server)
        .await;

    let dir = workspace();
    let store = seeded_store(dir.path()).await;
    let adapter: Arc<dyn SourceAdapter> = Arc::new(
        HtmlDirectoryAdapter::new(
            "flaky",
            HtmlDirectoryConfig {
                seed_urls: vec![
                    format!("{}/labs/broken", server.uri()),
                    format!("{}/labs/blank", server.uri()),
                    format!("{}/labs/gulf-coast", server.uri()),
                ],
                ..HtmlDirectoryConfig::default()
            },
        )
        .unwrap(),
    );

    let report = IngestionOrchestrator::new(context(&store, dir.path()), adapter, run_config())
        .run()
        .await
        .unwrap();
    let stats = report.statistics;
    assert_eq!(stats.listings_fetched, 2);
    assert_eq!(stats.listings_failed, 2);
    assert_eq!(stats.parse_failures, 1);
    assert_eq!(stats.listings_saved, 1);
    assert_eq!(store.listing_count().await, 1);
}

#[tokio::test]
async fn rejected_writes_count_as_failures() {
    let server = MockServer::start().await;
    mount_directory(&server).await;
    let dir = workspace();
    let store = seeded_store(dir.path()).await;
    store.reject_listing_inserts(true).await;

    let report = IngestionOrchestrator::new(context(&store, dir.path()), directory(&server), run_config())
        .run()
        .await
        .unwrap();
    assert_eq!(report.statistics.listings_fetched, 2);
    assert_eq!(report.statistics.listings_failed, 2);
    assert_eq!(report.statistics.listings_saved, 0);
    assert_eq!(store.custom_values().await.len(), 0);
}

#[tokio::test]
async fn dry_run_writes_records_and_persists_nothing() {
    let server = MockServer::start().await;
    mount_directory(&server).await;
    let dir = workspace();
    let store = seeded_store(dir.path()).await;

    let report = IngestionOrchestrator::new(
        context(&store, dir.path()),
        directory(&server),
        run_config().with_dry_run(true).with_limit(Some(1)),
    )
    .run()
    .await
    .unwrap();
    assert_eq!(report.urls_enumerated, 1);
    assert_eq!(report.statistics.listings_saved, 0);
    assert!(report.statistics.custom_fields_populated > 0);
    assert_eq!(store.listing_count().await, 0);

    let dry_run = dir
        .path()
        .join("reports")
        .join(report.run_id.to_string())
        .join("dry_run.json");
    let records: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dry_run).unwrap()).unwrap();
    assert_eq!(records.as_array().unwrap().len(), 1);
    assert_eq!(records[0]["business_name"], "Gulf Coast Materials Lab");
    assert_eq!(records[0]["custom_fields"]["custom_test_dev"], true);
}

#[tokio::test]
async fn run_all_covers_every_enabled_source() {
    let server = MockServer::start().await;
    mount_directory(&server).await;
    let dir = workspace();
    let store = seeded_store(dir.path()).await;

    let registry = SourceRegistry::from_yaml(&format!(
        r#"
sources:
  - source_id: directory-a
    display_name: Directory A
    category_slug: {CATEGORY}
    rate_limit_seconds: 0
    kind: html_directory
    seed_urls: ["{base}/labs/gulf-coast"]
  - source_id: directory-b
    display_name: Directory B
    category_slug: {CATEGORY}
    rate_limit_seconds: 0
    kind: html_directory
    seed_urls: ["{base}/labs/alpine"]
  - source_id: retired
    display_name: Retired
    enabled: false
    category_slug: {CATEGORY}
    kind: html_directory
    seed_urls: ["{base}/labs/gone"]
  - source_id: wrong-category
    display_name: Wrong
    category_slug: food-testing
    rate_limit_seconds: 0
    kind: html_directory
"#,
        base = server.uri()
    ))
    .unwrap();

    let sync = SyncConfig {
        workspace_root: dir.path().to_path_buf(),
        ..SyncConfig::default()
    };
    let results = run_all(
        context(&store, dir.path()),
        &sync,
        &registry,
        RunOverrides::default(),
    )
    .await;

    let ids: Vec<&str> = results.iter().map(|r| r.source_id.as_str()).collect();
    assert_eq!(ids, vec!["directory-a", "directory-b", "wrong-category"]);
    assert_eq!(results[0].result.as_ref().unwrap().statistics.listings_saved, 1);
    assert_eq!(results[1].result.as_ref().unwrap().statistics.listings_saved, 1);
    assert!(results[2].result.is_err());
    assert_eq!(store.listing_count().await, 2);
}

#[tokio::test]
async fn bundled_registry_builds_every_adapter() {
    let registry = SourceRegistry::load(&repo_root()).await.unwrap();
    assert!(registry.enabled().count() >= 3);
    for source in &registry.sources {
        source.adapter.build(&source.source_id).unwrap();
        TaxonomyRules::for_category(repo_root(), &source.category_slug).unwrap();
    }
}

#[tokio::test]
async fn json_records_with_separate_zip_resolve_to_city() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/labs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": {"labs": [{
                "lab_code": "BEL-01",
                "lab_name": "Bayou Environmental Lab",
                "scope_summary": "Tensile and hardness testing of pipeline steel.",
                "address": {"street": "9 Elm St", "city": "Houston", "state": "TX", "zip": "77002"},
                "contact": {"phone": "713-555-0199", "website": "https://bayou-lab.test"}
            }]}
        })))
        .mount(&server)
        .await;

    let adapter: Arc<dyn SourceAdapter> = Arc::new(JsonApiAdapter::new(
        "accreditation-api",
        JsonApiConfig {
            collection_url: format!("{}/v1/labs", server.uri()),
            records_pointer: "/data/labs".into(),
            id_pointer: "/lab_code".into(),
            fields: JsonFieldPointers {
                business_name: Some("/lab_name".into()),
                description: Some("/scope_summary".into()),
                address_parts: vec![
                    "/address/street".into(),
                    "/address/city".into(),
                    "/address/state".into(),
                    "/address/zip".into(),
                ],
                phone: Some("/contact/phone".into()),
                website: Some("/contact/website".into()),
                ..JsonFieldPointers::default()
            },
        },
    ));

    let dir = workspace();
    let store = seeded_store(dir.path()).await;
    let ctx = context(&store, dir.path());
    let report = IngestionOrchestrator::new(
        ctx.clone(),
        adapter,
        run_config().with_fallback_country(Some("United States".into())),
    )
    .run()
    .await
    .unwrap();
    assert_eq!(report.statistics.listings_saved, 1);
    assert_eq!(report.statistics.locations_unresolved, 0);

    let listing = store.listings().await.into_iter().next().unwrap();
    assert_eq!(listing.data.address, "9 Elm St, Houston, TX, 77002");
    let city = store.location(listing.data.location_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(city.name, "Houston");
    assert_eq!(city.level, LocationLevel::City);
    let region = store.location(city.parent_id.unwrap()).await.unwrap().unwrap();
    assert_eq!((region.name.as_str(), region.level), ("TX", LocationLevel::Region));
    assert!(ctx
        .resolver
        .lock()
        .await
        .validate_hierarchy(city.id)
        .await
        .unwrap());
}
