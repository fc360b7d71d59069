use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dirscout_sync::{
    connect_store, recent_runs, run_all, run_source, LocationResolver, PipelineContext,
    RunOverrides, RunReport, SetupError, SourceRegistry, SyncConfig,
};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "dirscout")]
#[command(about = "Business directory ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest one source from sources.yaml.
    Run {
        source_id: String,
        /// Process at most this many listings.
        #[arg(long)]
        limit: Option<usize>,
        /// Parse and report without persisting anything.
        #[arg(long)]
        dry_run: bool,
        /// Stop processing listings after this many seconds.
        #[arg(long)]
        deadline_secs: Option<u64>,
    },
    /// Ingest every enabled source concurrently.
    RunAll {
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        dry_run: bool,
    },
    /// List registered sources.
    Sources,
    /// Check that a location reaches the global root.
    ValidateLocation { id: Uuid },
    /// Summaries of the most recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("DIRSCOUT_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn print_report(report: &RunReport) {
    let s = &report.statistics;
    println!(
        "run complete: run_id={} source={} fetched={} saved={} duplicates={} failed={} parse_failures={} robots_blocked={} custom_fields={} deadline_exceeded={}",
        report.run_id,
        report.source_id,
        s.listings_fetched,
        s.listings_saved,
        s.listings_skipped_duplicate,
        s.listings_failed,
        s.parse_failures,
        s.robots_blocked,
        s.custom_fields_populated,
        s.deadline_exceeded,
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command {
        Commands::Run {
            source_id,
            limit,
            dry_run,
            deadline_secs,
        } => {
            let registry = SourceRegistry::load(&config.workspace_root).await?;
            let source = registry
                .get(&source_id)
                .ok_or_else(|| SetupError::UnknownSource(source_id.clone()))?;
            let mut run = source
                .run_config(&config)
                .with_limit(limit)
                .with_dry_run(dry_run);
            if let Some(secs) = deadline_secs {
                run = run.with_deadline(Some(Duration::from_secs(secs)));
            }

            let ctx = Arc::new(PipelineContext::from_config(&config, &registry, dry_run).await?);
            let report = run_source(ctx, source, run)
                .await
                .with_context(|| format!("running source {source_id}"))?;
            print_report(&report);
        }
        Commands::RunAll { limit, dry_run } => {
            let registry = SourceRegistry::load(&config.workspace_root).await?;
            let ctx = Arc::new(PipelineContext::from_config(&config, &registry, dry_run).await?);
            let results = run_all(ctx, &config, &registry, RunOverrides { limit, dry_run }).await;

            let mut aborted = 0usize;
            for result in &results {
                match &result.result {
                    Ok(report) => print_report(report),
                    Err(err) => {
                        aborted += 1;
                        eprintln!("source {} aborted: {err}", result.source_id);
                    }
                }
            }
            if aborted > 0 {
                bail!("{aborted} of {} sources failed setup", results.len());
            }
        }
        Commands::Sources => {
            let registry = SourceRegistry::load(&config.workspace_root).await?;
            for source in &registry.sources {
                println!(
                    "{}\t{}\t{}\t{}",
                    source.source_id,
                    if source.enabled { "enabled" } else { "disabled" },
                    source.category_slug,
                    source.display_name
                );
            }
        }
        Commands::ValidateLocation { id } => {
            let mut resolver = LocationResolver::new(connect_store(&config).await?).read_only(true);
            let chain = resolver.ancestry(id).await?;
            if chain.is_empty() {
                bail!("location {id} not found");
            }
            for row in &chain {
                println!("{}\t{}\t{}", row.level.as_str(), row.id, row.name);
            }
            let valid = resolver.validate_hierarchy(id).await?;
            info!(%id, valid, "hierarchy checked");
            if !valid {
                bail!("location {id} does not reach the global root within bounds");
            }
            println!("valid");
        }
        Commands::Report { runs } => {
            for run in recent_runs(&config.workspace_root, runs)? {
                let s = &run.statistics;
                println!(
                    "{}\t{}\t{}\t{}\tsaved={} duplicates={} failed={}{}",
                    run.finished_at,
                    run.run_id,
                    run.source_id,
                    run.category_slug,
                    s.listings_saved,
                    s.listings_skipped_duplicate,
                    s.listings_failed,
                    if run.dry_run { " (dry run)" } else { "" }
                );
            }
        }
    }

    Ok(())
}
