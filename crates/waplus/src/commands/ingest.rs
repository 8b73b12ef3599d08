// crates/waplus/src/commands/ingest.rs

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use comfy_table::Table;
use tracing::{info, warn};
use waplus_core::cache::CacheManager;
use waplus_core::catalog::ReferenceCatalog;
use waplus_core::config::Settings;
use waplus_core::discovery::{describe_path, expand_patterns, FsSourceReader};
use waplus_core::jobs::JobState;
use waplus_core::orchestrator::{JobOutcome, Orchestrator, PipelineContext};
use waplus_core::store::{JobStore, MemoryStore, PgStore, RecordStore};
use waplus_parser::ParserRegistry;

use crate::connect_pool;

#[derive(Args, Debug)]
pub struct IngestArgs {
    /// Files or glob patterns, e.g. `data/**/*.csv`
    #[arg(required = true)]
    paths: Vec<String>,

    /// Format tag for every file instead of inferring it from the extension
    #[arg(long)]
    format: Option<String>,

    /// Catalog TOML; defaults to the reference tables in the database
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Run against an in-memory store; requires --catalog
    #[arg(long)]
    dry_run: bool,

    /// Print outcomes as JSON lines instead of a table
    #[arg(long)]
    json: bool,
}

pub async fn run(settings: &Settings, args: IngestArgs) -> Result<()> {
    let outcomes = if args.dry_run {
        let path = args
            .catalog
            .as_deref()
            .context("--dry-run needs --catalog because there is no database to read it from")?;
        let catalog = ReferenceCatalog::from_path(path)
            .with_context(|| format!("failed to load catalog {}", path.display()))?;
        info!("Dry run: records stay in memory");
        ingest(settings, Arc::new(MemoryStore::new()), Arc::new(catalog), &args).await?
    } else {
        let pool = connect_pool(settings).await?;
        let store = Arc::new(PgStore::new(pool));
        let catalog = match args.catalog.as_deref() {
            Some(path) => ReferenceCatalog::from_path(path)
                .with_context(|| format!("failed to load catalog {}", path.display()))?,
            None => store
                .load_catalog()
                .await
                .context("failed to read reference tables")?,
        };
        ingest(settings, store, Arc::new(catalog), &args).await?
    };

    if args.json {
        for outcome in &outcomes {
            println!("{}", serde_json::to_string(outcome)?);
        }
    } else {
        println!("{}", outcome_table(&outcomes));
    }

    let failed = outcomes
        .iter()
        .filter(|outcome| outcome.state == JobState::Failed)
        .count();
    let quarantined = outcomes
        .iter()
        .filter(|outcome| outcome.state == JobState::Quarantined)
        .count();
    info!(
        files = outcomes.len(),
        failed, quarantined, "Ingestion finished"
    );
    if failed > 0 {
        bail!("{failed} of {} file(s) failed", outcomes.len());
    }
    Ok(())
}

async fn ingest<S>(
    settings: &Settings,
    store: Arc<S>,
    catalog: Arc<ReferenceCatalog>,
    args: &IngestArgs,
) -> Result<Vec<JobOutcome>>
where
    S: RecordStore + JobStore + 'static,
{
    let files = expand_patterns(&args.paths)?;
    if files.is_empty() {
        warn!(patterns = ?args.paths, "No files matched");
        return Ok(Vec::new());
    }

    let context = PipelineContext::new(
        ParserRegistry::standard(),
        catalog,
        store,
        Arc::new(CacheManager::in_memory(settings.cache_config())),
        Arc::new(FsSourceReader),
    );
    let pipeline = Orchestrator::new(context, settings.pipeline_config()).start();

    let mut tickets = Vec::with_capacity(files.len());
    for path in &files {
        let source = match describe_path(path, args.format.as_deref()).await {
            Ok(source) => source,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Skipping file");
                continue;
            }
        };
        tickets.push(pipeline.submit(source).await?);
    }
    info!(submitted = tickets.len(), "Files queued");

    let waiting = async move {
        let mut outcomes = Vec::with_capacity(tickets.len());
        for ticket in tickets {
            outcomes.push(ticket.wait().await?);
        }
        Ok::<_, waplus_core::error::IngestError>(outcomes)
    };
    tokio::pin!(waiting);
    let outcomes = tokio::select! {
        result = &mut waiting => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupt received; cancelling outstanding jobs");
            pipeline.cancel_all();
            waiting.await?
        }
    };
    pipeline.shutdown().await;
    Ok(outcomes)
}

fn outcome_table(outcomes: &[JobOutcome]) -> Table {
    let mut table = Table::new();
    table.set_header(vec![
        "Job", "File", "State", "Attempts", "Loaded", "Rejected", "Error",
    ]);
    for outcome in outcomes {
        table.add_row(vec![
            outcome.job_id.to_string(),
            outcome.uri.clone(),
            outcome.state.to_string(),
            outcome.attempts.to_string(),
            outcome.loaded.to_string(),
            outcome.rejected.to_string(),
            outcome.last_error.clone().unwrap_or_default(),
        ]);
    }
    table
}
