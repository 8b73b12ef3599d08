use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use waplus_core::config::{LogFormat, Settings};
use waplus_core::{db, seed};

mod commands;

#[derive(Parser, Debug)]
#[command(author, version, about = "Basin indicator ingestion pipeline", long_about = None)]
struct Cli {
    /// Settings file (TOML). Environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run database migrations
    Migrate,
    /// Load basin and indicator reference data from a catalog file
    SeedCatalog(SeedArgs),
    /// Discover files and drive them through parse, transform and load
    Ingest(commands::ingest::IngestArgs),
    /// Latest job state for a checksum
    Status { checksum: String },
    /// Every job recorded for a checksum, oldest first
    History { checksum: String },
    /// List registered source formats
    Formats,
}

#[derive(Args, Debug)]
struct SeedArgs {
    /// Catalog TOML with [[basin]] and [[indicator]] tables
    catalog: PathBuf,

    /// Skip running migrations before seeding
    #[arg(long)]
    skip_migrations: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;
    init_tracing(settings.logging.format);

    match cli.command {
        Command::Migrate => {
            let pool = connect_pool(&settings).await?;
            db::run_migrations(&pool).await?;
            info!("Database migrations applied");
            Ok(())
        }
        Command::SeedCatalog(args) => {
            let catalog = waplus_core::catalog::ReferenceCatalog::from_path(&args.catalog)
                .with_context(|| format!("failed to load catalog {}", args.catalog.display()))?;
            let pool = connect_pool(&settings).await?;
            if args.skip_migrations {
                warn!("Skipping migrations before seeding");
            } else {
                db::run_migrations(&pool).await?;
            }
            seed::seed_catalog(&pool, &catalog).await?;
            info!(
                basins = catalog.basins().len(),
                indicators = catalog.indicators().len(),
                "Reference data seeded"
            );
            Ok(())
        }
        Command::Ingest(args) => commands::ingest::run(&settings, args).await,
        Command::Status { checksum } => {
            let pool = connect_pool(&settings).await?;
            commands::jobs::status(pool, &checksum).await
        }
        Command::History { checksum } => {
            let pool = connect_pool(&settings).await?;
            commands::jobs::history(pool, &checksum).await
        }
        Command::Formats => {
            commands::jobs::formats();
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

pub(crate) async fn connect_pool(settings: &Settings) -> Result<db::DbPool> {
    let database_url = settings
        .database
        .url
        .as_deref()
        .context("DATABASE_URL (or WAPLUS_DATABASE_URL) must be set")?;
    let max_connections = settings
        .database
        .max_connections
        .unwrap_or(db::DEFAULT_MAX_CONNECTIONS);
    db::connect(database_url, max_connections).await
}
