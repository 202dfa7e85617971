use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use datastore_core::config::Config;
use datastore_core::datastore::catalog::{CatalogServer, CatalogService};
use datastore_core::datastore::merge::{merge, SourceRole};
use datastore_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use datastore_core::{CatalogDataStore, Context, DataStoreArchive, MemoryDataStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "datastore")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file; DATASTORE_* variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<LogLevel>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the catalog service
    Serve {
        /// Listen address, overriding the configured one
        #[arg(long)]
        bind: Option<String>,

        /// SQLite database file, overriding the configured one
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Write every catalog record to a JSON archive
    Export {
        /// Archive file to write
        output: PathBuf,
    },

    /// Push a JSON archive into the catalog in one transaction
    Merge {
        /// Archive file to read
        input: PathBuf,

        /// How the archive is described in error messages
        #[arg(long, value_enum, default_value_t = MergeMode::Sync)]
        mode: MergeMode,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum MergeMode {
    /// Routine reconciliation of a local store
    Sync,
    /// One-shot migration of a legacy store
    Migrate,
    /// Any other source
    Merge,
}

impl From<MergeMode> for SourceRole {
    fn from(mode: MergeMode) -> Self {
        match mode {
            MergeMode::Sync => SourceRole::Local,
            MergeMode::Migrate => SourceRole::Migration,
            MergeMode::Merge => SourceRole::Source,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    let mut log_config = LogConfig::from_settings(&config.logging)?;
    if let Some(level) = args.log_level {
        log_config.level = level;
    }
    if args.json_logs {
        log_config = log_config.json_format(true);
    }
    init_logging_with_config(log_config)?;
    datastore_core::metrics::init_metrics();

    let ctx = Context::background();
    match args.command {
        Command::Serve { bind, db } => serve(config, bind, db, ctx).await,
        Command::Export { output } => export(&config, &ctx, output).await,
        Command::Merge { input, mode } => merge_archive(&config, &ctx, input, mode).await,
    }
}

async fn serve(mut config: Config, bind: Option<String>, db: Option<PathBuf>, ctx: Context) -> Result<()> {
    if let Some(bind) = bind {
        config.service.bind_address = bind.parse().context("invalid --bind address")?;
    }
    if let Some(db) = db {
        config.service.db_path = db;
    }
    if let Some(parent) = config.service.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }

    let service = Arc::new(CatalogService::from_config(&config.service)?);
    let server = CatalogServer::bind(&config.service.bind_address.to_string(), service).await?;

    let shutdown = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            shutdown.cancel();
        }
    });

    server.serve_until(&ctx).await?;
    Ok(())
}

async fn export(config: &Config, ctx: &Context, output: PathBuf) -> Result<()> {
    let catalog = CatalogDataStore::connect(&config.catalog).await?;
    let archive = DataStoreArchive::capture(ctx, &catalog).await?;
    archive.write_to_file(&output).await?;
    info!(
        domain = %config.catalog.domain,
        environment = %config.catalog.environment,
        records = archive.len(),
        path = %output.display(),
        "Exported catalog"
    );
    Ok(())
}

async fn merge_archive(config: &Config, ctx: &Context, input: PathBuf, mode: MergeMode) -> Result<()> {
    let archive = DataStoreArchive::read_from_file(&input).await?;
    let source = MemoryDataStore::from_archive(archive)?;
    let catalog = CatalogDataStore::connect(&config.catalog).await?;

    let report = merge(ctx, &source, &catalog, mode.into()).await?;
    info!(records = report.total(), "Merged {} into catalog", input.display());
    Ok(())
}
