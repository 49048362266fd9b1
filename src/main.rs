//! MarketMind service binary.
//!
//! Boots the analysis core: storage, market-data service with the
//! default adapter set, and the task engine with the reference runners.
//! The process runs until interrupted.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use marketmind_backend::config::AppConfig;
use marketmind_backend::db::AnalysisStore;
use marketmind_backend::market::MarketDataService;
use marketmind_backend::tasks::runner::RunnerSet;
use marketmind_backend::tasks::TaskEngine;

#[derive(Parser, Debug)]
#[command(name = "marketmind", about = "Analysis execution core service")]
struct Args {
    /// Path to a TOML config file
    #[arg(long, env = "MARKETMIND_CONFIG")]
    config: Option<String>,

    /// SQLite database path (overrides config)
    #[arg(long, env = "MARKETMIND_DB_PATH")]
    db_path: Option<String>,

    /// Local dataset file for the dataset provider
    #[arg(long, env = "MARKETMIND_DATASET_PATH", default_value = "dataset.db")]
    dataset_path: String,

    /// Worker pool size (overrides config)
    #[arg(long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(db_path) = args.db_path {
        config.database_path = db_path;
    }
    if let Some(workers) = args.workers {
        config.engine.max_workers = workers;
    }

    info!(db = config.database_path, "starting marketmind backend");
    let store = AnalysisStore::open(&config.database_path)?;
    let service = MarketDataService::with_default_adapters(&config, &args.dataset_path);

    let engine = TaskEngine::new(
        store,
        config.engine.clone(),
        RunnerSet::reference(service.clone()),
    );
    engine.start();

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    engine.shutdown().await;

    Ok(())
}
