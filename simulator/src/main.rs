//! SimpleBank Simulator
//!
//! Drives concurrent transfers through the ledger and checks that the books
//! still balance afterwards.

use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use simplebank_ledger::{LedgerConfig, MemoryStore, PgStore};

mod accounts;
mod backend;
mod controller;
mod metrics;
mod scenario;

use backend::SimStore;
use controller::SimulationController;
use scenario::Scenario;

/// SimpleBank Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "SimpleBank transfer load and scenario simulator")]
struct Args {
    /// Number of accounts to create
    #[arg(short, long, default_value = "3")]
    accounts: usize,

    /// Initial balance of every account, in cents
    #[arg(long, default_value = "100000")]
    initial_balance: i64,

    /// Built-in scenario to run
    #[arg(short, long, conflicts_with = "scenario_file")]
    scenario: Option<String>,

    /// Scenario JSON file to run
    #[arg(long)]
    scenario_file: Option<PathBuf>,

    /// Random transfers to run when no scenario is given
    #[arg(short, long, default_value = "1000")]
    transfers: usize,

    /// Concurrent transfer workers
    #[arg(short, long, default_value = "8")]
    concurrency: usize,

    /// Largest random transfer amount, in cents
    #[arg(long, default_value = "5000")]
    max_amount: i64,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// PostgreSQL connection string; the in-memory store is used without one
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
    );
    if args.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting SimpleBank Simulator");

    let mut config = LedgerConfig::from_env();
    match args.database_url.clone() {
        Some(url) => {
            config.database_url = url;
            let store = PgStore::connect(&config).await?;
            run(store, config, &args).await
        }
        None => {
            info!("No database configured, using the in-memory store");
            run(MemoryStore::new(), config, &args).await
        }
    }
}

async fn run<S: SimStore>(store: S, config: LedgerConfig, args: &Args) -> anyhow::Result<()> {
    let scenario = match (&args.scenario, &args.scenario_file) {
        (Some(name), _) => Some(Scenario::load(name)?),
        (None, Some(path)) => Some(Scenario::from_file(path)?),
        (None, None) => None,
    };

    let accounts = match &scenario {
        Some(s) => args.accounts.max(s.accounts),
        None => args.accounts,
    };

    let mut controller = SimulationController::new(store, config);
    controller.initialize(accounts, args.initial_balance).await?;
    info!(run_id = controller.run_id(), "Simulator initialized with {} accounts", accounts);

    let start = Instant::now();
    match &scenario {
        Some(scenario) => controller.run_scenario(scenario).await?,
        None => {
            controller
                .run_load(args.transfers, args.concurrency, args.max_amount, args.seed)
                .await?
        }
    }
    let elapsed_ms = start.elapsed().as_millis() as u64;

    controller.verify().await?;

    // Print metrics
    let metrics = controller.metrics().await;
    info!("Simulation complete");
    info!("Total transfers: {}", metrics.total_transfers);
    info!("Successful: {}", metrics.successful_transfers);
    info!("Failed: {}", metrics.failed_transfers);
    for (kind, count) in metrics.failures_by_kind() {
        info!("  {}: {}", kind, count);
    }
    info!("Success rate: {:.1}%", metrics.success_rate() * 100.0);
    info!("Throughput: {:.1} transfers/s", metrics.throughput(elapsed_ms));
    info!(
        "Latency avg/p50/p99: {}/{}/{}ms",
        metrics.average_latency_ms(),
        metrics.p50_latency_ms(),
        metrics.p99_latency_ms()
    );

    Ok(())
}
