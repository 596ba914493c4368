//! AtomicLedger Simulator
//!
//! Drives concurrent deposits, withdrawals, exchanges, invoices and trades
//! against an in-memory ledger and checks that no update was lost or
//! applied twice.

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod controller;
mod metrics;

use controller::{SimulationConfig, SimulationController};

/// AtomicLedger Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "AtomicLedger concurrent load simulator")]
struct Args {
    /// Number of simulated accounts
    #[arg(short, long, default_value = "16")]
    accounts: usize,

    /// Number of concurrent workers
    #[arg(short, long, default_value = "8")]
    workers: usize,

    /// Total operations across all workers
    #[arg(short, long, default_value = "10000")]
    operations: usize,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Probability (0..1) that an operation hits the hot account
    #[arg(long, default_value = "0.2")]
    contention: f64,

    /// Disable the atomic primitive and force compare-and-swap
    #[arg(long)]
    optimistic: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,atomicledger_coordinator=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    if args.accounts == 0 || args.workers == 0 {
        anyhow::bail!("--accounts and --workers must be at least 1");
    }
    if !(0.0..=1.0).contains(&args.contention) {
        anyhow::bail!("--contention must be between 0 and 1");
    }

    info!("Starting AtomicLedger Simulator");
    info!("Accounts: {}", args.accounts);
    info!("Workers: {}", args.workers);

    let controller = SimulationController::new(SimulationConfig {
        accounts: args.accounts,
        workers: args.workers,
        operations: args.operations,
        seed: args.seed,
        contention: args.contention,
        optimistic_only: args.optimistic,
    });
    controller.initialize().await?;

    let (metrics, elapsed) = controller.run().await?;
    let engine = controller.engine_stats();
    let trades = controller.trade_stats();

    info!("Simulation complete");
    info!("Total operations: {}", metrics.total_operations);
    info!("Applied: {}", metrics.applied);
    info!("Already settled: {}", metrics.already_settled);
    info!("Insufficient balance: {}", metrics.insufficient);
    info!("Conflicts: {}", metrics.conflicts);
    info!("Trade already open: {}", metrics.trade_busy);
    info!("Failed: {}", metrics.failed);
    info!("Engine retries: {}", engine.retries);
    info!("Engine fallbacks: {}", engine.fallbacks);
    info!(
        "Trades opened: {}, settled: {}, degraded: {}",
        trades.trades_opened, trades.trades_settled, trades.trades_degraded
    );
    info!("Average latency: {}µs", metrics.average_latency_us());
    info!("p99 latency: {}µs", metrics.p99_latency_us());
    info!("Throughput: {:.0} ops/s", metrics.throughput(elapsed.as_secs_f64()));

    let report = controller.verify();
    if report.is_consistent() {
        info!(accounts = report.accounts, "Balances match the journal");
        Ok(())
    } else {
        for mismatch in &report.mismatches {
            error!("{}", mismatch);
        }
        anyhow::bail!("{} accounts failed verification", report.mismatches.len())
    }
}
