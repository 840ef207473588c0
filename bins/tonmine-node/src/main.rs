//! tonmine node binary.
//!
//! Runs the accrual engine against the in-process store: periodic batch
//! distribution, a sync worker draining the offline ledger, and optional
//! seeding of positions from a JSON file.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use tonmine_core::types::Position;
use tonmine_node_lib::{Cancellation, Node, NodeConfig, RunReport};

/// tonmine node: staking reward accrual and reconciliation.
#[derive(Parser, Debug)]
#[command(
    name = "tonmine-node",
    version,
    about = "Staking reward accrual, batch distribution and offline reconciliation"
)]
struct Args {
    /// TOML configuration file (TONMINE__* environment variables override it)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for the offline ledger
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,

    /// JSON file with an array of positions to load at startup
    #[arg(long)]
    seed: Option<PathBuf>,

    /// Seconds between distribution runs
    #[arg(long, default_value_t = 60)]
    interval_secs: u64,

    /// Run a single distribution pass and exit
    #[arg(long)]
    once: bool,

    /// Print each run report to stdout as JSON
    #[arg(long)]
    report_json: bool,
}

impl Args {
    /// Layer CLI flags over the loaded configuration.
    fn into_config(&self) -> anyhow::Result<NodeConfig> {
        let mut config = NodeConfig::load(self.config.as_deref()).context("loading configuration")?;
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = args.into_config()?;

    init_logging(&config.log_level, &args.log_format);

    info!("tonmine node v{}", env!("CARGO_PKG_VERSION"));
    info!(data_dir = %config.data_dir.display(), "starting");

    let node = Node::open(config).context("starting node")?;

    if let Some(path) = &args.seed {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading seed file {}", path.display()))?;
        let positions: Vec<Position> = serde_json::from_str(&raw).context("parsing seed positions")?;
        node.seed_positions(positions)?;
    }

    let cancel = Cancellation::new();

    if args.once {
        let report = distribute(&node, &cancel).await?;
        emit(&report, args.report_json)?;
        return Ok(());
    }

    // The in-process store is always reachable.
    let (_online_tx, online_rx) = watch::channel(true);
    let worker = tokio::spawn(node.sync_worker(online_rx).run(cancel.clone()));

    let shutdown = {
        let cancel = cancel.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "cannot listen for Ctrl+C");
                return;
            }
            info!("received Ctrl+C, shutting down");
            cancel.cancel();
        }
    };
    tokio::spawn(shutdown);

    info!(interval_secs = args.interval_secs, "tonmine node running (Ctrl+C to stop)");
    let mut ticker = tokio::time::interval(Duration::from_secs(args.interval_secs.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match distribute(&node, &cancel).await {
                    Ok(report) => emit(&report, args.report_json)?,
                    Err(e) => error!(error = %e, "distribution run failed"),
                }
            }
        }
    }

    worker.await.context("sync worker panicked")?;
    info!("tonmine node shutdown complete");
    Ok(())
}

/// One distribution pass, retrying a transient scan failure.
async fn distribute(node: &Node, cancel: &Cancellation) -> anyhow::Result<RunReport> {
    let policy = node.config().retry.clone();
    let report = policy
        .run("distribution", || node.run_distribution(cancel), |e| e.is_transient())
        .await?;
    Ok(report)
}

fn emit(report: &RunReport, as_json: bool) -> anyhow::Result<()> {
    if as_json {
        println!("{}", serde_json::to_string(report)?);
    }
    Ok(())
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// Pass `format = "json"` for structured JSON output. Any other value
/// defaults to human-readable text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
