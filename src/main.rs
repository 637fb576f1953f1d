//! route-system: resolve addresses and plan delivery routes.
//!
//! # Architecture Overview
//!
//! ```text
//!   addresses (JSON records or one per line)
//!        │
//!        ▼
//!   ┌──────────────────────────── pipeline ─────────────────────────────┐
//!   │  normalize → dedupe → cache ─hit──────────────────────────┐       │
//!   │                         │ miss                            │       │
//!   │                         ▼                                 │       │
//!   │              provider::api ──blocked──▶ provider::browser │       │
//!   │              (throttle + retries)        (WebDriver)      │       │
//!   └────────────────────────────┬──────────────────────────────┴───────┘
//!                                ▼
//!   ┌──────────────────────────── routing ──────────────────────────────┐
//!   │  cluster (sweep + refine) → sequence (NN + 2-opt) → measure legs  │
//!   └────────────────────────────┬──────────────────────────────────────┘
//!                                ▼
//!                      BatchReport (JSON)
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

use route_system::config;
use route_system::geocode::AddressRecord;
use route_system::lifecycle::{signals, startup, RunCancellation};
use route_system::observability::{logging, metrics};
use route_system::pipeline::{BatchEvent, EventSink, RunParams};

#[derive(Parser)]
#[command(name = "route-system")]
#[command(about = "Geocode address batches and plan routes", long_about = None)]
struct Cli {
    /// Configuration file (TOML). Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve addresses and plan routes
    Plan {
        /// JSON array of records, or a text file with one address per line
        input: PathBuf,
        /// Number of vehicles
        #[arg(long)]
        vehicles: Option<usize>,
        /// Maximum stops per vehicle
        #[arg(long)]
        capacity: Option<usize>,
        /// Re-resolve cache entries older than this
        #[arg(long)]
        max_age_secs: Option<u64>,
        /// Write the report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Resolve addresses only
    Resolve {
        input: PathBuf,
        #[arg(long)]
        max_age_secs: Option<u64>,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show fresh/stale cache entry counts
    Cache,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => config::load_config(path).with_context(|| format!("loading {}", path.display()))?,
        None => config::loader::default_config()?,
    };
    logging::init(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "route-system starting");

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    match cli.command {
        Commands::Cache => {
            let cache = startup::open_cache(&config)?;
            let summary = cache.summary();
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Resolve {
            input,
            max_age_secs,
            output,
        } => {
            let records = read_records(&input)?;
            let params = RunParams {
                max_age_secs,
                ..RunParams::default()
            };
            let runner = startup::build_runner(&config)?;
            let (cancel, events) = run_scope();
            let report = runner.resolve_all(records, &params, &cancel, &events).await;
            write_report(output.as_deref(), &report)?;
        }
        Commands::Plan {
            input,
            vehicles,
            capacity,
            max_age_secs,
            output,
        } => {
            let records = read_records(&input)?;
            let params = RunParams {
                vehicle_count: vehicles,
                capacity,
                max_age_secs,
            };
            let runner = startup::build_runner(&config)?;
            let (cancel, events) = run_scope();
            let report = runner.run(records, &params, &cancel, &events).await?;
            write_report(output.as_deref(), &report)?;
        }
    }

    tracing::info!("Done");
    Ok(())
}

/// Cancellation wired to Ctrl-C, and a progress logger.
fn run_scope() -> (RunCancellation, EventSink) {
    let cancel = RunCancellation::new();
    signals::cancel_on_ctrl_c(cancel.clone());

    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut done = 0usize;
        let mut total = 0usize;
        while let Some(event) = rx.recv().await {
            match event {
                BatchEvent::Started { total: t, distinct, .. } => {
                    total = t;
                    tracing::info!(total, distinct, "Run started");
                }
                BatchEvent::Resolved { .. } | BatchEvent::Unresolved { .. } => {
                    done += 1;
                    if done % 50 == 0 || done == total {
                        tracing::info!(done, total, "Progress");
                    }
                }
                BatchEvent::Finished {
                    resolved,
                    unresolved,
                    cancelled,
                    ..
                } => tracing::info!(resolved, unresolved, cancelled, "Run finished"),
            }
        }
    });
    (cancel, EventSink::new(tx))
}

fn read_records(path: &Path) -> anyhow::Result<Vec<AddressRecord>> {
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    if content.trim_start().starts_with('[') {
        return serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()));
    }
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(AddressRecord::new)
        .collect())
}

fn write_report<T: serde::Serialize>(output: Option<&Path>, report: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(report)?;
    match output {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
            tracing::info!(path = %path.display(), "Report written");
        }
        None => println!("{}", json),
    }
    Ok(())
}
