//! Beacon-Dissect command line.
//!
//! Runs the dissection pipeline against a JSON snapshot of the document
//! store and prints the resulting beacon records.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use beacon_dissect::certificate::{CertificateInput, CertificateRepository};
use beacon_dissect::config::Config;
use beacon_dissect::export::{export_report, BeaconReport};
use beacon_dissect::metrics::new_shared_metrics;
use beacon_dissect::orchestrator::{BeaconPipeline, BeaconVariant};
use beacon_dissect::store::MemoryStore;

/// Beacon-Dissect: strobe separation and beacon scoring over pair summaries.
#[derive(Parser, Debug)]
#[command(name = "beacon-dissect")]
#[command(version = "0.1.0")]
#[command(about = "Re-aggregate pair summaries, separate strobes and score beacon candidates")]
#[command(long_about = None)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (writes to stderr).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Dissect, score and record one family of pair summaries.
    Dissect {
        /// JSON snapshot of the store ({"collection": [documents]}).
        #[arg(short, long)]
        snapshot: PathBuf,

        /// Pair family: uconn, sni, proxy.
        #[arg(short = 'k', long, default_value = "sni")]
        variant: String,

        /// Output format: text, json, jsonl (default: from config).
        #[arg(short, long)]
        output: Option<String>,

        /// Workers per stage (default: from config).
        #[arg(short, long)]
        workers: Option<usize>,

        /// Chunk id stamped on written records (default: from config).
        #[arg(long)]
        chunk: Option<i64>,

        /// Write the updated store back to this snapshot path.
        #[arg(long)]
        save: Option<PathBuf>,

        /// Print pipeline counters in Prometheus text format after the report.
        #[arg(long)]
        metrics: bool,
    },

    /// Record hosts that presented invalid certificates.
    Certificates {
        /// JSON map of host key to certificate input.
        #[arg(short, long)]
        inputs: PathBuf,

        /// Existing store snapshot to update (default: empty store).
        #[arg(short, long)]
        snapshot: Option<PathBuf>,

        /// Write the updated store to this snapshot path.
        #[arg(long)]
        save: Option<PathBuf>,
    },

    /// Print a default configuration file.
    GenerateConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string().to_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Dissect {
            snapshot,
            variant,
            output,
            workers,
            chunk,
            save,
            metrics,
        } => {
            let variant: BeaconVariant = variant.parse().map_err(anyhow::Error::msg)?;
            let mut config = config;
            if let Some(workers) = workers {
                config.pipeline.workers = workers;
            }
            if let Some(chunk) = chunk {
                config.rolling.current_chunk = chunk;
            }
            if let Some(output) = output {
                config.output.format = output.parse().map_err(anyhow::Error::msg)?;
            }
            config.validate()?;

            run_dissect(config, &snapshot, variant, save.as_deref(), metrics).await
        }

        Commands::Certificates {
            inputs,
            snapshot,
            save,
        } => {
            config.validate()?;
            run_certificates(config, &inputs, snapshot.as_deref(), save.as_deref()).await
        }

        Commands::GenerateConfig => {
            print!("{}", Config::generate_default());
            Ok(())
        }
    }
}

/// Cancels `token` on Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling pipeline...");
            token.cancel();
        }
    });
}

async fn run_dissect(
    config: Config,
    snapshot: &Path,
    variant: BeaconVariant,
    save: Option<&Path>,
    print_metrics: bool,
) -> Result<()> {
    let store = MemoryStore::load(snapshot)
        .with_context(|| format!("Failed to load snapshot {}", snapshot.display()))?;

    let summaries = store.documents(&variant.schema(&config).collection);
    info!(
        "Loaded {} {} summaries from {}",
        summaries.len(),
        variant,
        snapshot.display()
    );

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let metrics = new_shared_metrics();
    let pipeline = BeaconPipeline::new(store.clone(), config.clone(), Arc::clone(&metrics), cancel);
    let fed = pipeline
        .run_documents(variant, &summaries)
        .await
        .context("Beacon pipeline stopped early")?;

    let records = store.documents(variant.output_table(&config));
    let report = BeaconReport::from_documents(
        variant.to_string(),
        fed,
        metrics.snapshot(),
        &records,
        Utc::now(),
    );
    println!("{}", export_report(&report, config.output.format));

    if print_metrics {
        println!("\n{}", metrics.to_prometheus_format());
    }

    if let Some(path) = save {
        store
            .save(path)
            .with_context(|| format!("Failed to save snapshot {}", path.display()))?;
        info!("Saved store to {}", path.display());
    }
    Ok(())
}

async fn run_certificates(
    config: Config,
    inputs: &Path,
    snapshot: Option<&Path>,
    save: Option<&Path>,
) -> Result<()> {
    let store = match snapshot {
        Some(path) => MemoryStore::load(path)
            .with_context(|| format!("Failed to load snapshot {}", path.display()))?,
        None => MemoryStore::new(),
    };

    let content = std::fs::read_to_string(inputs)
        .with_context(|| format!("Failed to read inputs: {}", inputs.display()))?;
    let inputs: HashMap<String, CertificateInput> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse inputs: {}", inputs.display()))?;

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let metrics = new_shared_metrics();
    let table = config.tables.certificate_table.clone();
    let repository = CertificateRepository::new(store.clone(), config, Arc::clone(&metrics), cancel);
    repository
        .create_indexes()
        .await
        .context("Failed to create certificate collection")?;
    let fed = repository
        .upsert(inputs)
        .await
        .context("Certificate pipeline stopped early")?;

    let snapshot = metrics.snapshot();
    info!(
        "Recorded {} hosts into {} ({} writes, {} failures)",
        fed, table, snapshot.writes_completed, snapshot.write_failures
    );
    if let Some(path) = save {
        store
            .save(path)
            .with_context(|| format!("Failed to save snapshot {}", path.display()))?;
        info!("Saved store to {}", path.display());
    }
    Ok(())
}
