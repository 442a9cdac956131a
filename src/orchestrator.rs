//! Pipeline wiring.
//!
//! Builds the dissector → analyzer → writer chain for a pair variant, starts
//! the same number of workers in every stage, feeds the head and lets its
//! shutdown cascade down the chain.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregate::Document;
use crate::analyzer::{Analyzer, BeaconScorer};
use crate::config::Config;
use crate::dissector::{DissectionResult, Dissector, PairSchema};
use crate::error::PipelineError;
use crate::metrics::SharedMetrics;
use crate::pairs::{IpPair, ProxyPair, SrcFqdnPair, UnitOfWork};
use crate::pool::PipelineStage;
use crate::store::DocumentStore;
use crate::writer::Writer;

/// Workers per stage: the configured count, or half the CPUs (at least one).
pub fn pool_size(configured: usize) -> usize {
    if configured > 0 {
        configured
    } else {
        (num_cpus::get() / 2).max(1)
    }
}

/// Submits every item to `head`, then shuts it down.
///
/// Feeding stops at the first rejected submit (cancellation, timeout); the
/// cascade still runs so downstream stages drain what they already hold.
/// Returns the number of items handed off.
pub async fn feed<T, H>(
    label: &str,
    head: &H,
    items: impl IntoIterator<Item = T>,
) -> Result<usize, PipelineError>
where
    T: Send + 'static,
    H: PipelineStage<T> + ?Sized,
{
    let items: Vec<T> = items.into_iter().collect();
    let total = items.len();
    let step = (total / 10).max(1);
    info!("[-] {}: {} units", label, total);

    let mut fed = 0;
    let mut rejected = None;
    for item in items {
        if let Err(e) = head.submit(item).await {
            warn!("{}: stopped feeding after {} / {}: {}", label, fed, total, e);
            rejected = Some(e);
            break;
        }
        fed += 1;
        if fed % step == 0 || fed == total {
            debug!("{}: {} / {} ({}%)", label, fed, total, fed * 100 / total);
        }
    }

    head.shutdown().await?;
    match rejected {
        Some(e) => Err(e),
        None => {
            info!("[-] {}: done", label);
            Ok(fed)
        }
    }
}

/// Which pair summaries a beacon run dissects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconVariant {
    /// Source IP to destination IP
    Uconn,
    /// Source IP to SNI / HTTP host
    Sni,
    /// Source IP to FQDN through a proxy
    Proxy,
}

impl fmt::Display for BeaconVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uconn => write!(f, "uconn"),
            Self::Sni => write!(f, "sni"),
            Self::Proxy => write!(f, "proxy"),
        }
    }
}

impl FromStr for BeaconVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "uconn" | "ip" => Ok(Self::Uconn),
            "sni" => Ok(Self::Sni),
            "proxy" => Ok(Self::Proxy),
            _ => Err(format!("Unknown beacon variant: {}", s)),
        }
    }
}

impl BeaconVariant {
    pub fn schema(&self, config: &Config) -> PairSchema {
        match self {
            Self::Uconn => PairSchema::uconn(config),
            Self::Sni => PairSchema::sni(config),
            Self::Proxy => PairSchema::proxy(config),
        }
    }

    /// Collection receiving this variant's beacon records.
    pub fn output_table<'a>(&self, config: &'a Config) -> &'a str {
        match self {
            Self::Uconn => &config.tables.beacon_table,
            Self::Sni => &config.tables.beacon_sni_table,
            Self::Proxy => &config.tables.beacon_proxy_table,
        }
    }
}

/// Recovers every unit found in a set of pair summary records, skipping
/// records that do not describe one.
pub fn units_from_documents<U: UnitOfWork>(docs: &[Document]) -> Vec<U> {
    let units: Vec<U> = docs.iter().filter_map(U::from_summary).collect();
    if units.len() < docs.len() {
        warn!("Skipped {} malformed summary records", docs.len() - units.len());
    }
    units
}

/// Runs beacon pipelines against one store.
pub struct BeaconPipeline<S> {
    store: S,
    config: Config,
    metrics: SharedMetrics,
    cancel: CancellationToken,
}

impl<S: DocumentStore + Clone> BeaconPipeline<S> {
    pub fn new(store: S, config: Config, metrics: SharedMetrics, cancel: CancellationToken) -> Self {
        Self {
            store,
            config,
            metrics,
            cancel,
        }
    }

    /// Dissects, scores and writes every unit. Returns the number of units
    /// fed to the dissector.
    pub async fn run<U: UnitOfWork>(
        &self,
        variant: BeaconVariant,
        units: Vec<U>,
    ) -> Result<usize, PipelineError> {
        let tuning = &self.config.pipeline;
        let workers = pool_size(tuning.workers);
        let schema = variant.schema(&self.config);

        let writer = Arc::new(Writer::new(
            self.store.clone(),
            tuning.query_timeout(),
            Arc::clone(&self.metrics),
            self.cancel.child_token(),
        ));
        let analyzer: Arc<Analyzer<DissectionResult<U>, _, _>> = Arc::new(Analyzer::new(
            "beacon_analyzer",
            BeaconScorer::new(variant.output_table(&self.config), self.config.rolling.current_chunk),
            Arc::clone(&writer),
            Arc::clone(&self.metrics),
            self.cancel.child_token(),
        ));
        let dissector = Dissector::new(
            self.config.strobe.connection_limit,
            self.store.clone(),
            schema,
            tuning,
            Arc::clone(&analyzer),
            Arc::clone(&self.metrics),
            self.cancel.child_token(),
        );

        for _ in 0..workers {
            writer.start();
            analyzer.start();
            dissector.start();
        }
        debug!("{} pipeline: {} workers per stage", variant, workers);

        feed(&format!("Beacon Analysis ({})", variant), &dissector, units).await
    }

    /// Enumerates the variant's units from `summaries` and runs them.
    pub async fn run_documents(
        &self,
        variant: BeaconVariant,
        summaries: &[Document],
    ) -> Result<usize, PipelineError> {
        match variant {
            BeaconVariant::Uconn => {
                self.run(variant, units_from_documents::<IpPair>(summaries)).await
            }
            BeaconVariant::Sni => {
                self.run(variant, units_from_documents::<SrcFqdnPair>(summaries)).await
            }
            BeaconVariant::Proxy => {
                self.run(variant, units_from_documents::<ProxyPair>(summaries)).await
            }
        }
    }
}
