//! Invalid certificate records.
//!
//! One input per host that presented an invalid certificate. Each input
//! becomes an upsert on the certificate collection keyed by host, appending
//! this chunk's observations under `dat`.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::aggregate::Filter;
use crate::analyzer::{Analyzer, Transform};
use crate::config::Config;
use crate::error::{PipelineError, StoreError};
use crate::metrics::SharedMetrics;
use crate::orchestrator::{feed, pool_size};
use crate::pairs::UniqueIp;
use crate::pool::PipelineStage;
use crate::store::{DocumentStore, IndexSpec, Session, Update};
use crate::writer::{WriteOp, Writer};

/// Precomputed observations for one host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateInput {
    pub host: UniqueIp,
    /// Connections to the host in this chunk.
    pub seen: i64,
    /// Clients that connected to the host.
    #[serde(default)]
    pub orig_ips: Vec<UniqueIp>,
    /// `port:protocol:service` tuples the host answered on.
    #[serde(default)]
    pub tuples: Vec<String>,
    /// Validation failure codes reported for the certificates.
    #[serde(default)]
    pub invalid_certs: Vec<String>,
}

fn ip_value(ip: &UniqueIp) -> Value {
    json!({
        "ip": ip.ip.to_string(),
        "network_uuid": ip.network_uuid.to_string(),
        "network_name": ip.network_name,
    })
}

/// Turns inputs into certificate upserts tagged with the current chunk.
pub struct CertificateSummarizer {
    collection: String,
    current_chunk: i64,
}

impl CertificateSummarizer {
    pub fn new(collection: impl Into<String>, current_chunk: i64) -> Self {
        Self {
            collection: collection.into(),
            current_chunk,
        }
    }
}

impl Transform<CertificateInput> for CertificateSummarizer {
    type Output = WriteOp;

    fn transform(&self, input: CertificateInput) -> Option<WriteOp> {
        let mut seen_clients = HashSet::new();
        let orig_ips: Vec<Value> = input
            .orig_ips
            .iter()
            .filter(|ip| seen_clients.insert((ip.ip, ip.network_uuid)))
            .map(ip_value)
            .collect();
        let tuples: BTreeSet<&str> = input.tuples.iter().map(String::as_str).collect();
        let invalid_certs: BTreeSet<&str> = input.invalid_certs.iter().map(String::as_str).collect();

        let selector = Filter::new()
            .eq("ip", input.host.ip.to_string())
            .eq("network_uuid", input.host.network_uuid.to_string());
        let update = Update::new()
            .set("network_name", input.host.network_name.clone())
            .push(
                "dat",
                json!({
                    "seen": input.seen,
                    "orig_ips": orig_ips,
                    "tuples": tuples,
                    "icerts": invalid_certs,
                    "cid": self.current_chunk,
                }),
            );

        Some(WriteOp {
            collection: self.collection.clone(),
            selector,
            update,
        })
    }
}

/// Certificate collection bootstrap and bulk upsert.
pub struct CertificateRepository<S> {
    store: S,
    config: Config,
    metrics: SharedMetrics,
    cancel: CancellationToken,
}

impl<S: DocumentStore + Clone> CertificateRepository<S> {
    pub fn new(store: S, config: Config, metrics: SharedMetrics, cancel: CancellationToken) -> Self {
        Self {
            store,
            config,
            metrics,
            cancel,
        }
    }

    /// Creates the certificate collection and its indexes unless it exists.
    pub async fn create_indexes(&self) -> Result<(), StoreError> {
        let name = &self.config.tables.certificate_table;
        let indexes = [
            IndexSpec::new(&["ip", "network_uuid"]).unique(),
            IndexSpec::new(&["dat.seen"]),
        ];

        let mut session = self.store.session().await?;
        if session.ensure_collection(name, &indexes).await? {
            info!("Created collection {}", name);
        } else {
            debug!("Collection {} already exists", name);
        }
        Ok(())
    }

    /// Records every input. Returns the number of inputs fed.
    pub async fn upsert(
        &self,
        inputs: HashMap<String, CertificateInput>,
    ) -> Result<usize, PipelineError> {
        let workers = pool_size(self.config.pipeline.workers);

        let writer = Arc::new(Writer::new(
            self.store.clone(),
            self.config.pipeline.query_timeout(),
            Arc::clone(&self.metrics),
            self.cancel.child_token(),
        ));
        let analyzer = Analyzer::new(
            "cert_analyzer",
            CertificateSummarizer::new(
                self.config.tables.certificate_table.clone(),
                self.config.rolling.current_chunk,
            ),
            Arc::clone(&writer),
            Arc::clone(&self.metrics),
            self.cancel.child_token(),
        );

        for _ in 0..workers {
            analyzer.start();
            writer.start();
        }

        feed("Invalid Cert Analysis", &analyzer, inputs.into_values()).await
    }
}
