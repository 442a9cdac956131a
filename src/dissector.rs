//! Dissection stage: re-aggregates pair summaries and forwards analyzable
//! candidates.
//!
//! For every unit a worker runs one aggregation over the pair's summary
//! record. Records already flagged as strobes are excluded by the match.
//! The connection count is summed and filtered against the module threshold
//! before any per-timestamp expansion, so low-traffic pairs are discarded
//! before the expensive unwinds. What survives is classified:
//!
//! - more connections than the strobe ceiling: forwarded as a strobe with
//!   counts, bytes and endpoints only
//! - otherwise: forwarded with timestamps and byte lists, but only if more
//!   than [`DISTINCT_TIMESTAMP_FLOOR`] distinct timestamps exist
//!
//! Store failures are retried, logged and counted, then the unit is dropped.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::aggregate::{Accumulator, Document, Expr, Filter, Pipeline, Projection};
use crate::config::{Config, PipelineConfig};
use crate::error::{PipelineError, StoreError};
use crate::metrics::{PipelineMetrics, SharedMetrics};
use crate::pairs::{UniqueIp, UnitOfWork};
use crate::pool::{PipelineStage, WorkQueue};
use crate::store::{DocumentStore, Session};

/// Timing analysis needs more distinct timestamps than this.
pub const DISTINCT_TIMESTAMP_FLOOR: usize = 3;

/// Field and collection layout of one family of pair summaries.
///
/// The SNI, proxy and IP-pair variants share one query shape; only the
/// collection, the per-protocol categories the arrays live under, the strobe
/// flags and the tracked extras differ.
#[derive(Debug, Clone, PartialEq)]
pub struct PairSchema {
    /// Stage label used in logs.
    pub name: &'static str,
    pub collection: String,
    /// Paths of the sub-documents holding `ts`, `count`, `bytes`, `tbytes`
    /// and `dst_ips` arrays.
    pub categories: Vec<String>,
    /// Paths that must not be `true` for a record to be dissected.
    pub strobe_flags: Vec<String>,
    /// Pairs with this many connections or fewer are not aggregated.
    pub min_connections: i64,
    pub tracks_bytes: bool,
    pub tracks_endpoints: bool,
}

impl PairSchema {
    /// Source/SNI pairs, merged across HTTP and TLS traffic.
    pub fn sni(config: &Config) -> Self {
        Self {
            name: "beacon_sni",
            collection: config.tables.sni_conn_table.clone(),
            categories: vec!["dat.http".into(), "dat.tls".into()],
            strobe_flags: vec![
                "dat.tls.strobe".into(),
                "dat.http.strobe".into(),
                "dat.merged.strobe".into(),
            ],
            min_connections: config.beacon_sni.default_connection_thresh,
            tracks_bytes: true,
            tracks_endpoints: true,
        }
    }

    /// Source/FQDN pairs seen through a proxy.
    pub fn proxy(config: &Config) -> Self {
        Self {
            name: "beacon_proxy",
            collection: config.tables.uconn_proxy_table.clone(),
            categories: vec!["dat".into()],
            strobe_flags: vec!["strobe".into()],
            min_connections: config.beacon_proxy.default_connection_thresh,
            tracks_bytes: false,
            tracks_endpoints: false,
        }
    }

    /// Plain source/destination IP pairs.
    pub fn uconn(config: &Config) -> Self {
        Self {
            name: "beacon",
            collection: config.tables.uconn_table.clone(),
            categories: vec!["dat".into()],
            strobe_flags: vec!["strobe".into()],
            min_connections: config.beacon.default_connection_thresh,
            tracks_bytes: true,
            tracks_endpoints: false,
        }
    }

    fn source(&self, field: &str) -> Expr {
        let mut parts: Vec<Expr> = self
            .categories
            .iter()
            .map(|category| Expr::field(format!("{category}.{field}")))
            .collect();
        if parts.len() == 1 {
            parts.remove(0)
        } else {
            Expr::concat(parts)
        }
    }

    /// Builds the single-result re-aggregation for the record matching `key`.
    pub fn build_query(&self, key: Filter) -> Pipeline {
        let id = || Expr::field("_id");
        let filter = self
            .strobe_flags
            .iter()
            .fold(key, |filter, flag| filter.ne(flag.clone(), true));

        let mut fields: Vec<&'static str> = vec!["ts", "count"];
        let mut projection = vec![
            ("ts", Projection::Computed(self.source("ts"))),
            ("count", Projection::Computed(self.source("count"))),
        ];
        if self.tracks_bytes {
            fields.extend(["bytes", "tbytes"]);
            projection.push(("bytes", Projection::Computed(self.source("bytes"))));
            projection.push(("tbytes", Projection::Computed(self.source("tbytes"))));
        }
        if self.tracks_endpoints {
            fields.push("responding_ips");
            projection.push(("responding_ips", Projection::Computed(self.source("dst_ips"))));
        }

        let mut pipeline = Pipeline::new()
            .match_on(filter)
            .limit(1)
            .project(projection)
            .unwind("count")
            .group(id(), carry(&fields, vec![("count", Accumulator::sum("count"))]))
            .match_on(Filter::new().gt("count", self.min_connections));

        if self.tracks_bytes {
            pipeline = pipeline
                .unwind("tbytes")
                .group(id(), carry(&fields, vec![("tbytes", Accumulator::sum("tbytes"))]));
        }

        pipeline = pipeline.unwind("ts").unwind("ts").group(
            id(),
            carry(
                &fields,
                vec![
                    ("ts", Accumulator::add_to_set("ts")),
                    ("ts_full", Accumulator::push("ts")),
                ],
            ),
        );
        fields.push("ts_full");

        if self.tracks_bytes {
            pipeline = pipeline
                .unwind("bytes")
                .unwind("bytes")
                .group(id(), carry(&fields, vec![("bytes", Accumulator::push("bytes"))]));
        }

        if self.tracks_endpoints {
            let scalars: Vec<&'static str> = fields
                .iter()
                .copied()
                .filter(|f| *f != "responding_ips")
                .collect();
            pipeline = pipeline
                .unwind("responding_ips")
                .unwind("responding_ips")
                .group(
                    Expr::object(vec![
                        ("pair_id", Expr::field("_id")),
                        ("ip", Expr::field("responding_ips.ip")),
                        ("network_uuid", Expr::field("responding_ips.network_uuid")),
                    ]),
                    carry(
                        &scalars,
                        vec![(
                            "network_name",
                            Accumulator::last("responding_ips.network_name"),
                        )],
                    ),
                )
                .group(
                    Expr::field("_id.pair_id"),
                    carry(
                        &scalars,
                        vec![(
                            "responding_ips",
                            Accumulator::Push(Expr::object(vec![
                                ("ip", Expr::field("_id.ip")),
                                ("network_uuid", Expr::field("_id.network_uuid")),
                                ("network_name", Expr::field("network_name")),
                            ])),
                        )],
                    ),
                );
        }

        pipeline
            .project(
                fields
                    .iter()
                    .map(|f| (*f, Projection::Include))
                    .collect::<Vec<_>>(),
            )
            .allow_disk_use()
    }
}

/// Group fields passing every carried field through with `first`, except
/// those given an explicit accumulator.
fn carry(fields: &[&str], overrides: Vec<(&str, Accumulator)>) -> Vec<(String, Accumulator)> {
    let mut out: Vec<(String, Accumulator)> = fields
        .iter()
        .filter(|f| !overrides.iter().any(|(name, _)| name == *f))
        .map(|f| (f.to_string(), Accumulator::first(f)))
        .collect();
    out.extend(overrides.into_iter().map(|(name, acc)| (name.to_string(), acc)));
    out
}

/// Decoded output of the re-aggregation. A missing document decodes to
/// all zeros.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PairAggregate {
    pub count: i64,
    pub ts: Vec<i64>,
    pub ts_full: Vec<i64>,
    pub bytes: Vec<i64>,
    pub tbytes: i64,
    pub responding_ips: Vec<UniqueIp>,
}

impl PairAggregate {
    pub fn decode(doc: Option<Document>) -> Result<Self, StoreError> {
        match doc {
            Some(mut doc) => {
                doc.retain(|_, v| !v.is_null());
                Ok(serde_json::from_value(serde_json::Value::Object(doc))?)
            }
            None => Ok(Self::default()),
        }
    }
}

/// What the dissector hands downstream for one unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DissectionResult<U> {
    pub unit: U,
    pub connection_count: i64,
    pub total_bytes: i64,
    pub is_strobe: bool,
    /// Distinct connection timestamps (epoch seconds), unordered.
    pub ts_list: Vec<i64>,
    /// Every connection timestamp, duplicates included.
    pub ts_list_full: Vec<i64>,
    pub orig_bytes_list: Vec<i64>,
    pub responding_ips: Vec<UniqueIp>,
}

/// Outcome of classifying one aggregate.
#[derive(Debug, Clone, PartialEq)]
pub enum Dissection<U> {
    Emit(DissectionResult<U>),
    NoData,
    InsufficientSamples { distinct: usize },
}

/// Applies the strobe ceiling and the distinct-timestamp floor.
pub fn classify<U>(unit: U, aggregate: PairAggregate, conn_limit: i64) -> Dissection<U> {
    if aggregate.count <= 0 {
        return Dissection::NoData;
    }

    let mut result = DissectionResult {
        unit,
        connection_count: aggregate.count,
        total_bytes: aggregate.tbytes,
        is_strobe: false,
        ts_list: Vec::new(),
        ts_list_full: Vec::new(),
        orig_bytes_list: Vec::new(),
        responding_ips: aggregate.responding_ips,
    };

    if result.connection_count > conn_limit {
        result.is_strobe = true;
        return Dissection::Emit(result);
    }

    if aggregate.ts.len() <= DISTINCT_TIMESTAMP_FLOOR {
        return Dissection::InsufficientSamples {
            distinct: aggregate.ts.len(),
        };
    }

    result.ts_list = aggregate.ts;
    result.ts_list_full = aggregate.ts_full;
    result.orig_bytes_list = aggregate.bytes;
    Dissection::Emit(result)
}

struct DissectorInner<S, N> {
    conn_limit: i64,
    schema: PairSchema,
    store: S,
    tuning: PipelineConfig,
    next: Arc<N>,
    metrics: SharedMetrics,
}

impl<S: DocumentStore, N> DissectorInner<S, N> {
    async fn dissect<U>(&self, session: &mut S::Session, unit: U)
    where
        U: UnitOfWork,
        N: PipelineStage<DissectionResult<U>>,
    {
        let pipeline = self.schema.build_query(unit.query_key());
        let aggregate = match self.aggregate(session, &pipeline).await {
            Ok(aggregate) => aggregate,
            Err(e) => {
                PipelineMetrics::inc(&self.metrics.store_failures);
                warn!("{}: dropping {} after store failure: {}", self.schema.name, unit, e);
                return;
            }
        };
        PipelineMetrics::inc(&self.metrics.units_dissected);

        match classify(unit, aggregate, self.conn_limit) {
            Dissection::Emit(result) => {
                let counter = if result.is_strobe {
                    &self.metrics.strobes_emitted
                } else {
                    &self.metrics.candidates_emitted
                };
                debug!(
                    "{}: {} has {} connections (strobe: {})",
                    self.schema.name, result.unit, result.connection_count, result.is_strobe
                );
                match self.next.submit(result).await {
                    Ok(()) => PipelineMetrics::inc(counter),
                    Err(e) => warn!("{}: downstream rejected result: {}", self.schema.name, e),
                }
            }
            Dissection::NoData => {
                PipelineMetrics::inc(&self.metrics.dropped_no_data);
                trace!("{}: no qualifying traffic", self.schema.name);
            }
            Dissection::InsufficientSamples { distinct } => {
                PipelineMetrics::inc(&self.metrics.dropped_insufficient_samples);
                debug!(
                    "{}: only {} distinct timestamps, not analyzable",
                    self.schema.name, distinct
                );
            }
        }
    }

    async fn aggregate(
        &self,
        session: &mut S::Session,
        pipeline: &Pipeline,
    ) -> Result<PairAggregate, StoreError> {
        let timeout = self.tuning.query_timeout();
        let mut attempt = 0;
        loop {
            let outcome = match tokio::time::timeout(
                timeout,
                session.aggregate_one(&self.schema.collection, pipeline),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(StoreError::Timeout {
                    collection: self.schema.collection.clone(),
                    elapsed: timeout,
                }),
            };

            match outcome {
                Ok(doc) => return PairAggregate::decode(doc),
                Err(e) if attempt < self.tuning.query_retries => {
                    attempt += 1;
                    PipelineMetrics::inc(&self.metrics.store_retries);
                    warn!("{}: aggregation attempt {} failed: {}", self.schema.name, attempt, e);
                    tokio::time::sleep(self.tuning.retry_backoff() * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Pool of dissection workers sharing one input queue.
pub struct Dissector<U, S, N> {
    queue: WorkQueue<U>,
    inner: Arc<DissectorInner<S, N>>,
}

impl<U, S, N> Dissector<U, S, N>
where
    U: UnitOfWork,
    S: DocumentStore,
    N: PipelineStage<DissectionResult<U>> + 'static,
{
    pub fn new(
        conn_limit: i64,
        store: S,
        schema: PairSchema,
        tuning: &PipelineConfig,
        next: Arc<N>,
        metrics: SharedMetrics,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            queue: WorkQueue::new(schema.name, cancel).with_submit_timeout(tuning.submit_timeout()),
            inner: Arc::new(DissectorInner {
                conn_limit,
                schema,
                store,
                tuning: tuning.clone(),
                next,
                metrics,
            }),
        }
    }
}

#[async_trait]
impl<U, S, N> PipelineStage<U> for Dissector<U, S, N>
where
    U: UnitOfWork,
    S: DocumentStore,
    N: PipelineStage<DissectionResult<U>> + 'static,
{
    async fn submit(&self, unit: U) -> Result<(), PipelineError> {
        self.queue.submit(unit).await?;
        PipelineMetrics::inc(&self.inner.metrics.units_submitted);
        Ok(())
    }

    fn start(&self) {
        let inner = Arc::clone(&self.inner);
        self.queue.spawn(move |worker| async move {
            let mut session = match inner.store.session().await {
                Ok(session) => session,
                Err(e) => {
                    PipelineMetrics::inc(&inner.metrics.session_failures);
                    error!("{}: worker could not check out a session: {}", inner.schema.name, e);
                    worker.abandon();
                    return;
                }
            };
            while let Some(unit) = worker.recv().await {
                inner.dissect(&mut session, unit).await;
            }
        });
    }

    async fn shutdown(&self) -> Result<(), PipelineError> {
        self.queue.close_and_drain().await?;
        info!("{}: dissection complete", self.inner.schema.name);
        self.inner.next.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Stage;
    use crate::metrics::new_shared_metrics;
    use crate::pairs::{IpPair, ProxyPair, SrcFqdnPair};
    use crate::pool::testing::RecordingStage;
    use crate::store::MemoryStore;
    use serde_json::{json, Value};
    use std::collections::HashSet;

    const NET: &str = "2b9b1bd4-1c5a-4d4e-a6b0-6f1fd3b0c9a1";

    fn test_config() -> Config {
        let mut config = Config::default();
        config.strobe.connection_limit = 20;
        config.beacon_sni.default_connection_thresh = 3;
        config.beacon_proxy.default_connection_thresh = 3;
        config.beacon.default_connection_thresh = 3;
        config.pipeline.retry_backoff_ms = 1;
        config
    }

    fn endpoint(ip: &str, name: &str) -> Value {
        json!({"ip": ip, "network_uuid": NET, "network_name": name})
    }

    fn category(count: i64, ts: &[i64], dst_ips: Vec<Value>) -> Value {
        json!({
            "count": count,
            "tbytes": 100 * ts.len() as i64,
            "ts": ts,
            "bytes": vec![100; ts.len()],
            "dst_ips": dst_ips,
        })
    }

    fn sni_summary(fqdn: &str, http: Value, tls: Value) -> Document {
        let doc = json!({
            "src": "10.0.0.5",
            "src_network_uuid": NET,
            "src_network_name": "lan",
            "fqdn": fqdn,
            "dat": [{"http": http, "tls": tls}],
        });
        doc.as_object().cloned().unwrap()
    }

    fn sni_unit(fqdn: &str) -> SrcFqdnPair {
        SrcFqdnPair::new(
            UniqueIp::new("10.0.0.5".parse().unwrap(), NET.parse().unwrap(), "lan"),
            fqdn,
        )
    }

    struct Run<U> {
        results: Vec<DissectionResult<U>>,
        recorder: Arc<RecordingStage<DissectionResult<U>>>,
        metrics: SharedMetrics,
    }

    async fn run_schema<U: UnitOfWork>(
        store: &MemoryStore,
        schema: PairSchema,
        units: Vec<U>,
        config: &Config,
    ) -> Run<U> {
        let recorder = Arc::new(RecordingStage::default());
        let metrics = new_shared_metrics();
        let dissector = Dissector::new(
            config.strobe.connection_limit,
            store.clone(),
            schema,
            &config.pipeline,
            Arc::clone(&recorder),
            Arc::clone(&metrics),
            CancellationToken::new(),
        );
        for _ in 0..2 {
            dissector.start();
        }
        for unit in units {
            dissector.submit(unit).await.unwrap();
        }
        dissector.shutdown().await.unwrap();

        Run {
            results: recorder.items(),
            recorder,
            metrics,
        }
    }

    async fn run_sni(store: &MemoryStore, units: Vec<SrcFqdnPair>, config: &Config) -> Run<SrcFqdnPair> {
        run_schema(store, PairSchema::sni(config), units, config).await
    }

    fn proxy_summary(fqdn: &str, dat: Value, strobe: bool) -> Document {
        let doc = json!({
            "src": "10.0.0.5",
            "src_network_uuid": NET,
            "src_network_name": "lan",
            "fqdn": fqdn,
            "proxy": endpoint("10.0.0.254", "lan"),
            "strobe": strobe,
            "dat": dat,
        });
        doc.as_object().cloned().unwrap()
    }

    fn uconn_summary(dst: &str, dat: Value, strobe: bool) -> Document {
        let doc = json!({
            "src": "10.0.0.5",
            "src_network_uuid": NET,
            "src_network_name": "lan",
            "dst": dst,
            "dst_network_uuid": NET,
            "dst_network_name": "wan",
            "strobe": strobe,
            "dat": dat,
        });
        doc.as_object().cloned().unwrap()
    }

    /// Store that never hands out a session.
    struct UnavailableStore;

    #[async_trait]
    impl DocumentStore for UnavailableStore {
        type Session = crate::store::MemorySession;

        async fn session(&self) -> Result<Self::Session, StoreError> {
            Err(StoreError::SessionUnavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_below_threshold_emits_nothing() {
        let store = MemoryStore::new();
        let ts = [100, 160, 220, 280, 340];
        store.insert_many(
            "SNIconn",
            vec![sni_summary("low.example.com", category(1, &ts, vec![]), category(1, &ts, vec![]))],
        );

        let run = run_sni(&store, vec![sni_unit("low.example.com")], &test_config()).await;

        assert!(run.results.is_empty());
        assert_eq!(run.metrics.snapshot().dropped_no_data, 1);
    }

    #[tokio::test]
    async fn test_strobe_carries_no_timestamps() {
        let store = MemoryStore::new();
        let ts: Vec<i64> = (0..30).map(|i| 1_000 + i * 60).collect();
        store.insert_many(
            "SNIconn",
            vec![sni_summary(
                "chatty.example.com",
                category(30, &ts, vec![endpoint("203.0.113.9", "wan")]),
                category(20, &ts, vec![endpoint("203.0.113.9", "wan")]),
            )],
        );

        let run = run_sni(&store, vec![sni_unit("chatty.example.com")], &test_config()).await;

        assert_eq!(run.results.len(), 1);
        let result = &run.results[0];
        assert!(result.is_strobe);
        assert_eq!(result.connection_count, 50);
        assert_eq!(result.total_bytes, 6_000);
        assert!(result.ts_list.is_empty());
        assert!(result.ts_list_full.is_empty());
        assert!(result.orig_bytes_list.is_empty());
        assert_eq!(result.responding_ips.len(), 1);
        assert_eq!(run.metrics.snapshot().strobes_emitted, 1);
    }

    #[tokio::test]
    async fn test_candidate_with_five_distinct_timestamps() {
        let store = MemoryStore::new();
        store.insert_many(
            "SNIconn",
            vec![sni_summary(
                "beacon.example.com",
                category(6, &[100, 160, 220], vec![endpoint("203.0.113.9", "wan")]),
                category(4, &[220, 280, 340], vec![endpoint("203.0.113.10", "wan")]),
            )],
        );

        let run = run_sni(&store, vec![sni_unit("beacon.example.com")], &test_config()).await;

        assert_eq!(run.results.len(), 1);
        let result = &run.results[0];
        assert!(!result.is_strobe);
        assert_eq!(result.connection_count, 10);
        assert_eq!(result.unit, sni_unit("beacon.example.com"));

        let distinct: HashSet<i64> = result.ts_list.iter().copied().collect();
        assert_eq!(result.ts_list.len(), 5);
        assert_eq!(distinct.len(), 5, "ts_list must not contain duplicates");
        assert_eq!(result.ts_list_full.len(), 6);
        let full: HashSet<i64> = result.ts_list_full.iter().copied().collect();
        assert!(distinct.is_subset(&full));

        assert_eq!(result.orig_bytes_list, vec![100; 6]);
        assert_eq!(result.total_bytes, 600);
        assert_eq!(result.responding_ips.len(), 2);
    }

    #[tokio::test]
    async fn test_two_distinct_timestamps_dropped() {
        let store = MemoryStore::new();
        store.insert_many(
            "SNIconn",
            vec![sni_summary(
                "sparse.example.com",
                category(5, &[100, 100, 200], vec![endpoint("203.0.113.9", "wan")]),
                category(5, &[200, 100], vec![endpoint("203.0.113.9", "wan")]),
            )],
        );

        let run = run_sni(&store, vec![sni_unit("sparse.example.com")], &test_config()).await;

        assert!(run.results.is_empty());
        assert_eq!(run.metrics.snapshot().dropped_insufficient_samples, 1);
    }

    #[tokio::test]
    async fn test_flagged_strobe_excluded_on_every_read() {
        let store = MemoryStore::new();
        let ts: Vec<i64> = (0..10).map(|i| i * 60).collect();
        let mut tls = category(25, &ts, vec![endpoint("203.0.113.9", "wan")]);
        tls["strobe"] = json!(true);
        store.insert_many(
            "SNIconn",
            vec![sni_summary(
                "flagged.example.com",
                category(25, &ts, vec![endpoint("203.0.113.9", "wan")]),
                tls,
            )],
        );

        let config = test_config();
        for _ in 0..2 {
            let run = run_sni(&store, vec![sni_unit("flagged.example.com")], &config).await;
            assert!(run.results.is_empty());
            assert_eq!(run.metrics.snapshot().dropped_no_data, 1);
        }
    }

    #[tokio::test]
    async fn test_missing_summary_is_zero_result() {
        let store = MemoryStore::new();
        let run = run_sni(&store, vec![sni_unit("nowhere.example.com")], &test_config()).await;

        assert!(run.results.is_empty());
        let snapshot = run.metrics.snapshot();
        assert_eq!(snapshot.units_dissected, 1);
        assert_eq!(snapshot.dropped_no_data, 1);
        assert_eq!(snapshot.store_failures, 0);
    }

    #[tokio::test]
    async fn test_responding_ips_deduplicated_with_last_name() {
        let store = MemoryStore::new();
        store.insert_many(
            "SNIconn",
            vec![sni_summary(
                "cdn.example.com",
                category(
                    6,
                    &[100, 160, 220],
                    vec![endpoint("203.0.113.9", "wan"), endpoint("203.0.113.10", "wan")],
                ),
                category(
                    4,
                    &[280, 340],
                    vec![endpoint("203.0.113.9", "wan-renamed")],
                ),
            )],
        );

        let run = run_sni(&store, vec![sni_unit("cdn.example.com")], &test_config()).await;

        let ips = &run.results[0].responding_ips;
        assert_eq!(ips.len(), 2);
        let distinct: HashSet<(String, String)> = ips
            .iter()
            .map(|ip| (ip.ip.to_string(), ip.network_uuid.to_string()))
            .collect();
        assert_eq!(distinct.len(), 2);
        let renamed = ips
            .iter()
            .find(|ip| ip.ip.to_string() == "203.0.113.9")
            .unwrap();
        assert_eq!(renamed.network_name, "wan-renamed");
    }

    #[tokio::test]
    async fn test_store_failure_counted_and_dropped() {
        let store = MemoryStore::new();
        store.insert_many(
            "SNIconn",
            vec![sni_summary(
                "beacon.example.com",
                category(6, &[100, 160, 220], vec![endpoint("203.0.113.9", "wan")]),
                category(4, &[280, 340], vec![endpoint("203.0.113.9", "wan")]),
            )],
        );
        store.fail_next(10);

        let config = test_config();
        let run = run_sni(&store, vec![sni_unit("beacon.example.com")], &config).await;

        assert!(run.results.is_empty());
        let snapshot = run.metrics.snapshot();
        assert_eq!(snapshot.store_failures, 1);
        assert_eq!(snapshot.store_retries, u64::from(config.pipeline.query_retries));
    }

    #[tokio::test]
    async fn test_store_failure_recovered_by_retry() {
        let store = MemoryStore::new();
        store.insert_many(
            "SNIconn",
            vec![sni_summary(
                "beacon.example.com",
                category(6, &[100, 160, 220], vec![endpoint("203.0.113.9", "wan")]),
                category(4, &[280, 340], vec![endpoint("203.0.113.9", "wan")]),
            )],
        );
        store.fail_next(1);

        let run = run_sni(&store, vec![sni_unit("beacon.example.com")], &test_config()).await;

        assert_eq!(run.results.len(), 1);
        assert_eq!(run.metrics.snapshot().store_retries, 1);
        assert_eq!(run.metrics.snapshot().store_failures, 0);
    }

    #[tokio::test]
    async fn test_query_timeout_counts_as_failure() {
        let store = MemoryStore::new();
        store.set_latency(std::time::Duration::from_millis(200));

        let mut config = test_config();
        config.pipeline.query_timeout_ms = 10;
        config.pipeline.query_retries = 0;
        let run = run_sni(&store, vec![sni_unit("slow.example.com")], &config).await;

        assert!(run.results.is_empty());
        assert_eq!(run.metrics.snapshot().store_failures, 1);
    }

    #[tokio::test]
    async fn test_sessions_released_and_cascade_once() {
        let store = MemoryStore::new();
        let recorder: Arc<RecordingStage<DissectionResult<SrcFqdnPair>>> =
            Arc::new(RecordingStage::default());
        let config = test_config();
        let dissector = Dissector::new(
            config.strobe.connection_limit,
            store.clone(),
            PairSchema::sni(&config),
            &config.pipeline,
            Arc::clone(&recorder),
            new_shared_metrics(),
            CancellationToken::new(),
        );
        for _ in 0..3 {
            dissector.start();
        }
        dissector.submit(sni_unit("a.example.com")).await.unwrap();
        dissector.shutdown().await.unwrap();

        assert_eq!(store.open_sessions(), 0);
        assert_eq!(store.sessions_opened(), 3);
        assert_eq!(recorder.shutdowns(), 1);

        assert!(matches!(
            dissector.shutdown().await,
            Err(PipelineError::AlreadyShutDown(_))
        ));
        assert!(matches!(
            dissector.submit(sni_unit("b.example.com")).await,
            Err(PipelineError::QueueClosed(_))
        ));
        assert_eq!(recorder.shutdowns(), 1);
    }

    #[tokio::test]
    async fn test_many_units_across_workers() {
        let store = MemoryStore::new();
        let mut units = Vec::new();
        for i in 0..20 {
            let fqdn = format!("host{i}.example.com");
            store.insert_many(
                "SNIconn",
                vec![sni_summary(
                    &fqdn,
                    category(6, &[100, 160, 220], vec![endpoint("203.0.113.9", "wan")]),
                    category(4, &[280, 340], vec![endpoint("203.0.113.9", "wan")]),
                )],
            );
            units.push(sni_unit(&fqdn));
        }

        let run = run_sni(&store, units, &test_config()).await;

        assert_eq!(run.results.len(), 20);
        let fqdns: HashSet<String> = run.results.iter().map(|r| r.unit.fqdn.clone()).collect();
        assert_eq!(fqdns.len(), 20);
        assert_eq!(run.recorder.shutdowns(), 1);
    }

    #[tokio::test]
    async fn test_proxy_variant() {
        let store = MemoryStore::new();
        let doc = json!({
            "src": "10.0.0.5",
            "src_network_uuid": NET,
            "fqdn": "c2.example.net",
            "proxy": endpoint("10.0.0.254", "lan"),
            "dat": [
                {"count": 3, "ts": [100, 160, 220]},
                {"count": 4, "ts": [280, 340, 400, 400]},
            ],
        });
        store.insert_many("uconnProxy", vec![doc.as_object().cloned().unwrap()]);
        let unit = ProxyPair::from_summary(doc.as_object().unwrap()).unwrap();

        let config = test_config();
        let recorder: Arc<RecordingStage<DissectionResult<ProxyPair>>> =
            Arc::new(RecordingStage::default());
        let dissector = Dissector::new(
            config.strobe.connection_limit,
            store.clone(),
            PairSchema::proxy(&config),
            &config.pipeline,
            Arc::clone(&recorder),
            new_shared_metrics(),
            CancellationToken::new(),
        );
        dissector.start();
        dissector.submit(unit.clone()).await.unwrap();
        dissector.shutdown().await.unwrap();

        let results = recorder.items();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].unit, unit);
        assert_eq!(results[0].connection_count, 7);
        assert_eq!(results[0].ts_list.len(), 6);
        assert_eq!(results[0].ts_list_full.len(), 7);
        assert!(results[0].responding_ips.is_empty());
    }

    #[tokio::test]
    async fn test_proxy_flagged_and_low_count_pairs_skipped() {
        let store = MemoryStore::new();
        let ts = [100, 160, 220, 280, 340];
        let busy = json!([{"count": 5, "ts": ts}, {"count": 5, "ts": [400]}]);
        store.insert_many(
            "uconnProxy",
            vec![
                proxy_summary("flagged.example.net", busy.clone(), true),
                proxy_summary("quiet.example.net", json!([{"count": 2, "ts": ts}, {"count": 1, "ts": [400]}]), false),
                proxy_summary("c2.example.net", busy, false),
            ],
        );
        let units: Vec<ProxyPair> = store
            .documents("uconnProxy")
            .iter()
            .filter_map(ProxyPair::from_summary)
            .collect();
        assert_eq!(units.len(), 3);

        let config = test_config();
        let run = run_schema(&store, PairSchema::proxy(&config), units, &config).await;

        assert_eq!(run.results.len(), 1);
        assert_eq!(run.results[0].unit.hosts.fqdn, "c2.example.net");
        assert_eq!(run.results[0].ts_list.len(), 6);
        assert_eq!(run.metrics.snapshot().dropped_no_data, 2);
    }

    #[tokio::test]
    async fn test_uconn_flagged_strobe_excluded() {
        let store = MemoryStore::new();
        let dat = json!([{
            "count": 8,
            "tbytes": 800,
            "ts": [100, 160, 220, 280, 340, 400, 460, 520],
            "bytes": vec![100; 8],
        }]);
        store.insert_many(
            "uconn",
            vec![
                uconn_summary("203.0.113.9", dat.clone(), true),
                uconn_summary("203.0.113.10", dat, false),
            ],
        );
        let units: Vec<IpPair> = store
            .documents("uconn")
            .iter()
            .filter_map(IpPair::from_summary)
            .collect();

        let config = test_config();
        let run = run_schema(&store, PairSchema::uconn(&config), units, &config).await;

        assert_eq!(run.results.len(), 1);
        let result = &run.results[0];
        assert_eq!(result.unit.dst.ip.to_string(), "203.0.113.10");
        assert_eq!(result.total_bytes, 800);
        assert_eq!(result.orig_bytes_list, vec![100; 8]);
        assert_eq!(run.metrics.snapshot().dropped_no_data, 1);
    }

    #[tokio::test]
    async fn test_twenty_thousand_timestamps_aggregate() {
        let store = MemoryStore::new();
        let http: Vec<i64> = (0..10_000).map(|i| 1_000 + i * 7).collect();
        let tls: Vec<i64> = (10_000..20_000).map(|i| 1_000 + i * 7).collect();
        store.insert_many(
            "SNIconn",
            vec![sni_summary(
                "busy.example.com",
                category(10_000, &http, vec![endpoint("203.0.113.9", "wan")]),
                category(10_000, &tls, vec![endpoint("203.0.113.9", "wan")]),
            )],
        );

        let mut config = test_config();
        config.strobe.connection_limit = 86_400;
        let run = run_sni(&store, vec![sni_unit("busy.example.com")], &config).await;

        assert_eq!(run.results.len(), 1);
        let result = &run.results[0];
        assert!(!result.is_strobe);
        assert_eq!(result.connection_count, 20_000);
        assert_eq!(result.ts_list.len(), 20_000);
        assert_eq!(result.ts_list_full.len(), 20_000);
        assert_eq!(result.orig_bytes_list.len(), 20_000);
        assert_eq!(result.responding_ips.len(), 1);
    }

    #[tokio::test]
    async fn test_cpu_bound_query_times_out() {
        let store = MemoryStore::new();
        let ts: Vec<i64> = (0..200_000).collect();
        store.insert_many(
            "SNIconn",
            vec![sni_summary(
                "huge.example.com",
                category(200_000, &ts, vec![endpoint("203.0.113.9", "wan")]),
                category(200_000, &ts, vec![endpoint("203.0.113.9", "wan")]),
            )],
        );

        let mut config = test_config();
        config.strobe.connection_limit = 1_000_000;
        config.pipeline.query_timeout_ms = 1;
        config.pipeline.query_retries = 0;
        let run = run_sni(&store, vec![sni_unit("huge.example.com")], &config).await;

        assert!(run.results.is_empty());
        assert_eq!(run.metrics.snapshot().store_failures, 1);
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_no_sessions_cancels_instead_of_blocking() {
        let config = test_config();
        let metrics = new_shared_metrics();
        let recorder: Arc<RecordingStage<DissectionResult<SrcFqdnPair>>> =
            Arc::new(RecordingStage::default());
        let dissector = Dissector::new(
            config.strobe.connection_limit,
            UnavailableStore,
            PairSchema::sni(&config),
            &config.pipeline,
            Arc::clone(&recorder),
            Arc::clone(&metrics),
            CancellationToken::new(),
        );
        dissector.start();
        dissector.start();

        let submitted = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            dissector.submit(sni_unit("a.example.com")),
        )
        .await
        .expect("submit must not hang");
        assert!(matches!(submitted, Err(PipelineError::Cancelled(_))));
        assert_eq!(metrics.snapshot().session_failures, 2);
        assert_eq!(metrics.snapshot().units_submitted, 0);

        dissector.shutdown().await.unwrap();
        assert_eq!(recorder.shutdowns(), 1);
    }

    #[test]
    fn test_query_filters_count_before_expansion() {
        let config = test_config();
        let pipeline = PairSchema::sni(&config).build_query(sni_unit("x").query_key());
        let stages = pipeline.stages();

        assert!(pipeline.allows_disk_use());
        match &stages[0] {
            Stage::Match(filter) => {
                assert!(filter.conditions().iter().any(|(p, _)| p == "dat.merged.strobe"));
                assert_eq!(filter.conditions().len(), 6);
            }
            other => panic!("expected match, got {:?}", other),
        }
        assert_eq!(stages[1], Stage::Limit(1));

        let count_filter = stages
            .iter()
            .position(|s| matches!(s, Stage::Match(f) if f.conditions().iter().any(|(p, _)| p == "count")))
            .unwrap();
        let first_ts_unwind = stages
            .iter()
            .position(|s| *s == Stage::Unwind("ts".into()))
            .unwrap();
        assert!(count_filter < first_ts_unwind);
    }

    #[test]
    fn test_proxy_query_skips_bytes_and_endpoints() {
        let config = test_config();
        let pipeline = PairSchema::proxy(&config).build_query(Filter::new());
        assert!(!pipeline
            .stages()
            .iter()
            .any(|s| matches!(s, Stage::Unwind(f) if f == "bytes" || f == "responding_ips")));
    }

    #[test]
    fn test_classify_boundaries() {
        let aggregate = |count: i64, distinct: usize| PairAggregate {
            count,
            ts: (0..distinct as i64).collect(),
            ts_full: (0..distinct as i64).collect(),
            ..Default::default()
        };

        assert_eq!(classify((), aggregate(0, 10), 20), Dissection::NoData);
        assert_eq!(
            classify((), aggregate(10, 3), 20),
            Dissection::InsufficientSamples { distinct: 3 }
        );
        assert!(matches!(classify((), aggregate(10, 4), 20), Dissection::Emit(r) if !r.is_strobe));
        assert!(matches!(classify((), aggregate(20, 4), 20), Dissection::Emit(r) if !r.is_strobe));
        assert!(
            matches!(classify((), aggregate(21, 0), 20), Dissection::Emit(r) if r.is_strobe && r.ts_list.is_empty())
        );
    }

    #[test]
    fn test_decode_missing_document() {
        assert_eq!(PairAggregate::decode(None).unwrap(), PairAggregate::default());
        let doc = json!({"_id": "x", "count": 4, "tbytes": null});
        let decoded = PairAggregate::decode(doc.as_object().cloned()).unwrap();
        assert_eq!(decoded.count, 4);
        assert_eq!(decoded.tbytes, 0);
    }
}
