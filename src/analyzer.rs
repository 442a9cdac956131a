//! Scoring stage - turns dissection results into beacon records.
//!
//! [`Analyzer`] is a generic worker pool applying a [`Transform`] to every
//! item it receives and forwarding the output. [`BeaconScorer`] is the
//! transform used by the beacon pipelines; the certificate pipeline plugs
//! its own transform into the same pool.
//!
//! # Statistical Methodology
//!
//! ## Delta Calculation
//! For the sorted distinct timestamps [t₀, t₁, t₂, ..., tₙ] of a pair:
//! Δᵢ = tᵢ - tᵢ₋₁ for i ∈ [1, n]
//!
//! ## Jitter Metric (Coefficient of Variation)
//! CV = σ / μ where:
//! - σ (sigma) = standard deviation of intervals
//! - μ (mu) = mean of intervals
//!
//! The CV is dimensionless and allows comparison across pairs with different
//! beacon frequencies. The timing score is `1 - min(CV, 1)`; the data size
//! score applies the same formula to the originator byte counts.
//!
//! ## Classification Thresholds
//! - CV < 0.1: Highly Periodic → Probable Bot/C2
//! - 0.1 ≤ CV < 0.5: Jittered Periodicity → Suspicious
//! - CV ≥ 1.0: Stochastic → Likely Human/Organic Traffic

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Distribution, Max, Min, OrderStatistics};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dissector::{DissectionResult, DISTINCT_TIMESTAMP_FLOOR};
use crate::error::PipelineError;
use crate::metrics::{PipelineMetrics, SharedMetrics};
use crate::pairs::{UniqueIp, UnitOfWork};
use crate::pool::{PipelineStage, WorkQueue};
use crate::store::Update;
use crate::writer::WriteOp;

/// Classification of pair behavior based on CV analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowClassification {
    /// CV < 0.1 - Highly regular intervals, likely automated/C2
    HighlyPeriodic,
    /// 0.1 ≤ CV < 0.5 - Some jitter but still suspicious regularity
    JitteredPeriodic,
    /// 0.5 ≤ CV < 1.0 - Moderate variation, needs monitoring
    Moderate,
    /// CV ≥ 1.0 - High variation, likely human-driven
    Stochastic,
    /// Insufficient data for classification
    Insufficient,
}

impl FlowClassification {
    /// Returns the classification based on CV value.
    pub fn from_cv(cv: f64) -> Self {
        match cv {
            cv if cv < 0.1 => Self::HighlyPeriodic,
            cv if cv < 0.5 => Self::JitteredPeriodic,
            cv if cv < 1.0 => Self::Moderate,
            _ => Self::Stochastic,
        }
    }

    /// Returns a human-readable severity level.
    pub fn severity(&self) -> &'static str {
        match self {
            Self::HighlyPeriodic => "CRITICAL",
            Self::JitteredPeriodic => "HIGH",
            Self::Moderate => "MEDIUM",
            Self::Stochastic => "LOW",
            Self::Insufficient => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for FlowClassification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HighlyPeriodic => write!(f, "Highly Periodic (Probable Bot)"),
            Self::JitteredPeriodic => write!(f, "Jittered Periodic (Suspicious)"),
            Self::Moderate => write!(f, "Moderate Variation"),
            Self::Stochastic => write!(f, "Stochastic (Likely Organic)"),
            Self::Insufficient => write!(f, "Insufficient Data"),
        }
    }
}

/// Trait for beacon detection algorithms.
/// Allows for extensibility with different detection strategies.
pub trait Detector: Send + Sync {
    /// Analyzes a series of intervals and returns a detection result.
    fn analyze(&self, intervals: &[f64]) -> DetectionResult;

    /// Returns the minimum number of samples required for analysis.
    fn min_samples(&self) -> usize;
}

/// Result of beacon detection analysis.
#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub classification: FlowClassification,
    pub statistics: Option<IntervalStatistics>,
}

impl DetectionResult {
    /// Creates a result indicating insufficient data.
    pub fn insufficient() -> Self {
        Self {
            classification: FlowClassification::Insufficient,
            statistics: None,
        }
    }
}

/// Default CV-based beacon detector.
pub struct CvDetector {
    min_samples: usize,
}

impl CvDetector {
    pub fn new(min_samples: usize) -> Self {
        Self { min_samples }
    }
}

impl Default for CvDetector {
    /// More than the distinct-timestamp floor yields at least this many deltas.
    fn default() -> Self {
        Self {
            min_samples: DISTINCT_TIMESTAMP_FLOOR,
        }
    }
}

impl Detector for CvDetector {
    fn analyze(&self, intervals: &[f64]) -> DetectionResult {
        if intervals.len() < self.min_samples.max(2) {
            return DetectionResult::insufficient();
        }

        let stats = calculate_statistics(intervals);

        DetectionResult {
            classification: FlowClassification::from_cv(stats.cv),
            statistics: Some(stats),
        }
    }

    fn min_samples(&self) -> usize {
        self.min_samples
    }
}

/// Statistical summary for a set of samples.
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalStatistics {
    pub mean: f64,
    pub std_dev: f64,
    pub cv: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
}

/// Calculates comprehensive statistics for a set of samples.
pub fn calculate_statistics(samples: &[f64]) -> IntervalStatistics {
    let mut data = Data::new(samples.to_vec());

    let mean = data.mean().unwrap_or(0.0);
    let std_dev = data.std_dev().unwrap_or(0.0);
    let cv = if mean > 0.0 { std_dev / mean } else { f64::INFINITY };
    let min = data.min();
    let max = data.max();
    let median = data.median();

    IntervalStatistics {
        mean,
        std_dev,
        cv,
        min,
        max,
        median,
    }
}

/// Converts sorted epoch-second timestamps to interval deltas in seconds.
pub fn timestamps_to_deltas(timestamps: &[i64]) -> Vec<f64> {
    if timestamps.len() < 2 {
        return Vec::new();
    }

    timestamps
        .windows(2)
        .map(|window| (window[1] - window[0]) as f64)
        .collect()
}

/// Maps a coefficient of variation onto [0, 1], 1 being perfectly regular.
fn regularity_score(cv: f64) -> f64 {
    1.0 - cv.min(1.0)
}

/// Timing half of a beacon record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingScore {
    /// Seconds between the first and last connection.
    pub range: i64,
    pub mean_interval: f64,
    pub std_dev: f64,
    pub cv: f64,
    pub median_interval: f64,
    pub classification: FlowClassification,
    pub score: f64,
}

/// Data size half of a beacon record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeScore {
    pub mean: f64,
    pub std_dev: f64,
    pub cv: f64,
    pub score: f64,
}

/// Fields written for one pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconRecord {
    pub connection_count: i64,
    pub total_bytes: i64,
    pub avg_bytes: f64,
    pub strobe: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub first_seen: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ts: Option<TimingScore>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub ds: Option<SizeScore>,
    pub score: f64,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub responding_ips: Vec<UniqueIp>,
    pub cid: i64,
}

/// Scores one dissection result.
pub fn score_result<U>(result: &DissectionResult<U>, detector: &dyn Detector, cid: i64) -> BeaconRecord {
    let avg_bytes = if result.connection_count > 0 {
        result.total_bytes as f64 / result.connection_count as f64
    } else {
        0.0
    };

    let mut record = BeaconRecord {
        connection_count: result.connection_count,
        total_bytes: result.total_bytes,
        avg_bytes,
        strobe: result.is_strobe,
        first_seen: None,
        last_seen: None,
        ts: None,
        ds: None,
        score: 0.0,
        responding_ips: result.responding_ips.clone(),
        cid,
    };
    if result.is_strobe {
        return record;
    }

    let mut timestamps = result.ts_list.clone();
    timestamps.sort_unstable();
    let (first, last) = match (timestamps.first(), timestamps.last()) {
        (Some(first), Some(last)) => (*first, *last),
        _ => return record,
    };
    record.first_seen = DateTime::from_timestamp(first, 0);
    record.last_seen = DateTime::from_timestamp(last, 0);

    let detection = detector.analyze(&timestamps_to_deltas(&timestamps));
    if let Some(stats) = detection.statistics {
        record.ts = Some(TimingScore {
            range: last - first,
            mean_interval: stats.mean,
            std_dev: stats.std_dev,
            cv: stats.cv,
            median_interval: stats.median,
            classification: detection.classification,
            score: regularity_score(stats.cv),
        });
    }

    if !result.orig_bytes_list.is_empty() {
        let sizes: Vec<f64> = result.orig_bytes_list.iter().map(|b| *b as f64).collect();
        let stats = calculate_statistics(&sizes);
        // Constant sizes are perfectly regular even when they are all zero.
        let cv = if stats.std_dev == 0.0 { 0.0 } else { stats.cv };
        record.ds = Some(SizeScore {
            mean: stats.mean,
            std_dev: stats.std_dev,
            cv,
            score: regularity_score(cv),
        });
    }

    let parts: Vec<f64> = [
        record.ts.as_ref().map(|t| t.score),
        record.ds.as_ref().map(|d| d.score),
    ]
    .into_iter()
    .flatten()
    .collect();
    if !parts.is_empty() {
        record.score = parts.iter().sum::<f64>() / parts.len() as f64;
    }
    record
}

/// Per-item work done by an [`Analyzer`] pool.
pub trait Transform<I>: Send + Sync + 'static {
    type Output: Send + 'static;

    /// Returns `None` for items that produce nothing downstream.
    fn transform(&self, input: I) -> Option<Self::Output>;
}

/// Turns dissection results into beacon record upserts.
pub struct BeaconScorer {
    collection: String,
    current_chunk: i64,
    detector: CvDetector,
}

impl BeaconScorer {
    pub fn new(collection: impl Into<String>, current_chunk: i64) -> Self {
        Self {
            collection: collection.into(),
            current_chunk,
            detector: CvDetector::default(),
        }
    }
}

impl<U: UnitOfWork> Transform<DissectionResult<U>> for BeaconScorer {
    type Output = WriteOp;

    fn transform(&self, result: DissectionResult<U>) -> Option<WriteOp> {
        let record = score_result(&result, &self.detector, self.current_chunk);
        let fields = match serde_json::to_value(&record) {
            Ok(serde_json::Value::Object(fields)) => fields,
            Ok(_) => return None,
            Err(e) => {
                warn!("Failed to encode beacon record for {}: {}", result.unit, e);
                return None;
            }
        };

        debug!("Scored {} at {:.3} (strobe: {})", result.unit, record.score, record.strobe);

        let update = result
            .unit
            .record_fields()
            .into_iter()
            .chain(fields)
            .fold(Update::new(), |update, (field, value)| update.set(field, value));

        Some(WriteOp {
            collection: self.collection.clone(),
            selector: result.unit.query_key(),
            update,
        })
    }
}

struct AnalyzerInner<X, N> {
    name: &'static str,
    transform: X,
    next: Arc<N>,
    metrics: SharedMetrics,
}

/// Pool of workers applying one [`Transform`].
pub struct Analyzer<I, X, N> {
    queue: WorkQueue<I>,
    inner: Arc<AnalyzerInner<X, N>>,
}

impl<I, X, N> Analyzer<I, X, N>
where
    I: Send + 'static,
    X: Transform<I>,
    N: PipelineStage<X::Output> + 'static,
{
    pub fn new(
        name: &'static str,
        transform: X,
        next: Arc<N>,
        metrics: SharedMetrics,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            queue: WorkQueue::new(name, cancel),
            inner: Arc::new(AnalyzerInner {
                name,
                transform,
                next,
                metrics,
            }),
        }
    }
}

#[async_trait]
impl<I, X, N> PipelineStage<I> for Analyzer<I, X, N>
where
    I: Send + 'static,
    X: Transform<I>,
    N: PipelineStage<X::Output> + 'static,
{
    async fn submit(&self, item: I) -> Result<(), PipelineError> {
        self.queue.submit(item).await
    }

    fn start(&self) {
        let inner = Arc::clone(&self.inner);
        self.queue.spawn(move |worker| async move {
            while let Some(item) = worker.recv().await {
                let Some(output) = inner.transform.transform(item) else {
                    continue;
                };
                match inner.next.submit(output).await {
                    Ok(()) => PipelineMetrics::inc(&inner.metrics.results_scored),
                    Err(e) => warn!("{}: downstream rejected output: {}", inner.name, e),
                }
            }
        });
    }

    async fn shutdown(&self) -> Result<(), PipelineError> {
        self.queue.close_and_drain().await?;
        info!("{}: analysis complete", self.inner.name);
        self.inner.next.shutdown().await
    }
}
