//! Pipeline counters.
//!
//! Every stage records what happened to each unit it handled. Counters are
//! plain atomics so workers can update them without coordination; they are
//! never used to pass data between workers.
//!
//! # Metrics Exported
//!
//! - `beacon_dissect_units_submitted_total` - Units handed to the dissector
//! - `beacon_dissect_units_dissected_total` - Units whose aggregation completed
//! - `beacon_dissect_strobes_emitted_total` - Strobe results forwarded
//! - `beacon_dissect_candidates_emitted_total` - Beacon candidates forwarded
//! - `beacon_dissect_dropped_no_data_total` - Units with nothing above threshold
//! - `beacon_dissect_dropped_insufficient_samples_total` - Units with 3 or fewer distinct timestamps
//! - `beacon_dissect_store_failures_total` - Units dropped after exhausting retries
//! - `beacon_dissect_store_retries_total` - Failed aggregation attempts that were retried
//! - `beacon_dissect_session_failures_total` - Workers that exited without a store session
//! - `beacon_dissect_results_scored_total` - Results turned into records by an analyzer
//! - `beacon_dissect_writes_completed_total` - Records persisted
//! - `beacon_dissect_write_failures_total` - Records the writer failed to persist

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Atomic counters shared by every stage of one pipeline run.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub units_submitted: AtomicU64,
    pub units_dissected: AtomicU64,
    pub strobes_emitted: AtomicU64,
    pub candidates_emitted: AtomicU64,
    pub dropped_no_data: AtomicU64,
    pub dropped_insufficient_samples: AtomicU64,
    pub store_failures: AtomicU64,
    pub store_retries: AtomicU64,
    pub session_failures: AtomicU64,
    pub results_scored: AtomicU64,
    pub writes_completed: AtomicU64,
    pub write_failures: AtomicU64,
}

/// Point-in-time copy of [`PipelineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub units_submitted: u64,
    pub units_dissected: u64,
    pub strobes_emitted: u64,
    pub candidates_emitted: u64,
    pub dropped_no_data: u64,
    pub dropped_insufficient_samples: u64,
    pub store_failures: u64,
    pub store_retries: u64,
    pub session_failures: u64,
    pub results_scored: u64,
    pub writes_completed: u64,
    pub write_failures: u64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            units_submitted: load(&self.units_submitted),
            units_dissected: load(&self.units_dissected),
            strobes_emitted: load(&self.strobes_emitted),
            candidates_emitted: load(&self.candidates_emitted),
            dropped_no_data: load(&self.dropped_no_data),
            dropped_insufficient_samples: load(&self.dropped_insufficient_samples),
            store_failures: load(&self.store_failures),
            store_retries: load(&self.store_retries),
            session_failures: load(&self.session_failures),
            results_scored: load(&self.results_scored),
            writes_completed: load(&self.writes_completed),
            write_failures: load(&self.write_failures),
        }
    }

    /// Export metrics in Prometheus text format.
    pub fn to_prometheus_format(&self) -> String {
        let s = self.snapshot();
        let rows: [(&str, &str, u64); 12] = [
            ("units_submitted_total", "Units handed to the dissector", s.units_submitted),
            ("units_dissected_total", "Units whose aggregation completed", s.units_dissected),
            ("strobes_emitted_total", "Strobe results forwarded", s.strobes_emitted),
            ("candidates_emitted_total", "Beacon candidates forwarded", s.candidates_emitted),
            ("dropped_no_data_total", "Units with no traffic above threshold", s.dropped_no_data),
            (
                "dropped_insufficient_samples_total",
                "Units with too few distinct timestamps",
                s.dropped_insufficient_samples,
            ),
            ("store_failures_total", "Units dropped after store failures", s.store_failures),
            ("store_retries_total", "Retried aggregation attempts", s.store_retries),
            (
                "session_failures_total",
                "Workers that could not check out a session",
                s.session_failures,
            ),
            ("results_scored_total", "Results scored by an analyzer", s.results_scored),
            ("writes_completed_total", "Records persisted", s.writes_completed),
            ("write_failures_total", "Records that failed to persist", s.write_failures),
        ];

        let mut output = String::new();
        for (name, help, value) in rows {
            output.push_str(&format!("# HELP beacon_dissect_{} {}\n", name, help));
            output.push_str(&format!("# TYPE beacon_dissect_{} counter\n", name));
            output.push_str(&format!("beacon_dissect_{} {}\n\n", name, value));
        }
        output
    }
}

/// Shared metrics handle for use across tasks.
pub type SharedMetrics = Arc<PipelineMetrics>;

/// Create a new shared metrics instance.
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(PipelineMetrics::new())
}
