//! Export Module
//!
//! Renders the beacon records of a run as text, JSON or JSON Lines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::aggregate::Document;
use crate::analyzer::{BeaconRecord, FlowClassification};
use crate::metrics::MetricsSnapshot;
use crate::pairs::UniqueIp;

/// Output format for exports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    JsonLines, // One JSON object per line (JSONL)
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "jsonl" | "jsonlines" => Ok(Self::JsonLines),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
            Self::JsonLines => write!(f, "jsonl"),
        }
    }
}

/// A beacon record as read back from the store.
#[derive(Debug, Clone, Deserialize)]
struct StoredBeacon {
    src: String,
    #[serde(default)]
    dst: Option<String>,
    #[serde(default)]
    fqdn: Option<String>,
    #[serde(default)]
    proxy: Option<UniqueIp>,
    #[serde(flatten)]
    record: BeaconRecord,
}

/// JSON-serializable beacon
#[derive(Debug, Clone, Serialize)]
pub struct JsonBeacon {
    pub src: String,
    pub destination: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    pub classification: String,
    pub severity: String,
    pub score: f64,
    pub strobe: bool,
    pub connection_count: i64,
    pub total_bytes: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cv: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_interval_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
    pub responding_ips: Vec<String>,
}

impl From<StoredBeacon> for JsonBeacon {
    fn from(stored: StoredBeacon) -> Self {
        let record = stored.record;
        let classification = record
            .ts
            .as_ref()
            .map(|t| t.classification)
            .unwrap_or(FlowClassification::Insufficient);
        let classification_label = if record.strobe {
            "Strobe".to_string()
        } else {
            classification.to_string()
        };
        let severity = if record.strobe {
            "STROBE"
        } else {
            classification.severity()
        };

        Self {
            src: stored.src,
            destination: stored.dst.or(stored.fqdn).unwrap_or_default(),
            proxy: stored.proxy.map(|p| p.to_string()),
            classification: classification_label,
            severity: severity.to_string(),
            score: record.score,
            strobe: record.strobe,
            connection_count: record.connection_count,
            total_bytes: record.total_bytes,
            cv: record.ts.as_ref().map(|t| t.cv),
            mean_interval_secs: record.ts.as_ref().map(|t| t.mean_interval),
            first_seen: record.first_seen.map(|t| t.to_rfc3339()),
            last_seen: record.last_seen.map(|t| t.to_rfc3339()),
            responding_ips: record.responding_ips.iter().map(|ip| ip.to_string()).collect(),
        }
    }
}

/// JSON-serializable run report
#[derive(Debug, Clone, Serialize)]
pub struct BeaconReport {
    pub version: &'static str,
    pub timestamp: String,
    pub variant: String,
    pub units_fed: usize,
    pub metrics: MetricsSnapshot,
    pub beacons: Vec<JsonBeacon>,
}

impl BeaconReport {
    /// Builds a report from stored beacon records, highest score first.
    /// Strobes sort after every scored pair.
    pub fn from_documents(
        variant: impl Into<String>,
        units_fed: usize,
        metrics: MetricsSnapshot,
        docs: &[Document],
        timestamp: DateTime<Utc>,
    ) -> Self {
        let mut beacons: Vec<JsonBeacon> = docs
            .iter()
            .filter_map(|doc| {
                match serde_json::from_value::<StoredBeacon>(serde_json::Value::Object(doc.clone())) {
                    Ok(stored) => Some(JsonBeacon::from(stored)),
                    Err(e) => {
                        warn!("Skipping unreadable beacon record: {}", e);
                        None
                    }
                }
            })
            .collect();

        beacons.sort_by(|a, b| {
            a.strobe.cmp(&b.strobe).then(
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
        });

        Self {
            version: "1.0",
            timestamp: timestamp.to_rfc3339(),
            variant: variant.into(),
            units_fed,
            metrics,
            beacons,
        }
    }
}

/// Exports a report in the specified format
pub fn export_report(report: &BeaconReport, format: OutputFormat) -> String {
    match format {
        OutputFormat::Text => export_text(report),
        OutputFormat::Json => export_json(report),
        OutputFormat::JsonLines => export_jsonl(report),
    }
}

/// Exports report as pretty-printed JSON
pub fn export_json(report: &BeaconReport) -> String {
    serde_json::to_string_pretty(report).unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
}

/// Exports report as JSON Lines (one beacon per line)
pub fn export_jsonl(report: &BeaconReport) -> String {
    let mut lines = Vec::new();

    // First line is the summary
    let summary = serde_json::json!({
        "type": "summary",
        "timestamp": report.timestamp,
        "variant": report.variant,
        "units_fed": report.units_fed,
        "beacon_count": report.beacons.len(),
        "metrics": report.metrics,
    });
    lines.push(serde_json::to_string(&summary).unwrap_or_default());

    for beacon in &report.beacons {
        if let Ok(line) = serde_json::to_string(beacon) {
            lines.push(line);
        }
    }

    lines.join("\n")
}

/// Exports report as formatted text
pub fn export_text(report: &BeaconReport) -> String {
    let m = &report.metrics;
    let mut output = String::new();

    output.push_str(&format!(
        "--- Beacon Report ({}) ---\nTime: {}\nUnits Fed: {}\nStrobes: {}\nCandidates: {}\nStore Failures: {}\n",
        report.variant,
        report.timestamp,
        report.units_fed,
        m.strobes_emitted,
        m.candidates_emitted,
        m.store_failures,
    ));

    if report.beacons.is_empty() {
        output.push_str("Beacons: None recorded\n");
        return output;
    }

    output.push_str(&format!("\nBeacons ({}):\n", report.beacons.len()));
    output.push_str(&"-".repeat(100));
    output.push('\n');

    for beacon in &report.beacons {
        let via = beacon
            .proxy
            .as_ref()
            .map(|p| format!(" via {}", p))
            .unwrap_or_default();
        output.push_str(&format!(
            "[{:8}] {} -> {}{} | Score: {:.3} | CV: {} | Interval: {} | Connections: {}\n",
            beacon.severity,
            beacon.src,
            beacon.destination,
            via,
            beacon.score,
            beacon
                .cv
                .map(|cv| format!("{:.4}", cv))
                .unwrap_or_else(|| "N/A".to_string()),
            format_interval(beacon.mean_interval_secs),
            beacon.connection_count,
        ));
    }

    output
}

/// Formats an interval in a human-readable way
fn format_interval(secs: Option<f64>) -> String {
    match secs {
        Some(secs) if secs >= 3600.0 => format!("{:.1}h", secs / 3600.0),
        Some(secs) if secs >= 60.0 => format!("{:.1}m", secs / 60.0),
        Some(secs) => format!("{:.0}s", secs),
        None => "N/A".to_string(),
    }
}
