//! Configuration Module
//!
//! Provides TOML-based configuration for beacon-dissect.
//! Every section is optional; missing values fall back to defaults and
//! CLI arguments can override file settings.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::export::OutputFormat;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub tables: TableConfig,
    pub strobe: StrobeConfig,
    pub beacon: ModuleConfig,
    pub beacon_sni: ModuleConfig,
    pub beacon_proxy: ModuleConfig,
    pub rolling: RollingConfig,
    pub pipeline: PipelineConfig,
    pub output: OutputConfig,
}

impl Config {
    /// Loads configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Generates a default configuration file content
    pub fn generate_default() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config)
            .unwrap_or_else(|_| "# Failed to generate config".to_string())
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.strobe.connection_limit <= 0 {
            anyhow::bail!("strobe.connection_limit must be greater than 0");
        }
        for (name, module) in [
            ("beacon", &self.beacon),
            ("beacon_sni", &self.beacon_sni),
            ("beacon_proxy", &self.beacon_proxy),
        ] {
            if module.default_connection_thresh < 0 {
                anyhow::bail!("{}.default_connection_thresh must not be negative", name);
            }
            if module.default_connection_thresh >= self.strobe.connection_limit {
                anyhow::bail!(
                    "{}.default_connection_thresh must be below strobe.connection_limit",
                    name
                );
            }
        }
        if self.pipeline.query_timeout_ms == 0 {
            anyhow::bail!("pipeline.query_timeout_ms must be greater than 0");
        }
        for (name, table) in [
            ("uconn_table", &self.tables.uconn_table),
            ("sni_conn_table", &self.tables.sni_conn_table),
            ("uconn_proxy_table", &self.tables.uconn_proxy_table),
            ("certificate_table", &self.tables.certificate_table),
        ] {
            if table.trim().is_empty() {
                anyhow::bail!("tables.{} must not be empty", name);
            }
        }
        Ok(())
    }
}

/// Collection names
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TableConfig {
    /// IP pair summaries
    pub uconn_table: String,
    /// Source/SNI pair summaries
    pub sni_conn_table: String,
    /// Source/proxied FQDN pair summaries
    pub uconn_proxy_table: String,
    pub beacon_table: String,
    pub beacon_sni_table: String,
    pub beacon_proxy_table: String,
    /// Invalid certificate records
    pub certificate_table: String,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            uconn_table: "uconn".into(),
            sni_conn_table: "SNIconn".into(),
            uconn_proxy_table: "uconnProxy".into(),
            beacon_table: "beacon".into(),
            beacon_sni_table: "beaconSNI".into(),
            beacon_proxy_table: "beaconProxy".into(),
            certificate_table: "cert".into(),
        }
    }
}

/// Strobe classification
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StrobeConfig {
    /// Connection count above which a pair is a strobe
    pub connection_limit: i64,
}

impl Default for StrobeConfig {
    fn default() -> Self {
        Self {
            connection_limit: 86_400,
        }
    }
}

/// Per-module thresholds
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ModuleConfig {
    /// Pairs with this many connections or fewer are not aggregated
    pub default_connection_thresh: i64,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            default_connection_thresh: 20,
        }
    }
}

/// Rolling dataset state
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RollingConfig {
    /// Chunk identifier stamped on records written during this run
    pub current_chunk: i64,
}

/// Worker pool and store call tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Workers per stage (0 = half the available CPUs, at least 1)
    pub workers: usize,
    /// Timeout for one aggregation round trip
    pub query_timeout_ms: u64,
    /// Extra attempts after a failed aggregation
    pub query_retries: u32,
    /// Backoff step between attempts
    pub retry_backoff_ms: u64,
    /// Timeout for handing a unit to a stage (0 = wait forever)
    pub submit_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            query_timeout_ms: 30_000,
            query_retries: 2,
            retry_backoff_ms: 100,
            submit_timeout_ms: 0,
        }
    }
}

impl PipelineConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn submit_timeout(&self) -> Option<Duration> {
        (self.submit_timeout_ms > 0).then(|| Duration::from_millis(self.submit_timeout_ms))
    }
}

/// Output-related configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Output format (text, json, jsonl)
    #[serde(with = "output_format_serde")]
    pub format: OutputFormat,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Text,
        }
    }
}

/// Custom serde implementation for OutputFormat
mod output_format_serde {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(format: &OutputFormat, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<OutputFormat, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
