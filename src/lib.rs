//! Beacon-Dissect: the dissection stage of a beacon threat-hunting pipeline.
//!
//! Per-pair connection summaries (source to IP, SNI name or proxied FQDN)
//! are re-aggregated from a document store, strobes are separated from
//! low-volume candidates, and only statistically analyzable pairs are
//! handed on for scoring and persistence.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Dissector   │────>│  Analyzer   │────>│   Writer    │
//! │ (aggregates) │ q1  │  (scoring)  │ q2  │  (upserts)  │
//! └──────────────┘     └─────────────┘     └─────────────┘
//!    N workers            N workers           N workers
//! ```
//!
//! - **Dissector**: one store session per worker, one aggregation per unit
//! - **Analyzer**: CV statistics over timestamp deltas and byte counts
//! - **Writer**: upserts records, one store session per worker

pub mod aggregate;
pub mod analyzer;
pub mod certificate;
pub mod config;
pub mod dissector;
pub mod error;
pub mod export;
pub mod metrics;
pub mod orchestrator;
pub mod pairs;
pub mod pool;
pub mod store;
pub mod writer;
