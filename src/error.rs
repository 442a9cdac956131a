//! Domain-specific error types for beacon-dissect.
//!
//! Uses `thiserror` for the store and pipeline failure classes; application
//! paths (config, snapshots, CLI) use `anyhow` on top of these.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by a document store or one of its sessions.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Aggregation on '{collection}' failed: {reason}")]
    QueryFailed { collection: String, reason: String },

    #[error("Store call on '{collection}' timed out after {elapsed:?}")]
    Timeout {
        collection: String,
        elapsed: Duration,
    },

    #[error("No store session available: {0}")]
    SessionUnavailable(String),

    #[error("Failed to decode aggregation result: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Snapshot error for '{path}': {reason}")]
    Snapshot { path: String, reason: String },
}

/// Errors raised by the pipeline stages themselves.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("Stage '{0}' no longer accepts work")]
    QueueClosed(&'static str),

    #[error("Stage '{0}' was already shut down")]
    AlreadyShutDown(&'static str),

    #[error("Stage '{0}' was cancelled")]
    Cancelled(&'static str),

    #[error("Timed out handing work to stage '{stage}' after {timeout:?}")]
    SubmitTimeout {
        stage: &'static str,
        timeout: Duration,
    },
}

/// Result type alias using anyhow for application-level error handling.
pub type Result<T> = anyhow::Result<T>;
