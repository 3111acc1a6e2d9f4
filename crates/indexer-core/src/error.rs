use std::fmt;

use thiserror::Error;

/// Why derived state has to be wiped and indexing restarted from scratch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReindexingReason {
    /// Requested explicitly by a handler via `ctx.reindex()`.
    Manual,
    /// A chain reorganization reached below the index's durable level.
    Rollback,
    /// Index configuration changed since the persisted state was written.
    ConfigModified,
}

impl fmt::Display for ReindexingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::Rollback => write!(f, "rollback"),
            Self::ConfigModified => write!(f, "config_modified"),
        }
    }
}

#[derive(Error, Debug)]
pub enum IndexerError {
    /// Transport exhausted its retries; surfaces to the operator.
    #[error("datasource `{name}` failed: {message}")]
    Datasource { name: String, message: String },

    /// Payload no longer matches the schema a handler was built against.
    #[error("failed to decode payload for `{callback}` (record {record_id}): {message}")]
    Decode {
        callback: String,
        record_id: u64,
        message: String,
    },

    /// Derived state must be wiped and indexing restarted from the first level.
    #[error("reindexing required for `{index}` ({reason})")]
    ReindexingRequired {
        index: String,
        reason: ReindexingReason,
    },

    /// Internal consistency check failure. Always fatal, never retried.
    #[error("framework invariant violated: {0}")]
    FrameworkInvariant(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("handler `{0}` is not registered")]
    HandlerNotRegistered(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IndexerError>;
