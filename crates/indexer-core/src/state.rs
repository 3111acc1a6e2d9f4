use serde::{Deserialize, Serialize};

use crate::types::Level;

/// Lifecycle state of one index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexStatus {
    /// Created but not yet driven; level is `first_level - 1` or restored.
    New,
    /// Backfilling historical data toward the datasource head.
    Syncing,
    /// Caught up; consuming realtime messages.
    Realtime,
    /// Oneshot index that reached its configured `last_level`.
    Disabled,
}

impl IndexStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Syncing => "syncing",
            Self::Realtime => "realtime",
            Self::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(Self::New),
            "syncing" => Some(Self::Syncing),
            "realtime" => Some(Self::Realtime),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }
}

/// Durable per-index state. `level` is the highest level whose data has been
/// fully applied; it is the low-water mark used to resume after restart and
/// to decide how far a rollback must unwind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexState {
    pub name: String,
    pub kind: String,
    pub level: Level,
    pub config_hash: String,
    pub status: IndexStatus,
}

impl IndexState {
    pub fn new(name: &str, kind: &str, first_level: Level, config_hash: String) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            // The index has not reached its first level yet.
            level: first_level.saturating_sub(1),
            config_hash,
            status: IndexStatus::New,
        }
    }
}
