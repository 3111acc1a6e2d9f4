//! Persistence surface of the pipeline.
//!
//! The contract with the rest of the engine is one open transaction per
//! (index, level) pair: opened before matcher output is applied, committed
//! immediately after the last handler for that level returns, rolled back if
//! dropped uncommitted. `IndexState` rows are the only state the core
//! requires to be durable; everything handlers write through the transaction
//! is derived and may be wiped on reindex.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

use indexer_core::{IndexState, Level, Result};

/// Journal history retained for point-in-time rollback, in levels behind the
/// sync head. Levels further behind are applied without journaling.
pub const DEFAULT_HISTORY_DEPTH: u64 = 2;

/// How a journaled write changed a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateAction {
    Insert,
    Update,
    Delete,
}

impl UpdateAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(Self::Insert),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Scope of one per-level transaction. Everything a handler persists for a
/// level goes through this; dropping the value without `commit` discards it.
#[async_trait]
pub trait LevelTransaction: Send + Sync {
    /// Upsert a value into a named collection.
    async fn put(&mut self, collection: &str, key: &str, value: serde_json::Value) -> Result<()>;

    async fn delete(&mut self, collection: &str, key: &str) -> Result<()>;

    /// Read back a value staged or previously committed.
    async fn get(&mut self, collection: &str, key: &str) -> Result<Option<serde_json::Value>>;

    /// Persist the index's durable state inside this transaction, so the
    /// level bump and the handler writes land atomically.
    async fn save_state(&mut self, state: &IndexState) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Durable store behind all indexes of one process.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_index(&self, name: &str) -> Result<Option<IndexState>>;

    async fn save_index(&self, state: &IndexState) -> Result<()>;

    /// Open the transaction for one level. `sync_level` is the current head
    /// target; writes are journaled for rollback only when the level is
    /// within the history depth of it.
    async fn begin_level_transaction(
        &self,
        index: &str,
        level: Level,
        sync_level: Level,
    ) -> Result<Box<dyn LevelTransaction>>;

    /// Whether this store can revert derived state to an earlier level.
    fn supports_rollback(&self) -> bool;

    /// Revert an index's derived state to `level` using the journal.
    async fn revert_to(&self, index: &str, level: Level) -> Result<()>;

    /// Drop all state for an index, durable and derived (reindex support).
    async fn wipe(&self, index: &str) -> Result<()>;
}

pub use memory::MemoryStateStore;
pub use postgres::{DatabaseConfig, PgStateStore};
