//! In-memory store: the default when no database is configured, and the
//! backing for unit tests. Transactions stage writes and apply them on
//! commit, mirroring the database semantics of rollback-on-drop.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use indexer_core::{IndexState, IndexerError, Level, Result};

use crate::{LevelTransaction, StateStore, UpdateAction, DEFAULT_HISTORY_DEPTH};

type CollectionKey = (String, String, String);

#[derive(Debug, Clone)]
struct ModelUpdate {
    index: String,
    collection: String,
    key: String,
    level: Level,
    action: UpdateAction,
    /// Value before the change; `None` for inserts.
    data: Option<serde_json::Value>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    indexes: HashMap<String, IndexState>,
    records: HashMap<CollectionKey, serde_json::Value>,
    journal: Vec<ModelUpdate>,
}

pub struct MemoryStateStore {
    inner: Arc<Mutex<MemoryInner>>,
    history_depth: u64,
    rollback_enabled: bool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryInner::default())),
            history_depth: DEFAULT_HISTORY_DEPTH,
            rollback_enabled: true,
        }
    }

    /// A store without point-in-time rollback; any realtime rollback below
    /// the index level then escalates to a full reindex.
    pub fn forward_only() -> Self {
        Self {
            rollback_enabled: false,
            ..Self::new()
        }
    }

    /// Committed value of a record, for assertions in tests.
    pub async fn get_record(
        &self,
        index: &str,
        collection: &str,
        key: &str,
    ) -> Option<serde_json::Value> {
        let inner = self.inner.lock().await;
        inner
            .records
            .get(&(index.to_string(), collection.to_string(), key.to_string()))
            .cloned()
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// A staged write; applied to the shared maps only on commit.
enum StagedOp {
    Put {
        collection: String,
        key: String,
        value: serde_json::Value,
    },
    Delete {
        collection: String,
        key: String,
    },
    SaveState(IndexState),
}

struct MemoryTransaction {
    inner: Arc<Mutex<MemoryInner>>,
    index: String,
    level: Level,
    journal: bool,
    staged: Vec<StagedOp>,
}

impl MemoryTransaction {
    fn staged_value(&self, collection: &str, key: &str) -> Option<Option<serde_json::Value>> {
        // Later stages shadow earlier ones.
        for op in self.staged.iter().rev() {
            match op {
                StagedOp::Put {
                    collection: c,
                    key: k,
                    value,
                } if c == collection && k == key => return Some(Some(value.clone())),
                StagedOp::Delete {
                    collection: c,
                    key: k,
                } if c == collection && k == key => return Some(None),
                _ => {}
            }
        }
        None
    }
}

#[async_trait]
impl LevelTransaction for MemoryTransaction {
    async fn put(&mut self, collection: &str, key: &str, value: serde_json::Value) -> Result<()> {
        self.staged.push(StagedOp::Put {
            collection: collection.to_string(),
            key: key.to_string(),
            value,
        });
        Ok(())
    }

    async fn delete(&mut self, collection: &str, key: &str) -> Result<()> {
        self.staged.push(StagedOp::Delete {
            collection: collection.to_string(),
            key: key.to_string(),
        });
        Ok(())
    }

    async fn get(&mut self, collection: &str, key: &str) -> Result<Option<serde_json::Value>> {
        if let Some(staged) = self.staged_value(collection, key) {
            return Ok(staged);
        }
        let inner = self.inner.lock().await;
        Ok(inner
            .records
            .get(&(self.index.clone(), collection.to_string(), key.to_string()))
            .cloned())
    }

    async fn save_state(&mut self, state: &IndexState) -> Result<()> {
        self.staged.push(StagedOp::SaveState(state.clone()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for op in self.staged {
            match op {
                StagedOp::Put {
                    collection,
                    key,
                    value,
                } => {
                    let map_key = (self.index.clone(), collection.clone(), key.clone());
                    let previous = inner.records.insert(map_key, value);
                    if self.journal {
                        let action = match previous {
                            Some(_) => UpdateAction::Update,
                            None => UpdateAction::Insert,
                        };
                        inner.journal.push(ModelUpdate {
                            index: self.index.clone(),
                            collection,
                            key,
                            level: self.level,
                            action,
                            data: previous,
                        });
                    }
                }
                StagedOp::Delete { collection, key } => {
                    let map_key = (self.index.clone(), collection.clone(), key.clone());
                    if let Some(previous) = inner.records.remove(&map_key) {
                        if self.journal {
                            inner.journal.push(ModelUpdate {
                                index: self.index.clone(),
                                collection,
                                key,
                                level: self.level,
                                action: UpdateAction::Delete,
                                data: Some(previous),
                            });
                        }
                    }
                }
                StagedOp::SaveState(state) => {
                    inner.indexes.insert(state.name.clone(), state);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load_index(&self, name: &str) -> Result<Option<IndexState>> {
        let inner = self.inner.lock().await;
        Ok(inner.indexes.get(name).cloned())
    }

    async fn save_index(&self, state: &IndexState) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.indexes.insert(state.name.clone(), state.clone());
        Ok(())
    }

    async fn begin_level_transaction(
        &self,
        index: &str,
        level: Level,
        sync_level: Level,
    ) -> Result<Box<dyn LevelTransaction>> {
        let journal = self.rollback_enabled && sync_level.saturating_sub(level) <= self.history_depth;
        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            index: index.to_string(),
            level,
            journal,
            staged: Vec::new(),
        }))
    }

    fn supports_rollback(&self) -> bool {
        self.rollback_enabled
    }

    async fn revert_to(&self, index: &str, level: Level) -> Result<()> {
        if !self.rollback_enabled {
            return Err(IndexerError::FrameworkInvariant(
                "revert_to called on a store without rollback support".to_string(),
            ));
        }

        let mut inner = self.inner.lock().await;
        let mut keep = Vec::with_capacity(inner.journal.len());
        let mut revert = Vec::new();
        for update in inner.journal.drain(..) {
            if update.index == index && update.level > level {
                revert.push(update);
            } else {
                keep.push(update);
            }
        }
        inner.journal = keep;

        let reverted = revert.len();
        // Newest entries first; the journal is append-only.
        for update in revert.into_iter().rev() {
            let map_key = (
                update.index.clone(),
                update.collection.clone(),
                update.key.clone(),
            );
            match (update.action, update.data) {
                (UpdateAction::Insert, _) => {
                    inner.records.remove(&map_key);
                }
                (UpdateAction::Update, Some(previous)) | (UpdateAction::Delete, Some(previous)) => {
                    inner.records.insert(map_key, previous);
                }
                (UpdateAction::Update, None) | (UpdateAction::Delete, None) => {
                    return Err(IndexerError::FrameworkInvariant(
                        "journal entry missing previous value".to_string(),
                    ));
                }
            }
        }

        if let Some(state) = inner.indexes.get_mut(index) {
            state.level = level;
        }

        info!(index, level, reverted, "Reverted derived state");
        Ok(())
    }

    async fn wipe(&self, index: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.indexes.remove(index);
        inner.records.retain(|(i, _, _), _| i != index);
        inner.journal.retain(|u| u.index != index);
        info!(index, "Wiped index state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(name: &str, level: Level) -> IndexState {
        IndexState::new(name, "operations", level + 1, "hash".into())
    }

    #[tokio::test]
    async fn uncommitted_transaction_leaves_no_trace() {
        let store = MemoryStateStore::new();
        {
            let mut tx = store
                .begin_level_transaction("dex", 100, 100)
                .await
                .unwrap();
            tx.put("trades", "1", json!({"amount": 5})).await.unwrap();
            // Dropped without commit.
        }
        assert!(store.get_record("dex", "trades", "1").await.is_none());
    }

    #[tokio::test]
    async fn commit_applies_staged_writes_and_state() {
        let store = MemoryStateStore::new();
        let mut tx = store
            .begin_level_transaction("dex", 100, 100)
            .await
            .unwrap();
        tx.put("trades", "1", json!({"amount": 5})).await.unwrap();
        tx.save_state(&state("dex", 100)).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(
            store.get_record("dex", "trades", "1").await,
            Some(json!({"amount": 5}))
        );
        assert!(store.load_index("dex").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn get_sees_staged_writes() {
        let store = MemoryStateStore::new();
        let mut tx = store
            .begin_level_transaction("dex", 100, 100)
            .await
            .unwrap();
        tx.put("trades", "1", json!(1)).await.unwrap();
        assert_eq!(tx.get("trades", "1").await.unwrap(), Some(json!(1)));
        tx.delete("trades", "1").await.unwrap();
        assert_eq!(tx.get("trades", "1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn revert_undoes_journaled_levels() {
        let store = MemoryStateStore::new();

        let mut tx = store
            .begin_level_transaction("dex", 100, 101)
            .await
            .unwrap();
        tx.put("pools", "p", json!({"volume": 1})).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store
            .begin_level_transaction("dex", 101, 101)
            .await
            .unwrap();
        tx.put("pools", "p", json!({"volume": 2})).await.unwrap();
        tx.put("trades", "t", json!({"new": true})).await.unwrap();
        tx.commit().await.unwrap();

        store.revert_to("dex", 100).await.unwrap();
        assert_eq!(
            store.get_record("dex", "pools", "p").await,
            Some(json!({"volume": 1}))
        );
        assert!(store.get_record("dex", "trades", "t").await.is_none());
    }

    #[tokio::test]
    async fn writes_far_behind_head_are_not_journaled() {
        let store = MemoryStateStore::new();
        // Level 100 against a sync head of 1000: backfill territory.
        let mut tx = store
            .begin_level_transaction("dex", 100, 1000)
            .await
            .unwrap();
        tx.put("pools", "p", json!(1)).await.unwrap();
        tx.commit().await.unwrap();

        let inner = store.inner.lock().await;
        assert!(inner.journal.is_empty());
    }

    #[tokio::test]
    async fn wipe_removes_everything_for_one_index() {
        let store = MemoryStateStore::new();
        store.save_index(&state("dex", 100)).await.unwrap();
        store.save_index(&state("nft", 100)).await.unwrap();
        let mut tx = store
            .begin_level_transaction("dex", 100, 100)
            .await
            .unwrap();
        tx.put("trades", "1", json!(1)).await.unwrap();
        tx.commit().await.unwrap();

        store.wipe("dex").await.unwrap();
        assert!(store.load_index("dex").await.unwrap().is_none());
        assert!(store.get_record("dex", "trades", "1").await.is_none());
        assert!(store.load_index("nft").await.unwrap().is_some());
    }
}
