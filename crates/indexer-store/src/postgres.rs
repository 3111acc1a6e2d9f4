//! Postgres-backed store. Plain runtime queries; the schema is created on
//! startup so a fresh database works without out-of-band migrations.

use std::env;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;

use indexer_core::{IndexState, IndexStatus, IndexerError, Level, Result};

use crate::{LevelTransaction, StateStore, UpdateAction, DEFAULT_HISTORY_DEPTH};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS indexer_index (
        name        TEXT PRIMARY KEY,
        kind        TEXT NOT NULL,
        level       BIGINT NOT NULL,
        config_hash TEXT NOT NULL,
        status      TEXT NOT NULL,
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE TABLE IF NOT EXISTS indexer_record (
        index_name TEXT NOT NULL,
        collection TEXT NOT NULL,
        key        TEXT NOT NULL,
        value      JSONB NOT NULL,
        level      BIGINT NOT NULL,
        PRIMARY KEY (index_name, collection, key)
    )",
    "CREATE TABLE IF NOT EXISTS indexer_model_update (
        id         BIGSERIAL PRIMARY KEY,
        index_name TEXT NOT NULL,
        collection TEXT NOT NULL,
        key        TEXT NOT NULL,
        level      BIGINT NOT NULL,
        action     TEXT NOT NULL,
        data       JSONB
    )",
    "CREATE INDEX IF NOT EXISTS idx_model_update_index_level
        ON indexer_model_update (index_name, level)",
];

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self> {
        let url = env::var("DATABASE_URL")
            .map_err(|_| IndexerError::Config("DATABASE_URL is not set".to_string()))?;
        let max_connections = env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);
        Ok(Self {
            url,
            max_connections,
        })
    }
}

pub struct PgStateStore {
    pool: PgPool,
    history_depth: u64,
}

impl PgStateStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await
            .map_err(|e| IndexerError::Database(e.to_string()))?;

        let store = Self {
            pool,
            history_depth: DEFAULT_HISTORY_DEPTH,
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA.iter().copied() {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| IndexerError::Database(e.to_string()))?;
        }
        info!("Database schema ensured");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

struct PgLevelTransaction {
    tx: Transaction<'static, Postgres>,
    index: String,
    level: Level,
    journal: bool,
}

impl PgLevelTransaction {
    async fn previous_value(
        &mut self,
        collection: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as(
            "SELECT value FROM indexer_record WHERE index_name = $1 AND collection = $2 AND key = $3",
        )
        .bind(&self.index)
        .bind(collection)
        .bind(key)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| IndexerError::Database(e.to_string()))?;
        Ok(row.map(|(value,)| value))
    }

    async fn journal_entry(
        &mut self,
        collection: &str,
        key: &str,
        action: UpdateAction,
        data: Option<&serde_json::Value>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO indexer_model_update (index_name, collection, key, level, action, data) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&self.index)
        .bind(collection)
        .bind(key)
        .bind(self.level as i64)
        .bind(action.as_str())
        .bind(data)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| IndexerError::Database(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl LevelTransaction for PgLevelTransaction {
    async fn put(&mut self, collection: &str, key: &str, value: serde_json::Value) -> Result<()> {
        if self.journal {
            let previous = self.previous_value(collection, key).await?;
            let action = match previous {
                Some(_) => UpdateAction::Update,
                None => UpdateAction::Insert,
            };
            self.journal_entry(collection, key, action, previous.as_ref())
                .await?;
        }

        sqlx::query(
            "INSERT INTO indexer_record (index_name, collection, key, value, level) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (index_name, collection, key) \
             DO UPDATE SET value = EXCLUDED.value, level = EXCLUDED.level",
        )
        .bind(&self.index)
        .bind(collection)
        .bind(key)
        .bind(&value)
        .bind(self.level as i64)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| IndexerError::Database(e.to_string()))?;
        Ok(())
    }

    async fn delete(&mut self, collection: &str, key: &str) -> Result<()> {
        if self.journal {
            if let Some(previous) = self.previous_value(collection, key).await? {
                self.journal_entry(collection, key, UpdateAction::Delete, Some(&previous))
                    .await?;
            }
        }

        sqlx::query(
            "DELETE FROM indexer_record WHERE index_name = $1 AND collection = $2 AND key = $3",
        )
        .bind(&self.index)
        .bind(collection)
        .bind(key)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| IndexerError::Database(e.to_string()))?;
        Ok(())
    }

    async fn get(&mut self, collection: &str, key: &str) -> Result<Option<serde_json::Value>> {
        self.previous_value(collection, key).await
    }

    async fn save_state(&mut self, state: &IndexState) -> Result<()> {
        sqlx::query(
            "INSERT INTO indexer_index (name, kind, level, config_hash, status, updated_at) \
             VALUES ($1, $2, $3, $4, $5, NOW()) \
             ON CONFLICT (name) DO UPDATE \
             SET level = EXCLUDED.level, status = EXCLUDED.status, \
                 config_hash = EXCLUDED.config_hash, updated_at = NOW()",
        )
        .bind(&state.name)
        .bind(&state.kind)
        .bind(state.level as i64)
        .bind(&state.config_hash)
        .bind(state.status.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| IndexerError::Database(e.to_string()))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| IndexerError::Database(e.to_string()))
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn load_index(&self, name: &str) -> Result<Option<IndexState>> {
        let row: Option<(String, String, i64, String, String)> = sqlx::query_as(
            "SELECT name, kind, level, config_hash, status FROM indexer_index WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| IndexerError::Database(e.to_string()))?;

        let Some((name, kind, level, config_hash, status)) = row else {
            return Ok(None);
        };
        let status = IndexStatus::parse(&status).ok_or_else(|| {
            IndexerError::Database(format!("unknown index status `{status}` for `{name}`"))
        })?;
        Ok(Some(IndexState {
            name,
            kind,
            level: level as u64,
            config_hash,
            status,
        }))
    }

    async fn save_index(&self, state: &IndexState) -> Result<()> {
        sqlx::query(
            "INSERT INTO indexer_index (name, kind, level, config_hash, status, updated_at) \
             VALUES ($1, $2, $3, $4, $5, NOW()) \
             ON CONFLICT (name) DO UPDATE \
             SET level = EXCLUDED.level, status = EXCLUDED.status, \
                 config_hash = EXCLUDED.config_hash, updated_at = NOW()",
        )
        .bind(&state.name)
        .bind(&state.kind)
        .bind(state.level as i64)
        .bind(&state.config_hash)
        .bind(state.status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| IndexerError::Database(e.to_string()))?;
        Ok(())
    }

    async fn begin_level_transaction(
        &self,
        index: &str,
        level: Level,
        sync_level: Level,
    ) -> Result<Box<dyn LevelTransaction>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| IndexerError::Database(e.to_string()))?;
        let journal = sync_level.saturating_sub(level) <= self.history_depth;
        Ok(Box::new(PgLevelTransaction {
            tx,
            index: index.to_string(),
            level,
            journal,
        }))
    }

    fn supports_rollback(&self) -> bool {
        true
    }

    async fn revert_to(&self, index: &str, level: Level) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| IndexerError::Database(e.to_string()))?;

        let updates: Vec<(i64, String, String, String, Option<serde_json::Value>)> =
            sqlx::query_as(
                "SELECT id, collection, key, action, data FROM indexer_model_update \
                 WHERE index_name = $1 AND level > $2 ORDER BY id DESC",
            )
            .bind(index)
            .bind(level as i64)
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| IndexerError::Database(e.to_string()))?;

        let reverted = updates.len();
        for (id, collection, key, action, data) in updates {
            let action = UpdateAction::parse(&action).ok_or_else(|| {
                IndexerError::Database(format!("unknown journal action `{action}`"))
            })?;
            match (action, data) {
                (UpdateAction::Insert, _) => {
                    sqlx::query(
                        "DELETE FROM indexer_record \
                         WHERE index_name = $1 AND collection = $2 AND key = $3",
                    )
                    .bind(index)
                    .bind(&collection)
                    .bind(&key)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| IndexerError::Database(e.to_string()))?;
                }
                (UpdateAction::Update, Some(previous)) | (UpdateAction::Delete, Some(previous)) => {
                    sqlx::query(
                        "INSERT INTO indexer_record (index_name, collection, key, value, level) \
                         VALUES ($1, $2, $3, $4, $5) \
                         ON CONFLICT (index_name, collection, key) \
                         DO UPDATE SET value = EXCLUDED.value, level = EXCLUDED.level",
                    )
                    .bind(index)
                    .bind(&collection)
                    .bind(&key)
                    .bind(&previous)
                    .bind(level as i64)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| IndexerError::Database(e.to_string()))?;
                }
                (UpdateAction::Update, None) | (UpdateAction::Delete, None) => {
                    return Err(IndexerError::Database(format!(
                        "journal entry {id} missing previous value"
                    )));
                }
            }
            sqlx::query("DELETE FROM indexer_model_update WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| IndexerError::Database(e.to_string()))?;
        }

        sqlx::query("UPDATE indexer_index SET level = $2, updated_at = NOW() WHERE name = $1")
            .bind(index)
            .bind(level as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| IndexerError::Database(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| IndexerError::Database(e.to_string()))?;

        info!(index, level, reverted, "Reverted derived state");
        Ok(())
    }

    async fn wipe(&self, index: &str) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| IndexerError::Database(e.to_string()))?;

        for statement in [
            "DELETE FROM indexer_model_update WHERE index_name = $1",
            "DELETE FROM indexer_record WHERE index_name = $1",
            "DELETE FROM indexer_index WHERE name = $1",
        ] {
            sqlx::query(statement)
                .bind(index)
                .execute(&mut *tx)
                .await
                .map_err(|e| IndexerError::Database(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| IndexerError::Database(e.to_string()))?;

        info!(index, "Wiped index state");
        Ok(())
    }
}
