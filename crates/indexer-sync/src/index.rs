//! Per-index synchronization state machine.
//!
//! One logical stream of chain data for one set of handlers. Drives the
//! historical fetcher while behind the datasource head, switches to realtime
//! messages once caught up, and executes matched handlers inside one
//! transaction per level. Levels are processed strictly in increasing order;
//! a level's handlers run to completion, commit included, before the next
//! level begins.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use indexer_core::{
    ChainRecord, DispatcherCommand, IndexConfig, IndexState, IndexStatus, IndexerError, Level,
    ReindexingReason, Result, RollbackMessage, Subscription,
};
use indexer_datasource::Datasource;
use indexer_processor::{match_batch, HandlerContext, HandlerRegistry};
use indexer_store::StateStore;

use crate::fetcher::HistoricalFetcher;

/// One item on an index's realtime queue. Only the dispatcher produces them.
#[derive(Debug, Clone)]
pub enum IndexMessage {
    /// The datasource head moved; re-evaluate the sync target.
    Head(Level),
    Level {
        level: Level,
        records: Vec<ChainRecord>,
    },
    Rollback(RollbackMessage),
}

pub struct Index {
    name: String,
    config: IndexConfig,
    subscriptions: BTreeSet<Subscription>,
    datasource: Arc<Datasource>,
    store: Arc<dyn StateStore>,
    registry: Arc<HandlerRegistry>,
    commands: mpsc::Sender<DispatcherCommand>,
    queue: mpsc::Receiver<IndexMessage>,
    state: IndexState,
}

impl Index {
    /// Restore or create the index's durable state and wire it to its
    /// datasource. A persisted config hash that no longer matches means the
    /// definition drifted: reindexing is mandatory.
    pub async fn create(
        name: &str,
        config: IndexConfig,
        datasource: Arc<Datasource>,
        store: Arc<dyn StateStore>,
        registry: Arc<HandlerRegistry>,
        commands: mpsc::Sender<DispatcherCommand>,
        queue: mpsc::Receiver<IndexMessage>,
    ) -> Result<Self> {
        let config_hash = config.config_hash();
        let state = match store.load_index(name).await? {
            Some(state) if state.config_hash != config_hash => {
                warn!(
                    index = name,
                    persisted = %state.config_hash,
                    current = %config_hash,
                    "Config hash mismatch"
                );
                return Err(IndexerError::ReindexingRequired {
                    index: name.to_string(),
                    reason: ReindexingReason::ConfigModified,
                });
            }
            Some(state) => {
                info!(index = name, level = state.level, "Restored index state");
                state
            }
            None => {
                let state = IndexState::new(name, &config.kind, config.first_level, config_hash);
                store.save_index(&state).await?;
                state
            }
        };

        let subscriptions = config.subscriptions();
        datasource.add_subscriptions(subscriptions.iter().cloned());

        Ok(Self {
            name: name.to_string(),
            config,
            subscriptions,
            datasource,
            store,
            registry,
            commands,
            queue,
            state,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &IndexState {
        &self.state
    }

    /// Drive the index until shutdown. Fatal errors propagate out; the
    /// defined recovery is process restart resuming from the durable level.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        // A configured last level makes this a oneshot index: synchronize
        // through it, mark disabled, then park until shutdown.
        if let Some(last_level) = self.config.last_level {
            if self.state.status != IndexStatus::Disabled {
                if !self.synchronize(last_level, &mut shutdown).await? {
                    return Ok(());
                }
                self.state.status = IndexStatus::Disabled;
                self.state.level = last_level;
                self.store.save_index(&self.state).await?;
                info!(index = %self.name, level = last_level, "Oneshot index complete");
            }
            let _ = shutdown.recv().await;
            return Ok(());
        }

        loop {
            let sync_level = self.datasource.sync_level(&self.subscriptions)?;

            if self.state.level < sync_level {
                // Stale queue contents are superseded by the fetch below;
                // the buffer retained anything newer than the new target.
                while self.queue.try_recv().is_ok() {}
                if !self.synchronize(sync_level, &mut shutdown).await? {
                    return Ok(());
                }
                continue;
            }

            let message = tokio::select! {
                _ = shutdown.recv() => {
                    info!(index = %self.name, "Index shutting down");
                    return Ok(());
                }
                message = self.queue.recv() => message,
            };
            let Some(message) = message else {
                // Dispatcher dropped the queue; shutdown is in progress.
                return Ok(());
            };

            match message {
                IndexMessage::Head(level) => {
                    debug!(index = %self.name, level, "Head advanced");
                }
                IndexMessage::Level { level, records } => {
                    if level <= self.state.level {
                        debug!(
                            index = %self.name,
                            level,
                            index_level = self.state.level,
                            "Skipping outdated realtime message"
                        );
                        continue;
                    }
                    let target = sync_level.max(level);
                    self.process_level(level, records, target).await?;
                }
                IndexMessage::Rollback(rollback) => {
                    self.rollback(rollback).await?;
                }
            }
        }
    }

    /// Backfill `(state.level, sync_level]` through the historical fetcher.
    ///
    /// Returns `false` when interrupted by shutdown: the current level's
    /// transaction has committed, the durable level is a true lower bound,
    /// and the remaining range is picked up on the next run.
    async fn synchronize(
        &mut self,
        sync_level: Level,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<bool> {
        let index_level = self.state.level;
        if index_level > sync_level {
            return Err(IndexerError::FrameworkInvariant(format!(
                "attempt to synchronize index `{}` from level {index_level} down to {sync_level}",
                self.name
            )));
        }
        if index_level == sync_level {
            if self.state.status != IndexStatus::Realtime {
                self.state.status = IndexStatus::Realtime;
                self.store.save_index(&self.state).await?;
            }
            return Ok(true);
        }

        info!(
            index = %self.name,
            from = index_level + 1,
            to = sync_level,
            "Index is behind the datasource level, synchronizing"
        );
        self.state.status = IndexStatus::Syncing;
        self.store.save_index(&self.state).await?;

        let fetcher = HistoricalFetcher::from_patterns(
            self.datasource.gateway(),
            &self.config.handlers,
            index_level + 1,
            sync_level,
        );
        let mut stream = fetcher.fetch_by_level(self.config.readahead_limit);
        while let Some(item) = stream.next().await {
            if shutdown.try_recv().is_ok() {
                info!(index = %self.name, level = self.state.level, "Synchronization interrupted by shutdown");
                return Ok(false);
            }
            let (level, records) = item?;
            self.process_level(level, records, sync_level).await?;
        }

        self.state.status = IndexStatus::Realtime;
        self.state.level = sync_level;
        self.store.save_index(&self.state).await?;
        info!(index = %self.name, level = sync_level, "Index synchronized");
        Ok(true)
    }

    /// Apply one level: match, then run every matched handler inside a
    /// single transaction scoped to the level, bumping the durable state in
    /// the same commit.
    async fn process_level(
        &mut self,
        level: Level,
        records: Vec<ChainRecord>,
        sync_level: Level,
    ) -> Result<()> {
        if level <= self.state.level {
            return Err(IndexerError::FrameworkInvariant(format!(
                "batch level is lower than index level: {level} <= {}",
                self.state.level
            )));
        }
        for record in &records {
            if record.level != level {
                return Err(IndexerError::FrameworkInvariant(format!(
                    "record {} of level {} in batch of level {level}",
                    record.id, record.level
                )));
            }
        }

        let matched = match_batch(&self.config.handlers, &records)?;
        if matched.is_empty() {
            // Still bump the level so resumption never replays it.
            self.state.level = level;
            self.store.save_index(&self.state).await?;
            return Ok(());
        }

        debug!(
            index = %self.name,
            level,
            handlers = matched.len(),
            "Processing level"
        );

        let mut tx = self
            .store
            .begin_level_transaction(&self.name, level, sync_level)
            .await?;
        for matched_handler in &matched {
            let handler = self.registry.get(&matched_handler.callback)?;
            let mut ctx = HandlerContext::new(
                &self.name,
                self.datasource.name(),
                level,
                &matched_handler.record,
                tx.as_mut(),
                &self.commands,
            );
            handler.handle(&mut ctx, &matched_handler.payload).await?;
        }
        self.state.level = level;
        tx.save_state(&self.state).await?;
        tx.commit().await?;

        info!(
            index = %self.name,
            level,
            handlers = matched.len(),
            "Level committed"
        );
        Ok(())
    }

    /// A rollback that reaches below the durable level unwinds via the
    /// store's point-in-time revert when available and shallow enough;
    /// otherwise forward-only handlers cannot be inverted and the index
    /// escalates to a full reindex.
    async fn rollback(&mut self, rollback: RollbackMessage) -> Result<()> {
        if rollback.to_level >= self.state.level {
            info!(
                index = %self.name,
                from_level = rollback.from_level,
                to_level = rollback.to_level,
                index_level = self.state.level,
                "Rollback above index level, nothing to undo"
            );
            return Ok(());
        }

        let depth = self.state.level.saturating_sub(rollback.to_level);
        if !self.store.supports_rollback() || depth > self.datasource.rollback_depth() {
            warn!(
                index = %self.name,
                from_level = rollback.from_level,
                to_level = rollback.to_level,
                depth,
                "Rollback cannot be unwound in place"
            );
            return Err(IndexerError::ReindexingRequired {
                index: self.name.clone(),
                reason: ReindexingReason::Rollback,
            });
        }

        self.store.revert_to(&self.name, rollback.to_level).await?;
        self.state.level = rollback.to_level;
        info!(
            index = %self.name,
            level = rollback.to_level,
            "Rolled back"
        );
        Ok(())
    }
}
