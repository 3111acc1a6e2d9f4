//! Execution context handed to every handler invocation.

use std::collections::BTreeMap;

use tokio::sync::mpsc;

use indexer_core::{
    ChainRecord, DispatcherCommand, IndexerError, Level, ReindexingReason, Result,
};
use indexer_store::LevelTransaction;

/// Scoped view a callback gets of the pipeline: the matched record, the open
/// level transaction, and escalation hooks back into the dispatcher.
pub struct HandlerContext<'a> {
    pub index: &'a str,
    pub datasource: &'a str,
    pub level: Level,
    pub record: &'a ChainRecord,
    /// The one open transaction for this (index, level) pair. Everything a
    /// handler persists goes through it.
    pub tx: &'a mut dyn LevelTransaction,
    commands: &'a mpsc::Sender<DispatcherCommand>,
}

impl<'a> HandlerContext<'a> {
    pub fn new(
        index: &'a str,
        datasource: &'a str,
        level: Level,
        record: &'a ChainRecord,
        tx: &'a mut dyn LevelTransaction,
        commands: &'a mpsc::Sender<DispatcherCommand>,
    ) -> Self {
        Self {
            index,
            datasource,
            level,
            record,
            tx,
            commands,
        }
    }

    /// Spawn a new index from a template at runtime (factory pattern).
    /// Queued to the dispatcher rather than applied in place, so a handler
    /// never reenters the dispatcher mid-dispatch.
    pub async fn add_index(
        &self,
        name: &str,
        template: &str,
        values: BTreeMap<String, String>,
    ) -> Result<()> {
        self.commands
            .send(DispatcherCommand::SpawnIndex {
                name: name.to_string(),
                template: template.to_string(),
                values,
            })
            .await
            .map_err(|_| {
                IndexerError::FrameworkInvariant(
                    "dispatcher command queue is closed".to_string(),
                )
            })
    }

    /// Force a full rebuild of this index's derived state. The returned
    /// error must be propagated out of the handler.
    pub fn reindex(&self, reason: ReindexingReason) -> IndexerError {
        IndexerError::ReindexingRequired {
            index: self.index.to_string(),
            reason,
        }
    }
}
