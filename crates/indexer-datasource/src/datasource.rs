//! One named provider connection: owns the subscription tracker and the
//! realtime reorder buffer, and turns the gateway's raw stream into ordered
//! per-level messages for the dispatcher.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use indexer_core::{
    DatasourceConfig, Gateway, GatewayMessage, HeadBlock, IndexerError, Level, Result,
    RollbackMessage, Subscription,
};

use crate::buffer::{BufferedMessage, MessageBuffer};
use crate::subscriptions::SubscriptionTracker;

/// Ordered message emitted by a datasource task toward the dispatcher.
#[derive(Debug, Clone)]
pub enum DatasourceMessage {
    Head(HeadBlock),
    /// All buffered kinds for one level, released together.
    Data {
        level: Level,
        messages: Vec<BufferedMessage>,
    },
    /// A rollback the buffer could not absorb; must reach every index.
    Rollback(RollbackMessage),
}

pub struct Datasource {
    name: String,
    config: DatasourceConfig,
    gateway: Arc<dyn Gateway>,
    // Written only by this datasource's task and during index registration;
    // read from index tasks. Accesses are short and non-suspending.
    tracker: RwLock<SubscriptionTracker>,
}

impl Datasource {
    pub fn new(name: &str, config: DatasourceConfig, gateway: Arc<dyn Gateway>) -> Self {
        Self {
            name: name.to_string(),
            config,
            gateway,
            tracker: RwLock::new(SubscriptionTracker::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn gateway(&self) -> Arc<dyn Gateway> {
        Arc::clone(&self.gateway)
    }

    /// Deepest reorg this provider declares it can report.
    pub fn rollback_depth(&self) -> u64 {
        self.config.rollback_depth
    }

    pub fn add_subscriptions(&self, subscriptions: impl IntoIterator<Item = Subscription>) {
        let mut tracker = self.tracker.write().unwrap_or_else(|e| e.into_inner());
        for subscription in subscriptions {
            tracker.add(subscription);
        }
    }

    pub fn missing_subscriptions(&self) -> usize {
        let tracker = self.tracker.read().unwrap_or_else(|e| e.into_inner());
        tracker.missing().len()
    }

    /// Level an index must synchronize to, given its subscription set: the
    /// highest sync level across them. Multiple levels happen when an index
    /// with new subscriptions was added at runtime; outdated realtime
    /// messages are dropped by the index anyway.
    pub fn sync_level(&self, subscriptions: &BTreeSet<Subscription>) -> Result<Level> {
        if subscriptions.is_empty() {
            return Err(IndexerError::FrameworkInvariant(
                "index has no subscriptions".to_string(),
            ));
        }
        let tracker = self.tracker.read().unwrap_or_else(|e| e.into_inner());
        let mut max_level = None;
        for subscription in subscriptions {
            match tracker.get_sync_level(subscription)? {
                Some(level) => max_level = Some(max_level.map_or(level, |m: Level| m.max(level))),
                None => {
                    return Err(IndexerError::FrameworkInvariant(format!(
                        "subscription {subscription} has no sync level; datasource `{}` is not initialized",
                        self.name
                    )))
                }
            }
        }
        Ok(max_level.unwrap_or_default())
    }

    /// Fetch the current head over REST and seed the wildcard sync level so
    /// indexes can start synchronizing before the first realtime message.
    pub async fn initialize(&self) -> Result<()> {
        let value = self.gateway.request("/head", &[]).await?;
        let head: HeadBlock = serde_json::from_value(value).map_err(|e| {
            IndexerError::Datasource {
                name: self.name.clone(),
                message: format!("malformed head response: {e}"),
            }
        })?;

        info!(datasource = %self.name, level = head.level, "Datasource initialized");
        self.set_sync_level(None, head.level)?;
        Ok(())
    }

    fn set_sync_level(&self, subscription: Option<&Subscription>, level: Level) -> Result<()> {
        let mut tracker = self.tracker.write().unwrap_or_else(|e| e.into_inner());
        tracker.set_sync_level(subscription, level)
    }

    /// Consume the gateway's realtime stream until shutdown: feed the
    /// tracker and reorder buffer, release complete levels downstream and
    /// absorb shallow rollbacks.
    pub async fn run(
        &self,
        sender: mpsc::Sender<DatasourceMessage>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let mut stream = self.gateway.subscribe().await?;
        let mut buffer = MessageBuffer::new(self.config.buffer_size);

        info!(datasource = %self.name, buffer_size = self.config.buffer_size, "Datasource running");

        loop {
            let message = tokio::select! {
                _ = shutdown.recv() => {
                    info!(datasource = %self.name, "Datasource shutting down");
                    return Ok(());
                }
                message = stream.recv() => message,
            };

            let Some(message) = message else {
                return Err(IndexerError::Datasource {
                    name: self.name.clone(),
                    message: "realtime stream closed".to_string(),
                });
            };

            match message {
                GatewayMessage::Connected => {
                    // Force resynchronization without losing filter intent.
                    let mut tracker = self.tracker.write().unwrap_or_else(|e| e.into_inner());
                    tracker.reset();
                    info!(datasource = %self.name, "Realtime transport connected");
                }
                GatewayMessage::Disconnected => {
                    warn!(datasource = %self.name, "Realtime transport disconnected");
                }
                GatewayMessage::Head(head) => {
                    debug!(datasource = %self.name, level = head.level, "New head");
                    self.set_sync_level(None, head.level)?;
                    if sender.send(DatasourceMessage::Head(head)).await.is_err() {
                        return Ok(());
                    }
                }
                GatewayMessage::Data {
                    kind,
                    level,
                    records,
                } => {
                    buffer.add(kind, level, records)?;
                    for (level, messages) in buffer.yield_ready() {
                        if sender
                            .send(DatasourceMessage::Data { level, messages })
                            .await
                            .is_err()
                        {
                            return Ok(());
                        }
                    }
                }
                GatewayMessage::Rollback { kind, rollback } => {
                    if buffer.rollback(kind, rollback.from_level, rollback.to_level) {
                        info!(
                            datasource = %self.name,
                            kind = %kind,
                            from_level = rollback.from_level,
                            to_level = rollback.to_level,
                            "Rollback absorbed by buffer"
                        );
                        continue;
                    }
                    warn!(
                        datasource = %self.name,
                        kind = %kind,
                        from_level = rollback.from_level,
                        to_level = rollback.to_level,
                        "Rollback reaches released levels; notifying indexes"
                    );
                    if sender
                        .send(DatasourceMessage::Rollback(rollback))
                        .await
                        .is_err()
                    {
                        return Ok(());
                    }
                }
            }
        }
    }
}
