//! Index dispatcher: owns the live index set and datasource lifecycles,
//! routes realtime messages from each datasource to every subscribed index,
//! and services runtime spawn commands coming out of handlers.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use indexer_core::{
    DispatcherCommand, IndexConfig, IndexerError, Result, RuntimeConfig, Subscription,
};
use indexer_datasource::{Datasource, DatasourceMessage};
use indexer_processor::HandlerRegistry;
use indexer_store::StateStore;

use crate::index::{Index, IndexMessage};

const INDEX_QUEUE_CAPACITY: usize = 1024;
const DATASOURCE_CHANNEL_CAPACITY: usize = 256;
const COMMAND_QUEUE_CAPACITY: usize = 64;

/// Routing entry for one live index.
struct IndexHandle {
    queue: mpsc::Sender<IndexMessage>,
    datasource: String,
    subscriptions: BTreeSet<Subscription>,
}

pub struct IndexDispatcher {
    config: RuntimeConfig,
    store: Arc<dyn StateStore>,
    registry: Arc<HandlerRegistry>,
    datasources: BTreeMap<String, Arc<Datasource>>,
    handles: Arc<DashMap<String, IndexHandle>>,
    command_tx: mpsc::Sender<DispatcherCommand>,
    command_rx: mpsc::Receiver<DispatcherCommand>,
}

impl IndexDispatcher {
    pub fn new(
        config: RuntimeConfig,
        store: Arc<dyn StateStore>,
        registry: Arc<HandlerRegistry>,
        datasources: BTreeMap<String, Arc<Datasource>>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        Self {
            config,
            store,
            registry,
            datasources,
            handles: Arc::new(DashMap::new()),
            command_tx,
            command_rx,
        }
    }

    /// Sender handlers use (through their context) to reach the dispatcher.
    pub fn command_sender(&self) -> mpsc::Sender<DispatcherCommand> {
        self.command_tx.clone()
    }

    /// Run every datasource and index to completion. Returns the first fatal
    /// error after cancelling the remaining tasks, or `Ok` on shutdown.
    pub async fn run(mut self, shutdown: broadcast::Sender<()>) -> Result<()> {
        for datasource in self.datasources.values() {
            datasource.initialize().await?;
        }

        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        let index_configs: Vec<(String, IndexConfig)> = self
            .config
            .indexes
            .iter()
            .map(|(name, config)| (name.clone(), config.clone()))
            .collect();
        for (name, index_config) in index_configs {
            self.spawn_index(&name, index_config, &mut tasks, &shutdown)
                .await?;
        }

        for (name, datasource) in &self.datasources {
            let (tx, rx) = mpsc::channel(DATASOURCE_CHANNEL_CAPACITY);

            let runner = Arc::clone(datasource);
            let datasource_shutdown = shutdown.subscribe();
            tasks.spawn(async move { runner.run(tx, datasource_shutdown).await });

            let handles = Arc::clone(&self.handles);
            let datasource_name = name.clone();
            let routing_shutdown = shutdown.subscribe();
            tasks.spawn(async move {
                Self::route(datasource_name, rx, handles, routing_shutdown).await
            });
        }

        info!(
            indexes = self.handles.len(),
            datasources = self.datasources.len(),
            "Dispatcher running"
        );

        let mut shutdown_rx = shutdown.subscribe();
        let mut failure = loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break None,
                Some(command) = self.command_rx.recv() => {
                    if let Err(e) = self.handle_command(command, &mut tasks, &shutdown).await {
                        break Some(e);
                    }
                }
                Some(result) = tasks.join_next() => {
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => break Some(e),
                        Err(e) => {
                            break Some(IndexerError::FrameworkInvariant(format!(
                                "task panicked: {e}"
                            )))
                        }
                    }
                }
            }
        };

        // Cooperative shutdown: every task finishes its in-flight level
        // before exiting; pending queue contents are dropped unprocessed.
        let _ = shutdown.send(());
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if failure.is_none() {
                        failure = Some(e);
                    } else {
                        error!(error = %e, "Task failed during shutdown");
                    }
                }
                Err(e) => warn!(error = %e, "Task join failed during shutdown"),
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn handle_command(
        &mut self,
        command: DispatcherCommand,
        tasks: &mut JoinSet<Result<()>>,
        shutdown: &broadcast::Sender<()>,
    ) -> Result<()> {
        match command {
            DispatcherCommand::SpawnIndex {
                name,
                template,
                values,
            } => {
                let template_config = self.config.templates.get(&template).ok_or_else(|| {
                    IndexerError::Config(format!(
                        "index `{name}` references unknown template `{template}`"
                    ))
                })?;
                let index_config = template_config.instantiate(&values);
                info!(index = %name, template = %template, "Spawning index from template");
                self.spawn_index(&name, index_config, tasks, shutdown).await
            }
        }
    }

    async fn spawn_index(
        &mut self,
        name: &str,
        config: IndexConfig,
        tasks: &mut JoinSet<Result<()>>,
        shutdown: &broadcast::Sender<()>,
    ) -> Result<()> {
        if self.handles.contains_key(name) {
            warn!(index = %name, "Index already spawned");
            return Ok(());
        }

        let datasource = self
            .datasources
            .get(&config.datasource)
            .cloned()
            .ok_or_else(|| {
                IndexerError::Config(format!(
                    "index `{name}` references unknown datasource `{}`",
                    config.datasource
                ))
            })?;

        let subscriptions = config.subscriptions();
        let (queue_tx, queue_rx) = mpsc::channel(INDEX_QUEUE_CAPACITY);

        let index = Index::create(
            name,
            config,
            Arc::clone(&datasource),
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            self.command_tx.clone(),
            queue_rx,
        )
        .await?;

        self.handles.insert(
            name.to_string(),
            IndexHandle {
                queue: queue_tx,
                datasource: datasource.name().to_string(),
                subscriptions,
            },
        );

        let index_shutdown = shutdown.subscribe();
        tasks.spawn(async move { index.run(index_shutdown).await });
        info!(index = %name, "Index spawned");
        Ok(())
    }

    /// Routing loop for one datasource connection: fan its ordered message
    /// stream out to every subscribed index's queue. This is the only
    /// producer into index queues.
    async fn route(
        datasource: String,
        mut rx: mpsc::Receiver<DatasourceMessage>,
        handles: Arc<DashMap<String, IndexHandle>>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        loop {
            let message = tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                message = rx.recv() => message,
            };
            let Some(message) = message else {
                return Ok(());
            };

            match message {
                DatasourceMessage::Head(head) => {
                    Self::fanout(&datasource, &handles, |_| {
                        Some(IndexMessage::Head(head.level))
                    })
                    .await;
                }
                DatasourceMessage::Data { level, messages } => {
                    let mut records: Vec<_> = messages
                        .into_iter()
                        .flat_map(|message| message.records)
                        .collect();
                    records.sort_by_key(|r| r.id);

                    Self::fanout(&datasource, &handles, |handle| {
                        let interested: Vec<_> = records
                            .iter()
                            .filter(|r| handle.subscriptions.iter().any(|s| s.matches(r)))
                            .cloned()
                            .collect();
                        if interested.is_empty() {
                            None
                        } else {
                            Some(IndexMessage::Level {
                                level,
                                records: interested,
                            })
                        }
                    })
                    .await;
                }
                DatasourceMessage::Rollback(rollback) => {
                    // Broadcast: every index sharing the datasource decides
                    // for itself whether the rollback touches it.
                    Self::fanout(&datasource, &handles, |_| {
                        Some(IndexMessage::Rollback(rollback))
                    })
                    .await;
                }
            }
        }
    }

    async fn fanout<F>(datasource: &str, handles: &DashMap<String, IndexHandle>, make: F)
    where
        F: Fn(&IndexHandle) -> Option<IndexMessage>,
    {
        // Collect first: holding a dashmap shard lock across an await point
        // would block concurrent spawns.
        let targets: Vec<(String, mpsc::Sender<IndexMessage>, Option<IndexMessage>)> = handles
            .iter()
            .filter(|entry| entry.value().datasource == datasource)
            .map(|entry| {
                let message = make(entry.value());
                (entry.key().clone(), entry.value().queue.clone(), message)
            })
            .collect();

        for (name, queue, message) in targets {
            let Some(message) = message else { continue };
            if queue.send(message).await.is_err() {
                // The index task ended; its terminal result is handled by
                // the dispatcher's join loop.
                warn!(index = %name, "Index queue closed, dropping message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use indexer_core::{
        ChainRecord, ChainRecordKind, DatasourceConfig, GatewayMessage, HandlerPatternConfig,
        HeadBlock, IndexTemplate, Level,
    };
    use indexer_processor::{DecodedPayload, Handler, HandlerContext};
    use indexer_store::MemoryStateStore;

    use crate::testutil::TestProvider;

    fn op(id: u64, level: Level, target: &str) -> ChainRecord {
        ChainRecord {
            id,
            kind: ChainRecordKind::Operation,
            level,
            contract: None,
            entrypoint: Some("transfer".to_string()),
            sender: None,
            target: Some(target.to_string()),
            token_id: None,
            path: None,
            payload: json!({"entrypoint": "transfer", "parameter": {}}),
        }
    }

    fn pattern(callback: &str, target: &str) -> HandlerPatternConfig {
        HandlerPatternConfig {
            callback: callback.to_string(),
            kind: ChainRecordKind::Operation,
            contract: None,
            entrypoint: None,
            sender: None,
            target: Some(target.to_string()),
            token_id: None,
            path: None,
        }
    }

    struct RecordingHandler {
        seen: Arc<Mutex<Vec<(String, Level)>>>,
        name: String,
    }

    #[async_trait]
    impl Handler for RecordingHandler {
        async fn handle(
            &self,
            ctx: &mut HandlerContext<'_>,
            _payload: &DecodedPayload,
        ) -> Result<()> {
            self.seen
                .lock()
                .unwrap()
                .push((self.name.clone(), ctx.level));
            Ok(())
        }
    }

    fn runtime_config(head_target: &str) -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.datasources.insert(
            "main".to_string(),
            DatasourceConfig {
                url: "http://localhost".to_string(),
                buffer_size: 0,
                rollback_depth: 2,
                poll_interval_ms: 10,
            },
        );
        config.indexes.insert(
            "dex".to_string(),
            IndexConfig {
                kind: "operations".to_string(),
                datasource: "main".to_string(),
                handlers: vec![pattern("on_transfer", head_target)],
                first_level: 100,
                last_level: None,
                readahead_limit: 100,
            },
        );
        config.templates.insert(
            "factory_child".to_string(),
            IndexTemplate {
                kind: "operations".to_string(),
                datasource: "main".to_string(),
                handlers: vec![pattern("on_child", "<contract>")],
                first_level: 100,
                last_level: None,
            },
        );
        config
    }

    fn datasources(provider: &Arc<TestProvider>, config: &RuntimeConfig) -> BTreeMap<String, Arc<Datasource>> {
        config
            .datasources
            .iter()
            .map(|(name, ds_config)| {
                (
                    name.clone(),
                    Arc::new(Datasource::new(name, ds_config.clone(), provider.gateway())),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn routes_realtime_levels_to_subscribed_indexes() {
        // Level 101 is also in the REST table: whether the index picks it up
        // from the realtime queue or by re-syncing after the head message,
        // it is applied exactly once.
        let provider =
            TestProvider::with_head(vec![op(1, 100, "KT1a"), op(2, 101, "KT1a")], 100);
        provider.script_realtime(vec![
            GatewayMessage::Data {
                kind: ChainRecordKind::Operation,
                level: 101,
                records: vec![op(2, 101, "KT1a")],
            },
            GatewayMessage::Head(HeadBlock {
                level: 101,
                hash: "h101".to_string(),
                timestamp: 0,
            }),
        ]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(HandlerRegistry::new());
        registry.register(
            "on_transfer",
            Arc::new(RecordingHandler {
                seen: Arc::clone(&seen),
                name: "dex".to_string(),
            }),
        );

        let config = runtime_config("KT1a");
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let dispatcher = IndexDispatcher::new(
            config.clone(),
            Arc::clone(&store),
            registry,
            datasources(&provider, &config),
        );

        let (shutdown_tx, _) = broadcast::channel(1);
        let run = tokio::spawn(dispatcher.run(shutdown_tx.clone()));

        for _ in 0..200 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            if seen.lock().unwrap().len() == 2 {
                break;
            }
        }
        // Backfilled level 100 plus realtime level 101.
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("dex".to_string(), 100), ("dex".to_string(), 101)]
        );

        shutdown_tx.send(()).unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn spawn_command_creates_index_from_template() {
        let provider = TestProvider::with_head(
            vec![op(1, 100, "KT1a"), op(2, 100, "KT1child")],
            100,
        );

        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(HandlerRegistry::new());
        registry.register(
            "on_transfer",
            Arc::new(RecordingHandler {
                seen: Arc::clone(&seen),
                name: "dex".to_string(),
            }),
        );
        registry.register(
            "on_child",
            Arc::new(RecordingHandler {
                seen: Arc::clone(&seen),
                name: "child".to_string(),
            }),
        );

        let config = runtime_config("KT1a");
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let dispatcher = IndexDispatcher::new(
            config.clone(),
            Arc::clone(&store),
            registry,
            datasources(&provider, &config),
        );
        let commands = dispatcher.command_sender();

        let (shutdown_tx, _) = broadcast::channel(1);
        let run = tokio::spawn(dispatcher.run(shutdown_tx.clone()));

        let mut values = BTreeMap::new();
        values.insert("contract".to_string(), "KT1child".to_string());
        commands
            .send(DispatcherCommand::SpawnIndex {
                name: "child-index".to_string(),
                template: "factory_child".to_string(),
                values,
            })
            .await
            .unwrap();

        for _ in 0..200 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            let seen = seen.lock().unwrap();
            if seen.iter().any(|(name, _)| name == "child") {
                break;
            }
        }
        assert!(seen
            .lock()
            .unwrap()
            .iter()
            .any(|(name, level)| name == "child" && *level == 100));

        let state = store.load_index("child-index").await.unwrap().unwrap();
        assert_eq!(state.level, 100);

        shutdown_tx.send(()).unwrap();
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn rollback_broadcast_reaches_every_index_on_the_datasource() {
        let provider = TestProvider::with_head(vec![op(1, 100, "KT1a")], 100);
        provider.script_realtime(vec![GatewayMessage::Rollback {
            kind: ChainRecordKind::Operation,
            rollback: indexer_core::RollbackMessage {
                from_level: 100,
                to_level: 98,
            },
        }]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = Arc::new(HandlerRegistry::new());
        registry.register(
            "on_transfer",
            Arc::new(RecordingHandler {
                seen: Arc::clone(&seen),
                name: "dex".to_string(),
            }),
        );

        let config = runtime_config("KT1a");
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::forward_only());
        let dispatcher = IndexDispatcher::new(
            config.clone(),
            store,
            registry,
            datasources(&provider, &config),
        );

        let (shutdown_tx, _) = broadcast::channel(1);
        let run = tokio::spawn(dispatcher.run(shutdown_tx.clone()));

        // The index applies level 100, then the broadcast rollback to 98
        // lands below its durable level: reindexing is the only way out.
        let result = tokio::time::timeout(std::time::Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            result,
            Err(IndexerError::ReindexingRequired { .. })
        ));
    }
}
