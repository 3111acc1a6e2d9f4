use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use indexer_core::{IndexerError, RuntimeConfig};
use indexer_datasource::{Datasource, HttpGateway, HttpGatewayConfig};
use indexer_processor::HandlerRegistry;
use indexer_store::{DatabaseConfig, MemoryStateStore, PgStateStore, StateStore};
use indexer_sync::IndexDispatcher;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file (ignore if not found)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(Level::INFO.into())
                .add_directive("indexer_sync=info".parse()?)
                .add_directive("indexer_datasource=info".parse()?),
        )
        .init();

    info!("Riptide indexer starting...");

    let config = match RuntimeConfig::load() {
        Ok(config) => {
            info!(
                datasources = config.datasources.len(),
                indexes = config.indexes.len(),
                templates = config.templates.len(),
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    // Durable store if DATABASE_URL is set, in-memory otherwise.
    let store: Arc<dyn StateStore> = match std::env::var("DATABASE_URL") {
        Ok(_) => {
            let db_config = match DatabaseConfig::from_env() {
                Ok(db_config) => db_config,
                Err(e) => {
                    error!(error = %e, "Invalid database configuration");
                    std::process::exit(1);
                }
            };
            match PgStateStore::connect(&db_config).await {
                Ok(store) => {
                    info!("Database connected, schema ensured");
                    Arc::new(store)
                }
                Err(e) => {
                    error!(error = %e, "Failed to connect to database");
                    std::process::exit(1);
                }
            }
        }
        Err(_) => {
            warn!("DATABASE_URL not set, index state will not survive restarts");
            Arc::new(MemoryStateStore::new())
        }
    };

    // User callbacks register here; a pattern referencing an unregistered
    // callback fails on first match.
    let registry = Arc::new(HandlerRegistry::new());

    let datasources: BTreeMap<String, Arc<Datasource>> = config
        .datasources
        .iter()
        .map(|(name, ds_config)| {
            let gateway = Arc::new(HttpGateway::new(HttpGatewayConfig::new(
                name,
                &ds_config.url,
                ds_config.poll_interval_ms,
            )));
            (
                name.clone(),
                Arc::new(Datasource::new(name, ds_config.clone(), gateway)),
            )
        })
        .collect();

    let (shutdown_tx, _) = broadcast::channel::<()>(4);

    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received (Ctrl+C)");
        ctrl_c_tx.send(()).ok();
    });

    // Periodic status line with each index's durable level.
    let status_store = Arc::clone(&store);
    let index_names: Vec<String> = config.indexes.keys().cloned().collect();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            for name in &index_names {
                match status_store.load_index(name).await {
                    Ok(Some(state)) => info!(
                        index = %name,
                        level = state.level,
                        status = state.status.as_str(),
                        "Status"
                    ),
                    Ok(None) => {}
                    Err(e) => warn!(index = %name, error = %e, "Failed to read index state"),
                }
            }
        }
    });

    let dispatcher = IndexDispatcher::new(config, Arc::clone(&store), registry, datasources);

    match dispatcher.run(shutdown_tx).await {
        Ok(()) => {
            info!("Riptide indexer shutdown complete");
            Ok(())
        }
        Err(IndexerError::ReindexingRequired { index, reason }) => {
            // Expected, non-error termination of this run: wipe the index's
            // derived state so the next start rebuilds from the first level.
            warn!(index = %index, reason = %reason, "Reindexing required, wiping index state");
            if let Err(e) = store.wipe(&index).await {
                error!(error = %e, "Failed to wipe index state");
                std::process::exit(1);
            }
            info!(index = %index, "Index state wiped; restart to reindex");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Indexer failed");
            std::process::exit(1);
        }
    }
}
