use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{ChainRecord, ChainRecordKind, HeadBlock, Level, RollbackMessage};

/// One message on a datasource's realtime stream.
#[derive(Debug, Clone)]
pub enum GatewayMessage {
    /// Transport (re)established; subscriptions must resynchronize.
    Connected,
    Disconnected,
    Head(HeadBlock),
    Data {
        kind: ChainRecordKind,
        level: Level,
        records: Vec<ChainRecord>,
    },
    Rollback {
        kind: ChainRecordKind,
        rollback: RollbackMessage,
    },
}

/// Authenticated, rate-limited transport primitive provided to the pipeline.
///
/// Connectivity failures are retried behind `request` with backoff and are
/// invisible to callers; only exhausted retries surface, as
/// `IndexerError::Datasource`.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Name of the datasource this gateway serves, for error attribution.
    fn name(&self) -> &str;

    /// Paginated request/response. Callers pass provider cursor parameters
    /// (`limit`, `offset.cr`) through `params`.
    async fn request(&self, path: &str, params: &[(String, String)]) -> Result<serde_json::Value>;

    /// Open the realtime stream. One receiver per datasource task.
    async fn subscribe(&self) -> Result<mpsc::Receiver<GatewayMessage>>;
}
