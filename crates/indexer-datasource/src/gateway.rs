//! HTTP gateway: paginated REST requests with bounded exponential backoff,
//! plus a polling loop that synthesizes the realtime stream. A socket
//! transport can replace the polling loop behind the same `Gateway` contract.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use indexer_core::{
    ChainRecord, ChainRecordKind, Gateway, GatewayMessage, HeadBlock, IndexerError, Level, Result,
    RollbackMessage,
};

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);
/// Provider-side page size for realtime catch-up requests.
const REALTIME_PAGE_LIMIT: usize = 1000;

#[derive(Debug, Clone)]
pub struct HttpGatewayConfig {
    pub name: String,
    pub url: String,
    pub poll_interval: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
}

impl HttpGatewayConfig {
    pub fn new(name: &str, url: &str, poll_interval_ms: u64) -> Self {
        Self {
            name: name.to_string(),
            url: url.trim_end_matches('/').to_string(),
            poll_interval: Duration::from_millis(poll_interval_ms),
            retry_attempts: 10,
            retry_delay: Duration::from_millis(1000),
        }
    }
}

pub struct HttpGateway {
    client: reqwest::Client,
    config: HttpGatewayConfig,
}

impl HttpGateway {
    pub fn new(config: HttpGatewayConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    async fn request_once(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> std::result::Result<serde_json::Value, reqwest::Error> {
        self.client
            .get(format!("{}{}", self.config.url, path))
            .query(params)
            .send()
            .await?
            .error_for_status()?
            .json::<serde_json::Value>()
            .await
    }

    async fn fetch_head(&self) -> Result<HeadBlock> {
        let value = self.request("/head", &[]).await?;
        serde_json::from_value(value).map_err(|e| IndexerError::Datasource {
            name: self.config.name.clone(),
            message: format!("malformed head response: {e}"),
        })
    }

    /// Records of one kind in `(after, through]`, grouped by level ascending.
    async fn fetch_records(
        &self,
        kind: ChainRecordKind,
        after: Level,
        through: Level,
    ) -> Result<BTreeMap<Level, Vec<ChainRecord>>> {
        let params = vec![
            ("kind".to_string(), kind.as_str().to_string()),
            ("level.gt".to_string(), after.to_string()),
            ("level.le".to_string(), through.to_string()),
            ("limit".to_string(), REALTIME_PAGE_LIMIT.to_string()),
        ];
        let value = self.request("/records", &params).await?;
        let records: Vec<ChainRecord> =
            serde_json::from_value(value).map_err(|e| IndexerError::Datasource {
                name: self.config.name.clone(),
                message: format!("malformed records response: {e}"),
            })?;

        let mut by_level: BTreeMap<Level, Vec<ChainRecord>> = BTreeMap::new();
        for record in records {
            by_level.entry(record.level).or_default().push(record);
        }
        Ok(by_level)
    }

    /// One polling round: emit per-level data for every kind, then the head.
    /// A head below the previous one is a reorg and becomes rollbacks.
    async fn poll_round(
        &self,
        tx: &mpsc::Sender<GatewayMessage>,
        last_head: &mut Option<Level>,
    ) -> Result<bool> {
        let head = self.fetch_head().await?;

        let since = match *last_head {
            None => {
                *last_head = Some(head.level);
                return Ok(tx.send(GatewayMessage::Head(head)).await.is_ok());
            }
            Some(last) if head.level < last => {
                let rollback = RollbackMessage {
                    from_level: last,
                    to_level: head.level,
                };
                for kind in ChainRecordKind::ALL {
                    if tx
                        .send(GatewayMessage::Rollback { kind, rollback })
                        .await
                        .is_err()
                    {
                        return Ok(false);
                    }
                }
                *last_head = Some(head.level);
                return Ok(tx.send(GatewayMessage::Head(head)).await.is_ok());
            }
            Some(last) if head.level == last => return Ok(true),
            Some(last) => last,
        };

        for kind in ChainRecordKind::ALL {
            if kind == ChainRecordKind::Block {
                continue;
            }
            let by_level = self.fetch_records(kind, since, head.level).await?;
            for (level, records) in by_level {
                debug!(
                    datasource = %self.config.name,
                    kind = %kind,
                    level,
                    count = records.len(),
                    "Realtime records fetched"
                );
                if tx
                    .send(GatewayMessage::Data {
                        kind,
                        level,
                        records,
                    })
                    .await
                    .is_err()
                {
                    return Ok(false);
                }
            }
        }

        *last_head = Some(head.level);
        Ok(tx.send(GatewayMessage::Head(head)).await.is_ok())
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn request(&self, path: &str, params: &[(String, String)]) -> Result<serde_json::Value> {
        let mut attempts = 0u32;
        let mut delay = self.config.retry_delay;

        loop {
            attempts += 1;
            match self.request_once(path, params).await {
                Ok(value) => return Ok(value),
                Err(e) if attempts < self.config.retry_attempts => {
                    warn!(
                        datasource = %self.config.name,
                        path,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Request failed, retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_RETRY_DELAY);
                }
                Err(e) => {
                    return Err(IndexerError::Datasource {
                        name: self.config.name.clone(),
                        message: format!("request to `{path}` failed after {attempts} attempts: {e}"),
                    })
                }
            }
        }
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<GatewayMessage>> {
        let (tx, rx) = mpsc::channel(256);
        let gateway = HttpGateway {
            client: self.client.clone(),
            config: self.config.clone(),
        };

        tokio::spawn(async move {
            if tx.send(GatewayMessage::Connected).await.is_err() {
                return;
            }
            let mut last_head: Option<Level> = None;
            let mut interval = tokio::time::interval(gateway.config.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                match gateway.poll_round(&tx, &mut last_head).await {
                    Ok(true) => {}
                    // Receiver dropped; the datasource task is gone.
                    Ok(false) => return,
                    Err(e) => {
                        error!(
                            datasource = %gateway.config.name,
                            error = %e,
                            "Realtime polling failed; closing stream"
                        );
                        let _ = tx.send(GatewayMessage::Disconnected).await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}
