//! In-memory provider used across this crate's tests: answers paginated
//! `/records` queries against a fixed record table and replays a scripted
//! realtime stream.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use indexer_core::{ChainRecord, Gateway, GatewayMessage, Level, Result};

const PAGE_LIMIT_PARAM: &str = "limit";

pub(crate) struct TestProvider {
    records: Vec<ChainRecord>,
    head_level: Level,
    realtime: Mutex<Vec<GatewayMessage>>,
}

impl TestProvider {
    pub fn new(records: Vec<ChainRecord>) -> Arc<Self> {
        let head_level = records.iter().map(|r| r.level).max().unwrap_or_default();
        Arc::new(Self {
            records,
            head_level,
            realtime: Mutex::new(Vec::new()),
        })
    }

    pub fn with_head(records: Vec<ChainRecord>, head_level: Level) -> Arc<Self> {
        Arc::new(Self {
            records,
            head_level,
            realtime: Mutex::new(Vec::new()),
        })
    }

    pub fn script_realtime(self: &Arc<Self>, messages: Vec<GatewayMessage>) {
        *self.realtime.lock().unwrap() = messages;
    }

    pub fn gateway(self: &Arc<Self>) -> Arc<dyn Gateway> {
        Arc::clone(self) as Arc<dyn Gateway>
    }

    fn field_of<'a>(record: &'a ChainRecord, field: &str) -> Option<&'a str> {
        match field {
            "sender" => record.sender.as_deref(),
            "target" => record.target.as_deref(),
            "contract" => record.contract.as_deref(),
            "path" => record.path.as_deref(),
            _ => None,
        }
    }
}

#[async_trait]
impl Gateway for TestProvider {
    fn name(&self) -> &str {
        "test"
    }

    async fn request(&self, path: &str, params: &[(String, String)]) -> Result<serde_json::Value> {
        match path {
            "/head" => Ok(serde_json::json!({
                "level": self.head_level,
                "hash": format!("h{}", self.head_level),
                "timestamp": 0,
            })),
            "/records" => {
                let get = |name: &str| {
                    params
                        .iter()
                        .find(|(key, _)| key == name)
                        .map(|(_, value)| value.as_str())
                };
                let kind = get("kind");
                let level_ge: Level = get("level.ge").and_then(|v| v.parse().ok()).unwrap_or(0);
                let level_le: Level = get("level.le")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(Level::MAX);
                let offset: Option<u64> = get("offset.cr").and_then(|v| v.parse().ok());
                let limit: usize = get(PAGE_LIMIT_PARAM)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(usize::MAX);
                let field_filter = params.iter().find_map(|(key, value)| {
                    key.strip_suffix(".in").map(|field| {
                        (
                            field.to_string(),
                            value.split(',').map(str::to_string).collect::<Vec<_>>(),
                        )
                    })
                });

                let mut matched: Vec<&ChainRecord> = self
                    .records
                    .iter()
                    .filter(|r| kind.map_or(true, |k| r.kind.as_str() == k))
                    .filter(|r| r.level >= level_ge && r.level <= level_le)
                    .filter(|r| offset.map_or(true, |o| r.id > o))
                    .filter(|r| {
                        field_filter.as_ref().map_or(true, |(field, values)| {
                            Self::field_of(r, field)
                                .map_or(false, |v| values.iter().any(|x| x == v))
                        })
                    })
                    .collect();
                matched.sort_by_key(|r| r.id);
                matched.truncate(limit);
                Ok(serde_json::to_value(matched).unwrap_or_default())
            }
            other => panic!("unexpected request path: {other}"),
        }
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<GatewayMessage>> {
        let (tx, rx) = mpsc::channel(64);
        let script = std::mem::take(&mut *self.realtime.lock().unwrap());
        tokio::spawn(async move {
            // Give indexes time to finish their initial backfill, so the
            // scripted messages exercise the realtime path.
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            for message in script {
                if tx.send(message).await.is_err() {
                    return;
                }
            }
            // Hold the stream open until the datasource drops it.
            tx.closed().await;
        });
        Ok(rx)
    }
}
