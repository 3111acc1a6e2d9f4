use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{IndexerError, Result};
use crate::types::{ChainRecordKind, Level, Subscription};

fn default_buffer_size() -> usize {
    1
}

fn default_rollback_depth() -> u64 {
    2
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_readahead_limit() -> usize {
    5000
}

/// One named provider connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasourceConfig {
    pub url: String,
    /// Levels retained by the realtime reorder buffer before release.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Deepest reorg the provider declares it can report; anything deeper
    /// forces a full reindex.
    #[serde(default = "default_rollback_depth")]
    pub rollback_depth: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Declarative filter bound to a callback identifier. All set fields must
/// match (conjunction); absent fields are wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerPatternConfig {
    pub callback: String,
    pub kind: ChainRecordKind,
    #[serde(default)]
    pub contract: Option<String>,
    #[serde(default)]
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub token_id: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

/// Resolved configuration of one index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub kind: String,
    pub datasource: String,
    pub handlers: Vec<HandlerPatternConfig>,
    pub first_level: Level,
    #[serde(default)]
    pub last_level: Option<Level>,
    #[serde(default = "default_readahead_limit")]
    pub readahead_limit: usize,
}

impl IndexConfig {
    /// Stable fingerprint of this config; a mismatch against the persisted
    /// state means the index definition drifted and a reindex is mandatory.
    pub fn config_hash(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = DefaultHasher::new();
        canonical.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }

    /// Realtime channels this index needs from its datasource. The head
    /// channel is always included: it drives the sync-level target.
    pub fn subscriptions(&self) -> BTreeSet<Subscription> {
        let mut subs = BTreeSet::new();
        subs.insert(Subscription::Head);
        for handler in &self.handlers {
            let sub = match handler.kind {
                ChainRecordKind::Block => Subscription::Head,
                ChainRecordKind::Operation => Subscription::Operations {
                    address: handler.target.clone().or_else(|| handler.contract.clone()),
                },
                ChainRecordKind::Event => Subscription::Events {
                    contract: handler.contract.clone(),
                },
                ChainRecordKind::BigMapDiff => Subscription::BigMaps {
                    path: handler.path.clone(),
                },
                ChainRecordKind::TokenTransfer => Subscription::TokenTransfers {
                    contract: handler.contract.clone(),
                },
            };
            subs.insert(sub);
        }
        subs
    }
}

/// Index template for runtime spawning (factory pattern). `<key>` markers in
/// string fields are replaced with substitution values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexTemplate {
    pub kind: String,
    pub datasource: String,
    pub handlers: Vec<HandlerPatternConfig>,
    #[serde(default)]
    pub first_level: Level,
    #[serde(default)]
    pub last_level: Option<Level>,
}

impl IndexTemplate {
    /// Produce a concrete index config by substituting `<key>` placeholders.
    pub fn instantiate(&self, values: &BTreeMap<String, String>) -> IndexConfig {
        let substitute = |field: &Option<String>| -> Option<String> {
            field.as_ref().map(|s| {
                let mut out = s.clone();
                for (key, value) in values {
                    out = out.replace(&format!("<{key}>"), value);
                }
                out
            })
        };
        let handlers = self
            .handlers
            .iter()
            .map(|h| HandlerPatternConfig {
                callback: h.callback.clone(),
                kind: h.kind,
                contract: substitute(&h.contract),
                entrypoint: substitute(&h.entrypoint),
                sender: substitute(&h.sender),
                target: substitute(&h.target),
                token_id: substitute(&h.token_id),
                path: substitute(&h.path),
            })
            .collect();
        IndexConfig {
            kind: self.kind.clone(),
            datasource: self.datasource.clone(),
            handlers,
            first_level: self.first_level,
            last_level: self.last_level,
            readahead_limit: default_readahead_limit(),
        }
    }
}

/// Complete runtime configuration: every datasource and index the process
/// will drive, plus templates available for runtime spawning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub datasources: BTreeMap<String, DatasourceConfig>,
    #[serde(default)]
    pub indexes: BTreeMap<String, IndexConfig>,
    #[serde(default)]
    pub templates: BTreeMap<String, IndexTemplate>,
}

impl RuntimeConfig {
    /// Load from the file named by `RIPTIDE_CONFIG` (default `riptide.json`).
    pub fn load() -> Result<Self> {
        let path = env::var("RIPTIDE_CONFIG").unwrap_or_else(|_| "riptide.json".to_string());
        Self::from_file(Path::new(&path))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|_| {
            IndexerError::Config(format!("config file not found: {}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| IndexerError::Config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Referential integrity checks that cannot be expressed in serde.
    pub fn validate(&self) -> Result<()> {
        for (name, index) in &self.indexes {
            if !self.datasources.contains_key(&index.datasource) {
                return Err(IndexerError::Config(format!(
                    "index `{name}` references unknown datasource `{}`",
                    index.datasource
                )));
            }
            if index.handlers.is_empty() {
                return Err(IndexerError::Config(format!(
                    "index `{name}` has no handlers"
                )));
            }
            if let Some(last) = index.last_level {
                if last < index.first_level {
                    return Err(IndexerError::Config(format!(
                        "index `{name}`: last_level {last} is below first_level {}",
                        index.first_level
                    )));
                }
            }
        }
        for (name, template) in &self.templates {
            if !self.datasources.contains_key(&template.datasource) {
                return Err(IndexerError::Config(format!(
                    "template `{name}` references unknown datasource `{}`",
                    template.datasource
                )));
            }
        }
        Ok(())
    }
}
