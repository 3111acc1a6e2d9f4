use serde::{Deserialize, Serialize};

/// Monotonically increasing block/slot identifier. All chain data is
/// level-stamped and delivered to handlers in non-decreasing level order.
pub type Level = u64;

/// Closed set of chain-data message kinds. The reorder buffer, subscriptions,
/// fetcher and matcher all key off this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainRecordKind {
    Block,
    Operation,
    BigMapDiff,
    Event,
    TokenTransfer,
}

impl ChainRecordKind {
    pub const ALL: [ChainRecordKind; 5] = [
        ChainRecordKind::Block,
        ChainRecordKind::Operation,
        ChainRecordKind::BigMapDiff,
        ChainRecordKind::Event,
        ChainRecordKind::TokenTransfer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Operation => "operation",
            Self::BigMapDiff => "big_map_diff",
            Self::Event => "event",
            Self::TokenTransfer => "token_transfer",
        }
    }
}

impl std::fmt::Display for ChainRecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One level-stamped record as returned by a provider.
///
/// `id` is the provider's stable primary key; it is used for deduplication
/// across overlapping request streams and as the intra-level ordering key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainRecord {
    pub id: u64,
    pub kind: ChainRecordKind,
    pub level: Level,
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
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Most recent block known to a datasource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadBlock {
    pub level: Level,
    pub hash: String,
    pub timestamp: i64,
}

/// Provider-reported retraction: data in `(to_level, from_level]` is no
/// longer valid and must be discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackMessage {
    pub from_level: Level,
    pub to_level: Level,
}

impl RollbackMessage {
    /// Number of levels being retracted.
    pub fn depth(&self) -> u64 {
        self.from_level.saturating_sub(self.to_level)
    }
}

/// Filter descriptor for one realtime data channel. `None` fields mean "all".
///
/// Two indexes wanting the same subscription value share a single tracker
/// entry; the `None`-keyed wildcard entry in the tracker covers everything
/// a specific subscription does not.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subscription {
    Head,
    Operations { address: Option<String> },
    Events { contract: Option<String> },
    BigMaps { path: Option<String> },
    TokenTransfers { contract: Option<String> },
}

impl Subscription {
    /// The record kind this subscription delivers.
    pub fn kind(&self) -> ChainRecordKind {
        match self {
            Self::Head => ChainRecordKind::Block,
            Self::Operations { .. } => ChainRecordKind::Operation,
            Self::Events { .. } => ChainRecordKind::Event,
            Self::BigMaps { .. } => ChainRecordKind::BigMapDiff,
            Self::TokenTransfers { .. } => ChainRecordKind::TokenTransfer,
        }
    }

    /// Whether a record belongs to this subscription's channel.
    pub fn matches(&self, record: &ChainRecord) -> bool {
        if record.kind != self.kind() {
            return false;
        }
        match self {
            Self::Head => true,
            Self::Operations { address } => match address {
                Some(a) => {
                    record.sender.as_deref() == Some(a.as_str())
                        || record.target.as_deref() == Some(a.as_str())
                }
                None => true,
            },
            Self::Events { contract } | Self::TokenTransfers { contract } => match contract {
                Some(c) => record.contract.as_deref() == Some(c.as_str()),
                None => true,
            },
            Self::BigMaps { path } => match path {
                Some(p) => record.path.as_deref() == Some(p.as_str()),
                None => true,
            },
        }
    }
}

impl std::fmt::Display for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Head => write!(f, "head"),
            Self::Operations { address } => {
                write!(f, "operations({})", address.as_deref().unwrap_or("*"))
            }
            Self::Events { contract } => {
                write!(f, "events({})", contract.as_deref().unwrap_or("*"))
            }
            Self::BigMaps { path } => {
                write!(f, "big_maps({})", path.as_deref().unwrap_or("*"))
            }
            Self::TokenTransfers { contract } => {
                write!(f, "token_transfers({})", contract.as_deref().unwrap_or("*"))
            }
        }
    }
}
