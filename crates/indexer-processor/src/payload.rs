//! Typed payloads handed to callbacks after a positive match.
//!
//! Decoding is strict on required fields: a record whose payload no longer
//! carries what the handler was built against must fail loudly, never be
//! silently dropped.

use serde::{Deserialize, Serialize};

use indexer_core::{ChainRecord, ChainRecordKind, IndexerError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockPayload {
    pub hash: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationPayload {
    pub entrypoint: String,
    pub parameter: serde_json::Value,
    #[serde(default)]
    pub storage: serde_json::Value,
    #[serde(default)]
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BigMapDiffPayload {
    pub path: String,
    pub action: String,
    pub key: serde_json::Value,
    /// Absent for removals.
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub tag: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenTransferPayload {
    pub token_id: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    pub amount: String,
}

/// Payload of a matched record, decoded per its kind.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedPayload {
    Block(BlockPayload),
    Operation(OperationPayload),
    BigMapDiff(BigMapDiffPayload),
    Event(EventPayload),
    TokenTransfer(TokenTransferPayload),
}

impl DecodedPayload {
    /// Decode a record's raw payload. Called only after a pattern matched;
    /// failure is fatal for the whole process.
    pub fn decode(callback: &str, record: &ChainRecord) -> Result<Self> {
        let raw = record.payload.clone();
        let decoded = match record.kind {
            ChainRecordKind::Block => serde_json::from_value(raw).map(Self::Block),
            ChainRecordKind::Operation => serde_json::from_value(raw).map(Self::Operation),
            ChainRecordKind::BigMapDiff => serde_json::from_value(raw).map(Self::BigMapDiff),
            ChainRecordKind::Event => serde_json::from_value(raw).map(Self::Event),
            ChainRecordKind::TokenTransfer => serde_json::from_value(raw).map(Self::TokenTransfer),
        };
        decoded.map_err(|e| IndexerError::Decode {
            callback: callback.to_string(),
            record_id: record.id,
            message: e.to_string(),
        })
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(kind: ChainRecordKind, payload: serde_json::Value) -> ChainRecord {
        ChainRecord {
            id: 7,
            kind,
            level: 100,
            contract: None,
            entrypoint: None,
            sender: None,
            target: None,
            token_id: None,
            path: None,
            payload,
        }
    }

    #[test]
    fn decodes_operation_payload() {
        let record = record(
            ChainRecordKind::Operation,
            json!({"entrypoint": "transfer", "parameter": {"to": "tz1a"}, "amount": 3}),
        );
        match DecodedPayload::decode("on_transfer", &record).unwrap() {
            DecodedPayload::Operation(op) => {
                assert_eq!(op.entrypoint, "transfer");
                assert_eq!(op.amount, 3);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn missing_required_field_is_a_decode_error() {
        let record = record(ChainRecordKind::TokenTransfer, json!({"token_id": "5"}));
        let err = DecodedPayload::decode("on_transfer", &record).unwrap_err();
        match err {
            IndexerError::Decode {
                callback,
                record_id,
                ..
            } => {
                assert_eq!(callback, "on_transfer");
                assert_eq!(record_id, 7);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
