//! Pure handler-matching engine.
//!
//! For each record every pattern's set filter fields are evaluated as a
//! conjunction; absent fields are wildcards. Output order follows the input
//! batch's record order, then handler registration order, so composite
//! handlers see a deterministic pairing. Payloads are decoded only after a
//! positive match.

use tracing::debug;

use indexer_core::{ChainRecord, HandlerPatternConfig, Result};

use crate::payload::DecodedPayload;

/// One callback due to run for one matched record.
#[derive(Debug, Clone)]
pub struct MatchedHandler {
    pub callback: String,
    pub record: ChainRecord,
    pub payload: DecodedPayload,
}

fn field_matches(filter: &Option<String>, value: &Option<String>) -> bool {
    match filter {
        Some(expected) => value.as_deref() == Some(expected.as_str()),
        None => true,
    }
}

/// Whether a record satisfies every set filter of a pattern.
pub fn pattern_matches(pattern: &HandlerPatternConfig, record: &ChainRecord) -> bool {
    pattern.kind == record.kind
        && field_matches(&pattern.contract, &record.contract)
        && field_matches(&pattern.entrypoint, &record.entrypoint)
        && field_matches(&pattern.sender, &record.sender)
        && field_matches(&pattern.target, &record.target)
        && field_matches(&pattern.token_id, &record.token_id)
        && field_matches(&pattern.path, &record.path)
}

/// Match a per-level batch against the registered patterns.
///
/// Pure: identical input yields identical output. A decode failure is fatal
/// for the whole process, never a silent drop.
pub fn match_batch(
    patterns: &[HandlerPatternConfig],
    records: &[ChainRecord],
) -> Result<Vec<MatchedHandler>> {
    let mut matched = Vec::new();
    for record in records {
        for pattern in patterns {
            if !pattern_matches(pattern, record) {
                continue;
            }
            debug!(
                callback = %pattern.callback,
                record_id = record.id,
                level = record.level,
                "Handler matched"
            );
            matched.push(MatchedHandler {
                callback: pattern.callback.clone(),
                record: record.clone(),
                payload: DecodedPayload::decode(&pattern.callback, record)?,
            });
        }
    }
    Ok(matched)
}

#[cfg(test)]
mod tests {
    use super::*;

    use indexer_core::ChainRecordKind;
    use serde_json::json;

    fn record(id: u64, entrypoint: &str, target: &str) -> ChainRecord {
        ChainRecord {
            id,
            kind: ChainRecordKind::Operation,
            level: 100,
            contract: None,
            entrypoint: Some(entrypoint.to_string()),
            sender: Some("tz1sender".to_string()),
            target: Some(target.to_string()),
            token_id: None,
            path: None,
            payload: json!({"entrypoint": entrypoint, "parameter": {}}),
        }
    }

    fn pattern(callback: &str, entrypoint: Option<&str>, target: Option<&str>) -> HandlerPatternConfig {
        HandlerPatternConfig {
            callback: callback.to_string(),
            kind: ChainRecordKind::Operation,
            contract: None,
            entrypoint: entrypoint.map(Into::into),
            sender: None,
            target: target.map(Into::into),
            token_id: None,
            path: None,
        }
    }

    #[test]
    fn filters_are_a_conjunction() {
        let patterns = vec![pattern("cb", Some("transfer"), Some("KT1a"))];

        let hit = record(1, "transfer", "KT1a");
        let wrong_entrypoint = record(2, "mint", "KT1a");
        let wrong_target = record(3, "transfer", "KT1b");

        let matched =
            match_batch(&patterns, &[hit, wrong_entrypoint, wrong_target]).unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].record.id, 1);
    }

    #[test]
    fn absent_fields_are_wildcards() {
        let patterns = vec![pattern("cb", None, None)];
        let matched = match_batch(&patterns, &[record(1, "anything", "KT1z")]).unwrap();
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn order_is_record_then_registration() {
        let patterns = vec![
            pattern("first", Some("transfer"), None),
            pattern("second", Some("transfer"), None),
        ];
        let records = vec![record(10, "transfer", "KT1a"), record(11, "transfer", "KT1a")];

        let matched = match_batch(&patterns, &records).unwrap();
        let order: Vec<(u64, &str)> = matched
            .iter()
            .map(|m| (m.record.id, m.callback.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![(10, "first"), (10, "second"), (11, "first"), (11, "second")]
        );
    }

    #[test]
    fn output_is_deterministic() {
        let patterns = vec![pattern("cb", None, None)];
        let records = vec![record(1, "transfer", "KT1a"), record(2, "mint", "KT1b")];

        let first = match_batch(&patterns, &records).unwrap();
        let second = match_batch(&patterns, &records).unwrap();
        let ids = |m: &[MatchedHandler]| m.iter().map(|x| x.record.id).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
    }

    #[test]
    fn decode_failure_is_fatal_not_dropped() {
        let patterns = vec![pattern("cb", None, None)];
        let mut broken = record(1, "transfer", "KT1a");
        broken.payload = json!({"no_entrypoint_field": true});

        assert!(match_batch(&patterns, &[broken]).is_err());
    }

    #[test]
    fn unmatched_records_are_never_decoded() {
        // The payload is malformed, but the pattern does not match, so the
        // decoder must not run.
        let patterns = vec![pattern("cb", Some("transfer"), None)];
        let mut skipped = record(1, "mint", "KT1a");
        skipped.payload = json!("garbage");

        let matched = match_batch(&patterns, &[skipped]).unwrap();
        assert!(matched.is_empty());
    }
}
