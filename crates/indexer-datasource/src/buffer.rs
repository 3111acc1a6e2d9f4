//! Realtime message reorder buffer.
//!
//! Push feeds deliver the kinds belonging to one level as separate messages,
//! not necessarily in order. The buffer holds them keyed by level and only
//! releases a level once it has fallen behind the newest `size` levels, so
//! every index sees one consistent snapshot per level. Shallow rollbacks are
//! absorbed here before any index observes the retracted data.

use std::collections::BTreeMap;
use std::mem;

use tracing::info;

use indexer_core::{ChainRecord, ChainRecordKind, IndexerError, Level, Result};

/// Extra pending levels tolerated beyond the nominal capacity before the
/// datasource is declared broken.
const OVERFLOW_SLACK: usize = 16;

/// One buffered realtime message: all records of one kind at one level.
#[derive(Debug, Clone)]
pub struct BufferedMessage {
    pub kind: ChainRecordKind,
    pub records: Vec<ChainRecord>,
}

/// Holds realtime messages keyed by level until the level is old enough to
/// release, then yields them in level order with all kinds together.
#[derive(Debug)]
pub struct MessageBuffer {
    size: usize,
    messages: BTreeMap<Level, Vec<BufferedMessage>>,
}

impl MessageBuffer {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            messages: BTreeMap::new(),
        }
    }

    /// Number of levels currently buffered.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Buffer one message. Providers deliver the kinds of a level in close
    /// succession; a buffer growing far past its capacity means a kind never
    /// arrived for an old level, which is a protocol violation.
    pub fn add(&mut self, kind: ChainRecordKind, level: Level, records: Vec<ChainRecord>) -> Result<()> {
        self.messages
            .entry(level)
            .or_default()
            .push(BufferedMessage { kind, records });

        if self.messages.len() > 2 * self.size + OVERFLOW_SLACK {
            return Err(IndexerError::FrameworkInvariant(format!(
                "message buffer overflow: {} levels pending with capacity {}",
                self.messages.len(),
                self.size,
            )));
        }
        Ok(())
    }

    /// Drop buffered entries of `kind` in `(to_level, from_level]`, walking
    /// newest-first. Returns whether the rollback was fully absorbed by the
    /// buffer: `false` as soon as a level in the span is no longer buffered
    /// (already released to indexes) or nothing was discarded, in which case
    /// the caller must propagate the rollback downstream.
    pub fn rollback(&mut self, kind: ChainRecordKind, from_level: Level, to_level: Level) -> bool {
        info!(kind = %kind, from_level, to_level, "Rollback requested");

        let mut discarded = 0usize;
        for level in ((to_level + 1)..=from_level).rev() {
            let Some(entries) = self.messages.get_mut(&level) else {
                return false;
            };
            let before = entries.len();
            entries.retain(|message| message.kind != kind);
            discarded += before - entries.len();
            if entries.is_empty() {
                self.messages.remove(&level);
            }
        }
        discarded > 0
    }

    /// Release every level older than the newest `size` levels, ascending,
    /// with all kinds for a level grouped together. Finite and restartable:
    /// each call drains only the currently-complete levels.
    pub fn yield_ready(&mut self) -> impl Iterator<Item = (Level, Vec<BufferedMessage>)> {
        let mut ready = BTreeMap::new();
        if self.messages.len() > self.size {
            let lag = self.messages.len() - self.size;
            // Key of the first level that stays buffered; `None` when the
            // whole buffer is due for release.
            match self.messages.keys().nth(lag).copied() {
                Some(cut) => {
                    let keep = self.messages.split_off(&cut);
                    ready = mem::replace(&mut self.messages, keep);
                }
                None => ready = mem::take(&mut self.messages),
            }
        }
        ready.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64, kind: ChainRecordKind, level: Level) -> ChainRecord {
        ChainRecord {
            id,
            kind,
            level,
            contract: None,
            entrypoint: None,
            sender: None,
            target: None,
            token_id: None,
            path: None,
            payload: serde_json::Value::Null,
        }
    }

    #[test]
    fn yields_levels_older_than_capacity_in_order() {
        let mut buffer = MessageBuffer::new(2);
        for level in [102, 100, 101] {
            buffer
                .add(
                    ChainRecordKind::Operation,
                    level,
                    vec![record(level, ChainRecordKind::Operation, level)],
                )
                .unwrap();
        }

        let ready: Vec<Level> = buffer.yield_ready().map(|(level, _)| level).collect();
        assert_eq!(ready, vec![100]);
        assert_eq!(buffer.len(), 2);

        // Nothing new arrived; a second call drains nothing.
        assert_eq!(buffer.yield_ready().count(), 0);
    }

    #[test]
    fn level_released_with_all_kinds_together() {
        let mut buffer = MessageBuffer::new(0);
        buffer
            .add(ChainRecordKind::Operation, 100, vec![])
            .unwrap();
        buffer
            .add(ChainRecordKind::TokenTransfer, 100, vec![])
            .unwrap();

        let ready: Vec<_> = buffer.yield_ready().collect();
        assert_eq!(ready.len(), 1);
        let (level, messages) = &ready[0];
        assert_eq!(*level, 100);
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn rollback_absorbed_while_buffered() {
        let mut buffer = MessageBuffer::new(5);
        for level in 100..=102 {
            buffer
                .add(
                    ChainRecordKind::Operation,
                    level,
                    vec![record(level, ChainRecordKind::Operation, level)],
                )
                .unwrap();
        }

        assert!(buffer.rollback(ChainRecordKind::Operation, 102, 100));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn rollback_is_idempotent() {
        let mut buffer = MessageBuffer::new(5);
        for level in 101..=102 {
            buffer
                .add(
                    ChainRecordKind::Operation,
                    level,
                    vec![record(level, ChainRecordKind::Operation, level)],
                )
                .unwrap();
        }

        assert!(buffer.rollback(ChainRecordKind::Operation, 102, 100));
        // Entries already discarded: the second call is a no-op.
        assert!(!buffer.rollback(ChainRecordKind::Operation, 102, 100));
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn rollback_past_released_levels_is_not_absorbed() {
        let mut buffer = MessageBuffer::new(0);
        buffer
            .add(
                ChainRecordKind::Operation,
                102,
                vec![record(1, ChainRecordKind::Operation, 102)],
            )
            .unwrap();
        // Level 101 was never buffered (already released downstream).
        assert!(!buffer.rollback(ChainRecordKind::Operation, 102, 100));
    }

    #[test]
    fn rollback_keeps_other_kinds() {
        let mut buffer = MessageBuffer::new(5);
        buffer
            .add(
                ChainRecordKind::Operation,
                101,
                vec![record(1, ChainRecordKind::Operation, 101)],
            )
            .unwrap();
        buffer
            .add(
                ChainRecordKind::Event,
                101,
                vec![record(2, ChainRecordKind::Event, 101)],
            )
            .unwrap();

        assert!(buffer.rollback(ChainRecordKind::Operation, 101, 100));
        assert_eq!(buffer.len(), 1);
        let remaining = &buffer.messages[&101];
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].kind, ChainRecordKind::Event);
    }

    #[test]
    fn overflow_is_a_protocol_violation() {
        let mut buffer = MessageBuffer::new(1);
        let mut result = Ok(());
        for level in 0..100 {
            result = buffer.add(ChainRecordKind::Operation, level, vec![]);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(IndexerError::FrameworkInvariant(_))));
    }
}
