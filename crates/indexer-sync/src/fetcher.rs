//! Historical fetcher: pulls paginated data for a level range from the
//! gateway over several logically-distinct request streams, merges them into
//! one strictly-increasing level sequence, deduplicates by record id and
//! groups into complete per-level batches.
//!
//! Each channel tracks the level through which it is complete (`head`) and
//! its provider cursor. The merge loop always services the channel with the
//! lowest head, then releases every buffered level at or below the minimum
//! head across channels: those levels can no longer receive records.

use std::collections::{BTreeMap, BTreeSet};
use std::mem;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use indexer_core::{
    ChainRecord, ChainRecordKind, Gateway, HandlerPatternConfig, IndexerError, Level, Result,
};

use crate::readahead::{readahead, LevelStream};

/// Provider-side page size for backfill requests.
const REQUEST_LIMIT: usize = 1000;

pub type LevelBuffer = BTreeMap<Level, Vec<ChainRecord>>;

/// One paginated request stream contributing records to the shared buffer.
#[async_trait]
pub trait FetcherChannel: Send {
    /// Level through which this channel is complete.
    fn head(&self) -> Level;

    fn fetched(&self) -> bool;

    /// Pull one page into the buffer and advance the cursor.
    async fn fetch(&mut self, buffer: &mut LevelBuffer) -> Result<()>;
}

/// Highest level of a sorted full page that is known complete. The last
/// level may continue on the next page, so the head stops at the boundary
/// just before it; a page spanning a single level completes nothing yet.
fn records_head(records: &[ChainRecord]) -> Level {
    for i in (0..records.len().saturating_sub(1)).rev() {
        if records[i].level != records[i + 1].level {
            return records[i].level;
        }
    }
    records
        .first()
        .map(|r| r.level.saturating_sub(1))
        .unwrap_or_default()
}

/// Merge overlapping request streams: sort by id and drop duplicates.
fn dedup_records(mut records: Vec<ChainRecord>) -> Vec<ChainRecord> {
    records.sort_by_key(|r| r.id);
    records.dedup_by_key(|r| r.id);
    records
}

/// Fetches one record kind, optionally filtered on one provider-side field
/// (`sender`, `target`, `contract`, `path`).
pub struct RecordChannel {
    gateway: Arc<dyn Gateway>,
    kind: ChainRecordKind,
    filter: Option<(&'static str, BTreeSet<String>)>,
    first_level: Level,
    last_level: Level,
    offset: u64,
    head: Level,
}

impl RecordChannel {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        kind: ChainRecordKind,
        filter: Option<(&'static str, BTreeSet<String>)>,
        first_level: Level,
        last_level: Level,
    ) -> Self {
        Self {
            gateway,
            kind,
            filter,
            first_level,
            last_level,
            offset: 0,
            head: 0,
        }
    }
}

#[async_trait]
impl FetcherChannel for RecordChannel {
    fn head(&self) -> Level {
        self.head
    }

    fn fetched(&self) -> bool {
        self.head >= self.last_level
    }

    async fn fetch(&mut self, buffer: &mut LevelBuffer) -> Result<()> {
        if let Some((_, values)) = &self.filter {
            if values.is_empty() {
                self.head = self.last_level;
                return Ok(());
            }
        }

        let mut params = vec![
            ("kind".to_string(), self.kind.as_str().to_string()),
            ("level.ge".to_string(), self.first_level.to_string()),
            ("level.le".to_string(), self.last_level.to_string()),
            ("limit".to_string(), REQUEST_LIMIT.to_string()),
        ];
        if self.offset > 0 {
            params.push(("offset.cr".to_string(), self.offset.to_string()));
        }
        if let Some((field, values)) = &self.filter {
            params.push((
                format!("{field}.in"),
                values.iter().cloned().collect::<Vec<_>>().join(","),
            ));
        }

        let value = self.gateway.request("/records", &params).await?;
        let records: Vec<ChainRecord> =
            serde_json::from_value(value).map_err(|e| IndexerError::Datasource {
                name: self.gateway.name().to_string(),
                message: format!("malformed records response: {e}"),
            })?;

        debug!(
            kind = %self.kind,
            offset = self.offset,
            count = records.len(),
            "Fetched page"
        );

        for record in &records {
            buffer.entry(record.level).or_default().push(record.clone());
        }

        if records.len() < REQUEST_LIMIT {
            self.head = self.last_level;
        } else {
            self.offset = records.last().map(|r| r.id).unwrap_or(self.offset);
            self.head = records_head(&records);
        }
        Ok(())
    }
}

/// Historical fetcher over `[first_level, last_level]` for one index's
/// handler patterns.
pub struct HistoricalFetcher {
    channels: Vec<Box<dyn FetcherChannel>>,
    first_level: Level,
    last_level: Level,
}

impl HistoricalFetcher {
    pub fn new(
        channels: Vec<Box<dyn FetcherChannel>>,
        first_level: Level,
        last_level: Level,
    ) -> Self {
        Self {
            channels,
            first_level,
            last_level,
        }
    }

    /// Derive the request streams an index needs from its handler patterns.
    /// Operations are fetched twice, as sender and as target, with the same
    /// address set; the merge loop deduplicates the overlap.
    pub fn from_patterns(
        gateway: Arc<dyn Gateway>,
        patterns: &[HandlerPatternConfig],
        first_level: Level,
        last_level: Level,
    ) -> Self {
        let mut channels: Vec<Box<dyn FetcherChannel>> = Vec::new();

        let mut operation_addresses: BTreeSet<String> = BTreeSet::new();
        let mut operations_unfiltered = false;
        let mut event_contracts: BTreeSet<String> = BTreeSet::new();
        let mut events_unfiltered = false;
        let mut big_map_paths: BTreeSet<String> = BTreeSet::new();
        let mut big_maps_unfiltered = false;
        let mut transfer_contracts: BTreeSet<String> = BTreeSet::new();
        let mut transfers_unfiltered = false;
        let mut blocks = false;

        for pattern in patterns {
            match pattern.kind {
                ChainRecordKind::Operation => {
                    let addresses = [&pattern.sender, &pattern.target, &pattern.contract]
                        .into_iter()
                        .flatten()
                        .cloned()
                        .collect::<Vec<_>>();
                    if addresses.is_empty() {
                        operations_unfiltered = true;
                    } else {
                        operation_addresses.extend(addresses);
                    }
                }
                ChainRecordKind::Event => match &pattern.contract {
                    Some(contract) => {
                        event_contracts.insert(contract.clone());
                    }
                    None => events_unfiltered = true,
                },
                ChainRecordKind::BigMapDiff => match &pattern.path {
                    Some(path) => {
                        big_map_paths.insert(path.clone());
                    }
                    None => big_maps_unfiltered = true,
                },
                ChainRecordKind::TokenTransfer => match &pattern.contract {
                    Some(contract) => {
                        transfer_contracts.insert(contract.clone());
                    }
                    None => transfers_unfiltered = true,
                },
                ChainRecordKind::Block => blocks = true,
            }
        }

        let mut push = |kind: ChainRecordKind,
                        filter: Option<(&'static str, BTreeSet<String>)>| {
            channels.push(Box::new(RecordChannel::new(
                Arc::clone(&gateway),
                kind,
                filter,
                first_level,
                last_level,
            )));
        };

        if operations_unfiltered {
            push(ChainRecordKind::Operation, None);
        } else if !operation_addresses.is_empty() {
            push(
                ChainRecordKind::Operation,
                Some(("sender", operation_addresses.clone())),
            );
            push(
                ChainRecordKind::Operation,
                Some(("target", operation_addresses)),
            );
        }
        if events_unfiltered {
            push(ChainRecordKind::Event, None);
        } else if !event_contracts.is_empty() {
            push(ChainRecordKind::Event, Some(("contract", event_contracts)));
        }
        if big_maps_unfiltered {
            push(ChainRecordKind::BigMapDiff, None);
        } else if !big_map_paths.is_empty() {
            push(ChainRecordKind::BigMapDiff, Some(("path", big_map_paths)));
        }
        if transfers_unfiltered {
            push(ChainRecordKind::TokenTransfer, None);
        } else if !transfer_contracts.is_empty() {
            push(
                ChainRecordKind::TokenTransfer,
                Some(("contract", transfer_contracts)),
            );
        }
        if blocks {
            push(ChainRecordKind::Block, None);
        }

        Self::new(channels, first_level, last_level)
    }

    /// Start the fetch loop on its own task and return the consumer half.
    ///
    /// Single-pass: every level in the range with matching data is yielded
    /// exactly once, in increasing order. Re-create the fetcher to restart.
    pub fn fetch_by_level(self, readahead_limit: usize) -> LevelStream {
        let (producer, stream) = readahead(readahead_limit);
        tokio::spawn(async move {
            let mut fetcher = self;
            if let Err(e) = fetcher.run(&producer).await {
                producer.fail(e).await;
            }
        });
        stream
    }

    async fn run(&mut self, producer: &crate::readahead::ReadaheadProducer) -> Result<()> {
        if self.channels.is_empty() || self.first_level > self.last_level {
            return Ok(());
        }

        info!(
            first_level = self.first_level,
            last_level = self.last_level,
            channels = self.channels.len(),
            "Starting historical fetch"
        );

        let mut buffer = LevelBuffer::new();

        loop {
            // Service the channel that lags furthest behind.
            let lagging = match self
                .channels
                .iter()
                .enumerate()
                .filter(|(_, c)| !c.fetched())
                .min_by_key(|(_, c)| c.head())
            {
                Some((i, _)) => i,
                None => break,
            };
            self.channels[lagging].fetch(&mut buffer).await?;

            // Levels at or below every channel's head are complete.
            let min_head = self
                .channels
                .iter()
                .map(|c| c.head())
                .min()
                .unwrap_or(self.last_level);

            let rest = match min_head.checked_add(1) {
                Some(cut) => buffer.split_off(&cut),
                None => LevelBuffer::new(),
            };
            let ready = mem::replace(&mut buffer, rest);
            for (level, records) in ready {
                let records = dedup_records(records);
                if !producer.send(level, records).await {
                    // Consumer dropped mid-sync; nothing left to do.
                    return Ok(());
                }
            }

            if self.channels.iter().all(|c| c.fetched()) {
                break;
            }
        }

        if !buffer.is_empty() {
            return Err(IndexerError::FrameworkInvariant(format!(
                "{} levels left in fetcher buffer after all channels completed",
                buffer.len()
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testutil::TestProvider;

    fn op(id: u64, level: Level, target: &str) -> ChainRecord {
        ChainRecord {
            id,
            kind: ChainRecordKind::Operation,
            level,
            contract: None,
            entrypoint: Some("transfer".to_string()),
            sender: Some("tz1sender".to_string()),
            target: Some(target.to_string()),
            token_id: None,
            path: None,
            payload: serde_json::json!({"entrypoint": "transfer", "parameter": {}}),
        }
    }

    fn pattern(target: &str) -> HandlerPatternConfig {
        HandlerPatternConfig {
            callback: "cb".to_string(),
            kind: ChainRecordKind::Operation,
            contract: None,
            entrypoint: None,
            sender: None,
            target: Some(target.to_string()),
            token_id: None,
            path: None,
        }
    }

    async fn collect(mut stream: LevelStream) -> Vec<(Level, Vec<u64>)> {
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            let (level, records) = item.unwrap();
            out.push((level, records.iter().map(|r| r.id).collect()));
        }
        out
    }

    #[tokio::test]
    async fn yields_levels_in_order_without_gaps_or_duplicates() {
        let provider = TestProvider::new(vec![
            op(1, 100, "KT1a"),
            op(2, 100, "KT1a"),
            op(3, 101, "KT1a"),
            op(7, 105, "KT1a"),
        ]);
        let fetcher = HistoricalFetcher::from_patterns(provider.gateway(), &[pattern("KT1a")], 100, 110);
        let yielded = collect(fetcher.fetch_by_level(100)).await;

        assert_eq!(
            yielded,
            vec![(100, vec![1, 2]), (101, vec![3]), (105, vec![7])]
        );
    }

    #[tokio::test]
    async fn sender_and_target_streams_are_deduplicated() {
        // Same address on both sides of one operation: the record comes back
        // from both the sender and the target channel.
        let mut record = op(5, 100, "KT1a");
        record.sender = Some("KT1a".to_string());
        let provider = TestProvider::new(vec![record]);

        let fetcher = HistoricalFetcher::from_patterns(provider.gateway(), &[pattern("KT1a")], 100, 100);
        let yielded = collect(fetcher.fetch_by_level(100)).await;

        assert_eq!(yielded, vec![(100, vec![5])]);
    }

    #[tokio::test]
    async fn readahead_depth_does_not_change_output() {
        let records: Vec<ChainRecord> = (0..500u64).map(|i| op(i, 100 + i / 3, "KT1a")).collect();
        let provider = TestProvider::new(records);
        let patterns = [pattern("KT1a")];

        let deep = collect(
            HistoricalFetcher::from_patterns(provider.gateway(), &patterns, 0, 1000)
                .fetch_by_level(10_000),
        )
        .await;
        let shallow = collect(
            HistoricalFetcher::from_patterns(provider.gateway(), &patterns, 0, 1000)
                .fetch_by_level(1),
        )
        .await;

        assert_eq!(deep, shallow);
        let total: usize = deep.iter().map(|(_, ids)| ids.len()).sum();
        assert_eq!(total, 500);
    }

    #[tokio::test]
    async fn pagination_cursor_walks_the_whole_range() {
        // More records than one page; the channel must follow its cursor.
        let records: Vec<ChainRecord> =
            (0..2500u64).map(|i| op(i, 100 + i / 100, "KT1a")).collect();
        let provider = TestProvider::new(records);

        let fetcher = HistoricalFetcher::from_patterns(provider.gateway(), &[pattern("KT1a")], 0, 1000);
        let yielded = collect(fetcher.fetch_by_level(5000)).await;

        let total: usize = yielded.iter().map(|(_, ids)| ids.len()).sum();
        assert_eq!(total, 2500);
        let levels: Vec<Level> = yielded.iter().map(|(l, _)| *l).collect();
        let mut sorted = levels.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(levels, sorted, "levels must be strictly increasing");
    }

    #[tokio::test]
    async fn empty_filter_set_yields_nothing() {
        let provider = TestProvider::new(vec![]);
        let channels: Vec<Box<dyn FetcherChannel>> = vec![Box::new(RecordChannel::new(
            provider.gateway(),
            ChainRecordKind::Operation,
            Some(("target", BTreeSet::new())),
            0,
            100,
        ))];
        let fetcher = HistoricalFetcher::new(channels, 0, 100);
        let yielded = collect(fetcher.fetch_by_level(100)).await;
        assert!(yielded.is_empty());
    }

    #[test]
    fn records_head_stops_before_last_unfinished_level() {
        let records = vec![op(1, 100, "a"), op(2, 100, "a"), op(3, 101, "a")];
        assert_eq!(records_head(&records), 100);

        // A full page on one level completes nothing: the level may spill
        // into the next page.
        let single_level = vec![op(1, 100, "a"), op(2, 100, "a")];
        assert_eq!(records_head(&single_level), 99);
    }
}
