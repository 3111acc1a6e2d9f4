//! Bounded readahead between the network-side fetch loop and the
//! application-side consumer.
//!
//! Depth is measured in records, not levels: a producer must hold permits
//! for a batch's records before sending it, and the consumer returns them on
//! receipt. When the budget is exhausted the fetch loop parks until the
//! consumer drains.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};

use indexer_core::{ChainRecord, Level, Result};

/// Slots in the underlying channel; the record budget is the real bound.
const CHANNEL_SLOTS: usize = 64;

pub type LevelBatch = (Level, Vec<ChainRecord>);

/// Permits one batch consumes from the readahead budget. A batch larger than
/// the whole budget still fits, taking everything.
fn permit_count(records: usize, limit: usize) -> u32 {
    records.clamp(1, limit) as u32
}

pub struct ReadaheadProducer {
    tx: mpsc::Sender<Result<LevelBatch>>,
    permits: Arc<Semaphore>,
    limit: usize,
}

impl ReadaheadProducer {
    /// Send one per-level batch, waiting for budget first. Returns `false`
    /// when the consumer is gone and fetching should stop.
    pub async fn send(&self, level: Level, records: Vec<ChainRecord>) -> bool {
        let wanted = permit_count(records.len(), self.limit);
        match self.permits.acquire_many(wanted).await {
            Ok(permit) => permit.forget(),
            Err(_) => return false,
        }
        self.tx.send(Ok((level, records))).await.is_ok()
    }

    /// Deliver a terminal error to the consumer.
    pub async fn fail(&self, error: indexer_core::IndexerError) {
        let _ = self.tx.send(Err(error)).await;
    }
}

/// Consumer half: a single-pass stream of per-level batches.
pub struct LevelStream {
    rx: mpsc::Receiver<Result<LevelBatch>>,
    permits: Arc<Semaphore>,
    limit: usize,
}

impl LevelStream {
    pub async fn next(&mut self) -> Option<Result<LevelBatch>> {
        let item = self.rx.recv().await?;
        if let Ok((_, records)) = &item {
            self.permits.add_permits(permit_count(records.len(), self.limit) as usize);
        }
        Some(item)
    }
}

/// Build a connected producer/consumer pair with a budget of `limit` records.
pub fn readahead(limit: usize) -> (ReadaheadProducer, LevelStream) {
    let limit = limit.max(1);
    let (tx, rx) = mpsc::channel(CHANNEL_SLOTS);
    let permits = Arc::new(Semaphore::new(limit));
    (
        ReadaheadProducer {
            tx,
            permits: Arc::clone(&permits),
            limit,
        },
        LevelStream { rx, permits, limit },
    )
}
