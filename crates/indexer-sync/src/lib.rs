pub mod dispatcher;
pub mod fetcher;
pub mod index;
pub mod readahead;

#[cfg(test)]
pub(crate) mod testutil;

pub use dispatcher::IndexDispatcher;
pub use fetcher::{FetcherChannel, HistoricalFetcher, RecordChannel};
pub use index::{Index, IndexMessage};
pub use readahead::{readahead, LevelStream, ReadaheadProducer};
