pub mod command;
pub mod config;
pub mod error;
pub mod gateway;
pub mod state;
pub mod types;

pub use command::DispatcherCommand;
pub use config::{
    DatasourceConfig, HandlerPatternConfig, IndexConfig, IndexTemplate, RuntimeConfig,
};
pub use error::{IndexerError, ReindexingReason, Result};
pub use gateway::{Gateway, GatewayMessage};
pub use state::{IndexState, IndexStatus};
pub use types::{ChainRecord, ChainRecordKind, HeadBlock, Level, RollbackMessage, Subscription};
