pub mod context;
pub mod matcher;
pub mod payload;
pub mod registry;

pub use context::HandlerContext;
pub use matcher::{match_batch, pattern_matches, MatchedHandler};
pub use payload::{
    BigMapDiffPayload, BlockPayload, DecodedPayload, EventPayload, OperationPayload,
    TokenTransferPayload,
};
pub use registry::{Handler, HandlerRegistry};
