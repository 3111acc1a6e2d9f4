//! Callback registry: maps the callback identifiers used in handler
//! patterns to user-supplied implementations.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use indexer_core::{IndexerError, Result};

use crate::context::HandlerContext;
use crate::payload::DecodedPayload;

/// One async entry point per handler pattern.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &mut HandlerContext<'_>, payload: &DecodedPayload) -> Result<()>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    pub fn register(&self, callback: &str, handler: Arc<dyn Handler>) {
        self.handlers.insert(callback.to_string(), handler);
    }

    /// A pattern referencing an unregistered callback is a configuration
    /// error, caught on first match rather than silently skipped.
    pub fn get(&self, callback: &str) -> Result<Arc<dyn Handler>> {
        self.handlers
            .get(callback)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| IndexerError::HandlerNotRegistered(callback.to_string()))
    }

    pub fn contains(&self, callback: &str) -> bool {
        self.handlers.contains_key(callback)
    }
}
