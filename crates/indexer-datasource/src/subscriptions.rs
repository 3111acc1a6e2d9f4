//! Per-datasource record of wanted realtime channels and the level through
//! which each has been synchronized.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use indexer_core::{IndexerError, Level, Result, Subscription};

/// Tracks subscriptions and their sync levels for one datasource.
///
/// The `None` key is the wildcard entry: its level applies to any
/// subscription whose own level is unset. Resetting (on reconnect) clears all
/// levels but keeps the subscription set, forcing resynchronization without
/// losing filter intent.
#[derive(Debug)]
pub struct SubscriptionTracker {
    subscriptions: HashMap<Option<Subscription>, Option<Level>>,
}

impl SubscriptionTracker {
    pub fn new() -> Self {
        let mut subscriptions = HashMap::new();
        subscriptions.insert(None, None);
        Self { subscriptions }
    }

    pub fn add(&mut self, subscription: Subscription) {
        self.subscriptions.entry(Some(subscription)).or_insert(None);
    }

    pub fn remove(&mut self, subscription: &Subscription) {
        if self
            .subscriptions
            .remove(&Some(subscription.clone()))
            .is_none()
        {
            warn!(subscription = %subscription, "Subscription does not exist");
        }
    }

    /// Subscriptions not yet confirmed active by the provider.
    pub fn missing(&self) -> HashSet<Subscription> {
        self.subscriptions
            .iter()
            .filter_map(|(sub, level)| match (sub, level) {
                (Some(sub), None) => Some(sub.clone()),
                _ => None,
            })
            .collect()
    }

    /// Clear all sync levels, keeping the subscription set.
    pub fn reset(&mut self) {
        for level in self.subscriptions.values_mut() {
            *level = None;
        }
    }

    /// Record the level through which a subscription is synchronized.
    /// Passing `None` fans the level out to every tracked subscription.
    pub fn set_sync_level(&mut self, subscription: Option<&Subscription>, level: Level) -> Result<()> {
        let Some(subscription) = subscription else {
            for value in self.subscriptions.values_mut() {
                *value = Some(level);
            }
            return Ok(());
        };

        let key = Some(subscription.clone());
        let Some(current) = self.subscriptions.get_mut(&key) else {
            return Err(IndexerError::FrameworkInvariant(format!(
                "subscription does not exist: {subscription}"
            )));
        };

        if let Some(previous) = *current {
            if level < previous {
                warn!(
                    subscription = %subscription,
                    previous,
                    level,
                    "Sync level moved backwards; provider is non-monotonic"
                );
            } else {
                debug!(subscription = %subscription, previous, level, "Sync level updated");
            }
        }
        *current = Some(level);
        Ok(())
    }

    /// Sync level of a subscription, falling back to the wildcard entry.
    pub fn get_sync_level(&self, subscription: &Subscription) -> Result<Option<Level>> {
        let Some(level) = self.subscriptions.get(&Some(subscription.clone())).copied() else {
            return Err(IndexerError::FrameworkInvariant(format!(
                "subscription does not exist: {subscription}"
            )));
        };
        let wildcard = self.subscriptions.get(&None).copied().flatten();
        Ok(level.or(wildcard))
    }
}

impl Default for SubscriptionTracker {
    fn default() -> Self {
        Self::new()
    }
}
