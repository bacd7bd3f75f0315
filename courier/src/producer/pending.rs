use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{BrokerError, BrokerResult};

#[derive(Debug)]
pub struct PendingEntry<C> {
    pub correlation_id: String,
    pub enqueued_at: Instant,
    pub context: C,
}

/// Publishes awaiting a transport outcome, keyed by correlation ID.
///
/// Owned by a single task; not synchronized.
#[derive(Debug)]
pub struct PendingTable<C> {
    entries: HashMap<String, PendingEntry<C>>,
}

impl<C> Default for PendingTable<C> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<C> PendingTable<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a publish. An ID that is already pending is rejected and the
    /// existing entry is left as it was.
    pub fn insert(&mut self, correlation_id: &str, now: Instant, context: C) -> BrokerResult<()> {
        if self.entries.contains_key(correlation_id) {
            return Err(BrokerError::DuplicateCorrelation(correlation_id.to_string()));
        }
        self.entries.insert(
            correlation_id.to_string(),
            PendingEntry {
                correlation_id: correlation_id.to_string(),
                enqueued_at: now,
                context,
            },
        );
        Ok(())
    }

    /// Removes and returns the entry for `correlation_id`. `None` for unknown
    /// or already resolved IDs.
    pub fn resolve(&mut self, correlation_id: &str) -> Option<PendingEntry<C>> {
        self.entries.remove(correlation_id)
    }

    /// Removes every entry older than `ttl`
    pub fn evict_expired(&mut self, now: Instant, ttl: Duration) -> Vec<PendingEntry<C>> {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|entry| now.saturating_duration_since(entry.enqueued_at) >= ttl)
            .map(|entry| entry.correlation_id.clone())
            .collect();

        expired
            .iter()
            .filter_map(|id| self.entries.remove(id))
            .collect()
    }

    pub fn contains(&self, correlation_id: &str) -> bool {
        self.entries.contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
