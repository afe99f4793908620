//! Processed-message cache that drops redelivered Stream frames.
//!
//! Entries expire after [`DEDUP_TTL_MS`] but are only evicted lazily, when a
//! mark pushes the cache to [`DEDUP_SWEEP_THRESHOLD`] entries.

use std::sync::Arc;

use tracing::debug;

use crate::store::{MemoryStore, StateStore, unix_now_ms};

/// How long a message ID is remembered.
pub const DEDUP_TTL_MS: u64 = 5 * 60 * 1000;

/// Entry count at which a mark triggers an eviction sweep.
pub const DEDUP_SWEEP_THRESHOLD: usize = 100;

/// Message ID → first-seen timestamp (ms).
pub struct DedupCache {
    store: Arc<dyn StateStore<u64>>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    pub fn with_store(store: Arc<dyn StateStore<u64>>) -> Self {
        Self { store }
    }

    pub fn is_processed(&self, message_id: &str) -> bool {
        !message_id.is_empty() && self.store.get(message_id).is_some()
    }

    pub fn mark_processed(&self, message_id: &str) {
        self.mark_processed_at(message_id, unix_now_ms());
    }

    /// Mark `message_id` unless it is already known. Returns `true` when this
    /// call marked it, so exactly one of several concurrent deliveries wins.
    pub fn check_and_mark(&self, message_id: &str) -> bool {
        self.check_and_mark_at(message_id, unix_now_ms())
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub(crate) fn mark_processed_at(&self, message_id: &str, now: u64) {
        if message_id.is_empty() {
            return;
        }
        self.store.set(message_id, now);
        self.sweep_if_full(now);
    }

    pub(crate) fn check_and_mark_at(&self, message_id: &str, now: u64) -> bool {
        if message_id.is_empty() {
            return false;
        }
        let mut newly_marked = false;
        self.store.update(message_id, &mut |seen| match seen {
            Some(first_seen) => *first_seen,
            None => {
                newly_marked = true;
                now
            },
        });
        if newly_marked {
            self.sweep_if_full(now);
        }
        newly_marked
    }

    fn sweep_if_full(&self, now: u64) {
        if self.store.len() < DEDUP_SWEEP_THRESHOLD {
            return;
        }
        let removed = self
            .store
            .sweep(&|first_seen| now.saturating_sub(*first_seen) <= DEDUP_TTL_MS);
        debug!(removed, remaining = self.store.len(), "swept dedup cache");
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new()
    }
}
