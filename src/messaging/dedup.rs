//! # Deduplication Cache
//!
//! Time-bounded set of recently seen natural identifiers. Registration is an
//! atomic register-if-absent on the map entry, so two concurrent submissions
//! of the same id cannot both be admitted.
//!
//! Expiry is checked lazily on lookup; [`DeduplicationCache::sweep_expired`]
//! reclaims memory for ids that are never seen again. The cache cannot fail:
//! an id it knows nothing about is always admitted.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
pub struct DeduplicationCache {
    entries: DashMap<String, Instant>,
    ttl: Duration,
}

impl DeduplicationCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Whether an item with this identifier should be processed
    ///
    /// Absent or empty ids are always processed. A known, unexpired id is a
    /// duplicate. Anything else is registered with a fresh expiry.
    pub fn should_process(&self, id: Option<&str>) -> bool {
        let Some(id) = id.filter(|id| !id.is_empty()) else {
            return true;
        };

        let now = Instant::now();
        match self.entries.entry(id.to_string()) {
            Entry::Occupied(mut entry) => {
                if *entry.get() > now {
                    debug!(message_id = %id, "Duplicate identifier within deduplication window");
                    false
                } else {
                    entry.insert(now + self.ttl);
                    true
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now + self.ttl);
                true
            }
        }
    }

    /// Forget an identifier so a later submission is admitted again
    pub fn forget(&self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Drop expired identifiers, returning how many were removed
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, expires_at| *expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    /// Number of tracked identifiers, expired ones not yet swept included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
