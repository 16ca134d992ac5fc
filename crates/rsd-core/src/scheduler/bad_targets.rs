use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Size at which `mark` sweeps expired entries before inserting.
pub const PURGE_THRESHOLD: usize = 1_024;

/// Short-TTL denylist keyed by [`Target::key`](crate::Target::key).
///
/// Absence of an entry means "unknown", not "good". Entries are evicted lazily
/// on lookup once `now >= expiry`.
#[derive(Debug)]
pub struct BadTargetCache {
    ttl: Duration,
    entries: HashMap<String, Instant>,
}

impl BadTargetCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn mark(&mut self, key: String, now: Instant) {
        if self.entries.len() >= PURGE_THRESHOLD {
            self.purge(now);
        }
        self.entries.insert(key, now + self.ttl);
    }

    pub fn is_blocked(&mut self, key: &str, now: Instant) -> bool {
        match self.entries.get(key) {
            Some(expiry) if now < *expiry => true,
            Some(_) => {
                self.entries.remove(key);
                false
            }
            None => false,
        }
    }

    /// Drop every expired entry; lookups already do this one key at a time.
    pub fn purge(&mut self, now: Instant) {
        self.entries.retain(|_, expiry| now < *expiry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
