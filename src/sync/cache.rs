use std::time::Duration;

use tokio::time::Instant;

use crate::model::Snapshot;

#[derive(Debug, Clone)]
struct CacheEntry {
    snapshot: Snapshot,
    expires_at: Instant,
}

/// Holds at most one snapshot: today's.
///
/// Other dates are never stored; the orchestrator clears the cache when it
/// fetches them.
///
/// A write raises the fence to the latest fetch version, so a fetch that was
/// already running when the write landed cannot repopulate the cache with
/// pre-write data.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    entry: Option<CacheEntry>,
    fence: u64,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the snapshot if it has not expired yet. Expiry is a miss, not an error.
    pub fn get(&self, now: Instant) -> Option<Snapshot> {
        match &self.entry {
            Some(entry) if now < entry.expires_at => Some(entry.snapshot.clone()),
            _ => None,
        }
    }

    pub fn set(&mut self, snapshot: Snapshot, now: Instant, ttl: Duration) {
        self.entry = Some(CacheEntry {
            snapshot,
            expires_at: now + ttl,
        });
    }

    pub fn clear(&mut self) {
        if self.entry.take().is_some() {
            log::trace!("[CACHE] cleared");
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entry.is_none()
    }

    /// Clears the entry and refuses snapshots from fetches up to `version`.
    pub fn fence(&mut self, version: u64) {
        self.clear();
        self.fence = self.fence.max(version);
    }

    /// Whether a snapshot fetched under `version` may be stored.
    pub fn admits(&self, version: u64) -> bool {
        version > self.fence
    }
}
