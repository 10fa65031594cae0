use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic fetch version, starting at 1. Never reset during a session.
#[derive(Debug)]
pub struct VersionCounter {
    next: AtomicU64,
}

impl Default for VersionCounter {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }
}

impl VersionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// The most recently issued version, 0 if none yet.
    pub fn current(&self) -> u64 {
        self.next.load(Ordering::Relaxed) - 1
    }
}
