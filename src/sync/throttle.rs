use std::time::Duration;

use tokio::time::Instant;

/// Advisory gate between fetch attempts.
///
/// A fetch is throttled while another one is in progress, or when the last one
/// started less than `min_interval` ago. A forced fetch may overlap one that is
/// being cancelled, so in-progress fetches are counted rather than flagged.
#[derive(Debug)]
pub struct ThrottleGate {
    min_interval: Duration,
    last_started: Option<Instant>,
    in_progress: usize,
}

impl ThrottleGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_started: None,
            in_progress: 0,
        }
    }

    pub fn should_throttle(&self, now: Instant) -> bool {
        if self.in_progress > 0 {
            return true;
        }
        match self.last_started {
            Some(started) => now.saturating_duration_since(started) < self.min_interval,
            None => false,
        }
    }

    pub fn mark_started(&mut self, now: Instant) {
        self.in_progress += 1;
        self.last_started = Some(now);
    }

    pub fn mark_completed(&mut self) {
        self.in_progress = self.in_progress.saturating_sub(1);
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress > 0
    }

    /// Time left before the minimum interval since the last start has passed.
    /// Ignores fetches in progress.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        let started = self.last_started?;
        let left = self
            .min_interval
            .saturating_sub(now.saturating_duration_since(started));
        (!left.is_zero()).then_some(left)
    }
}
