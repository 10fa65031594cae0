use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Timing knobs of the sync engine. All values are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// How long a cached "today" snapshot stays valid.
    pub cache_ttl_ms: u64,
    /// Minimum spacing between two fetch starts.
    pub fetch_throttle_ms: u64,
    /// Minimum spacing between two scheduled refreshes.
    pub refresh_throttle_ms: u64,
    /// Window in which repeated refresh requests collapse into one.
    pub refresh_debounce_ms: u64,
    /// Upper bound for a remote write before it is treated as failed.
    pub mutation_timeout_ms: u64,
    /// Delay before the silent refresh that follows a successful write.
    pub confirm_refresh_delay_ms: u64,
    /// Attempts per read slice (first try included).
    pub read_attempts: u32,
    pub read_retry_backoff_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 30_000,
            fetch_throttle_ms: 500,
            refresh_throttle_ms: 800,
            refresh_debounce_ms: 50,
            mutation_timeout_ms: 8_000,
            confirm_refresh_delay_ms: 300,
            read_attempts: 2,
            read_retry_backoff_ms: 200,
        }
    }
}

impl SyncConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).context("invalid sync config")
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = Self::from_json_str(&raw)?;
        log::info!("[CONFIG] loaded {}: {:?}", path.display(), config);
        Ok(config)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn fetch_throttle(&self) -> Duration {
        Duration::from_millis(self.fetch_throttle_ms)
    }

    pub fn refresh_throttle(&self) -> Duration {
        Duration::from_millis(self.refresh_throttle_ms)
    }

    pub fn refresh_debounce(&self) -> Duration {
        Duration::from_millis(self.refresh_debounce_ms)
    }

    pub fn mutation_timeout(&self) -> Duration {
        Duration::from_millis(self.mutation_timeout_ms)
    }

    pub fn confirm_refresh_delay(&self) -> Duration {
        Duration::from_millis(self.confirm_refresh_delay_ms)
    }

    pub fn read_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.read_retry_backoff_ms)
    }
}
