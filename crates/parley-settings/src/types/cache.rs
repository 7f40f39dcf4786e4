use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Recency cache and backfill settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSettings {
    /// Redis connection URL. When unset the in-process backend is used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    pub private_ttl_secs: u64,
    pub group_ttl_secs: u64,
    /// Entries kept per conversation list.
    pub max_entries: usize,
    /// Bound on each individual backend call.
    pub op_timeout_ms: u64,
    /// Bound on one backfill job, all entries included.
    pub backfill_timeout_ms: u64,
    /// Pending backfill jobs before new ones are dropped.
    pub backfill_queue: usize,
    /// Period of the janitor purge. Disabled when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purge_interval_secs: Option<u64>,
}

impl CacheSettings {
    pub fn private_ttl(&self) -> Duration {
        Duration::from_secs(self.private_ttl_secs)
    }

    pub fn group_ttl(&self) -> Duration {
        Duration::from_secs(self.group_ttl_secs)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn backfill_timeout(&self) -> Duration {
        Duration::from_millis(self.backfill_timeout_ms)
    }

    pub fn purge_interval(&self) -> Option<Duration> {
        self.purge_interval_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            redis_url: None,
            private_ttl_secs: 24 * 60 * 60,
            group_ttl_secs: 48 * 60 * 60,
            max_entries: 100,
            op_timeout_ms: 3_000,
            backfill_timeout_ms: 5_000,
            backfill_queue: 256,
            purge_interval_secs: None,
        }
    }
}
