use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Services to watch as soon as the pool starts.
    pub watch: Vec<String>,
    pub resync_base_backoff_ms: u64,
    pub resync_max_backoff_ms: u64,
    /// Fixed balancer seed; random when unset.
    pub rng_seed: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            watch: Vec::new(),
            resync_base_backoff_ms: 500,
            resync_max_backoff_ms: 10_000,
            rng_seed: None,
        }
    }
}

impl PoolConfig {
    /// Linear backoff for the `attempt`-th consecutive resubscription
    /// failure, capped at the configured maximum.
    #[must_use]
    pub fn resync_backoff(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.resync_base_backoff_ms);
        let max = Duration::from_millis(self.resync_max_backoff_ms);
        base.saturating_mul(attempt.max(1)).min(max)
    }
}
