//! Velocity Tracker
//! Mission: per-identifier event counts and amount sums over fixed recent
//! windows, cheap enough to read on every scoring request

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::hashing::HashedId;
use crate::kv::KvStore;

/// Count windows in seconds: 1m, 10m, 1h, 24h.
const COUNT_WINDOWS: [u64; 4] = [60, 600, 3_600, 86_400];
/// Amount sums are only kept for the 1h and 24h windows.
const AMOUNT_WINDOWS: [u64; 2] = [3_600, 86_400];

/// Point-in-time counter readout for one identifier key.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VelocitySnapshot {
    pub count_1m: u64,
    pub count_10m: u64,
    pub count_1h: u64,
    pub count_24h: u64,
    pub amount_1h: f64,
    pub amount_24h: f64,
}

/// Namespaced key for one identifier, e.g. `device:<hash>` or `ip:<addr>`.
pub fn identifier_key(kind: &str, hash: &HashedId) -> Option<String> {
    if hash.is_empty() {
        return None;
    }
    Some(format!("{}:{}", kind, hash.as_str()))
}

pub fn ip_key(ip: &str) -> Option<String> {
    let trimmed = ip.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(format!("ip:{}", trimmed))
}

#[derive(Clone)]
pub struct VelocityTracker {
    kv: Arc<dyn KvStore>,
}

impl VelocityTracker {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn count_key(key: &str, window_secs: u64) -> String {
        format!("velocity:{}:count:{}", key, window_secs)
    }

    fn amount_key(key: &str, window_secs: u64) -> String {
        format!("velocity:{}:amount:{}", key, window_secs)
    }

    /// Increment every window counter for `key`, and the amount sums when an
    /// amount is supplied. Each increment is atomic per key+window; transient
    /// store errors are logged and swallowed; a missed bump is acceptable, a
    /// failed request is not.
    pub async fn bump(&self, key: &str, amount: Option<f64>) {
        for window in COUNT_WINDOWS {
            let ttl = Duration::from_secs(window);
            if let Err(e) = self.kv.incr(&Self::count_key(key, window), 1, ttl).await {
                warn!(key, window, error = %e, "velocity count bump failed");
            }
        }
        if let Some(amount) = amount {
            for window in AMOUNT_WINDOWS {
                let ttl = Duration::from_secs(window);
                if let Err(e) = self
                    .kv
                    .incr_float(&Self::amount_key(key, window), amount, ttl)
                    .await
                {
                    warn!(key, window, error = %e, "velocity amount bump failed");
                }
            }
        }
    }

    /// Read the window counters. A failed read degrades that window to zero;
    /// counts are never negative.
    pub async fn read(&self, key: &str) -> VelocitySnapshot {
        let mut counts = [0u64; 4];
        for (slot, window) in COUNT_WINDOWS.iter().enumerate() {
            match self.kv.get_int(&Self::count_key(key, *window)).await {
                Ok(value) => counts[slot] = value.unwrap_or(0).max(0) as u64,
                Err(e) => {
                    warn!(key, window, error = %e, "velocity count read failed");
                }
            }
        }

        let mut amounts = [0f64; 2];
        for (slot, window) in AMOUNT_WINDOWS.iter().enumerate() {
            match self.kv.get_float(&Self::amount_key(key, *window)).await {
                Ok(value) => amounts[slot] = value.unwrap_or(0.0).max(0.0),
                Err(e) => {
                    warn!(key, window, error = %e, "velocity amount read failed");
                }
            }
        }

        VelocitySnapshot {
            count_1m: counts[0],
            count_10m: counts[1],
            count_1h: counts[2],
            count_24h: counts[3],
            amount_1h: amounts[0],
            amount_24h: amounts[1],
        }
    }
}
