//! KV/Cache Store
//! Mission: one typed surface over Redis (or an in-process map) for counters,
//! cached blobs and set membership, always with a TTL

mod memory;
mod redis;

pub use memory::MemoryKv;
pub use redis::RedisKv;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Object-safe handle shared by the velocity tracker, the rate limiter and
/// the result cache. Implementations must make `incr`/`incr_float`/`sadd`
/// atomic per key; readers never observe a torn value.
///
/// TTL semantics are lazy: the TTL is set when the key is created and left
/// alone on subsequent increments, so a window key dies `ttl` after its first
/// event.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Atomically add `delta` and return the new value. Creates the key (with
    /// `ttl`) if absent.
    async fn incr(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64>;

    /// Float variant used for amount sums.
    async fn incr_float(&self, key: &str, delta: f64, ttl: Duration) -> Result<f64>;

    async fn get_int(&self, key: &str) -> Result<Option<i64>>;

    async fn get_float(&self, key: &str) -> Result<Option<f64>>;

    async fn get_string(&self, key: &str) -> Result<Option<String>>;

    async fn set_string(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Add `member` to the set at `key`; returns true when the member is new.
    async fn sadd(&self, key: &str, member: &str, ttl: Duration) -> Result<bool>;

    /// Cardinality of the set at `key` (0 when absent or expired).
    async fn scard(&self, key: &str) -> Result<i64>;

    /// Liveness probe for /health.
    async fn ping(&self) -> Result<()>;
}
