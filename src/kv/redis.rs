//! Redis-backed KV store.
//!
//! Thin mapping of the [`KvStore`](super::KvStore) surface onto Redis
//! primitives via a shared `ConnectionManager` (reconnects internally; clones
//! are cheap handles onto one multiplexed connection).

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use std::time::Duration;
use tracing::info;

use super::KvStore;

pub struct RedisKv {
    manager: ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid REDIS_URL")?;
        let manager = client
            .get_connection_manager()
            .await
            .context("failed to connect to Redis")?;
        info!("Connected to Redis");
        Ok(Self { manager })
    }

    fn ttl_secs(ttl: Duration) -> i64 {
        ttl.as_secs().max(1) as i64
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn incr(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64> {
        let mut conn = self.manager.clone();
        let value: i64 = conn.incr(key, delta).await.context("INCRBY failed")?;
        // Fresh key: pin the window TTL once. Subsequent increments leave it.
        if value == delta && !ttl.is_zero() {
            let _: bool = conn
                .expire(key, Self::ttl_secs(ttl))
                .await
                .context("EXPIRE failed")?;
        }
        Ok(value)
    }

    async fn incr_float(&self, key: &str, delta: f64, ttl: Duration) -> Result<f64> {
        let mut conn = self.manager.clone();
        let value: f64 = conn.incr(key, delta).await.context("INCRBYFLOAT failed")?;
        if (value - delta).abs() < f64::EPSILON && !ttl.is_zero() {
            let _: bool = conn
                .expire(key, Self::ttl_secs(ttl))
                .await
                .context("EXPIRE failed")?;
        }
        Ok(value)
    }

    async fn get_int(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.manager.clone();
        conn.get(key).await.context("GET failed")
    }

    async fn get_float(&self, key: &str) -> Result<Option<f64>> {
        let mut conn = self.manager.clone();
        conn.get(key).await.context("GET failed")
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        conn.get(key).await.context("GET failed")
    }

    async fn set_string(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        if ttl.is_zero() {
            conn.set(key, value).await.context("SET failed")
        } else {
            conn.set_ex(key, value, Self::ttl_secs(ttl) as u64)
                .await
                .context("SETEX failed")
        }
    }

    async fn sadd(&self, key: &str, member: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.manager.clone();
        let added: i64 = conn.sadd(key, member).await.context("SADD failed")?;
        if added == 1 && !ttl.is_zero() {
            let card: i64 = conn.scard(key).await.context("SCARD failed")?;
            if card == 1 {
                let _: bool = conn
                    .expire(key, Self::ttl_secs(ttl))
                    .await
                    .context("EXPIRE failed")?;
            }
        }
        Ok(added == 1)
    }

    async fn scard(&self, key: &str) -> Result<i64> {
        let mut conn = self.manager.clone();
        conn.scard(key).await.context("SCARD failed")
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("PING failed")?;
        Ok(())
    }
}
