//! In-process KV store.
//!
//! Backs single-node deployments without Redis and every test. Expiry is
//! evaluated lazily against the injected clock on each access, so tests can
//! advance time instead of sleeping.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use super::KvStore;
use crate::clock::Clock;

#[derive(Debug, Clone)]
enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

pub struct MemoryKv {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn expiry(&self, ttl: Duration) -> Option<DateTime<Utc>> {
        if ttl.is_zero() {
            return None;
        }
        Some(self.clock.now() + ChronoDuration::milliseconds(ttl.as_millis() as i64))
    }

    /// Drop the key if its TTL has passed, so the caller sees a fresh slot.
    fn drop_if_expired(&self, map: &mut HashMap<String, Entry>, key: &str) {
        let now = self.clock.now();
        let dead = matches!(
            map.get(key).and_then(|e| e.expires_at),
            Some(exp) if exp <= now
        );
        if dead {
            map.remove(key);
        }
    }

    /// Evict everything past its TTL. Called opportunistically; correctness
    /// never depends on it because reads check expiry themselves.
    pub fn purge_expired(&self) {
        let now = self.clock.now();
        self.entries
            .lock()
            .retain(|_, e| !matches!(e.expires_at, Some(exp) if exp <= now));
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn incr(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64> {
        let mut map = self.entries.lock();
        self.drop_if_expired(&mut map, key);
        let expires_at = self.expiry(ttl);
        let entry = map.entry(key.to_string()).or_insert(Entry {
            value: Value::Int(0),
            expires_at,
        });
        match &mut entry.value {
            Value::Int(v) => {
                *v += delta;
                Ok(*v)
            }
            _ => bail!("kv type mismatch for key {}", key),
        }
    }

    async fn incr_float(&self, key: &str, delta: f64, ttl: Duration) -> Result<f64> {
        let mut map = self.entries.lock();
        self.drop_if_expired(&mut map, key);
        let expires_at = self.expiry(ttl);
        let entry = map.entry(key.to_string()).or_insert(Entry {
            value: Value::Float(0.0),
            expires_at,
        });
        match &mut entry.value {
            Value::Float(v) => {
                *v += delta;
                Ok(*v)
            }
            _ => bail!("kv type mismatch for key {}", key),
        }
    }

    async fn get_int(&self, key: &str) -> Result<Option<i64>> {
        let mut map = self.entries.lock();
        self.drop_if_expired(&mut map, key);
        match map.get(key) {
            Some(entry) => match entry.value {
                Value::Int(v) => Ok(Some(v)),
                _ => bail!("kv type mismatch for key {}", key),
            },
            None => Ok(None),
        }
    }

    async fn get_float(&self, key: &str) -> Result<Option<f64>> {
        let mut map = self.entries.lock();
        self.drop_if_expired(&mut map, key);
        match map.get(key) {
            Some(entry) => match entry.value {
                Value::Float(v) => Ok(Some(v)),
                Value::Int(v) => Ok(Some(v as f64)),
                _ => bail!("kv type mismatch for key {}", key),
            },
            None => Ok(None),
        }
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>> {
        let mut map = self.entries.lock();
        self.drop_if_expired(&mut map, key);
        match map.get(key) {
            Some(entry) => match &entry.value {
                Value::Str(v) => Ok(Some(v.clone())),
                _ => bail!("kv type mismatch for key {}", key),
            },
            None => Ok(None),
        }
    }

    async fn set_string(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let expires_at = self.expiry(ttl);
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at,
            },
        );
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str, ttl: Duration) -> Result<bool> {
        let mut map = self.entries.lock();
        self.drop_if_expired(&mut map, key);
        let expires_at = self.expiry(ttl);
        let entry = map.entry(key.to_string()).or_insert(Entry {
            value: Value::Set(HashSet::new()),
            expires_at,
        });
        match &mut entry.value {
            Value::Set(set) => Ok(set.insert(member.to_string())),
            _ => bail!("kv type mismatch for key {}", key),
        }
    }

    async fn scard(&self, key: &str) -> Result<i64> {
        let mut map = self.entries.lock();
        self.drop_if_expired(&mut map, key);
        match map.get(key) {
            Some(entry) => match &entry.value {
                Value::Set(set) => Ok(set.len() as i64),
                _ => bail!("kv type mismatch for key {}", key),
            },
            None => Ok(0),
        }
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
