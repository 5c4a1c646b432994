//! Process configuration.
//!
//! Loaded once at startup from the environment; immutable for the process
//! lifetime. Anything tunable per tenant (rate limit, weights, webhook) lives
//! on the tenant record instead.

use anyhow::{bail, Result};
use std::env;

/// Minimum byte length for `SECRET_KEY`.
const MIN_SECRET_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database path (accepts a bare path or `sqlite://` prefix).
    pub database_path: String,
    /// Redis connection string; `None` selects the in-process KV.
    pub redis_url: Option<String>,
    /// HMAC key for API-key digests. Required, >= 32 bytes.
    pub secret_key: String,
    pub port: u16,
    /// Risk score at and above which the level is `high` (and `critical` at +15).
    pub risk_threshold_high: u8,
    pub risk_threshold_medium: u8,
    /// Content-hash result cache TTL in seconds.
    pub cache_ttl_secs: u64,
    pub enable_consortium: bool,
    /// Default per-minute cap applied to tenants created without one.
    pub default_rate_limit_per_minute: u32,
    /// Model artifact path; absent disables ML process-wide.
    pub ml_model_path: Option<String>,
    pub webhook_queue_capacity: usize,
    pub webhook_workers: usize,
    /// End-to-end budget for one scoring request.
    pub scoring_timeout_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let database_path = env::var("DATABASE_URL")
            .unwrap_or_else(|_| "./sentinel.db".to_string());
        let database_path = database_path
            .strip_prefix("sqlite://")
            .unwrap_or(&database_path)
            .to_string();

        let redis_url = env::var("REDIS_URL").ok().filter(|v| !v.is_empty());

        let secret_key = match env::var("SECRET_KEY") {
            Ok(v) => v,
            Err(_) => bail!("SECRET_KEY must be set"),
        };
        if secret_key.len() < MIN_SECRET_LEN {
            bail!("SECRET_KEY must be at least {} bytes", MIN_SECRET_LEN);
        }

        let port = env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let risk_threshold_high = parse_env("RISK_THRESHOLD_HIGH", 70u8);
        let risk_threshold_medium = parse_env("RISK_THRESHOLD_MEDIUM", 40u8);
        if risk_threshold_medium >= risk_threshold_high {
            bail!(
                "RISK_THRESHOLD_MEDIUM ({}) must be below RISK_THRESHOLD_HIGH ({})",
                risk_threshold_medium,
                risk_threshold_high
            );
        }

        let cache_ttl_secs = parse_env("CACHE_TTL", 300u64);

        let enable_consortium = env::var("ENABLE_CONSORTIUM")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(true);

        let default_rate_limit_per_minute = parse_env("API_RATE_LIMIT", 10_000u32);

        let ml_model_path = env::var("ML_MODEL_PATH").ok().filter(|v| !v.is_empty());

        let webhook_queue_capacity = parse_env("WEBHOOK_QUEUE_CAPACITY", 4096usize).max(1);
        let webhook_workers = parse_env("WEBHOOK_WORKERS", 4usize).max(1);
        let scoring_timeout_ms = parse_env("SCORING_TIMEOUT_MS", 2_000u64);

        Ok(Self {
            database_path,
            redis_url,
            secret_key,
            port,
            risk_threshold_high,
            risk_threshold_medium,
            cache_ttl_secs,
            enable_consortium,
            default_rate_limit_per_minute,
            ml_model_path,
            webhook_queue_capacity,
            webhook_workers,
            scoring_timeout_ms,
        })
    }

    /// Score at and above which the level is `critical`.
    pub fn risk_threshold_critical(&self) -> u8 {
        self.risk_threshold_high.saturating_add(15).min(100)
    }
}

fn parse_env<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
impl Config {
    /// Config with test-friendly defaults; no environment access.
    pub fn for_tests() -> Self {
        Self {
            database_path: ":memory:".to_string(),
            redis_url: None,
            secret_key: "0123456789abcdef0123456789abcdef".to_string(),
            port: 0,
            risk_threshold_high: 70,
            risk_threshold_medium: 40,
            cache_ttl_secs: 300,
            enable_consortium: true,
            default_rate_limit_per_minute: 10_000,
            ml_model_path: None,
            webhook_queue_capacity: 64,
            webhook_workers: 1,
            scoring_timeout_ms: 2_000,
        }
    }
}
