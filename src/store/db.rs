//! SQLite handle and schema.
//!
//! One connection in WAL mode shared behind an async mutex; the per-store
//! types clone the handle. The uniqueness constraint on
//! `(tenant_id, transaction_id)` is the idempotency backstop for concurrent
//! first submissions.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open sentinel db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tenants (
                tenant_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                plan TEXT NOT NULL DEFAULT 'standard',
                api_key_hash TEXT UNIQUE NOT NULL,
                vertical TEXT NOT NULL,
                rate_limit_per_minute INTEGER NOT NULL,
                enabled_rule_ids TEXT NOT NULL DEFAULT '[]',
                disabled_rule_ids TEXT NOT NULL DEFAULT '[]',
                ml_enabled INTEGER NOT NULL DEFAULT 0,
                rule_score_weight REAL NOT NULL DEFAULT 0.5,
                ml_weight REAL NOT NULL DEFAULT 0.3,
                consortium_weight REAL NOT NULL DEFAULT 0.2,
                webhook_url TEXT,
                webhook_secret TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS transactions (
                tenant_id TEXT NOT NULL,
                transaction_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                amount REAL NOT NULL,
                currency TEXT NOT NULL,
                transaction_type TEXT NOT NULL,
                vertical TEXT NOT NULL,
                bvn_hash TEXT NOT NULL DEFAULT '',
                phone_hash TEXT NOT NULL DEFAULT '',
                email_hash TEXT NOT NULL DEFAULT '',
                device_hash TEXT NOT NULL DEFAULT '',
                ip_address TEXT NOT NULL DEFAULT '',
                user_agent TEXT NOT NULL DEFAULT '',
                device_fingerprint TEXT,
                location TEXT,
                risk_score INTEGER NOT NULL,
                risk_level TEXT NOT NULL,
                recommendation TEXT NOT NULL,
                flags TEXT NOT NULL DEFAULT '[]',
                consortium_match INTEGER NOT NULL DEFAULT 0,
                processing_time_ms INTEGER NOT NULL DEFAULT 0,
                cached INTEGER NOT NULL DEFAULT 0,
                actual_fraud INTEGER,
                feedback_applied INTEGER NOT NULL DEFAULT 0,
                feedback_timestamp TEXT,
                created_at TEXT NOT NULL,
                PRIMARY KEY (tenant_id, transaction_id)
            );
            CREATE INDEX IF NOT EXISTS idx_transactions_tenant_created
                ON transactions(tenant_id, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_transactions_device
                ON transactions(tenant_id, device_hash, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_transactions_tenant_level
                ON transactions(tenant_id, risk_level, created_at DESC);

            CREATE TABLE IF NOT EXISTS rule_accuracy (
                rule_id INTEGER PRIMARY KEY,
                rule_name TEXT NOT NULL,
                true_positives INTEGER NOT NULL DEFAULT 0,
                false_positives INTEGER NOT NULL DEFAULT 0,
                true_negatives INTEGER NOT NULL DEFAULT 0,
                false_negatives INTEGER NOT NULL DEFAULT 0,
                precision REAL NOT NULL DEFAULT 0,
                recall REAL NOT NULL DEFAULT 0,
                accuracy REAL NOT NULL DEFAULT 0,
                weight REAL NOT NULL DEFAULT 1.0,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS consortium_entries (
                identifier_type TEXT NOT NULL,
                identifier_hash TEXT NOT NULL,
                fraud_count INTEGER NOT NULL DEFAULT 0,
                total_count INTEGER NOT NULL DEFAULT 0,
                client_count INTEGER NOT NULL DEFAULT 1,
                fraud_rate REAL NOT NULL DEFAULT 0,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                PRIMARY KEY (identifier_type, identifier_hash)
            );

            CREATE TABLE IF NOT EXISTS consortium_tenants (
                identifier_type TEXT NOT NULL,
                identifier_hash TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                PRIMARY KEY (identifier_type, identifier_hash, tenant_id)
            );",
        )
        .context("create schema")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    /// Liveness probe for /health.
    pub async fn ping(&self) -> Result<()> {
        let conn = self.lock().await;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .context("db ping")?;
        Ok(())
    }
}
