//! Consortium aggregate storage.
//!
//! Entries are shared across tenants and append/increment-only. Every
//! observation lands inside one SQLite transaction so concurrent feedback on
//! the same identifier never loses an increment.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::Database;
use crate::hashing::HashedId;
use crate::models::ConsortiumEntry;

/// Aggregate view over the whole shared store.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ConsortiumInsights {
    pub tracked_identifiers: u64,
    pub total_reports: u64,
    pub fraud_reports: u64,
    pub identifiers_with_fraud: u64,
    pub contributing_clients: u64,
}

#[derive(Clone)]
pub struct ConsortiumStore {
    db: Database,
}

impl ConsortiumStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get(
        &self,
        identifier_type: &str,
        identifier_hash: &HashedId,
    ) -> Result<Option<ConsortiumEntry>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT identifier_type, identifier_hash, fraud_count, total_count,
                    client_count, fraud_rate, first_seen, last_seen
             FROM consortium_entries
             WHERE identifier_type = ?1 AND identifier_hash = ?2",
        )?;
        stmt.query_row(
            params![identifier_type, identifier_hash.as_str()],
            row_to_entry,
        )
        .optional()
        .context("query consortium entry")
    }

    /// All entries matching any of the given (type, hash) pairs.
    pub async fn lookup(
        &self,
        identifiers: &[(&str, &HashedId)],
    ) -> Result<Vec<ConsortiumEntry>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT identifier_type, identifier_hash, fraud_count, total_count,
                    client_count, fraud_rate, first_seen, last_seen
             FROM consortium_entries
             WHERE identifier_type = ?1 AND identifier_hash = ?2",
        )?;

        let mut entries = Vec::new();
        for (kind, hash) in identifiers {
            if hash.is_empty() {
                continue;
            }
            if let Some(entry) = stmt
                .query_row(params![kind, hash.as_str()], row_to_entry)
                .optional()?
            {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Transactional upsert for one observation. `total_count` always bumps;
    /// `fraud_count` only when the label is fraud; `client_count` tracks the
    /// distinct tenants that have reported this identifier.
    pub async fn record_observation(
        &self,
        identifier_type: &str,
        identifier_hash: &HashedId,
        tenant_id: &str,
        is_fraud: bool,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if identifier_hash.is_empty() {
            return Ok(());
        }

        let mut conn = self.db.lock().await;
        let tx = conn.transaction().context("begin consortium tx")?;

        tx.execute(
            "INSERT OR IGNORE INTO consortium_tenants (identifier_type, identifier_hash, tenant_id)
             VALUES (?1, ?2, ?3)",
            params![identifier_type, identifier_hash.as_str(), tenant_id],
        )?;

        let client_count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM consortium_tenants
             WHERE identifier_type = ?1 AND identifier_hash = ?2",
            params![identifier_type, identifier_hash.as_str()],
            |r| r.get(0),
        )?;

        let fraud_delta: i64 = if is_fraud { 1 } else { 0 };
        let now = at.to_rfc3339();
        tx.execute(
            "INSERT INTO consortium_entries (identifier_type, identifier_hash, fraud_count,
                                             total_count, client_count, fraud_rate,
                                             first_seen, last_seen)
             VALUES (?1, ?2, ?3, 1, ?4, ?3 * 1.0, ?5, ?5)
             ON CONFLICT(identifier_type, identifier_hash) DO UPDATE SET
                fraud_count = fraud_count + ?3,
                total_count = total_count + 1,
                client_count = MAX(client_count, ?4),
                last_seen = ?5",
            params![
                identifier_type,
                identifier_hash.as_str(),
                fraud_delta,
                client_count,
                now
            ],
        )?;
        tx.execute(
            "UPDATE consortium_entries
             SET fraud_rate = CAST(fraud_count AS REAL) / total_count
             WHERE identifier_type = ?1 AND identifier_hash = ?2",
            params![identifier_type, identifier_hash.as_str()],
        )?;

        tx.commit().context("commit consortium tx")
    }

    pub async fn insights(&self) -> Result<ConsortiumInsights> {
        let conn = self.db.lock().await;
        let (tracked, total, fraud, with_fraud): (i64, i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(total_count), 0),
                    COALESCE(SUM(fraud_count), 0),
                    COALESCE(SUM(CASE WHEN fraud_count > 0 THEN 1 ELSE 0 END), 0)
             FROM consortium_entries",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )?;
        let clients: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT tenant_id) FROM consortium_tenants",
            [],
            |r| r.get(0),
        )?;

        Ok(ConsortiumInsights {
            tracked_identifiers: tracked as u64,
            total_reports: total as u64,
            fraud_reports: fraud as u64,
            identifiers_with_fraud: with_fraud as u64,
            contributing_clients: clients as u64,
        })
    }
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<ConsortiumEntry> {
    let first_seen: String = row.get(6)?;
    let last_seen: String = row.get(7)?;
    let parse = |s: &str| {
        DateTime::parse_from_rfc3339(s)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    };
    Ok(ConsortiumEntry {
        identifier_type: row.get(0)?,
        identifier_hash: row.get(1)?,
        fraud_count: row.get::<_, i64>(2)? as u64,
        total_count: row.get::<_, i64>(3)? as u64,
        client_count: row.get::<_, i64>(4)? as u64,
        fraud_rate: row.get(5)?,
        first_seen: parse(&first_seen),
        last_seen: parse(&last_seen),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(seed: &str) -> HashedId {
        crate::hashing::IdentityHasher::new().hash(seed)
    }

    async fn store() -> (ConsortiumStore, tempfile::NamedTempFile) {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let db = Database::open(tmp.path().to_str().unwrap()).unwrap();
        (ConsortiumStore::new(db), tmp)
    }

    #[tokio::test]
    async fn observations_accumulate_and_keep_invariants() {
        let (store, _tmp) = store().await;
        let device = hash("device-1");

        for (tenant, fraud) in [("t1", true), ("t1", false), ("t2", true), ("t3", false)] {
            store
                .record_observation("device", &device, tenant, fraud, Utc::now())
                .await
                .unwrap();
        }

        let entry = store.get("device", &device).await.unwrap().unwrap();
        assert_eq!(entry.total_count, 4);
        assert_eq!(entry.fraud_count, 2);
        assert_eq!(entry.client_count, 3);
        assert!((entry.fraud_rate - 0.5).abs() < 1e-9);
        assert!(entry.fraud_count <= entry.total_count);
        assert!(entry.client_count >= 1);
    }

    #[tokio::test]
    async fn empty_hash_is_skipped() {
        let (store, _tmp) = store().await;
        store
            .record_observation("bvn", &HashedId::empty(), "t1", true, Utc::now())
            .await
            .unwrap();
        assert_eq!(store.insights().await.unwrap().tracked_identifiers, 0);
    }

    #[tokio::test]
    async fn lookup_skips_missing_and_empty() {
        let (store, _tmp) = store().await;
        let phone = hash("phone-1");
        store
            .record_observation("phone", &phone, "t1", true, Utc::now())
            .await
            .unwrap();

        let missing = hash("never-seen");
        let empty = HashedId::empty();
        let found = store
            .lookup(&[
                ("phone", &phone),
                ("device", &missing),
                ("bvn", &empty),
            ])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].identifier_type, "phone");
    }

    #[tokio::test]
    async fn insights_summarise_the_table() {
        let (store, _tmp) = store().await;
        store
            .record_observation("device", &hash("d1"), "t1", true, Utc::now())
            .await
            .unwrap();
        store
            .record_observation("phone", &hash("p1"), "t2", false, Utc::now())
            .await
            .unwrap();

        let insights = store.insights().await.unwrap();
        assert_eq!(insights.tracked_identifiers, 2);
        assert_eq!(insights.total_reports, 2);
        assert_eq!(insights.fraud_reports, 1);
        assert_eq!(insights.identifiers_with_fraud, 1);
        assert_eq!(insights.contributing_clients, 2);
    }
}
