//! Transaction Storage
//! Mission: the frozen record of every scoring decision, and the first-writer
//! gate that makes retries idempotent

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::Database;
use crate::hashing::HashedId;
use crate::models::{
    Location, Recommendation, RiskLevel, TransactionRecord, TransactionType, Vertical,
};

/// Outcome of an insert attempt against the `(tenant_id, transaction_id)`
/// uniqueness constraint.
#[derive(Debug, PartialEq)]
pub enum InsertOutcome {
    Inserted,
    /// A concurrent (or earlier) submission already froze a result.
    AlreadyExists,
}

/// Outcome of applying feedback to a transaction.
#[derive(Debug)]
pub enum FeedbackMark {
    NotFound,
    AlreadyApplied,
    Applied(TransactionRecord),
}

#[derive(Debug, Clone)]
pub struct DeviceHistoryEntry {
    pub amount: f64,
    pub actual_fraud: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub location: Option<Location>,
}

/// Recent transactions for one device hash, newest first, capped at the
/// configured limit.
#[derive(Debug, Clone, Default)]
pub struct DeviceHistory {
    pub entries: Vec<DeviceHistoryEntry>,
}

impl DeviceHistory {
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn fraud_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.actual_fraud == Some(true))
            .count()
    }

    pub fn fraud_ratio(&self) -> f64 {
        if self.entries.is_empty() {
            return 0.0;
        }
        self.fraud_count() as f64 / self.entries.len() as f64
    }

    pub fn mean_amount(&self) -> f64 {
        if self.entries.is_empty() {
            return 0.0;
        }
        self.entries.iter().map(|e| e.amount).sum::<f64>() / self.entries.len() as f64
    }

    /// Most recent entry that carried a location, for travel-speed checks.
    pub fn last_located(&self) -> Option<&DeviceHistoryEntry> {
        self.entries.iter().find(|e| e.location.is_some())
    }
}

/// Per-tenant aggregates for the stats endpoint.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TenantStats {
    pub total_transactions: u64,
    pub average_risk_score: f64,
    pub low: u64,
    pub medium: u64,
    pub high: u64,
    pub critical: u64,
    pub approved: u64,
    pub reviewed: u64,
    pub rejected: u64,
    pub feedback_received: u64,
    pub fraud_confirmed: u64,
}

#[derive(Clone)]
pub struct TransactionStore {
    db: Database,
}

impl TransactionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// First writer wins. `INSERT OR IGNORE` rides the primary key; a loser
    /// sees `AlreadyExists` and must return the stored result instead.
    pub async fn insert(&self, record: &TransactionRecord) -> Result<InsertOutcome> {
        let conn = self.db.lock().await;
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO transactions (
                    tenant_id, transaction_id, user_id, amount, currency,
                    transaction_type, vertical, bvn_hash, phone_hash, email_hash,
                    device_hash, ip_address, user_agent, device_fingerprint, location,
                    risk_score, risk_level, recommendation, flags, consortium_match,
                    processing_time_ms, cached, actual_fraud, feedback_applied,
                    feedback_timestamp, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                           ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)",
                params![
                    record.tenant_id,
                    record.transaction_id,
                    record.user_id,
                    record.amount,
                    record.currency,
                    record.transaction_type.as_str(),
                    record.vertical.as_str(),
                    record.bvn_hash.as_str(),
                    record.phone_hash.as_str(),
                    record.email_hash.as_str(),
                    record.device_hash.as_str(),
                    record.ip_address,
                    record.user_agent,
                    record
                        .device_fingerprint
                        .as_ref()
                        .map(|v| v.to_string()),
                    record
                        .location
                        .as_ref()
                        .and_then(|l| serde_json::to_string(l).ok()),
                    record.risk_score as i64,
                    record.risk_level.as_str(),
                    record.recommendation.as_str(),
                    serde_json::to_string(&record.flags)?,
                    record.consortium_match as i64,
                    record.processing_time_ms as i64,
                    record.cached as i64,
                    record.actual_fraud.map(|b| b as i64),
                    record.feedback_applied as i64,
                    record.feedback_timestamp.map(|t| t.to_rfc3339()),
                    record.created_at.to_rfc3339(),
                ],
            )
            .context("insert transaction")?;

        Ok(if changed > 0 {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::AlreadyExists
        })
    }

    pub async fn get(
        &self,
        tenant_id: &str,
        transaction_id: &str,
    ) -> Result<Option<TransactionRecord>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM transactions WHERE tenant_id = ?1 AND transaction_id = ?2",
            SELECT_COLUMNS
        ))?;
        stmt.query_row(params![tenant_id, transaction_id], row_to_record)
            .optional()
            .context("query transaction")
    }

    /// Recent transactions for a device hash within this tenant, newest first.
    pub async fn device_history(
        &self,
        tenant_id: &str,
        device_hash: &HashedId,
        limit: usize,
    ) -> Result<DeviceHistory> {
        if device_hash.is_empty() {
            return Ok(DeviceHistory::default());
        }
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT amount, actual_fraud, created_at, location
             FROM transactions
             WHERE tenant_id = ?1 AND device_hash = ?2
             ORDER BY created_at DESC LIMIT ?3",
        )?;
        let entries = stmt
            .query_map(
                params![tenant_id, device_hash.as_str(), limit as i64],
                |row| {
                    let location_json: Option<String> = row.get(3)?;
                    Ok(DeviceHistoryEntry {
                        amount: row.get(0)?,
                        actual_fraud: row.get::<_, Option<i64>>(1)?.map(|v| v != 0),
                        created_at: parse_ts(row.get::<_, String>(2)?),
                        location: location_json
                            .and_then(|j| serde_json::from_str(&j).ok()),
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("query device history")?;

        Ok(DeviceHistory { entries })
    }

    /// Stamp the fraud label. The `feedback_applied` guard makes a repeated
    /// submission a no-op so confusion counts are never double-booked.
    pub async fn mark_feedback(
        &self,
        tenant_id: &str,
        transaction_id: &str,
        actual_fraud: bool,
        at: DateTime<Utc>,
    ) -> Result<FeedbackMark> {
        {
            let conn = self.db.lock().await;
            let changed = conn.execute(
                "UPDATE transactions
                 SET actual_fraud = ?3, feedback_applied = 1, feedback_timestamp = ?4
                 WHERE tenant_id = ?1 AND transaction_id = ?2 AND feedback_applied = 0",
                params![
                    tenant_id,
                    transaction_id,
                    actual_fraud as i64,
                    at.to_rfc3339()
                ],
            )?;
            if changed == 0 {
                let exists: Option<i64> = conn
                    .query_row(
                        "SELECT 1 FROM transactions WHERE tenant_id = ?1 AND transaction_id = ?2",
                        params![tenant_id, transaction_id],
                        |r| r.get(0),
                    )
                    .optional()?;
                return Ok(match exists {
                    Some(_) => FeedbackMark::AlreadyApplied,
                    None => FeedbackMark::NotFound,
                });
            }
        }

        match self.get(tenant_id, transaction_id).await? {
            Some(record) => Ok(FeedbackMark::Applied(record)),
            None => Ok(FeedbackMark::NotFound),
        }
    }

    pub async fn list(
        &self,
        tenant_id: &str,
        limit: usize,
        offset: usize,
        risk_level: Option<RiskLevel>,
    ) -> Result<Vec<TransactionRecord>> {
        let conn = self.db.lock().await;
        let rows = match risk_level {
            Some(level) => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {} FROM transactions
                     WHERE tenant_id = ?1 AND risk_level = ?2
                     ORDER BY created_at DESC LIMIT ?3 OFFSET ?4",
                    SELECT_COLUMNS
                ))?;
                let r = stmt
                    .query_map(
                        params![tenant_id, level.as_str(), limit as i64, offset as i64],
                        row_to_record,
                    )?
                    .collect::<rusqlite::Result<Vec<_>>>();
                r
            }
            None => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {} FROM transactions
                     WHERE tenant_id = ?1
                     ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
                    SELECT_COLUMNS
                ))?;
                let r = stmt
                    .query_map(
                        params![tenant_id, limit as i64, offset as i64],
                        row_to_record,
                    )?
                    .collect::<rusqlite::Result<Vec<_>>>();
                r
            }
        }
        .context("list transactions")?;

        Ok(rows)
    }

    pub async fn stats_since(
        &self,
        tenant_id: &str,
        since: DateTime<Utc>,
    ) -> Result<TenantStats> {
        let conn = self.db.lock().await;
        let since_str = since.to_rfc3339();

        let (total, avg): (i64, f64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(AVG(risk_score), 0)
             FROM transactions WHERE tenant_id = ?1 AND created_at >= ?2",
            params![tenant_id, since_str],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;

        let mut stats = TenantStats {
            total_transactions: total as u64,
            average_risk_score: avg,
            ..Default::default()
        };

        let mut stmt = conn.prepare_cached(
            "SELECT risk_level, COUNT(*) FROM transactions
             WHERE tenant_id = ?1 AND created_at >= ?2 GROUP BY risk_level",
        )?;
        let level_rows = stmt
            .query_map(params![tenant_id, since_str], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (level, count) in level_rows {
            match level.as_str() {
                "low" => stats.low = count as u64,
                "medium" => stats.medium = count as u64,
                "high" => stats.high = count as u64,
                "critical" => stats.critical = count as u64,
                _ => {}
            }
        }

        let mut stmt = conn.prepare_cached(
            "SELECT recommendation, COUNT(*) FROM transactions
             WHERE tenant_id = ?1 AND created_at >= ?2 GROUP BY recommendation",
        )?;
        let rec_rows = stmt
            .query_map(params![tenant_id, since_str], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (rec, count) in rec_rows {
            match rec.as_str() {
                "APPROVE" => stats.approved = count as u64,
                "REVIEW" => stats.reviewed = count as u64,
                "REJECT" => stats.rejected = count as u64,
                _ => {}
            }
        }

        let (feedback, fraud): (i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(feedback_applied), 0),
                    COALESCE(SUM(CASE WHEN actual_fraud = 1 THEN 1 ELSE 0 END), 0)
             FROM transactions WHERE tenant_id = ?1 AND created_at >= ?2",
            params![tenant_id, since_str],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )?;
        stats.feedback_received = feedback as u64;
        stats.fraud_confirmed = fraud as u64;

        Ok(stats)
    }
}

const SELECT_COLUMNS: &str = "tenant_id, transaction_id, user_id, amount, currency, \
    transaction_type, vertical, bvn_hash, phone_hash, email_hash, device_hash, \
    ip_address, user_agent, device_fingerprint, location, risk_score, risk_level, \
    recommendation, flags, consortium_match, processing_time_ms, cached, actual_fraud, \
    feedback_applied, feedback_timestamp, created_at";

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<TransactionRecord> {
    let type_str: String = row.get(5)?;
    let vertical_str: String = row.get(6)?;
    let level_str: String = row.get(16)?;
    let rec_str: String = row.get(17)?;
    let flags_json: String = row.get(18)?;
    let fingerprint: Option<String> = row.get(13)?;
    let location: Option<String> = row.get(14)?;

    Ok(TransactionRecord {
        tenant_id: row.get(0)?,
        transaction_id: row.get(1)?,
        user_id: row.get(2)?,
        amount: row.get(3)?,
        currency: row.get(4)?,
        transaction_type: TransactionType::from_str(&type_str)
            .unwrap_or(TransactionType::Transfer),
        vertical: Vertical::from_str(&vertical_str).unwrap_or(Vertical::Fintech),
        bvn_hash: HashedId::from_stored(&row.get::<_, String>(7)?),
        phone_hash: HashedId::from_stored(&row.get::<_, String>(8)?),
        email_hash: HashedId::from_stored(&row.get::<_, String>(9)?),
        device_hash: HashedId::from_stored(&row.get::<_, String>(10)?),
        ip_address: row.get(11)?,
        user_agent: row.get(12)?,
        device_fingerprint: fingerprint.and_then(|j| serde_json::from_str(&j).ok()),
        location: location.and_then(|j| serde_json::from_str(&j).ok()),
        risk_score: row.get::<_, i64>(15)? as u8,
        risk_level: RiskLevel::from_str(&level_str).unwrap_or(RiskLevel::Low),
        recommendation: Recommendation::from_str(&rec_str).unwrap_or(Recommendation::Review),
        flags: serde_json::from_str(&flags_json).unwrap_or_default(),
        consortium_match: row.get::<_, i64>(19)? != 0,
        processing_time_ms: row.get::<_, i64>(20)? as u64,
        cached: row.get::<_, i64>(21)? != 0,
        actual_fraud: row.get::<_, Option<i64>>(22)?.map(|v| v != 0),
        feedback_applied: row.get::<_, i64>(23)? != 0,
        feedback_timestamp: row
            .get::<_, Option<String>>(24)?
            .map(parse_ts),
        created_at: parse_ts(row.get::<_, String>(25)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Flag;
    use crate::models::Severity;
    use chrono::Duration;

    fn record(tenant: &str, txid: &str) -> TransactionRecord {
        TransactionRecord {
            tenant_id: tenant.to_string(),
            transaction_id: txid.to_string(),
            user_id: "u1".to_string(),
            amount: 250_000.0,
            currency: "NGN".to_string(),
            transaction_type: TransactionType::LoanApplication,
            vertical: Vertical::Fintech,
            bvn_hash: HashedId::empty(),
            phone_hash: HashedId::empty(),
            email_hash: HashedId::empty(),
            device_hash: HashedId::empty(),
            ip_address: "197.210.1.1".to_string(),
            user_agent: "test-agent".to_string(),
            device_fingerprint: None,
            location: None,
            risk_score: 42,
            risk_level: RiskLevel::Medium,
            recommendation: Recommendation::Review,
            flags: vec![Flag {
                rule_id: 3,
                rule_name: "UnusualAmount".to_string(),
                severity: Severity::Medium,
                message: "amount outside expected band".to_string(),
                confidence: 0.8,
            }],
            consortium_match: false,
            processing_time_ms: 12,
            cached: false,
            actual_fraud: None,
            feedback_applied: false,
            feedback_timestamp: None,
            created_at: Utc::now(),
        }
    }

    async fn store() -> (TransactionStore, tempfile::NamedTempFile) {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let db = Database::open(tmp.path().to_str().unwrap()).unwrap();
        (TransactionStore::new(db), tmp)
    }

    #[tokio::test]
    async fn first_writer_wins() {
        let (store, _tmp) = store().await;
        let first = record("t1", "tx1");
        assert_eq!(store.insert(&first).await.unwrap(), InsertOutcome::Inserted);

        let mut second = record("t1", "tx1");
        second.risk_score = 99;
        assert_eq!(
            store.insert(&second).await.unwrap(),
            InsertOutcome::AlreadyExists
        );

        // The frozen record keeps the first score.
        let stored = store.get("t1", "tx1").await.unwrap().unwrap();
        assert_eq!(stored.risk_score, 42);
        assert_eq!(stored.flags.len(), 1);
        assert_eq!(stored.flags[0].rule_name, "UnusualAmount");

        // Same id under another tenant is a separate transaction.
        assert_eq!(
            store.insert(&record("t2", "tx1")).await.unwrap(),
            InsertOutcome::Inserted
        );
    }

    #[tokio::test]
    async fn feedback_is_idempotent() {
        let (store, _tmp) = store().await;
        store.insert(&record("t1", "tx1")).await.unwrap();

        let now = Utc::now();
        match store.mark_feedback("t1", "tx1", true, now).await.unwrap() {
            FeedbackMark::Applied(rec) => {
                assert_eq!(rec.actual_fraud, Some(true));
                assert!(rec.feedback_applied);
            }
            other => panic!("expected Applied, got {:?}", other),
        }

        assert!(matches!(
            store.mark_feedback("t1", "tx1", false, now).await.unwrap(),
            FeedbackMark::AlreadyApplied
        ));
        assert!(matches!(
            store.mark_feedback("t1", "ghost", true, now).await.unwrap(),
            FeedbackMark::NotFound
        ));

        // The repeated submission did not overwrite the label.
        let stored = store.get("t1", "tx1").await.unwrap().unwrap();
        assert_eq!(stored.actual_fraud, Some(true));
    }

    #[tokio::test]
    async fn device_history_is_capped_and_scoped() {
        let (store, _tmp) = store().await;
        let device = HashedId::from_stored(&"ab".repeat(32));
        let base = Utc::now();

        for i in 0..12 {
            let mut rec = record("t1", &format!("tx{}", i));
            rec.device_hash = device.clone();
            rec.amount = 100.0 * (i + 1) as f64;
            rec.created_at = base + Duration::seconds(i);
            rec.actual_fraud = if i < 2 { Some(true) } else { None };
            store.insert(&rec).await.unwrap();
        }
        // Same device under another tenant must not leak in.
        let mut other = record("t2", "tx-other");
        other.device_hash = device.clone();
        store.insert(&other).await.unwrap();

        let history = store.device_history("t1", &device, 10).await.unwrap();
        assert_eq!(history.count(), 10);
        assert_eq!(history.fraud_count(), 2);
        assert!(history.mean_amount() > 0.0);

        let empty = store
            .device_history("t1", &HashedId::empty(), 10)
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn list_filters_by_level() {
        let (store, _tmp) = store().await;
        for i in 0..5 {
            let mut rec = record("t1", &format!("tx{}", i));
            rec.risk_level = if i % 2 == 0 {
                RiskLevel::High
            } else {
                RiskLevel::Low
            };
            store.insert(&rec).await.unwrap();
        }

        let high = store
            .list("t1", 50, 0, Some(RiskLevel::High))
            .await
            .unwrap();
        assert_eq!(high.len(), 3);

        let all = store.list("t1", 2, 0, None).await.unwrap();
        assert_eq!(all.len(), 2);

        let offset = store.list("t1", 50, 4, None).await.unwrap();
        assert_eq!(offset.len(), 1);
    }

    #[tokio::test]
    async fn stats_aggregate_by_level_and_recommendation() {
        let (store, _tmp) = store().await;
        for (i, (level, rec_kind)) in [
            (RiskLevel::Low, Recommendation::Approve),
            (RiskLevel::Medium, Recommendation::Review),
            (RiskLevel::High, Recommendation::Reject),
            (RiskLevel::Critical, Recommendation::Reject),
        ]
        .iter()
        .enumerate()
        {
            let mut rec = record("t1", &format!("tx{}", i));
            rec.risk_level = *level;
            rec.recommendation = *rec_kind;
            store.insert(&rec).await.unwrap();
        }
        store.mark_feedback("t1", "tx3", true, Utc::now()).await.unwrap();

        let stats = store
            .stats_since("t1", Utc::now() - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(stats.total_transactions, 4);
        assert_eq!(stats.low, 1);
        assert_eq!(stats.critical, 1);
        assert_eq!(stats.rejected, 2);
        assert_eq!(stats.feedback_received, 1);
        assert_eq!(stats.fraud_confirmed, 1);

        let none = store
            .stats_since("t1", Utc::now() + Duration::days(1))
            .await
            .unwrap();
        assert_eq!(none.total_transactions, 0);
    }
}
