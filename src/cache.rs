//! Idempotency / Result Cache
//! Mission: first scoring wins per transaction id; identical bursts are
//! answered from the KV without touching the pipeline

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::kv::KvStore;
use crate::models::{TransactionCheckResponse, TransactionRecord};
use crate::store::TransactionStore;

/// What a cache probe found, in lookup order.
#[derive(Debug)]
pub enum CacheHit {
    /// Durable level: the frozen record for this (tenant, transaction id).
    Transaction(Box<TransactionRecord>),
    /// KV level: a recent identical request body.
    Content(TransactionCheckResponse),
}

/// Canonical request view for content hashing: PII already hashed, key order
/// fixed by `serde_json`'s sorted maps.
#[derive(Serialize)]
struct CanonicalRequest<'a> {
    tenant_id: &'a str,
    transaction_id: &'a str,
    user_id: &'a str,
    amount: f64,
    currency: &'a str,
    transaction_type: &'a str,
    vertical: &'a str,
    bvn_hash: &'a str,
    phone_hash: &'a str,
    email_hash: &'a str,
    device_hash: &'a str,
    ip_address: &'a str,
    user_agent: &'a str,
    location: Option<&'a crate::models::Location>,
    device_fingerprint: Option<&'a serde_json::Value>,
}

/// SHA-256 over the canonical JSON of a (pre-scoring) record.
pub fn content_hash(record: &TransactionRecord) -> String {
    let canonical = CanonicalRequest {
        tenant_id: &record.tenant_id,
        transaction_id: &record.transaction_id,
        user_id: &record.user_id,
        amount: record.amount,
        currency: &record.currency,
        transaction_type: record.transaction_type.as_str(),
        vertical: record.vertical.as_str(),
        bvn_hash: record.bvn_hash.as_str(),
        phone_hash: record.phone_hash.as_str(),
        email_hash: record.email_hash.as_str(),
        device_hash: record.device_hash.as_str(),
        ip_address: &record.ip_address,
        user_agent: &record.user_agent,
        location: record.location.as_ref(),
        device_fingerprint: record.device_fingerprint.as_ref(),
    };

    // Value round-trip sorts object keys (serde_json maps are BTreeMaps).
    let body = serde_json::to_value(&canonical)
        .and_then(|v| serde_json::to_string(&v))
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Clone)]
pub struct ResultCache {
    kv: Arc<dyn KvStore>,
    transactions: TransactionStore,
    content_ttl: Duration,
}

impl ResultCache {
    pub fn new(kv: Arc<dyn KvStore>, transactions: TransactionStore, content_ttl: Duration) -> Self {
        Self {
            kv,
            transactions,
            content_ttl,
        }
    }

    fn content_key(hash: &str) -> String {
        format!("result:{}", hash)
    }

    /// Two lookups in order: durable by transaction id, then KV by content
    /// hash. Store errors degrade to a miss; the pipeline re-evaluates.
    pub async fn lookup(
        &self,
        tenant_id: &str,
        transaction_id: &str,
        content_hash: &str,
    ) -> Option<CacheHit> {
        match self.transactions.get(tenant_id, transaction_id).await {
            Ok(Some(record)) => return Some(CacheHit::Transaction(Box::new(record))),
            Ok(None) => {}
            Err(e) => {
                warn!(tenant_id, transaction_id, error = %e, "idempotency lookup failed");
            }
        }

        match self.kv.get_string(&Self::content_key(content_hash)).await {
            Ok(Some(body)) => match serde_json::from_str::<TransactionCheckResponse>(&body) {
                Ok(response) => Some(CacheHit::Content(response)),
                Err(e) => {
                    warn!(error = %e, "cached result body unparsable, ignoring");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "content cache lookup failed");
                None
            }
        }
    }

    /// KV-level write after a fresh scoring. The durable level was already
    /// written by the persistence step; a KV failure only costs latency.
    pub async fn store(&self, content_hash: &str, response: &TransactionCheckResponse) {
        let body = match serde_json::to_string(response) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "failed to serialise response for caching");
                return;
            }
        };
        if let Err(e) = self
            .kv
            .set_string(&Self::content_key(content_hash), &body, self.content_ttl)
            .await
        {
            warn!(error = %e, "content cache write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::kv::MemoryKv;
    use crate::models::{TransactionType, Vertical};
    use crate::rules::testutil::record;
    use crate::store::Database;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    fn cache() -> (ResultCache, ManualClock, tempfile::NamedTempFile) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap());
        let kv = Arc::new(MemoryKv::new(Arc::new(clock.clone())));
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let db = Database::open(tmp.path().to_str().unwrap()).unwrap();
        let store = TransactionStore::new(db);
        (
            ResultCache::new(kv, store, Duration::from_secs(300)),
            clock,
            tmp,
        )
    }

    #[test]
    fn content_hash_is_stable_and_field_sensitive() {
        let a = record(TransactionType::Purchase, Vertical::Fintech, 500.0);
        let b = record(TransactionType::Purchase, Vertical::Fintech, 500.0);
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_eq!(content_hash(&a).len(), 64);

        let mut c = record(TransactionType::Purchase, Vertical::Fintech, 500.0);
        c.amount = 501.0;
        assert_ne!(content_hash(&a), content_hash(&c));

        // Score fields do not participate: the hash covers the request only.
        let mut d = record(TransactionType::Purchase, Vertical::Fintech, 500.0);
        d.risk_score = 90;
        assert_eq!(content_hash(&a), content_hash(&d));
    }

    #[tokio::test]
    async fn transaction_level_wins_over_content_level() {
        let (cache, _clock, _tmp) = cache();
        let rec = record(TransactionType::Purchase, Vertical::Fintech, 500.0);
        let hash = content_hash(&rec);
        cache.transactions.insert(&rec).await.unwrap();
        cache.store(&hash, &rec.to_response(false, 5)).await;

        match cache.lookup("t1", "tx1", &hash).await {
            Some(CacheHit::Transaction(found)) => {
                assert_eq!(found.transaction_id, "tx1");
            }
            other => panic!("expected transaction hit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn content_level_expires_with_ttl() {
        let (cache, clock, _tmp) = cache();
        let rec = record(TransactionType::Purchase, Vertical::Fintech, 500.0);
        let hash = content_hash(&rec);
        cache.store(&hash, &rec.to_response(false, 5)).await;

        match cache.lookup("t1", "other-id", &hash).await {
            Some(CacheHit::Content(resp)) => assert_eq!(resp.transaction_id, "tx1"),
            other => panic!("expected content hit, got {:?}", other),
        }

        clock.advance(ChronoDuration::seconds(301));
        assert!(cache.lookup("t1", "other-id", &hash).await.is_none());
    }

    #[tokio::test]
    async fn miss_when_nothing_stored() {
        let (cache, _clock, _tmp) = cache();
        assert!(cache.lookup("t1", "tx1", &"0".repeat(64)).await.is_none());
    }
}
