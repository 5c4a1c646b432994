//! Consortium Aggregator
//! Mission: surface what every tenant together knows about an identifier,
//! without ever moving raw PII between them

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::hashing::HashedId;
use crate::models::{ConsortiumSignal, TransactionRecord};
use crate::store::ConsortiumStore;

#[derive(Clone)]
pub struct ConsortiumAggregator {
    store: ConsortiumStore,
    enabled: bool,
}

impl ConsortiumAggregator {
    pub fn new(store: ConsortiumStore, enabled: bool) -> Self {
        Self { store, enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Cross-tenant fraud signal for the given identifiers. Sums counts over
    /// every matching entry; `client_count` is the maximum across entries.
    /// Disabled or failing lookups degrade to the neutral signal.
    pub async fn signals(&self, identifiers: &[(&str, &HashedId)]) -> ConsortiumSignal {
        if !self.enabled || identifiers.is_empty() {
            return ConsortiumSignal::neutral();
        }

        let entries = match self.store.lookup(identifiers).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "consortium lookup failed, degrading to neutral");
                return ConsortiumSignal::neutral();
            }
        };
        if entries.is_empty() {
            return ConsortiumSignal::neutral();
        }

        let fraud_count: u64 = entries.iter().map(|e| e.fraud_count).sum();
        let total_count: u64 = entries.iter().map(|e| e.total_count).sum();
        let client_count = entries.iter().map(|e| e.client_count).max().unwrap_or(0);
        let fraud_rate = if total_count > 0 {
            fraud_count as f64 / total_count as f64
        } else {
            0.0
        };

        ConsortiumSignal {
            matched: true,
            fraud_rate,
            client_count,
            fraud_count,
            total_count,
        }
    }

    /// Feedback write path: one atomic upsert per non-empty identifier on the
    /// transaction. Surfaces errors to the learner so they are logged once.
    pub async fn record_feedback(
        &self,
        record: &TransactionRecord,
        is_fraud: bool,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        for (kind, hash) in record.identifiers() {
            self.store
                .record_observation(kind, hash, &record.tenant_id, is_fraud, at)
                .await?;
        }
        Ok(())
    }
}
