//! Feedback & Learning
//! Mission: turn post-hoc fraud labels into rule-weight and consortium
//! updates without disturbing in-flight scoring

use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::consortium::ConsortiumAggregator;
use crate::error::ApiError;
use crate::models::{Recommendation, RuleAccuracy, Tenant, TransactionRecord};
use crate::rules::RuleWeights;
use crate::store::{FeedbackMark, RuleAccuracyStore, TransactionStore};
use crate::webhook::{WebhookDispatcher, WebhookEvent};

/// Capacity of the feedback → learner channel. Labels arrive at human pace;
/// this never fills in practice.
const FEEDBACK_CHANNEL_CAPACITY: usize = 1_024;

/// One labelled transaction on its way to the learner.
#[derive(Debug)]
pub struct FeedbackEvent {
    pub record: TransactionRecord,
    pub actual_fraud: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackAck {
    pub transaction_id: String,
    pub status: &'static str,
    pub actual_fraud: bool,
}

pub fn feedback_channel() -> (mpsc::Sender<FeedbackEvent>, mpsc::Receiver<FeedbackEvent>) {
    mpsc::channel(FEEDBACK_CHANNEL_CAPACITY)
}

/// Synchronous half: stamps the label, gates idempotency, hands the record
/// to the learner and optionally notifies the tenant of a missed fraud.
#[derive(Clone)]
pub struct FeedbackService {
    transactions: TransactionStore,
    clock: Arc<dyn Clock>,
    learner_tx: mpsc::Sender<FeedbackEvent>,
    webhooks: WebhookDispatcher,
}

impl FeedbackService {
    pub fn new(
        transactions: TransactionStore,
        clock: Arc<dyn Clock>,
        learner_tx: mpsc::Sender<FeedbackEvent>,
        webhooks: WebhookDispatcher,
    ) -> Self {
        Self {
            transactions,
            clock,
            learner_tx,
            webhooks,
        }
    }

    pub async fn submit(
        &self,
        tenant: &Tenant,
        transaction_id: &str,
        actual_fraud: bool,
    ) -> Result<FeedbackAck, ApiError> {
        let now = self.clock.now();
        let mark = self
            .transactions
            .mark_feedback(&tenant.tenant_id, transaction_id, actual_fraud, now)
            .await
            .map_err(|e| ApiError::DependencyUnavailable(format!("{:#}", e)))?;

        let record = match mark {
            FeedbackMark::NotFound => {
                return Err(ApiError::NotFound("Transaction".to_string()));
            }
            FeedbackMark::AlreadyApplied => {
                // Idempotent: the confusion counts were booked the first time.
                return Ok(FeedbackAck {
                    transaction_id: transaction_id.to_string(),
                    status: "already_recorded",
                    actual_fraud,
                });
            }
            FeedbackMark::Applied(record) => record,
        };

        // Confirmed fraud that the pipeline had approved is worth telling the
        // tenant about immediately.
        if actual_fraud && record.recommendation == Recommendation::Approve {
            if let (Some(url), Some(secret)) = (&tenant.webhook_url, &tenant.webhook_secret) {
                self.webhooks.enqueue(WebhookEvent {
                    event_id: Uuid::new_v4().to_string(),
                    event_type: "fraud.confirmed".to_string(),
                    created_at: now,
                    tenant_id: tenant.tenant_id.clone(),
                    url: url.clone(),
                    secret: secret.clone(),
                    data: serde_json::json!({
                        "transaction_id": record.transaction_id,
                        "risk_score": record.risk_score,
                        "recommendation": record.recommendation,
                        "actual_fraud": true,
                    }),
                });
            }
        }

        if self
            .learner_tx
            .send(FeedbackEvent {
                record,
                actual_fraud,
            })
            .await
            .is_err()
        {
            // Learner gone (shutdown); the durable label survives and can be
            // replayed, so the ack still stands.
            warn!(transaction_id, "learner channel closed, feedback not applied to weights");
        }

        Ok(FeedbackAck {
            transaction_id: transaction_id.to_string(),
            status: "recorded",
            actual_fraud,
        })
    }
}

/// Single consumer of the feedback channel. Being the only writer of rule
/// accuracy and the live weight map is what makes the per-rule critical
/// section trivial: readers see pre- or post-update values, nothing between.
pub struct Learner {
    accuracy: RuleAccuracyStore,
    consortium: ConsortiumAggregator,
    weights: RuleWeights,
    clock: Arc<dyn Clock>,
}

impl Learner {
    pub fn new(
        accuracy: RuleAccuracyStore,
        consortium: ConsortiumAggregator,
        weights: RuleWeights,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            accuracy,
            consortium,
            weights,
            clock,
        }
    }

    pub fn spawn(self, mut rx: mpsc::Receiver<FeedbackEvent>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = self.apply(&event).await {
                    error!(
                        transaction_id = %event.record.transaction_id,
                        error = %e,
                        "feedback application failed"
                    );
                }
            }
            info!("learner exiting, feedback channel closed");
        })
    }

    /// Book the outcome against every flagged rule, refresh the live weight
    /// map, then fold the label into the consortium aggregates.
    pub async fn apply(&self, event: &FeedbackEvent) -> Result<()> {
        let record = &event.record;
        let predicted_fraud = record.risk_level.is_notifiable();
        let now = self.clock.now();

        let mut seen = std::collections::HashSet::new();
        for flag in &record.flags {
            // Synthetic consortium flags carry id 0 and are not rules.
            if flag.rule_id == 0 || !seen.insert(flag.rule_id) {
                continue;
            }

            let mut acc = self
                .accuracy
                .get(flag.rule_id)
                .await?
                .unwrap_or_else(|| RuleAccuracy::new(flag.rule_id, &flag.rule_name));
            acc.record(predicted_fraud, event.actual_fraud);
            self.accuracy.upsert(&acc, now).await?;
            self.weights.write().insert(acc.rule_id, acc.weight);

            info!(
                rule_id = acc.rule_id,
                rule_name = %acc.rule_name,
                accuracy = acc.accuracy,
                weight = acc.weight,
                "rule accuracy updated"
            );
        }

        self.consortium
            .record_feedback(record, event.actual_fraud, now)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{Flag, RiskLevel, Severity, TransactionType, Vertical};
    use crate::rules::testutil::record as make_record;
    use crate::store::{ConsortiumStore, Database};
    use chrono::{TimeZone, Utc};
    use parking_lot::RwLock;
    use std::collections::HashMap;

    struct Setup {
        service: FeedbackService,
        learner: Learner,
        rx: mpsc::Receiver<FeedbackEvent>,
        transactions: TransactionStore,
        accuracy: RuleAccuracyStore,
        consortium_store: ConsortiumStore,
        weights: RuleWeights,
        _tmp: tempfile::NamedTempFile,
    }

    fn setup() -> Setup {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let db = Database::open(tmp.path().to_str().unwrap()).unwrap();
        let clock: Arc<dyn Clock> =
            Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()));

        let transactions = TransactionStore::new(db.clone());
        let accuracy = RuleAccuracyStore::new(db.clone());
        let consortium_store = ConsortiumStore::new(db.clone());
        let weights: RuleWeights = Arc::new(RwLock::new(HashMap::new()));
        let (tx, rx) = feedback_channel();

        Setup {
            service: FeedbackService::new(
                transactions.clone(),
                clock.clone(),
                tx,
                WebhookDispatcher::new(16),
            ),
            learner: Learner::new(
                accuracy.clone(),
                ConsortiumAggregator::new(consortium_store.clone(), true),
                weights.clone(),
                clock,
            ),
            rx,
            transactions,
            accuracy,
            consortium_store,
            weights,
            _tmp: tmp,
        }
    }

    fn flagged_record(txid: &str, level: RiskLevel) -> TransactionRecord {
        let mut rec = make_record(TransactionType::LoanApplication, Vertical::Fintech, 200_000.0);
        rec.transaction_id = txid.to_string();
        rec.risk_level = level;
        rec.flags = vec![
            Flag {
                rule_id: 6,
                rule_name: "LoanStacking".to_string(),
                severity: Severity::Critical,
                message: "stacked".to_string(),
                confidence: 0.8,
            },
            Flag {
                rule_id: 0,
                rule_name: "ConsortiumMatch".to_string(),
                severity: Severity::High,
                message: "seen elsewhere".to_string(),
                confidence: 0.7,
            },
        ];
        rec
    }

    fn tenant() -> Tenant {
        crate::rules::testutil::tenant(Vertical::Fintech)
    }

    #[tokio::test]
    async fn submit_is_idempotent_and_labels_once() {
        let mut s = setup();
        s.transactions
            .insert(&flagged_record("tx1", RiskLevel::High))
            .await
            .unwrap();

        let first = s.service.submit(&tenant(), "tx1", true).await.unwrap();
        assert_eq!(first.status, "recorded");

        let second = s.service.submit(&tenant(), "tx1", false).await.unwrap();
        assert_eq!(second.status, "already_recorded");

        // Only the first submission reached the learner.
        let event = s.rx.try_recv().unwrap();
        assert!(event.actual_fraud);
        assert!(s.rx.try_recv().is_err());

        let err = s.service.submit(&tenant(), "missing", true).await;
        assert!(matches!(err, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn apply_updates_accuracy_weights_and_consortium() {
        let s = setup();
        let record = flagged_record("tx1", RiskLevel::High);

        // High risk + fraud label: true positive for rule 6.
        s.learner
            .apply(&FeedbackEvent {
                record: record.clone(),
                actual_fraud: true,
            })
            .await
            .unwrap();

        let acc = s.accuracy.get(6).await.unwrap().unwrap();
        assert_eq!(acc.true_positives, 1);
        assert_eq!(acc.accuracy, 1.0);
        assert!((s.weights.read()[&6] - 1.0).abs() < 1e-9);

        // Synthetic flag id 0 never lands in accuracy.
        assert!(s.accuracy.get(0).await.unwrap().is_none());

        // Consortium saw one fraud observation per identifier.
        let entry = s
            .consortium_store
            .get("device", &record.device_hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.total_count, 1);
        assert_eq!(entry.fraud_count, 1);

        // A false positive pulls the weight down but keeps it in bounds.
        let mut second = flagged_record("tx2", RiskLevel::High);
        second.device_hash = crate::hashing::IdentityHasher::new().hash("device-2");
        s.learner
            .apply(&FeedbackEvent {
                record: second,
                actual_fraud: false,
            })
            .await
            .unwrap();
        let acc = s.accuracy.get(6).await.unwrap().unwrap();
        assert_eq!(acc.false_positives, 1);
        let w = s.weights.read()[&6];
        assert!((0.1..=2.0).contains(&w));
        assert!((w - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn low_risk_fraud_is_a_false_negative() {
        let s = setup();
        let record = flagged_record("tx1", RiskLevel::Low);
        s.learner
            .apply(&FeedbackEvent {
                record,
                actual_fraud: true,
            })
            .await
            .unwrap();

        let acc = s.accuracy.get(6).await.unwrap().unwrap();
        assert_eq!(acc.false_negatives, 1);
        assert_eq!(acc.recall, 0.0);
        // Accuracy 0 floors the weight at 0.1.
        assert!((acc.weight - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn spawned_learner_drains_the_channel() {
        let mut s = setup();
        s.transactions
            .insert(&flagged_record("tx1", RiskLevel::High))
            .await
            .unwrap();
        s.service.submit(&tenant(), "tx1", true).await.unwrap();

        let handle = s.learner.spawn(s.rx);
        drop(s.service); // closes the channel once the event is consumed

        handle.await.unwrap();
        assert!(s.accuracy.get(6).await.unwrap().is_some());
    }
}
