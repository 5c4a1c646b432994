//! Rule Engine
//! Mission: a flat catalogue of named predicates, filtered per vertical and
//! tenant, evaluated with per-rule fault isolation

pub mod catalog;

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

use crate::models::{Flag, Severity, Tenant, TransactionRecord, TransactionType, Vertical};
use crate::store::DeviceHistory;
use crate::velocity::VelocitySnapshot;

/// Confidence attached to a flag when the rule does not supply its own.
pub const DEFAULT_CONFIDENCE: f64 = 0.8;

/// Everything a rule may look at besides the transaction itself. Assembled
/// once per request by the orchestrator; rules never touch a store.
#[derive(Debug, Clone)]
pub struct RuleContext {
    pub device_velocity: VelocitySnapshot,
    pub phone_velocity: VelocitySnapshot,
    pub email_velocity: VelocitySnapshot,
    pub bvn_velocity: VelocitySnapshot,
    pub ip_velocity: VelocitySnapshot,
    pub device_history: DeviceHistory,
    /// Distinct device hashes seen on this IP in the last 24h.
    pub ip_device_count: u64,
    pub now: DateTime<Utc>,
}

impl RuleContext {
    /// A context with no signals, as seen by a first-ever transaction.
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            device_velocity: VelocitySnapshot::default(),
            phone_velocity: VelocitySnapshot::default(),
            email_velocity: VelocitySnapshot::default(),
            bvn_velocity: VelocitySnapshot::default(),
            ip_velocity: VelocitySnapshot::default(),
            device_history: DeviceHistory::default(),
            ip_device_count: 0,
            now,
        }
    }
}

/// A single fraud predicate. `check` returns the triggered message or `None`.
///
/// Implementations must be pure over `(tx, ctx)`: no I/O, no shared state,
/// so the engine can isolate a panicking rule without poisoning anything.
pub trait Rule: Send + Sync {
    fn id(&self) -> u32;
    fn name(&self) -> &'static str;
    fn base_score(&self) -> f64;
    fn severity(&self) -> Severity;

    /// Verticals this rule belongs to; empty means universal.
    fn verticals(&self) -> &'static [Vertical] {
        &[]
    }

    /// Transaction types this rule applies to; empty means all.
    fn transaction_types(&self) -> &'static [TransactionType] {
        &[]
    }

    fn check(&self, tx: &TransactionRecord, ctx: &RuleContext) -> Option<String>;
}

#[derive(Debug, Clone, Default)]
pub struct RuleEvaluation {
    pub flags: Vec<Flag>,
    /// Weighted sum of triggered base scores, capped at 100.
    pub rule_score: f64,
}

/// Live per-rule weights. The learner task is the only writer; the engine
/// takes one read-lock snapshot per evaluation, so a concurrent update is
/// seen entirely or not at all.
pub type RuleWeights = Arc<RwLock<HashMap<u32, f64>>>;

pub struct RuleEngine {
    rules: Vec<Box<dyn Rule>>,
    weights: RuleWeights,
}

impl RuleEngine {
    pub fn new(weights: RuleWeights) -> Self {
        Self {
            rules: catalog::default_rules(),
            weights,
        }
    }

    /// Engine over an explicit rule list (tests inject broken rules here).
    pub fn with_rules(rules: Vec<Box<dyn Rule>>, weights: RuleWeights) -> Self {
        Self { rules, weights }
    }

    pub fn rule_names(&self) -> Vec<(u32, &'static str)> {
        self.rules.iter().map(|r| (r.id(), r.name())).collect()
    }

    /// Selection: (universal ∪ vertical rules ∪ tenant-enabled) ∖ disabled,
    /// then the per-rule transaction-type filter.
    fn applies(&self, rule: &dyn Rule, tx: &TransactionRecord, tenant: &Tenant) -> bool {
        let id = rule.id();
        if tenant.disabled_rule_ids.contains(&id) {
            return false;
        }
        let verticals = rule.verticals();
        let vertical_ok = verticals.is_empty()
            || verticals.contains(&tx.vertical)
            || tenant.enabled_rule_ids.contains(&id);
        if !vertical_ok {
            return false;
        }
        let types = rule.transaction_types();
        types.is_empty() || types.contains(&tx.transaction_type)
    }

    /// Evaluate every applicable rule. A rule that panics is logged and
    /// treated as not triggered; one misbehaving rule cannot fail the
    /// request.
    pub fn evaluate(
        &self,
        tx: &TransactionRecord,
        ctx: &RuleContext,
        tenant: &Tenant,
    ) -> RuleEvaluation {
        let weights = self.weights.read();
        let mut flags = Vec::new();
        let mut score = 0.0;

        for rule in &self.rules {
            if !self.applies(rule.as_ref(), tx, tenant) {
                continue;
            }

            let outcome = catch_unwind(AssertUnwindSafe(|| rule.check(tx, ctx)));
            let message = match outcome {
                Ok(message) => message,
                Err(_) => {
                    counter!("rule_panics_total", 1);
                    error!(
                        rule_id = rule.id(),
                        rule_name = rule.name(),
                        "rule panicked during evaluation, treated as not triggered"
                    );
                    None
                }
            };

            if let Some(message) = message {
                let weight = weights.get(&rule.id()).copied().unwrap_or(1.0);
                let confidence = DEFAULT_CONFIDENCE;
                score += rule.base_score() * weight * confidence;
                flags.push(Flag {
                    rule_id: rule.id(),
                    rule_name: rule.name().to_string(),
                    severity: rule.severity(),
                    message,
                    confidence,
                });
            }
        }

        RuleEvaluation {
            flags,
            rule_score: score.min(100.0),
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::hashing::{HashedId, IdentityHasher};
    use crate::models::{Recommendation, RiskLevel};

    pub fn record(
        transaction_type: TransactionType,
        vertical: Vertical,
        amount: f64,
    ) -> TransactionRecord {
        let hasher = IdentityHasher::new();
        TransactionRecord {
            tenant_id: "t1".to_string(),
            transaction_id: "tx1".to_string(),
            user_id: "u1".to_string(),
            amount,
            currency: "NGN".to_string(),
            transaction_type,
            vertical,
            bvn_hash: hasher.hash("22123456789"),
            phone_hash: hasher.hash_phone("+2348012345678"),
            email_hash: hasher.hash_email("ada@example.com"),
            device_hash: hasher.hash("device-1"),
            ip_address: "197.210.1.1".to_string(),
            user_agent: "test".to_string(),
            device_fingerprint: None,
            location: None,
            risk_score: 0,
            risk_level: RiskLevel::Low,
            recommendation: Recommendation::Approve,
            flags: vec![],
            consortium_match: false,
            processing_time_ms: 0,
            cached: false,
            actual_fraud: None,
            feedback_applied: false,
            feedback_timestamp: None,
            created_at: Utc::now(),
        }
    }

    pub fn tenant(vertical: Vertical) -> Tenant {
        Tenant {
            tenant_id: "t1".to_string(),
            name: "Test".to_string(),
            plan: "standard".to_string(),
            api_key_hash: String::new(),
            vertical,
            rate_limit_per_minute: 600,
            enabled_rule_ids: vec![],
            disabled_rule_ids: vec![],
            ml_enabled: false,
            rule_score_weight: 0.5,
            ml_weight: 0.3,
            consortium_weight: 0.2,
            webhook_url: None,
            webhook_secret: None,
            active: true,
        }
    }

    pub fn no_device(mut tx: TransactionRecord) -> TransactionRecord {
        tx.device_hash = HashedId::empty();
        tx
    }

    pub fn weights() -> RuleWeights {
        Arc::new(RwLock::new(HashMap::new()))
    }
}
