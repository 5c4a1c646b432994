//! Core domain types shared across the scoring pipeline, the stores and the
//! API surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hashing::HashedId;

/// Industry category that selects a rule subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vertical {
    Fintech,
    Ecommerce,
    Betting,
    Crypto,
    Marketplace,
}

impl Vertical {
    pub fn as_str(&self) -> &'static str {
        match self {
            Vertical::Fintech => "fintech",
            Vertical::Ecommerce => "ecommerce",
            Vertical::Betting => "betting",
            Vertical::Crypto => "crypto",
            Vertical::Marketplace => "marketplace",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "fintech" => Some(Vertical::Fintech),
            "ecommerce" => Some(Vertical::Ecommerce),
            "betting" => Some(Vertical::Betting),
            "crypto" => Some(Vertical::Crypto),
            "marketplace" => Some(Vertical::Marketplace),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    LoanApplication,
    LoanDisbursement,
    LoanRepayment,
    Transfer,
    Withdrawal,
    Deposit,
    Purchase,
    CardTransaction,
    BetPlacement,
    BetWithdrawal,
    CryptoDeposit,
    CryptoWithdrawal,
    MarketplaceListing,
    MarketplacePurchase,
}

/// Fixed order used by the ML one-hot encoding. Order is part of the model
/// artifact contract; do not reorder.
pub const ALL_TRANSACTION_TYPES: [TransactionType; 14] = [
    TransactionType::LoanApplication,
    TransactionType::LoanDisbursement,
    TransactionType::LoanRepayment,
    TransactionType::Transfer,
    TransactionType::Withdrawal,
    TransactionType::Deposit,
    TransactionType::Purchase,
    TransactionType::CardTransaction,
    TransactionType::BetPlacement,
    TransactionType::BetWithdrawal,
    TransactionType::CryptoDeposit,
    TransactionType::CryptoWithdrawal,
    TransactionType::MarketplaceListing,
    TransactionType::MarketplacePurchase,
];

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::LoanApplication => "loan_application",
            TransactionType::LoanDisbursement => "loan_disbursement",
            TransactionType::LoanRepayment => "loan_repayment",
            TransactionType::Transfer => "transfer",
            TransactionType::Withdrawal => "withdrawal",
            TransactionType::Deposit => "deposit",
            TransactionType::Purchase => "purchase",
            TransactionType::CardTransaction => "card_transaction",
            TransactionType::BetPlacement => "bet_placement",
            TransactionType::BetWithdrawal => "bet_withdrawal",
            TransactionType::CryptoDeposit => "crypto_deposit",
            TransactionType::CryptoWithdrawal => "crypto_withdrawal",
            TransactionType::MarketplaceListing => "marketplace_listing",
            TransactionType::MarketplacePurchase => "marketplace_purchase",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        ALL_TRANSACTION_TYPES.iter().copied().find(|t| t.as_str() == s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "low" => Some(RiskLevel::Low),
            "medium" => Some(RiskLevel::Medium),
            "high" => Some(RiskLevel::High),
            "critical" => Some(RiskLevel::Critical),
            _ => None,
        }
    }

    /// Maps a composite score onto a level given the process thresholds.
    /// `critical` sits 15 points above the high threshold.
    pub fn from_score(score: u8, threshold_medium: u8, threshold_high: u8) -> Self {
        let critical = threshold_high.saturating_add(15).min(100);
        if score >= critical {
            RiskLevel::Critical
        } else if score >= threshold_high {
            RiskLevel::High
        } else if score >= threshold_medium {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    pub fn is_notifiable(&self) -> bool {
        matches!(self, RiskLevel::High | RiskLevel::Critical)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Recommendation {
    Approve,
    Review,
    Reject,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::Approve => "APPROVE",
            Recommendation::Review => "REVIEW",
            Recommendation::Reject => "REJECT",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "APPROVE" => Some(Recommendation::Approve),
            "REVIEW" => Some(Recommendation::Review),
            "REJECT" => Some(Recommendation::Reject),
            _ => None,
        }
    }
}

/// A single triggered rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flag {
    pub rule_id: u32,
    pub rule_name: String,
    pub severity: Severity,
    pub message: String,
    /// How strongly this flag should count towards the composite, in [0,1].
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

/// Tenant record resolved at auth time and passed by value through the
/// pipeline. No backrefs to transactions; lookups go through the stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub tenant_id: String,
    pub name: String,
    pub plan: String,
    #[serde(skip_serializing)]
    pub api_key_hash: String,
    pub vertical: Vertical,
    pub rate_limit_per_minute: u32,
    /// Empty means "all default rules for the vertical".
    pub enabled_rule_ids: Vec<u32>,
    pub disabled_rule_ids: Vec<u32>,
    pub ml_enabled: bool,
    pub rule_score_weight: f64,
    pub ml_weight: f64,
    pub consortium_weight: f64,
    pub webhook_url: Option<String>,
    #[serde(skip_serializing)]
    pub webhook_secret: Option<String>,
    pub active: bool,
}

impl Tenant {
    /// Signal weights normalised to sum to 1. Falls back to the documented
    /// defaults when a tenant carries degenerate (all-zero) weights.
    pub fn normalised_weights(&self) -> (f64, f64, f64) {
        let (r, m, c) = (
            self.rule_score_weight.clamp(0.0, 1.0),
            self.ml_weight.clamp(0.0, 1.0),
            self.consortium_weight.clamp(0.0, 1.0),
        );
        let sum = r + m + c;
        if sum <= f64::EPSILON {
            return (0.5, 0.3, 0.2);
        }
        (r / sum, m / sum, c / sum)
    }
}

/// Per-rule confusion-matrix metrics driving the learning loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleAccuracy {
    pub rule_id: u32,
    pub rule_name: String,
    pub true_positives: u64,
    pub false_positives: u64,
    pub true_negatives: u64,
    pub false_negatives: u64,
    pub precision: f64,
    pub recall: f64,
    pub accuracy: f64,
    pub weight: f64,
}

impl RuleAccuracy {
    pub fn new(rule_id: u32, rule_name: &str) -> Self {
        Self {
            rule_id,
            rule_name: rule_name.to_string(),
            true_positives: 0,
            false_positives: 0,
            true_negatives: 0,
            false_negatives: 0,
            precision: 0.0,
            recall: 0.0,
            accuracy: 0.0,
            weight: 1.0,
        }
    }

    /// Recompute derived metrics from the confusion counts. The weight is
    /// `clamp(accuracy, 0.1, 2.0)`: bounded and monotone in accuracy.
    pub fn recompute(&mut self) {
        let tp = self.true_positives as f64;
        let fp = self.false_positives as f64;
        let tn = self.true_negatives as f64;
        let fn_ = self.false_negatives as f64;
        let total = tp + fp + tn + fn_;

        self.precision = if tp + fp > 0.0 { tp / (tp + fp) } else { 0.0 };
        self.recall = if tp + fn_ > 0.0 { tp / (tp + fn_) } else { 0.0 };
        self.accuracy = if total > 0.0 { (tp + tn) / total } else { 0.0 };
        self.weight = self.accuracy.clamp(0.1, 2.0);
    }

    pub fn record(&mut self, predicted_fraud: bool, actual_fraud: bool) {
        match (predicted_fraud, actual_fraud) {
            (true, true) => self.true_positives += 1,
            (true, false) => self.false_positives += 1,
            (false, true) => self.false_negatives += 1,
            (false, false) => self.true_negatives += 1,
        }
        self.recompute();
    }
}

/// Shared cross-tenant aggregate for one hashed identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsortiumEntry {
    pub identifier_type: String,
    pub identifier_hash: String,
    pub fraud_count: u64,
    pub total_count: u64,
    pub client_count: u64,
    pub fraud_rate: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Aggregated consortium read for one transaction's identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ConsortiumSignal {
    pub matched: bool,
    pub fraud_rate: f64,
    pub client_count: u64,
    pub fraud_count: u64,
    pub total_count: u64,
}

impl ConsortiumSignal {
    pub fn neutral() -> Self {
        Self::default()
    }
}

/// Inbound scoring request. PII arrives raw here and is hashed before it
/// touches any store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionCheckRequest {
    pub transaction_id: String,
    pub user_id: String,
    pub amount: f64,
    pub currency: String,
    pub transaction_type: TransactionType,
    pub vertical: Vertical,
    #[serde(default)]
    pub bvn: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub device_fingerprint: Option<serde_json::Value>,
    #[serde(default)]
    pub location: Option<Location>,
}

/// Maximum accepted length for client-supplied identifier strings.
const MAX_ID_LEN: usize = 128;

impl TransactionCheckRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.transaction_id.trim().is_empty() {
            return Err("transaction_id must not be empty".to_string());
        }
        if self.transaction_id.len() > MAX_ID_LEN {
            return Err(format!("transaction_id exceeds {} characters", MAX_ID_LEN));
        }
        if self.user_id.trim().is_empty() {
            return Err("user_id must not be empty".to_string());
        }
        if self.user_id.len() > MAX_ID_LEN {
            return Err(format!("user_id exceeds {} characters", MAX_ID_LEN));
        }
        if !self.amount.is_finite() || self.amount <= 0.0 {
            return Err("amount must be a positive number".to_string());
        }
        if self.currency.len() != 3 || !self.currency.bytes().all(|b| b.is_ascii_alphabetic()) {
            return Err("currency must be a 3-letter ISO-4217 code".to_string());
        }
        if let Some(loc) = &self.location {
            if !(-90.0..=90.0).contains(&loc.lat) || !(-180.0..=180.0).contains(&loc.lon) {
                return Err("location lat/lon out of range".to_string());
            }
        }
        Ok(())
    }
}

/// The public scoring verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionCheckResponse {
    pub transaction_id: String,
    pub risk_score: u8,
    pub risk_level: RiskLevel,
    pub recommendation: Recommendation,
    pub flags: Vec<Flag>,
    pub processing_time_ms: u64,
    pub cached: bool,
    pub consortium_match: bool,
}

/// Durable record of a scored transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub tenant_id: String,
    pub transaction_id: String,
    pub user_id: String,
    pub amount: f64,
    pub currency: String,
    pub transaction_type: TransactionType,
    pub vertical: Vertical,
    pub bvn_hash: HashedId,
    pub phone_hash: HashedId,
    pub email_hash: HashedId,
    pub device_hash: HashedId,
    pub ip_address: String,
    pub user_agent: String,
    pub device_fingerprint: Option<serde_json::Value>,
    pub location: Option<Location>,
    pub risk_score: u8,
    pub risk_level: RiskLevel,
    pub recommendation: Recommendation,
    pub flags: Vec<Flag>,
    pub consortium_match: bool,
    pub processing_time_ms: u64,
    pub cached: bool,
    pub actual_fraud: Option<bool>,
    pub feedback_applied: bool,
    pub feedback_timestamp: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TransactionRecord {
    /// Rebuild the client-visible response from the frozen record.
    pub fn to_response(&self, cached: bool, processing_time_ms: u64) -> TransactionCheckResponse {
        TransactionCheckResponse {
            transaction_id: self.transaction_id.clone(),
            risk_score: self.risk_score,
            risk_level: self.risk_level,
            recommendation: self.recommendation,
            flags: self.flags.clone(),
            processing_time_ms,
            cached,
            consortium_match: self.consortium_match,
        }
    }

    /// Non-empty hashed identifiers paired with their type tag, in the order
    /// the consortium and velocity layers expect.
    pub fn identifiers(&self) -> Vec<(&'static str, &HashedId)> {
        let mut out = Vec::with_capacity(4);
        for (kind, hash) in [
            ("bvn", &self.bvn_hash),
            ("phone", &self.phone_hash),
            ("email", &self.email_hash),
            ("device", &self.device_hash),
        ] {
            if !hash.is_empty() {
                out.push((kind, hash));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> TransactionCheckRequest {
        TransactionCheckRequest {
            transaction_id: "tx-001".to_string(),
            user_id: "user-1".to_string(),
            amount: 500.0,
            currency: "NGN".to_string(),
            transaction_type: TransactionType::Purchase,
            vertical: Vertical::Fintech,
            bvn: None,
            phone: None,
            email: None,
            device_id: None,
            ip_address: None,
            user_agent: None,
            device_fingerprint: None,
            location: None,
        }
    }

    #[test]
    fn validation_rejects_non_positive_amount() {
        let mut req = request();
        req.amount = 0.0;
        assert!(req.validate().is_err());
        req.amount = -10.0;
        assert!(req.validate().is_err());
        req.amount = f64::NAN;
        assert!(req.validate().is_err());
        req.amount = 0.01;
        assert!(req.validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_currency() {
        let mut req = request();
        req.currency = "NAIRA".to_string();
        assert!(req.validate().is_err());
        req.currency = "N1N".to_string();
        assert!(req.validate().is_err());
        req.currency = "usd".to_string();
        assert!(req.validate().is_ok());
    }

    #[test]
    fn risk_level_mapping_matches_thresholds() {
        assert_eq!(RiskLevel::from_score(0, 40, 70), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(39, 40, 70), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(40, 40, 70), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(69, 40, 70), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(70, 40, 70), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(84, 40, 70), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(85, 40, 70), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_score(100, 40, 70), RiskLevel::Critical);
    }

    #[test]
    fn recommendation_serializes_uppercase() {
        assert_eq!(
            serde_json::to_string(&Recommendation::Reject).unwrap(),
            "\"REJECT\""
        );
        let parsed: Recommendation = serde_json::from_str("\"APPROVE\"").unwrap();
        assert_eq!(parsed, Recommendation::Approve);
    }

    #[test]
    fn rule_accuracy_weight_stays_bounded_and_monotone() {
        let mut acc = RuleAccuracy::new(1, "HighVelocityDevice");
        assert_eq!(acc.weight, 1.0);

        // All wrong: accuracy 0, weight floors at 0.1.
        acc.record(true, false);
        acc.record(true, false);
        assert!(acc.weight >= 0.1 && acc.weight <= 2.0);
        assert!((acc.weight - 0.1).abs() < 1e-9);

        // Correct calls pull accuracy (and thus weight) back up.
        let before = acc.weight;
        acc.record(true, true);
        acc.record(false, false);
        assert!(acc.weight > before);
        assert!(acc.weight <= 2.0);
    }

    #[test]
    fn tenant_weights_normalise() {
        let mut tenant = Tenant {
            tenant_id: "t1".into(),
            name: "Test".into(),
            plan: "standard".into(),
            api_key_hash: String::new(),
            vertical: Vertical::Fintech,
            rate_limit_per_minute: 100,
            enabled_rule_ids: vec![],
            disabled_rule_ids: vec![],
            ml_enabled: false,
            rule_score_weight: 1.0,
            ml_weight: 1.0,
            consortium_weight: 0.0,
            webhook_url: None,
            webhook_secret: None,
            active: true,
        };
        let (r, m, c) = tenant.normalised_weights();
        assert!((r - 0.5).abs() < 1e-9);
        assert!((m - 0.5).abs() < 1e-9);
        assert!(c.abs() < 1e-9);

        tenant.rule_score_weight = 0.0;
        tenant.ml_weight = 0.0;
        assert_eq!(tenant.normalised_weights(), (0.5, 0.3, 0.2));
    }

    #[test]
    fn transaction_type_round_trips() {
        for t in ALL_TRANSACTION_TYPES {
            assert_eq!(TransactionType::from_str(t.as_str()), Some(t));
        }
        let json = serde_json::to_string(&TransactionType::LoanApplication).unwrap();
        assert_eq!(json, "\"loan_application\"");
    }
}
