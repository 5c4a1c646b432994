//! Scoring Orchestrator
//! Mission: the end-to-end pipeline, dedup through webhook, inside one
//! request budget

use metrics::counter;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{content_hash, CacheHit, ResultCache};
use crate::clock::Clock;
use crate::config::Config;
use crate::consortium::ConsortiumAggregator;
use crate::error::ApiError;
use crate::hashing::{HashedId, IdentityHasher};
use crate::kv::KvStore;
use crate::ml::MlScorer;
use crate::models::{
    Flag, Recommendation, RiskLevel, Severity, Tenant, TransactionCheckRequest,
    TransactionCheckResponse, TransactionRecord,
};
use crate::rules::{RuleContext, RuleEngine};
use crate::store::{DeviceHistory, InsertOutcome, TransactionStore};
use crate::velocity::{identifier_key, ip_key, VelocityTracker};
use crate::webhook::{WebhookDispatcher, WebhookEvent};

/// Device history rows fetched per request.
const DEVICE_HISTORY_LIMIT: usize = 10;
/// TTL for the IP→device association sets feeding IpDeviceSpread.
const IP_DEVICE_TTL: Duration = Duration::from_secs(86_400);

/// Everything the orchestrator needs, wired once at startup. No singletons;
/// tests build one of these over in-memory stores.
pub struct ScoringDeps {
    pub config: Arc<Config>,
    pub clock: Arc<dyn Clock>,
    pub kv: Arc<dyn KvStore>,
    pub transactions: TransactionStore,
    pub rules: Arc<RuleEngine>,
    pub ml: Arc<MlScorer>,
    pub consortium: ConsortiumAggregator,
    pub velocity: VelocityTracker,
    pub cache: ResultCache,
    pub webhooks: WebhookDispatcher,
}

pub struct ScoringEngine {
    deps: ScoringDeps,
    hasher: IdentityHasher,
}

impl ScoringEngine {
    pub fn new(deps: ScoringDeps) -> Self {
        Self {
            deps,
            hasher: IdentityHasher::new(),
        }
    }

    pub fn webhooks(&self) -> &WebhookDispatcher {
        &self.deps.webhooks
    }

    /// Score one validated request for an authenticated tenant.
    ///
    /// Signal failures degrade to neutral; the only hard error is a
    /// persistence failure, because a decision that cannot be durably
    /// recorded must not be returned.
    pub async fn score(
        &self,
        tenant: &Tenant,
        request: &TransactionCheckRequest,
    ) -> Result<TransactionCheckResponse, ApiError> {
        let started = Instant::now();
        let deadline = Duration::from_millis(self.deps.config.scoring_timeout_ms);
        counter!("scoring_requests_total", 1);

        // Hash PII up front; nothing raw goes further than this frame.
        let mut record = self.build_record(tenant, request);
        let chash = content_hash(&record);

        // Dedup: durable by transaction id, then KV by content.
        if let Some(hit) = self
            .deps
            .cache
            .lookup(&tenant.tenant_id, &record.transaction_id, &chash)
            .await
        {
            counter!("scoring_cache_hits_total", 1);
            let elapsed = started.elapsed().as_millis() as u64;
            return Ok(match hit {
                CacheHit::Transaction(stored) => stored.to_response(true, elapsed),
                CacheHit::Content(mut response) => {
                    response.cached = true;
                    response.processing_time_ms = elapsed;
                    response
                }
            });
        }

        // Context fan-in: independent reads, each degrading on failure.
        let ctx = self.assemble_context(tenant, &record).await;
        let consortium = self
            .deps
            .consortium
            .signals(&record.identifiers())
            .await;

        // Rules, then ML (tenant opt-in and process-wide artifact gate).
        let evaluation = self.deps.rules.evaluate(&record, &ctx, tenant);
        let ml_p = if tenant.ml_enabled {
            self.deps.ml.predict(&record, &ctx)
        } else {
            0.0
        };

        // Composite: normalised tenant weights over the three signals.
        let (w_r, w_m, w_c) = tenant.normalised_weights();
        let raw = w_r * evaluation.rule_score
            + 100.0 * w_m * ml_p
            + 100.0 * w_c * consortium.fraud_rate;
        let mut risk_score = raw.min(100.0).round().max(0.0) as u8;

        let mut flags = evaluation.flags;
        if consortium.matched {
            flags.push(Flag {
                rule_id: 0,
                rule_name: "ConsortiumMatch".to_string(),
                severity: Severity::High,
                message: format!(
                    "identifier reported by {} client(s), fraud rate {:.2}",
                    consortium.client_count, consortium.fraud_rate
                ),
                confidence: consortium.fraud_rate,
            });
        }

        // A rule-confirmed critical pattern cannot score below the high
        // threshold, whatever the weighted sum says.
        let has_critical = flags.iter().any(|f| f.severity == Severity::Critical);
        if has_critical {
            risk_score = risk_score.max(self.deps.config.risk_threshold_high);
        }

        let risk_level = RiskLevel::from_score(
            risk_score,
            self.deps.config.risk_threshold_medium,
            self.deps.config.risk_threshold_high,
        );
        let recommendation = if has_critical || risk_score >= self.deps.config.risk_threshold_high
        {
            Recommendation::Reject
        } else if risk_score >= self.deps.config.risk_threshold_medium {
            Recommendation::Review
        } else {
            Recommendation::Approve
        };

        // Refuse to decide past the request budget: a caller that has given
        // up must not observe side effects afterwards.
        if started.elapsed() >= deadline {
            warn!(
                tenant_id = %tenant.tenant_id,
                transaction_id = %record.transaction_id,
                "scoring deadline exceeded before persistence"
            );
            return Err(ApiError::DependencyUnavailable(
                "scoring deadline exceeded".to_string(),
            ));
        }

        record.risk_score = risk_score;
        record.risk_level = risk_level;
        record.recommendation = recommendation;
        record.flags = flags;
        record.consortium_match = consortium.matched;
        record.processing_time_ms = started.elapsed().as_millis() as u64;

        // Persist; losing the first-writer race returns the winner verbatim.
        match self.deps.transactions.insert(&record).await {
            Ok(InsertOutcome::Inserted) => {}
            Ok(InsertOutcome::AlreadyExists) => {
                let stored = self
                    .deps
                    .transactions
                    .get(&tenant.tenant_id, &record.transaction_id)
                    .await
                    .map_err(|e| ApiError::DependencyUnavailable(format!("{:#}", e)))?
                    .ok_or_else(|| {
                        ApiError::Internal("winner record vanished".to_string())
                    })?;
                return Ok(stored.to_response(true, started.elapsed().as_millis() as u64));
            }
            Err(e) => {
                return Err(ApiError::DependencyUnavailable(format!("{:#}", e)));
            }
        }

        self.bump_velocity(&record).await;

        let response = record.to_response(false, record.processing_time_ms);
        self.deps.cache.store(&chash, &response).await;

        if record.risk_level.is_notifiable() {
            self.notify(tenant, "transaction.high_risk", &response);
        }

        Ok(response)
    }

    fn build_record(
        &self,
        tenant: &Tenant,
        request: &TransactionCheckRequest,
    ) -> TransactionRecord {
        let hasher = &self.hasher;
        let hash_opt = |value: &Option<String>, f: &dyn Fn(&str) -> HashedId| match value {
            Some(raw) => f(raw),
            None => HashedId::empty(),
        };

        TransactionRecord {
            tenant_id: tenant.tenant_id.clone(),
            transaction_id: request.transaction_id.clone(),
            user_id: request.user_id.clone(),
            amount: request.amount,
            currency: request.currency.to_uppercase(),
            transaction_type: request.transaction_type,
            vertical: request.vertical,
            bvn_hash: hash_opt(&request.bvn, &|raw| hasher.hash(raw)),
            phone_hash: hash_opt(&request.phone, &|raw| hasher.hash_phone(raw)),
            email_hash: hash_opt(&request.email, &|raw| hasher.hash_email(raw)),
            device_hash: hash_opt(&request.device_id, &|raw| hasher.hash(raw)),
            ip_address: request.ip_address.clone().unwrap_or_default(),
            user_agent: request.user_agent.clone().unwrap_or_default(),
            device_fingerprint: request.device_fingerprint.clone(),
            location: request.location.clone(),
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
            created_at: self.deps.clock.now(),
        }
    }

    async fn assemble_context(&self, tenant: &Tenant, record: &TransactionRecord) -> RuleContext {
        let velocity = &self.deps.velocity;
        let read = |key: Option<String>| async move {
            match key {
                Some(key) => velocity.read(&key).await,
                None => Default::default(),
            }
        };

        let history_fut = async {
            match self
                .deps
                .transactions
                .device_history(&tenant.tenant_id, &record.device_hash, DEVICE_HISTORY_LIMIT)
                .await
            {
                Ok(history) => history,
                Err(e) => {
                    counter!("scoring_degraded_signals_total", 1);
                    warn!(error = %e, "device history read failed, degrading to empty");
                    DeviceHistory::default()
                }
            }
        };

        let spread_fut = async {
            match ip_key(&record.ip_address) {
                Some(key) => match self.deps.kv.scard(&format!("ipdevices:{}", key)).await {
                    Ok(count) => count.max(0) as u64,
                    Err(e) => {
                        counter!("scoring_degraded_signals_total", 1);
                        warn!(error = %e, "ip device spread read failed, degrading to 0");
                        0
                    }
                },
                None => 0,
            }
        };

        let (device, phone, email, bvn, ip, device_history, ip_device_count) = tokio::join!(
            read(identifier_key("device", &record.device_hash)),
            read(identifier_key("phone", &record.phone_hash)),
            read(identifier_key("email", &record.email_hash)),
            read(identifier_key("bvn", &record.bvn_hash)),
            read(ip_key(&record.ip_address)),
            history_fut,
            spread_fut,
        );

        RuleContext {
            device_velocity: device,
            phone_velocity: phone,
            email_velocity: email,
            bvn_velocity: bvn,
            ip_velocity: ip,
            device_history,
            ip_device_count,
            now: self.deps.clock.now(),
        }
    }

    /// Post-persist counter updates. Skipped entirely on cache hits.
    async fn bump_velocity(&self, record: &TransactionRecord) {
        let amount = Some(record.amount);
        for (kind, hash) in record.identifiers() {
            if let Some(key) = identifier_key(kind, hash) {
                self.deps.velocity.bump(&key, amount).await;
            }
        }
        if let Some(key) = ip_key(&record.ip_address) {
            self.deps.velocity.bump(&key, amount).await;
            if !record.device_hash.is_empty() {
                if let Err(e) = self
                    .deps
                    .kv
                    .sadd(
                        &format!("ipdevices:{}", key),
                        record.device_hash.as_str(),
                        IP_DEVICE_TTL,
                    )
                    .await
                {
                    warn!(error = %e, "ip device association failed");
                }
            }
        }
    }

    /// Fire-and-forget; enqueue never blocks the response.
    pub fn notify(&self, tenant: &Tenant, event_type: &str, response: &TransactionCheckResponse) {
        let (url, secret) = match (&tenant.webhook_url, &tenant.webhook_secret) {
            (Some(url), Some(secret)) => (url.clone(), secret.clone()),
            _ => return,
        };
        let data = match serde_json::to_value(response) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "webhook payload serialisation failed");
                return;
            }
        };
        debug!(
            tenant_id = %tenant.tenant_id,
            transaction_id = %response.transaction_id,
            event_type,
            "enqueueing webhook"
        );
        self.deps.webhooks.enqueue(WebhookEvent {
            event_id: Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            created_at: self.deps.clock.now(),
            tenant_id: tenant.tenant_id.clone(),
            url,
            secret,
            data,
        });
    }
}
