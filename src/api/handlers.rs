//! Endpoint handlers for the `/api/v1` surface.

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::error::ApiError;
use crate::models::{
    Flag, Recommendation, RiskLevel, Tenant, TransactionCheckRequest, TransactionCheckResponse,
    TransactionRecord, TransactionType, Vertical,
};
use crate::state::AppState;
use crate::store::{ConsortiumInsights, TenantStats};

/// Hard ceiling on batch submissions.
const MAX_BATCH_SIZE: usize = 100;
/// Page-size ceiling for listings.
const MAX_PAGE_SIZE: usize = 200;

// ---------------------------------------------------------------------------
// Scoring

pub async fn check_transaction(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Json(request): Json<TransactionCheckRequest>,
) -> Result<Json<TransactionCheckResponse>, ApiError> {
    request.validate().map_err(ApiError::InvalidRequest)?;

    let budget = Duration::from_millis(state.config.scoring_timeout_ms);
    match tokio::time::timeout(budget, state.scoring.score(&tenant, &request)).await {
        Ok(result) => result.map(Json),
        Err(_) => {
            warn!(
                tenant_id = %tenant.tenant_id,
                transaction_id = %request.transaction_id,
                "scoring request cancelled at the deadline"
            );
            Err(ApiError::DependencyUnavailable(
                "scoring timed out".to_string(),
            ))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchCheckRequest {
    pub transactions: Vec<TransactionCheckRequest>,
}

#[derive(Debug, Serialize)]
pub struct BatchCheckResponse {
    pub results: Vec<TransactionCheckResponse>,
    pub total_processed: usize,
    pub processing_time_ms: u64,
}

pub async fn check_transactions_batch(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Json(batch): Json<BatchCheckRequest>,
) -> Result<Json<BatchCheckResponse>, ApiError> {
    if batch.transactions.is_empty() {
        return Err(ApiError::InvalidRequest(
            "batch must contain at least one transaction".to_string(),
        ));
    }
    if batch.transactions.len() > MAX_BATCH_SIZE {
        return Err(ApiError::InvalidRequest(format!(
            "batch size {} exceeds the limit of {}",
            batch.transactions.len(),
            MAX_BATCH_SIZE
        )));
    }
    for (index, request) in batch.transactions.iter().enumerate() {
        request
            .validate()
            .map_err(|msg| ApiError::InvalidRequest(format!("transaction[{}]: {}", index, msg)))?;
    }

    let started = Instant::now();
    let budget = Duration::from_millis(state.config.scoring_timeout_ms);
    let mut results = Vec::with_capacity(batch.transactions.len());

    // Sequential evaluation keeps per-item idempotency trivially intact;
    // an item that fails hard is skipped, the rest of the batch proceeds.
    for request in &batch.transactions {
        match tokio::time::timeout(budget, state.scoring.score(&tenant, request)).await {
            Ok(Ok(response)) => results.push(response),
            Ok(Err(e)) => {
                warn!(
                    tenant_id = %tenant.tenant_id,
                    transaction_id = %request.transaction_id,
                    error = %e,
                    "batch item failed"
                );
            }
            Err(_) => {
                warn!(
                    tenant_id = %tenant.tenant_id,
                    transaction_id = %request.transaction_id,
                    "batch item timed out"
                );
            }
        }
    }

    Ok(Json(BatchCheckResponse {
        total_processed: results.len(),
        results,
        processing_time_ms: started.elapsed().as_millis() as u64,
    }))
}

// ---------------------------------------------------------------------------
// Lookups

/// Stored transaction as returned by lookups; everything the tenant sent is
/// long since reduced to hashes.
#[derive(Debug, Serialize)]
pub struct TransactionDetail {
    pub transaction_id: String,
    pub user_id: String,
    pub amount: f64,
    pub currency: String,
    pub transaction_type: TransactionType,
    pub vertical: Vertical,
    pub risk_score: u8,
    pub risk_level: RiskLevel,
    pub recommendation: Recommendation,
    pub flags: Vec<Flag>,
    pub consortium_match: bool,
    pub processing_time_ms: u64,
    pub actual_fraud: Option<bool>,
    pub feedback_timestamp: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<TransactionRecord> for TransactionDetail {
    fn from(record: TransactionRecord) -> Self {
        Self {
            transaction_id: record.transaction_id,
            user_id: record.user_id,
            amount: record.amount,
            currency: record.currency,
            transaction_type: record.transaction_type,
            vertical: record.vertical,
            risk_score: record.risk_score,
            risk_level: record.risk_level,
            recommendation: record.recommendation,
            flags: record.flags,
            consortium_match: record.consortium_match,
            processing_time_ms: record.processing_time_ms,
            actual_fraud: record.actual_fraud,
            feedback_timestamp: record.feedback_timestamp,
            created_at: record.created_at,
        }
    }
}

pub async fn get_transaction(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Path(transaction_id): Path<String>,
) -> Result<Json<TransactionDetail>, ApiError> {
    let record = state
        .transactions
        .get(&tenant.tenant_id, &transaction_id)
        .await
        .map_err(|e| ApiError::DependencyUnavailable(format!("{:#}", e)))?
        .ok_or_else(|| ApiError::NotFound("Transaction".to_string()))?;
    Ok(Json(record.into()))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub risk_level: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub transactions: Vec<TransactionDetail>,
    pub count: usize,
    pub limit: usize,
    pub offset: usize,
}

pub async fn list_transactions(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, ApiError> {
    let limit = query.limit.unwrap_or(50).clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0);
    let risk_level = match &query.risk_level {
        Some(raw) => Some(RiskLevel::from_str(raw).ok_or_else(|| {
            ApiError::InvalidRequest(format!("unknown risk_level '{}'", raw))
        })?),
        None => None,
    };

    let records = state
        .transactions
        .list(&tenant.tenant_id, limit, offset, risk_level)
        .await
        .map_err(|e| ApiError::DependencyUnavailable(format!("{:#}", e)))?;

    let transactions: Vec<TransactionDetail> =
        records.into_iter().map(TransactionDetail::from).collect();
    Ok(Json(ListResponse {
        count: transactions.len(),
        transactions,
        limit,
        offset,
    }))
}

// ---------------------------------------------------------------------------
// Feedback

#[derive(Debug, Deserialize)]
pub struct FeedbackBody {
    pub transaction_id: String,
    pub actual_fraud: bool,
    #[serde(default)]
    #[allow(dead_code)]
    pub notes: Option<String>,
}

pub async fn submit_feedback(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Json(body): Json<FeedbackBody>,
) -> Result<Json<crate::feedback::FeedbackAck>, ApiError> {
    if body.transaction_id.trim().is_empty() {
        return Err(ApiError::InvalidRequest(
            "transaction_id must not be empty".to_string(),
        ));
    }
    let ack = state
        .feedback
        .submit(&tenant, &body.transaction_id, body.actual_fraud)
        .await?;
    Ok(Json(ack))
}

// ---------------------------------------------------------------------------
// Stats & tenant info

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    pub days: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub days: i64,
    #[serde(flatten)]
    pub stats: TenantStats,
}

pub async fn get_stats(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<StatsResponse>, ApiError> {
    let days = query.days.unwrap_or(7);
    if !(1..=90).contains(&days) {
        return Err(ApiError::Unprocessable(
            "days must be between 1 and 90".to_string(),
        ));
    }

    let since = state.clock.now() - ChronoDuration::days(days);
    let stats = state
        .transactions
        .stats_since(&tenant.tenant_id, since)
        .await
        .map_err(|e| ApiError::DependencyUnavailable(format!("{:#}", e)))?;
    Ok(Json(StatsResponse { days, stats }))
}

#[derive(Debug, Serialize)]
pub struct ClientInfoResponse {
    pub tenant_id: String,
    pub name: String,
    pub plan: String,
    pub vertical: Vertical,
    pub rate_limit_per_minute: u32,
    pub ml_enabled: bool,
    pub calls_today: i64,
}

pub async fn client_info(
    State(state): State<AppState>,
    Extension(tenant): Extension<Tenant>,
) -> Result<Json<ClientInfoResponse>, ApiError> {
    let day = state.clock.now().format("%Y%m%d");
    let counter_key = format!("calls:{}:{}", tenant.tenant_id, day);
    let calls_today = state.kv.get_int(&counter_key).await.ok().flatten().unwrap_or(0);

    Ok(Json(ClientInfoResponse {
        tenant_id: tenant.tenant_id,
        name: tenant.name,
        plan: tenant.plan,
        vertical: tenant.vertical,
        rate_limit_per_minute: tenant.rate_limit_per_minute,
        ml_enabled: tenant.ml_enabled,
        calls_today,
    }))
}

pub async fn consortium_insights(
    State(state): State<AppState>,
) -> Result<Json<ConsortiumInsights>, ApiError> {
    let insights = state
        .consortium_store
        .insights()
        .await
        .map_err(|e| ApiError::DependencyUnavailable(format!("{:#}", e)))?;
    Ok(Json(insights))
}

// ---------------------------------------------------------------------------
// Health

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let db_up = state.db.ping().await.is_ok();
    let kv_up = state.kv.ping().await.is_ok();
    let status = if db_up && kv_up { "ok" } else { "degraded" };

    (
        StatusCode::OK,
        Json(json!({
            "status": status,
            "database": if db_up { "up" } else { "down" },
            "cache": if kv_up { "up" } else { "down" },
        })),
    )
}
