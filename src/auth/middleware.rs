//! Authentication Middleware
//! Mission: resolve `X-API-Key` to a tenant record before anything else runs

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::hashing::api_key_digest;
use crate::state::AppState;

/// Daily call counters outlive the day they count by one more, so
/// `/client-info` can still show yesterday around midnight.
const DAILY_COUNTER_TTL: Duration = Duration::from_secs(48 * 3_600);

/// Rejects unknown keys with 401 and inactive tenants with 403; on success
/// the tenant record rides the request extensions so handlers and the rate
/// limiter never re-query it.
pub async fn require_api_key(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let api_key = req
        .headers()
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ApiError::Unauthorized)?;

    let digest = api_key_digest(&state.config.secret_key, &api_key);
    let tenant = state
        .tenants
        .find_by_api_key_hash(&digest)
        .await
        .map_err(|e| ApiError::DependencyUnavailable(format!("{:#}", e)))?
        .ok_or(ApiError::Unauthorized)?;

    if !tenant.active {
        warn!(tenant_id = %tenant.tenant_id, "inactive tenant rejected");
        return Err(ApiError::Forbidden);
    }

    // Best-effort daily call counter for /client-info.
    let day = state.clock.now().format("%Y%m%d");
    let counter_key = format!("calls:{}:{}", tenant.tenant_id, day);
    if let Err(e) = state.kv.incr(&counter_key, 1, DAILY_COUNTER_TTL).await {
        debug!(error = %e, "daily call counter bump failed");
    }

    req.extensions_mut().insert(tenant);
    Ok(next.run(req).await)
}
