//! Rate limiting middleware.
//!
//! Fixed-window counter per tenant against the shared KV store, so every
//! replica of the service enforces one combined limit. Runs after auth (it
//! needs the resolved tenant) and before the handler.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::time::Duration;
use tracing::warn;

use crate::error::ApiError;
use crate::models::Tenant;
use crate::state::AppState;

/// Window keys live a little past their minute so a slow reader never finds
/// the counter gone mid-window.
const WINDOW_TTL: Duration = Duration::from_secs(120);
const WINDOW_SECS: i64 = 60;

pub async fn rate_limit_by_tenant(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let tenant = match request.extensions().get::<Tenant>() {
        Some(tenant) => tenant.clone(),
        // Auth did not run (misconfigured route); let the request through
        // rather than inventing a tenant to count against.
        None => return next.run(request).await,
    };

    let limit = if tenant.rate_limit_per_minute > 0 {
        tenant.rate_limit_per_minute as i64
    } else {
        state.config.default_rate_limit_per_minute as i64
    };

    let now = state.clock.unix_seconds();
    let bucket = now / WINDOW_SECS;
    let reset_secs = (WINDOW_SECS - (now % WINDOW_SECS)).max(1) as u64;
    let key = format!("ratelimit:{}:{}", tenant.tenant_id, bucket);

    let count = match state.kv.incr(&key, 1, WINDOW_TTL).await {
        Ok(count) => count,
        Err(e) => {
            // KV down: fail open. Scoring still works and the limiter
            // recovers with the store.
            warn!(tenant_id = %tenant.tenant_id, error = %e, "rate limit counter unavailable");
            return next.run(request).await;
        }
    };

    if count > limit {
        warn!(
            tenant_id = %tenant.tenant_id,
            count,
            limit,
            "rate limit exceeded"
        );
        let mut response = ApiError::RateLimited {
            retry_after_secs: reset_secs,
        }
        .into_response();
        set_limit_headers(&mut response, limit, 0, reset_secs);
        return response;
    }

    let remaining = (limit - count).max(0);
    let mut response = next.run(request).await;
    set_limit_headers(&mut response, limit, remaining, reset_secs);
    response
}

fn set_limit_headers(response: &mut Response, limit: i64, remaining: i64, reset_secs: u64) {
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&limit.to_string()) {
        headers.insert("X-RateLimit-Limit", v);
    }
    if let Ok(v) = HeaderValue::from_str(&remaining.to_string()) {
        headers.insert("X-RateLimit-Remaining", v);
    }
    if let Ok(v) = HeaderValue::from_str(&reset_secs.to_string()) {
        headers.insert("X-RateLimit-Reset", v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::kv::{KvStore, MemoryKv};
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use std::sync::Arc;

    // The windowing math itself, without the axum plumbing.
    async fn check(kv: &dyn KvStore, clock: &dyn Clock, tenant: &str, limit: i64) -> bool {
        let now = clock.unix_seconds();
        let key = format!("ratelimit:{}:{}", tenant, now / WINDOW_SECS);
        let count = kv.incr(&key, 1, WINDOW_TTL).await.unwrap();
        count <= limit
    }

    #[tokio::test]
    async fn window_rolls_over_each_minute() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap());
        let kv = MemoryKv::new(Arc::new(clock.clone()));

        for _ in 0..5 {
            assert!(check(&kv, &clock, "t1", 5).await);
        }
        assert!(!check(&kv, &clock, "t1", 5).await);

        // Next minute bucket starts fresh.
        clock.advance(ChronoDuration::seconds(60));
        assert!(check(&kv, &clock, "t1", 5).await);
    }

    #[tokio::test]
    async fn tenants_have_independent_budgets() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap());
        let kv = MemoryKv::new(Arc::new(clock.clone()));

        assert!(check(&kv, &clock, "t1", 1).await);
        assert!(!check(&kv, &clock, "t1", 1).await);
        assert!(check(&kv, &clock, "t2", 1).await);
    }
}
