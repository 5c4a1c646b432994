//! API Routes
//! Mission: the `/api/v1` surface (scoring, feedback, lookups, insights)
//! behind auth and per-tenant rate limiting

pub mod handlers;

use axum::{
    middleware as axum_mw,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use crate::{auth, middleware, state::AppState};

/// Full application router. `/health` is unauthenticated and exempt from
/// rate limiting; everything under `/api/v1` requires an `X-API-Key`.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/check-transaction", post(handlers::check_transaction))
        .route(
            "/check-transactions-batch",
            post(handlers::check_transactions_batch),
        )
        .route("/transaction/:id", get(handlers::get_transaction))
        .route("/feedback", post(handlers::submit_feedback))
        .route("/stats", get(handlers::get_stats))
        .route("/transactions", get(handlers::list_transactions))
        .route("/client-info", get(handlers::client_info))
        .route("/consortium-insights", get(handlers::consortium_insights))
        // Layer order: auth resolves the tenant first, then the limiter
        // counts the request against it.
        .route_layer(axum_mw::from_fn_with_state(
            state.clone(),
            middleware::rate_limit_by_tenant,
        ))
        .route_layer(axum_mw::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api/v1", protected)
        .layer(CorsLayer::permissive())
        .layer(axum_mw::from_fn(middleware::request_logging))
        .with_state(state)
}
