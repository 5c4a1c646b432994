//! Sentinel - Real-Time Fraud Scoring Service
//! Mission: score financial transactions in tens of milliseconds with rules,
//! ML and the cross-tenant consortium, and keep learning from feedback

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

use sentinel_backend::{
    api,
    clock::{Clock, SystemClock},
    config::Config,
    hashing::api_key_digest,
    kv::{KvStore, MemoryKv, RedisKv},
    ml::MlScorer,
    models::{Tenant, Vertical},
    state::AppState,
};

#[derive(Parser, Debug)]
#[command(name = "sentinel", about = "Real-time fraud scoring service")]
struct Args {
    /// Override the listen port from the environment.
    #[arg(long)]
    port: Option<u16>,
}

/// Sweep interval for the in-memory KV fallback.
const MEMORY_KV_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sentinel_backend=info,info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::from_env().context("load configuration")?;
    if let Some(port) = args.port {
        config.port = port;
    }
    let config = Arc::new(config);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // C1: Redis when configured, in-process KV otherwise.
    let kv: Arc<dyn KvStore> = match &config.redis_url {
        Some(url) => Arc::new(RedisKv::connect(url).await?),
        None => {
            warn!("REDIS_URL not set, using the in-process KV store (single node only)");
            let memory = Arc::new(MemoryKv::new(clock.clone()));
            spawn_memory_purge(memory.clone());
            memory
        }
    };

    // C5: model artifact is optional; absence disables ML process-wide.
    let ml = match &config.ml_model_path {
        Some(path) => MlScorer::from_file(std::path::Path::new(path))
            .with_context(|| format!("load ML model from {}", path))?,
        None => {
            info!("ML_MODEL_PATH not set, ML scoring disabled");
            MlScorer::disabled()
        }
    };

    let (state, learner, feedback_rx) =
        AppState::initialise(config.clone(), clock, kv, ml).await?;

    seed_dev_tenant(&state).await?;

    learner.spawn(feedback_rx);
    state.webhooks.spawn_workers(config.webhook_workers);
    info!(
        workers = config.webhook_workers,
        queue = config.webhook_queue_capacity,
        "webhook dispatcher running"
    );

    let app = api::router(state.clone());
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    info!("🛡️ Sentinel listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    state.webhooks.shutdown();
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to install ctrl-c handler");
        return;
    }
    info!("shutdown signal received");
}

fn spawn_memory_purge(memory: Arc<MemoryKv>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MEMORY_KV_PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            memory.purge_expired();
        }
    });
}

/// First boot on an empty database: create one tenant and print its API key
/// exactly once so local development can start immediately.
async fn seed_dev_tenant(state: &AppState) -> Result<()> {
    if state.tenants.count().await? > 0 {
        return Ok(());
    }

    let api_key = format!("sk_test_{}", Uuid::new_v4().simple());
    let tenant = Tenant {
        tenant_id: format!("tn_{}", Uuid::new_v4().simple()),
        name: "Development".to_string(),
        plan: "dev".to_string(),
        api_key_hash: api_key_digest(&state.config.secret_key, &api_key),
        vertical: Vertical::Fintech,
        rate_limit_per_minute: state.config.default_rate_limit_per_minute,
        enabled_rule_ids: vec![],
        disabled_rule_ids: vec![],
        ml_enabled: false,
        rule_score_weight: 0.5,
        ml_weight: 0.3,
        consortium_weight: 0.2,
        webhook_url: None,
        webhook_secret: None,
        active: true,
    };
    state.tenants.insert(&tenant, state.clock.now()).await?;

    info!(tenant_id = %tenant.tenant_id, "🔐 Development tenant created");
    warn!("Development API key (shown once): {}", api_key);
    warn!("⚠️  Create real tenants before exposing this service");
    Ok(())
}
