//! Application state.
//!
//! One explicit dependency struct wired at startup and cloned into every
//! handler. The only process-wide singleton is the immutable `Config`.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::cache::ResultCache;
use crate::clock::Clock;
use crate::config::Config;
use crate::consortium::ConsortiumAggregator;
use crate::feedback::{feedback_channel, FeedbackEvent, FeedbackService, Learner};
use crate::kv::KvStore;
use crate::ml::MlScorer;
use crate::rules::{RuleEngine, RuleWeights};
use crate::scoring::{ScoringDeps, ScoringEngine};
use crate::store::{
    ConsortiumStore, Database, RuleAccuracyStore, TenantStore, TransactionStore,
};
use crate::velocity::VelocityTracker;
use crate::webhook::WebhookDispatcher;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub clock: Arc<dyn Clock>,
    pub kv: Arc<dyn KvStore>,
    pub db: Database,
    pub tenants: TenantStore,
    pub transactions: TransactionStore,
    pub rule_accuracy: RuleAccuracyStore,
    pub consortium_store: ConsortiumStore,
    pub scoring: Arc<ScoringEngine>,
    pub feedback: FeedbackService,
    pub webhooks: WebhookDispatcher,
    pub rule_weights: RuleWeights,
}

impl AppState {
    /// Wire every component over the given stores. Returns the state plus
    /// the learner and its channel; the caller decides when to spawn them
    /// (the binary does, most tests drive the learner inline).
    pub async fn initialise(
        config: Arc<Config>,
        clock: Arc<dyn Clock>,
        kv: Arc<dyn KvStore>,
        ml: MlScorer,
    ) -> Result<(Self, Learner, mpsc::Receiver<FeedbackEvent>)> {
        let db = Database::open(&config.database_path).context("open database")?;
        let tenants = TenantStore::new(db.clone());
        let transactions = TransactionStore::new(db.clone());
        let rule_accuracy = RuleAccuracyStore::new(db.clone());
        let consortium_store = ConsortiumStore::new(db.clone());

        // Seed the live weight map from whatever the learner wrote before
        // the last restart.
        let rule_weights: RuleWeights =
            Arc::new(RwLock::new(rule_accuracy.weights().await.unwrap_or_default()));

        let consortium =
            ConsortiumAggregator::new(consortium_store.clone(), config.enable_consortium);
        let velocity = VelocityTracker::new(kv.clone());
        let cache = ResultCache::new(
            kv.clone(),
            transactions.clone(),
            Duration::from_secs(config.cache_ttl_secs),
        );
        let webhooks = WebhookDispatcher::new(config.webhook_queue_capacity);

        let scoring = Arc::new(ScoringEngine::new(ScoringDeps {
            config: config.clone(),
            clock: clock.clone(),
            kv: kv.clone(),
            transactions: transactions.clone(),
            rules: Arc::new(RuleEngine::new(rule_weights.clone())),
            ml: Arc::new(ml),
            consortium: consortium.clone(),
            velocity,
            cache,
            webhooks: webhooks.clone(),
        }));

        let (feedback_tx, feedback_rx) = feedback_channel();
        let feedback = FeedbackService::new(
            transactions.clone(),
            clock.clone(),
            feedback_tx,
            webhooks.clone(),
        );
        let learner = Learner::new(
            rule_accuracy.clone(),
            consortium,
            rule_weights.clone(),
            clock.clone(),
        );

        let state = Self {
            config,
            clock,
            kv,
            db,
            tenants,
            transactions,
            rule_accuracy,
            consortium_store,
            scoring,
            feedback,
            webhooks,
            rule_weights,
        };
        Ok((state, learner, feedback_rx))
    }
}
