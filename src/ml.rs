//! ML Scorer
//! Mission: deterministic feature extraction plus in-process logistic
//! inference, failing closed whenever the artifact does not line up

use anyhow::{Context, Result};
use chrono::{Datelike, Timelike};
use serde::Deserialize;
use std::path::Path;
use tracing::{error, info, warn};

use crate::models::{TransactionRecord, ALL_TRANSACTION_TYPES};
use crate::rules::RuleContext;

/// Number of features the extractor produces. The artifact's weight vector
/// must match exactly or the scorer returns 0.
pub const FEATURE_COUNT: usize = 16 + ALL_TRANSACTION_TYPES.len();

/// Trained logistic model loaded from a JSON artifact:
/// `{"version": "...", "features": [...], "weights": [...], "bias": ...}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelArtifact {
    pub version: String,
    #[serde(default)]
    pub features: Vec<String>,
    pub weights: Vec<f64>,
    pub bias: f64,
}

#[derive(Clone)]
pub struct MlScorer {
    model: Option<ModelArtifact>,
}

impl MlScorer {
    /// Scorer with no model; every prediction is 0.
    pub fn disabled() -> Self {
        Self { model: None }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read model artifact {}", path.display()))?;
        let model: ModelArtifact =
            serde_json::from_str(&raw).context("parse model artifact")?;

        if model.weights.len() != FEATURE_COUNT {
            // Loaded but unusable; keep the process up and score 0.
            error!(
                version = %model.version,
                expected = FEATURE_COUNT,
                got = model.weights.len(),
                "model artifact feature count mismatch, ML disabled"
            );
            return Ok(Self::disabled());
        }

        info!(version = %model.version, features = FEATURE_COUNT, "ML model loaded");
        Ok(Self { model: Some(model) })
    }

    #[cfg(test)]
    pub fn from_artifact(model: ModelArtifact) -> Self {
        Self { model: Some(model) }
    }

    pub fn is_enabled(&self) -> bool {
        self.model.is_some()
    }

    /// Fraud probability in [0,1]. Side-effect-free; a shape mismatch or an
    /// absent model yields 0 rather than a wrong-shape prediction.
    pub fn predict(&self, tx: &TransactionRecord, ctx: &RuleContext) -> f64 {
        let model = match &self.model {
            Some(model) => model,
            None => return 0.0,
        };

        let features = extract_features(tx, ctx);
        if model.weights.len() != features.len() {
            warn!(
                version = %model.version,
                expected = features.len(),
                got = model.weights.len(),
                "feature count mismatch at inference, scoring 0"
            );
            return 0.0;
        }

        let z: f64 = model
            .weights
            .iter()
            .zip(features.iter())
            .map(|(w, x)| w * x)
            .sum::<f64>()
            + model.bias;
        sigmoid(z).clamp(0.0, 1.0)
    }
}

/// Feature vector in the fixed, versioned order:
/// amount, log1p(amount),
/// device counts (1m/10m/1h/24h), phone counts (1m/10m/1h/24h),
/// history size, history fraud count, history mean amount,
/// hour-of-day, day-of-week, late-night indicator,
/// then the transaction-type one-hot.
pub fn extract_features(tx: &TransactionRecord, ctx: &RuleContext) -> Vec<f64> {
    let mut features = Vec::with_capacity(FEATURE_COUNT);

    features.push(tx.amount);
    features.push(tx.amount.ln_1p());

    let d = &ctx.device_velocity;
    features.extend([
        d.count_1m as f64,
        d.count_10m as f64,
        d.count_1h as f64,
        d.count_24h as f64,
    ]);
    let p = &ctx.phone_velocity;
    features.extend([
        p.count_1m as f64,
        p.count_10m as f64,
        p.count_1h as f64,
        p.count_24h as f64,
    ]);

    features.push(ctx.device_history.count() as f64);
    features.push(ctx.device_history.fraud_count() as f64);
    features.push(ctx.device_history.mean_amount());

    let hour = ctx.now.hour();
    features.push(hour as f64);
    features.push(ctx.now.weekday().num_days_from_monday() as f64);
    features.push(if (2..=5).contains(&hour) { 1.0 } else { 0.0 });

    for t in ALL_TRANSACTION_TYPES {
        features.push(if tx.transaction_type == t { 1.0 } else { 0.0 });
    }

    features
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}
