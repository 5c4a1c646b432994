//! Per-rule accuracy metrics.
//!
//! Written only by the learner task; the rule engine reads a weight snapshot
//! loaded from here at startup and refreshed after each feedback event.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::collections::HashMap;

use super::Database;
use crate::models::RuleAccuracy;

#[derive(Clone)]
pub struct RuleAccuracyStore {
    db: Database,
}

impl RuleAccuracyStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get(&self, rule_id: u32) -> Result<Option<RuleAccuracy>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT rule_id, rule_name, true_positives, false_positives,
                    true_negatives, false_negatives, precision, recall, accuracy, weight
             FROM rule_accuracy WHERE rule_id = ?1",
        )?;
        stmt.query_row(params![rule_id], row_to_accuracy)
            .optional()
            .context("query rule accuracy")
    }

    pub async fn upsert(&self, acc: &RuleAccuracy, at: DateTime<Utc>) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO rule_accuracy (rule_id, rule_name, true_positives, false_positives,
                                        true_negatives, false_negatives, precision, recall,
                                        accuracy, weight, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(rule_id) DO UPDATE SET
                rule_name = excluded.rule_name,
                true_positives = excluded.true_positives,
                false_positives = excluded.false_positives,
                true_negatives = excluded.true_negatives,
                false_negatives = excluded.false_negatives,
                precision = excluded.precision,
                recall = excluded.recall,
                accuracy = excluded.accuracy,
                weight = excluded.weight,
                updated_at = excluded.updated_at",
            params![
                acc.rule_id,
                acc.rule_name,
                acc.true_positives as i64,
                acc.false_positives as i64,
                acc.true_negatives as i64,
                acc.false_negatives as i64,
                acc.precision,
                acc.recall,
                acc.accuracy,
                acc.weight,
                at.to_rfc3339(),
            ],
        )
        .context("upsert rule accuracy")?;
        Ok(())
    }

    pub async fn all(&self) -> Result<Vec<RuleAccuracy>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT rule_id, rule_name, true_positives, false_positives,
                    true_negatives, false_negatives, precision, recall, accuracy, weight
             FROM rule_accuracy ORDER BY rule_id",
        )?;
        let rows = stmt
            .query_map([], row_to_accuracy)?
            .collect::<rusqlite::Result<Vec<_>>>();
        rows.context("list rule accuracy")
    }

    /// Weight snapshot keyed by rule id, for the engine's live map.
    pub async fn weights(&self) -> Result<HashMap<u32, f64>> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .map(|a| (a.rule_id, a.weight))
            .collect())
    }
}

fn row_to_accuracy(row: &Row<'_>) -> rusqlite::Result<RuleAccuracy> {
    Ok(RuleAccuracy {
        rule_id: row.get::<_, i64>(0)? as u32,
        rule_name: row.get(1)?,
        true_positives: row.get::<_, i64>(2)? as u64,
        false_positives: row.get::<_, i64>(3)? as u64,
        true_negatives: row.get::<_, i64>(4)? as u64,
        false_negatives: row.get::<_, i64>(5)? as u64,
        precision: row.get(6)?,
        recall: row.get(7)?,
        accuracy: row.get(8)?,
        weight: row.get(9)?,
    })
}
