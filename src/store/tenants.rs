//! Tenant Storage
//! Mission: resolve API keys to tenant records and keep per-tenant scoring
//! configuration durable

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::info;

use super::Database;
use crate::models::{Tenant, Vertical};

#[derive(Clone)]
pub struct TenantStore {
    db: Database,
}

impl TenantStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn find_by_api_key_hash(&self, api_key_hash: &str) -> Result<Option<Tenant>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT tenant_id, name, plan, api_key_hash, vertical, rate_limit_per_minute,
                    enabled_rule_ids, disabled_rule_ids, ml_enabled,
                    rule_score_weight, ml_weight, consortium_weight,
                    webhook_url, webhook_secret, active
             FROM tenants WHERE api_key_hash = ?1",
        )?;
        stmt.query_row(params![api_key_hash], row_to_tenant)
            .optional()
            .context("query tenant by api key hash")
    }

    pub async fn get(&self, tenant_id: &str) -> Result<Option<Tenant>> {
        let conn = self.db.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT tenant_id, name, plan, api_key_hash, vertical, rate_limit_per_minute,
                    enabled_rule_ids, disabled_rule_ids, ml_enabled,
                    rule_score_weight, ml_weight, consortium_weight,
                    webhook_url, webhook_secret, active
             FROM tenants WHERE tenant_id = ?1",
        )?;
        stmt.query_row(params![tenant_id], row_to_tenant)
            .optional()
            .context("query tenant by id")
    }

    pub async fn count(&self) -> Result<u64> {
        let conn = self.db.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM tenants", [], |r| r.get(0))?;
        Ok(count as u64)
    }

    pub async fn insert(&self, tenant: &Tenant, created_at: DateTime<Utc>) -> Result<()> {
        let conn = self.db.lock().await;
        conn.execute(
            "INSERT INTO tenants (tenant_id, name, plan, api_key_hash, vertical,
                                  rate_limit_per_minute, enabled_rule_ids, disabled_rule_ids,
                                  ml_enabled, rule_score_weight, ml_weight, consortium_weight,
                                  webhook_url, webhook_secret, active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                tenant.tenant_id,
                tenant.name,
                tenant.plan,
                tenant.api_key_hash,
                tenant.vertical.as_str(),
                tenant.rate_limit_per_minute,
                serde_json::to_string(&tenant.enabled_rule_ids)?,
                serde_json::to_string(&tenant.disabled_rule_ids)?,
                tenant.ml_enabled as i64,
                tenant.rule_score_weight,
                tenant.ml_weight,
                tenant.consortium_weight,
                tenant.webhook_url,
                tenant.webhook_secret,
                tenant.active as i64,
                created_at.to_rfc3339(),
            ],
        )
        .context("insert tenant")?;

        info!(tenant_id = %tenant.tenant_id, vertical = tenant.vertical.as_str(), "Tenant created");
        Ok(())
    }

    pub async fn set_active(&self, tenant_id: &str, active: bool) -> Result<bool> {
        let conn = self.db.lock().await;
        let changed = conn.execute(
            "UPDATE tenants SET active = ?2 WHERE tenant_id = ?1",
            params![tenant_id, active as i64],
        )?;
        Ok(changed > 0)
    }
}

fn row_to_tenant(row: &Row<'_>) -> rusqlite::Result<Tenant> {
    let vertical_str: String = row.get(4)?;
    let enabled_json: String = row.get(6)?;
    let disabled_json: String = row.get(7)?;
    Ok(Tenant {
        tenant_id: row.get(0)?,
        name: row.get(1)?,
        plan: row.get(2)?,
        api_key_hash: row.get(3)?,
        vertical: Vertical::from_str(&vertical_str).unwrap_or(Vertical::Fintech),
        rate_limit_per_minute: row.get::<_, i64>(5)? as u32,
        enabled_rule_ids: serde_json::from_str(&enabled_json).unwrap_or_default(),
        disabled_rule_ids: serde_json::from_str(&disabled_json).unwrap_or_default(),
        ml_enabled: row.get::<_, i64>(8)? != 0,
        rule_score_weight: row.get(9)?,
        ml_weight: row.get(10)?,
        consortium_weight: row.get(11)?,
        webhook_url: row.get(12)?,
        webhook_secret: row.get(13)?,
        active: row.get::<_, i64>(14)? != 0,
    })
}
