//! Transactional Store
//! Mission: durable, indexed record of transactions, tenants, rule metrics
//! and consortium aggregates

mod consortium;
mod db;
mod rule_accuracy;
mod tenants;
mod transactions;

pub use consortium::{ConsortiumInsights, ConsortiumStore};
pub use db::Database;
pub use rule_accuracy::RuleAccuracyStore;
pub use tenants::TenantStore;
pub use transactions::{
    DeviceHistory, DeviceHistoryEntry, FeedbackMark, InsertOutcome, TenantStats,
    TransactionStore,
};
