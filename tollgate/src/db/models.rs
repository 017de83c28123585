//! Storage-facing entity records.
//!
//! These are the shapes the storage collaborator hands back; they are
//! storage-agnostic (plain serde structs). Backend-specific row types live
//! with their backend (see `postgres.rs`).

use crate::auth::principal::Role;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A stored credential, addressed by the one-way hash of its secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    /// SHA-256 hex of the raw secret. The secret itself is never stored.
    pub key_hash: String,
    pub alias: Option<String>,
    pub user_id: Option<String>,
    pub team_id: Option<String>,
    pub roles: Vec<Role>,
    pub scopes: Vec<String>,
    /// Tool allow-list attached directly to the key. `None` means unrestricted.
    pub allowed_tools: Option<Vec<String>>,
    /// Model allow-list. `None` means every model the deployment serves.
    pub allowed_models: Option<Vec<String>>,
    pub budget_id: Option<String>,
    pub rpm_limit: Option<u32>,
    pub tpm_limit: Option<u64>,
    pub blocked: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: String,
    pub email: Option<String>,
    pub team_id: Option<String>,
    pub roles: Vec<Role>,
    pub budget_id: Option<String>,
    pub blocked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamRecord {
    pub team_id: String,
    pub org_id: Option<String>,
    /// Team-wide tool allow-list, enforced in addition to any key-level list.
    pub allowed_tools: Option<Vec<String>>,
    pub budget_id: Option<String>,
    pub blocked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgRecord {
    pub org_id: String,
    pub budget_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndCustomerRecord {
    pub end_customer_id: String,
    pub budget_id: Option<String>,
}

/// Per-model sub-budget inside a [`BudgetRecord`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelBudget {
    pub max_amount: Decimal,
    pub spent: Decimal,
}

/// A spend budget. Loaded from storage, cached briefly, and compared against
/// in memory; persistence of new spend happens asynchronously through the
/// spend writer, never here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetRecord {
    pub budget_id: String,
    /// Hard ceiling. `None` means the budget only tracks spend.
    pub max_amount: Option<Decimal>,
    /// Crossing this emits a warning event but does not block the call.
    pub soft_threshold: Option<Decimal>,
    /// Spend accumulated since the last reset. Monotonically non-decreasing
    /// between resets.
    pub spent: Decimal,
    /// When the current period rolls over, if the budget is periodic.
    pub budget_reset_at: Option<DateTime<Utc>>,
    pub reset_period_secs: Option<i64>,
    /// Optional per-model sub-budgets, keyed by model name.
    #[serde(default)]
    pub model_budgets: HashMap<String, ModelBudget>,
}

impl BudgetRecord {
    /// Spend counted against the ceiling right now. A budget whose reset time
    /// has passed counts as zero until storage rolls the period over.
    pub fn effective_spent(&self, now: DateTime<Utc>) -> Decimal {
        match self.budget_reset_at {
            Some(reset_at) if reset_at <= now => Decimal::ZERO,
            _ => self.spent,
        }
    }
}
