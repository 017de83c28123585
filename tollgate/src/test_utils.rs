//! Shared fixtures for integration-style tests (available with the
//! `test-utils` feature).

use crate::auth::principal::Role;
use crate::crypto::hash_secret;
use crate::db::models::{
    BudgetRecord, EndCustomerRecord, KeyRecord, OrgRecord, TeamRecord, UserRecord,
};
use crate::db::MemoryStorage;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;

pub const TEST_SECRET: &str = "sk-fixture-secret";
pub const TEST_END_CUSTOMER: &str = "cust-7";

pub fn budget_fixture(id: &str, spent: i64, max: Option<i64>) -> BudgetRecord {
    BudgetRecord {
        budget_id: id.to_string(),
        max_amount: max.map(|m| Decimal::new(m, 0)),
        soft_threshold: None,
        spent: Decimal::new(spent, 0),
        budget_reset_at: None,
        reset_period_secs: None,
        model_budgets: Default::default(),
    }
}

pub fn key_fixture(secret: &str) -> KeyRecord {
    KeyRecord {
        key_hash: hash_secret(secret),
        alias: Some("fixture".to_string()),
        user_id: Some("u-1".to_string()),
        team_id: None,
        roles: vec![],
        scopes: vec![],
        allowed_tools: None,
        allowed_models: None,
        budget_id: Some("b-key".to_string()),
        rpm_limit: None,
        tpm_limit: None,
        blocked: false,
        expires_at: None,
        created_at: Utc::now(),
    }
}

/// A fully linked identity graph behind [`TEST_SECRET`]:
/// org `o-1` -> team `t-1` -> user `u-1` -> key, each layer carrying its own
/// budget, plus end customer [`TEST_END_CUSTOMER`]. The key budget has a 100
/// ceiling; every outer layer allows 1000.
pub async fn seeded_graph() -> Arc<MemoryStorage> {
    let storage = Arc::new(MemoryStorage::new());
    storage.seed_key(key_fixture(TEST_SECRET)).await;
    storage
        .seed_user(UserRecord {
            user_id: "u-1".to_string(),
            email: Some("u-1@example.com".to_string()),
            team_id: Some("t-1".to_string()),
            roles: vec![Role::Customer],
            budget_id: Some("b-user".to_string()),
            blocked: false,
        })
        .await;
    storage
        .seed_team(TeamRecord {
            team_id: "t-1".to_string(),
            org_id: Some("o-1".to_string()),
            allowed_tools: None,
            budget_id: Some("b-team".to_string()),
            blocked: false,
        })
        .await;
    storage
        .seed_org(OrgRecord {
            org_id: "o-1".to_string(),
            budget_id: Some("b-org".to_string()),
        })
        .await;
    storage
        .seed_end_customer(EndCustomerRecord {
            end_customer_id: TEST_END_CUSTOMER.to_string(),
            budget_id: Some("b-cust".to_string()),
        })
        .await;

    storage.seed_budget(budget_fixture("b-key", 0, Some(100))).await;
    storage.seed_budget(budget_fixture("b-user", 0, Some(1000))).await;
    storage.seed_budget(budget_fixture("b-team", 0, Some(1000))).await;
    storage.seed_budget(budget_fixture("b-org", 0, Some(1000))).await;
    storage.seed_budget(budget_fixture("b-cust", 0, Some(1000))).await;
    storage
}
