//! In-process engine for the [`Storage`](super::store::Storage) contract.
//!
//! Backs tests and embedded single-node runs. Semantics mirror the Postgres
//! engine where callers can observe them: duplicate key inserts fail at the
//! write with a unique violation, and spend commits are additive upserts.

use crate::db::errors::{DbError, Result};
use crate::db::models::{
    BudgetRecord, EndCustomerRecord, KeyRecord, OrgRecord, TeamRecord, UserRecord,
};
use crate::db::store::{IdentityStore, SpendStore};
use crate::spend::{DailySpendDelta, DailySpendKey};
use crate::types::EntityKind;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct MemoryStorage {
    keys: RwLock<HashMap<String, KeyRecord>>,
    users: RwLock<HashMap<String, UserRecord>>,
    teams: RwLock<HashMap<String, TeamRecord>>,
    orgs: RwLock<HashMap<String, OrgRecord>>,
    end_customers: RwLock<HashMap<String, EndCustomerRecord>>,
    budgets: RwLock<HashMap<String, BudgetRecord>>,
    entity_totals: RwLock<HashMap<(EntityKind, String), Decimal>>,
    daily_spend: RwLock<HashMap<DailySpendKey, DailySpendDelta>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    // Seeding helpers for fixtures. These overwrite unconditionally; the
    // race-sensitive path is `insert_key` below.

    pub async fn seed_key(&self, record: KeyRecord) {
        self.keys.write().await.insert(record.key_hash.clone(), record);
    }

    pub async fn seed_user(&self, record: UserRecord) {
        self.users.write().await.insert(record.user_id.clone(), record);
    }

    pub async fn seed_team(&self, record: TeamRecord) {
        self.teams.write().await.insert(record.team_id.clone(), record);
    }

    pub async fn seed_org(&self, record: OrgRecord) {
        self.orgs.write().await.insert(record.org_id.clone(), record);
    }

    pub async fn seed_end_customer(&self, record: EndCustomerRecord) {
        self.end_customers
            .write()
            .await
            .insert(record.end_customer_id.clone(), record);
    }

    pub async fn seed_budget(&self, record: BudgetRecord) {
        self.budgets.write().await.insert(record.budget_id.clone(), record);
    }

    /// Observed long-lived total for one entity, for test assertions.
    pub async fn entity_total(&self, kind: EntityKind, entity_id: &str) -> Decimal {
        self.entity_totals
            .read()
            .await
            .get(&(kind, entity_id.to_string()))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Observed daily aggregate row, for test assertions.
    pub async fn daily_row(&self, key: &DailySpendKey) -> Option<DailySpendDelta> {
        self.daily_spend.read().await.get(key).cloned()
    }
}

#[async_trait]
impl IdentityStore for MemoryStorage {
    async fn find_key_by_hash(&self, key_hash: &str) -> Result<Option<KeyRecord>> {
        Ok(self.keys.read().await.get(key_hash).cloned())
    }

    async fn find_user(&self, user_id: &str) -> Result<Option<UserRecord>> {
        Ok(self.users.read().await.get(user_id).cloned())
    }

    async fn find_team(&self, team_id: &str) -> Result<Option<TeamRecord>> {
        Ok(self.teams.read().await.get(team_id).cloned())
    }

    async fn find_org(&self, org_id: &str) -> Result<Option<OrgRecord>> {
        Ok(self.orgs.read().await.get(org_id).cloned())
    }

    async fn find_end_customer(
        &self,
        end_customer_id: &str,
    ) -> Result<Option<EndCustomerRecord>> {
        Ok(self.end_customers.read().await.get(end_customer_id).cloned())
    }

    async fn insert_key(&self, record: &KeyRecord) -> Result<()> {
        let mut keys = self.keys.write().await;
        if keys.contains_key(&record.key_hash) {
            return Err(DbError::UniqueViolation {
                constraint: Some("gateway_keys_key_hash_key".to_string()),
                table: Some("gateway_keys".to_string()),
                message: "duplicate key value violates unique constraint".to_string(),
                conflicting_value: Some(record.key_hash.clone()),
            });
        }
        keys.insert(record.key_hash.clone(), record.clone());
        Ok(())
    }

    async fn upsert_user(&self, record: &UserRecord) -> Result<()> {
        self.users
            .write()
            .await
            .insert(record.user_id.clone(), record.clone());
        Ok(())
    }

    async fn upsert_team(&self, record: &TeamRecord) -> Result<()> {
        self.teams
            .write()
            .await
            .insert(record.team_id.clone(), record.clone());
        Ok(())
    }
}

#[async_trait]
impl SpendStore for MemoryStorage {
    async fn find_budget(&self, budget_id: &str) -> Result<Option<BudgetRecord>> {
        Ok(self.budgets.read().await.get(budget_id).cloned())
    }

    async fn add_entity_spend(
        &self,
        kind: EntityKind,
        entity_id: &str,
        amount: Decimal,
    ) -> Result<()> {
        if kind.table_spec().is_none() {
            return Ok(());
        }
        let mut totals = self.entity_totals.write().await;
        *totals
            .entry((kind, entity_id.to_string()))
            .or_insert(Decimal::ZERO) += amount;
        Ok(())
    }

    async fn upsert_daily_spend(
        &self,
        key: &DailySpendKey,
        delta: &DailySpendDelta,
    ) -> Result<()> {
        if key.entity_kind.table_spec().is_none() {
            return Ok(());
        }
        let mut daily = self.daily_spend.write().await;
        daily.entry(key.clone()).or_default().merge(delta);
        Ok(())
    }

    async fn add_budget_spend(&self, budget_id: &str, amount: Decimal) -> Result<()> {
        if let Some(budget) = self.budgets.write().await.get_mut(budget_id) {
            budget.spent += amount;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    fn key_record(hash: &str) -> KeyRecord {
        KeyRecord {
            key_hash: hash.to_string(),
            alias: Some("ci".to_string()),
            user_id: None,
            team_id: None,
            roles: vec![],
            scopes: vec![],
            allowed_tools: None,
            allowed_models: None,
            budget_id: None,
            rpm_limit: None,
            tpm_limit: None,
            blocked: false,
            expires_at: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_key_rejects_duplicate_hash_at_write() {
        let store = MemoryStorage::new();
        store.insert_key(&key_record("abc")).await.unwrap();
        let err = store.insert_key(&key_record("abc")).await.unwrap_err();
        match err {
            DbError::UniqueViolation {
                conflicting_value, ..
            } => assert_eq!(conflicting_value.as_deref(), Some("abc")),
            other => panic!("expected unique violation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_entity_spend_is_additive() {
        let store = MemoryStorage::new();
        store
            .add_entity_spend(EntityKind::Team, "t-1", Decimal::new(5, 2))
            .await
            .unwrap();
        store
            .add_entity_spend(EntityKind::Team, "t-1", Decimal::new(3, 2))
            .await
            .unwrap();
        assert_eq!(
            store.entity_total(EntityKind::Team, "t-1").await,
            Decimal::new(8, 2)
        );
    }

    #[tokio::test]
    async fn test_unknown_kind_spend_is_a_no_op() {
        let store = MemoryStorage::new();
        store
            .add_entity_spend(EntityKind::Unknown, "x", Decimal::ONE)
            .await
            .unwrap();
        assert_eq!(
            store.entity_total(EntityKind::Unknown, "x").await,
            Decimal::ZERO
        );
    }

    #[tokio::test]
    async fn test_daily_spend_merges_by_dimension_key() {
        let store = MemoryStorage::new();
        let key = DailySpendKey {
            entity_kind: EntityKind::User,
            entity_id: "u-1".to_string(),
            date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            api_key: "hash-a".to_string(),
            model: "gpt-4o".to_string(),
            model_group: String::new(),
            provider: "openai".to_string(),
            endpoint: "/v1/chat/completions".to_string(),
            tool_name: String::new(),
        };
        let delta = DailySpendDelta {
            prompt_tokens: 10,
            api_requests: 1,
            successful_requests: 1,
            spend: Decimal::new(2, 2),
            ..Default::default()
        };
        store.upsert_daily_spend(&key, &delta).await.unwrap();
        store.upsert_daily_spend(&key, &delta).await.unwrap();
        let row = store.daily_row(&key).await.unwrap();
        assert_eq!(row.prompt_tokens, 20);
        assert_eq!(row.api_requests, 2);
        assert_eq!(row.spend, Decimal::new(4, 2));
    }
}
