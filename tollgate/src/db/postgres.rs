//! Postgres engine for the [`Storage`](super::store::Storage) contract.
//!
//! All queries are runtime-bound, so the crate compiles without a database
//! and the host decides how the schema is provisioned. Spend commits are
//! additive upserts (`x = x + EXCLUDED.x`): replaying a batch after a
//! mid-flight failure re-adds exactly the amounts re-sent, nothing else.

use crate::auth::principal::Role;
use crate::db::errors::Result;
use crate::db::models::{
    BudgetRecord, EndCustomerRecord, KeyRecord, ModelBudget, OrgRecord, TeamRecord, UserRecord,
};
use crate::db::store::{IdentityStore, SpendStore};
use crate::spend::{DailySpendDelta, DailySpendKey};
use crate::types::EntityKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(sqlx::FromRow)]
struct KeyRow {
    key_hash: String,
    alias: Option<String>,
    user_id: Option<String>,
    team_id: Option<String>,
    roles: Json<Vec<Role>>,
    scopes: Json<Vec<String>>,
    allowed_tools: Option<Json<Vec<String>>>,
    allowed_models: Option<Json<Vec<String>>>,
    budget_id: Option<String>,
    rpm_limit: Option<i32>,
    tpm_limit: Option<i64>,
    blocked: bool,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<KeyRow> for KeyRecord {
    fn from(row: KeyRow) -> Self {
        KeyRecord {
            key_hash: row.key_hash,
            alias: row.alias,
            user_id: row.user_id,
            team_id: row.team_id,
            roles: row.roles.0,
            scopes: row.scopes.0,
            allowed_tools: row.allowed_tools.map(|j| j.0),
            allowed_models: row.allowed_models.map(|j| j.0),
            budget_id: row.budget_id,
            rpm_limit: row.rpm_limit.map(|v| v as u32),
            tpm_limit: row.tpm_limit.map(|v| v as u64),
            blocked: row.blocked,
            expires_at: row.expires_at,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    user_id: String,
    email: Option<String>,
    team_id: Option<String>,
    roles: Json<Vec<Role>>,
    budget_id: Option<String>,
    blocked: bool,
}

impl From<UserRow> for UserRecord {
    fn from(row: UserRow) -> Self {
        UserRecord {
            user_id: row.user_id,
            email: row.email,
            team_id: row.team_id,
            roles: row.roles.0,
            budget_id: row.budget_id,
            blocked: row.blocked,
        }
    }
}

#[derive(sqlx::FromRow)]
struct TeamRow {
    team_id: String,
    org_id: Option<String>,
    allowed_tools: Option<Json<Vec<String>>>,
    budget_id: Option<String>,
    blocked: bool,
}

impl From<TeamRow> for TeamRecord {
    fn from(row: TeamRow) -> Self {
        TeamRecord {
            team_id: row.team_id,
            org_id: row.org_id,
            allowed_tools: row.allowed_tools.map(|j| j.0),
            budget_id: row.budget_id,
            blocked: row.blocked,
        }
    }
}

#[derive(sqlx::FromRow)]
struct BudgetRow {
    budget_id: String,
    max_amount: Option<Decimal>,
    soft_threshold: Option<Decimal>,
    spent: Decimal,
    budget_reset_at: Option<DateTime<Utc>>,
    reset_period_secs: Option<i64>,
    model_budgets: Option<Json<HashMap<String, ModelBudget>>>,
}

impl From<BudgetRow> for BudgetRecord {
    fn from(row: BudgetRow) -> Self {
        BudgetRecord {
            budget_id: row.budget_id,
            max_amount: row.max_amount,
            soft_threshold: row.soft_threshold,
            spent: row.spent,
            budget_reset_at: row.budget_reset_at,
            reset_period_secs: row.reset_period_secs,
            model_budgets: row.model_budgets.map(|j| j.0).unwrap_or_default(),
        }
    }
}

#[async_trait]
impl IdentityStore for PgStorage {
    async fn find_key_by_hash(&self, key_hash: &str) -> Result<Option<KeyRecord>> {
        let row = sqlx::query_as::<_, KeyRow>(
            "SELECT key_hash, alias, user_id, team_id, roles, scopes, allowed_tools, \
             allowed_models, budget_id, rpm_limit, tpm_limit, blocked, expires_at, created_at \
             FROM gateway_keys WHERE key_hash = $1",
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(KeyRecord::from))
    }

    async fn find_user(&self, user_id: &str) -> Result<Option<UserRecord>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT user_id, email, team_id, roles, budget_id, blocked \
             FROM gateway_users WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(UserRecord::from))
    }

    async fn find_team(&self, team_id: &str) -> Result<Option<TeamRecord>> {
        let row = sqlx::query_as::<_, TeamRow>(
            "SELECT team_id, org_id, allowed_tools, budget_id, blocked \
             FROM gateway_teams WHERE team_id = $1",
        )
        .bind(team_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(TeamRecord::from))
    }

    async fn find_org(&self, org_id: &str) -> Result<Option<OrgRecord>> {
        let row = sqlx::query_as::<_, (String, Option<String>)>(
            "SELECT org_id, budget_id FROM gateway_orgs WHERE org_id = $1",
        )
        .bind(org_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(org_id, budget_id)| OrgRecord { org_id, budget_id }))
    }

    async fn find_end_customer(
        &self,
        end_customer_id: &str,
    ) -> Result<Option<EndCustomerRecord>> {
        let row = sqlx::query_as::<_, (String, Option<String>)>(
            "SELECT end_customer_id, budget_id FROM gateway_end_customers \
             WHERE end_customer_id = $1",
        )
        .bind(end_customer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(end_customer_id, budget_id)| EndCustomerRecord {
            end_customer_id,
            budget_id,
        }))
    }

    async fn insert_key(&self, record: &KeyRecord) -> Result<()> {
        // Plain insert: a concurrent issuance of the same secret must lose
        // the race here with a unique violation, not at an earlier read.
        sqlx::query(
            "INSERT INTO gateway_keys \
             (key_hash, alias, user_id, team_id, roles, scopes, allowed_tools, \
              allowed_models, budget_id, rpm_limit, tpm_limit, blocked, expires_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(&record.key_hash)
        .bind(&record.alias)
        .bind(&record.user_id)
        .bind(&record.team_id)
        .bind(Json(&record.roles))
        .bind(Json(&record.scopes))
        .bind(record.allowed_tools.as_ref().map(Json))
        .bind(record.allowed_models.as_ref().map(Json))
        .bind(&record.budget_id)
        .bind(record.rpm_limit.map(|v| v as i32))
        .bind(record.tpm_limit.map(|v| v as i64))
        .bind(record.blocked)
        .bind(record.expires_at)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_user(&self, record: &UserRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO gateway_users (user_id, email, team_id, roles, budget_id, blocked) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (user_id) DO UPDATE SET \
             email = EXCLUDED.email, team_id = EXCLUDED.team_id, \
             roles = EXCLUDED.roles, budget_id = EXCLUDED.budget_id, \
             blocked = EXCLUDED.blocked",
        )
        .bind(&record.user_id)
        .bind(&record.email)
        .bind(&record.team_id)
        .bind(Json(&record.roles))
        .bind(&record.budget_id)
        .bind(record.blocked)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_team(&self, record: &TeamRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO gateway_teams (team_id, org_id, allowed_tools, budget_id, blocked) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (team_id) DO UPDATE SET \
             org_id = EXCLUDED.org_id, allowed_tools = EXCLUDED.allowed_tools, \
             budget_id = EXCLUDED.budget_id, blocked = EXCLUDED.blocked",
        )
        .bind(&record.team_id)
        .bind(&record.org_id)
        .bind(record.allowed_tools.as_ref().map(Json))
        .bind(&record.budget_id)
        .bind(record.blocked)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SpendStore for PgStorage {
    async fn find_budget(&self, budget_id: &str) -> Result<Option<BudgetRecord>> {
        let row = sqlx::query_as::<_, BudgetRow>(
            "SELECT budget_id, max_amount, soft_threshold, spent, budget_reset_at, \
             reset_period_secs, model_budgets \
             FROM gateway_budgets WHERE budget_id = $1",
        )
        .bind(budget_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(BudgetRecord::from))
    }

    async fn add_entity_spend(
        &self,
        kind: EntityKind,
        entity_id: &str,
        amount: Decimal,
    ) -> Result<()> {
        // Table names come from the closed EntityKind set, never from input.
        let Some(spec) = kind.table_spec() else {
            return Ok(());
        };
        let sql = format!(
            "INSERT INTO {table} ({col}, total_spend) VALUES ($1, $2) \
             ON CONFLICT ({col}) DO UPDATE SET \
             total_spend = {table}.total_spend + EXCLUDED.total_spend",
            table = spec.totals_table,
            col = spec.entity_column,
        );
        sqlx::query(&sql)
            .bind(entity_id)
            .bind(amount)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_daily_spend(
        &self,
        key: &DailySpendKey,
        delta: &DailySpendDelta,
    ) -> Result<()> {
        let Some(spec) = key.entity_kind.table_spec() else {
            return Ok(());
        };
        let sql = format!(
            "INSERT INTO {table} \
             ({col}, date, api_key, model, model_group, provider, endpoint, tool_name, \
              prompt_tokens, completion_tokens, cache_read_tokens, cache_creation_tokens, \
              spend, api_requests, successful_requests, failed_requests) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16) \
             ON CONFLICT ({col}, date, api_key, model, model_group, provider, endpoint, tool_name) \
             DO UPDATE SET \
             prompt_tokens = {table}.prompt_tokens + EXCLUDED.prompt_tokens, \
             completion_tokens = {table}.completion_tokens + EXCLUDED.completion_tokens, \
             cache_read_tokens = {table}.cache_read_tokens + EXCLUDED.cache_read_tokens, \
             cache_creation_tokens = {table}.cache_creation_tokens + EXCLUDED.cache_creation_tokens, \
             spend = {table}.spend + EXCLUDED.spend, \
             api_requests = {table}.api_requests + EXCLUDED.api_requests, \
             successful_requests = {table}.successful_requests + EXCLUDED.successful_requests, \
             failed_requests = {table}.failed_requests + EXCLUDED.failed_requests",
            table = spec.daily_table,
            col = spec.entity_column,
        );
        sqlx::query(&sql)
            .bind(&key.entity_id)
            .bind(key.date)
            .bind(&key.api_key)
            .bind(&key.model)
            .bind(&key.model_group)
            .bind(&key.provider)
            .bind(&key.endpoint)
            .bind(&key.tool_name)
            .bind(delta.prompt_tokens)
            .bind(delta.completion_tokens)
            .bind(delta.cache_read_tokens)
            .bind(delta.cache_creation_tokens)
            .bind(delta.spend)
            .bind(delta.api_requests)
            .bind(delta.successful_requests)
            .bind(delta.failed_requests)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_budget_spend(&self, budget_id: &str, amount: Decimal) -> Result<()> {
        // Zero rows affected means the budget was deleted since the call ran;
        // the spend is still recorded against the entities themselves.
        sqlx::query("UPDATE gateway_budgets SET spent = spent + $1 WHERE budget_id = $2")
            .bind(amount)
            .bind(budget_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
