//! Narrow storage contract the control plane depends on.
//!
//! The engine behind these traits is a collaborator, not part of this crate's
//! core: [`PgStorage`](super::postgres::PgStorage) binds them to Postgres,
//! [`MemoryStorage`](super::memory::MemoryStorage) keeps everything in
//! process for tests and embedded runs. Application code only ever sees
//! `Arc<dyn Storage>`.

use crate::db::errors::Result;
use crate::db::models::{
    BudgetRecord, EndCustomerRecord, KeyRecord, OrgRecord, TeamRecord, UserRecord,
};
use crate::spend::{DailySpendDelta, DailySpendKey};
use crate::types::EntityKind;
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Lookups and writes for the identity graph (keys, users, teams, orgs,
/// end customers).
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Look up a credential by the hash of its secret.
    async fn find_key_by_hash(&self, key_hash: &str) -> Result<Option<KeyRecord>>;

    async fn find_user(&self, user_id: &str) -> Result<Option<UserRecord>>;

    async fn find_team(&self, team_id: &str) -> Result<Option<TeamRecord>>;

    async fn find_org(&self, org_id: &str) -> Result<Option<OrgRecord>>;

    async fn find_end_customer(&self, end_customer_id: &str)
        -> Result<Option<EndCustomerRecord>>;

    /// Insert a new credential. Must surface
    /// [`DbError::UniqueViolation`](crate::db::errors::DbError::UniqueViolation)
    /// when the hash already exists, so concurrent issuance of the same
    /// secret loses the race at the write, not at a read-then-write gap.
    async fn insert_key(&self, record: &KeyRecord) -> Result<()>;

    /// Create or update a user. Used by token auto-provisioning.
    async fn upsert_user(&self, record: &UserRecord) -> Result<()>;

    /// Create or update a team. Used by token auto-provisioning when a
    /// verified token names a team that does not exist yet.
    async fn upsert_team(&self, record: &TeamRecord) -> Result<()>;
}

/// Budget lookups and the additive spend commits issued by the background
/// writer.
#[async_trait]
pub trait SpendStore: Send + Sync {
    async fn find_budget(&self, budget_id: &str) -> Result<Option<BudgetRecord>>;

    /// Add to an entity's long-lived total spend, creating the totals row if
    /// it does not exist. Must be additive, so replays after a mid-batch
    /// failure re-add only what the caller re-sends.
    async fn add_entity_spend(
        &self,
        kind: EntityKind,
        entity_id: &str,
        amount: Decimal,
    ) -> Result<()>;

    /// Merge one daily aggregate delta into its row, creating it on first
    /// sight of the dimension combination.
    async fn upsert_daily_spend(&self, key: &DailySpendKey, delta: &DailySpendDelta)
        -> Result<()>;

    /// Add to a budget's current-period spend.
    async fn add_budget_spend(&self, budget_id: &str, amount: Decimal) -> Result<()>;
}

/// Everything the control plane needs from its storage collaborator.
pub trait Storage: IdentityStore + SpendStore {}

impl<T: IdentityStore + SpendStore> Storage for T {}
