//! Common type definitions shared across the crate.
//!
//! This module defines:
//! - Id aliases for call-scoped identifiers
//! - [`EntityKind`]: the closed set of entity categories spend can be
//!   attributed to, together with the table metadata the spend writer needs
//! - [`BudgetLayer`]: one level of the budget ancestry walk
//!
//! # Entity categories
//!
//! Every spend delta names one [`EntityKind`]. The writer never branches on
//! the kind directly; it looks up a [`TableSpec`] and issues the same upsert
//! for every category. Wire payloads carrying an entity type this build does
//! not know deserialize to [`EntityKind::Unknown`], which aggregates nowhere
//! (a forward-compatible no-op rather than an error).

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a single gateway call, assigned when the call enters the
/// control plane.
pub type CallId = Uuid;

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}

/// Entity categories spend can be attributed to.
///
/// One completed call may produce one delta per applicable category (its key,
/// the key's user, that user's team, and so on).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Key,
    User,
    Team,
    Org,
    EndUser,
    TeamMember,
    Tag,
    Agent,
    /// Entity types introduced by newer peers. Ignored by aggregation.
    #[serde(other)]
    Unknown,
}

/// Storage metadata for one entity category: where its daily rows and
/// long-lived totals live, and which column carries the entity id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    /// Daily aggregate table for this category
    pub daily_table: &'static str,
    /// Entity-id column inside the daily aggregate table
    pub entity_column: &'static str,
    /// Table holding the long-lived per-entity total-spend column
    pub totals_table: &'static str,
}

impl EntityKind {
    /// Every known category, in the order the writer commits them.
    pub const ALL: [EntityKind; 8] = [
        EntityKind::Key,
        EntityKind::User,
        EntityKind::Team,
        EntityKind::Org,
        EntityKind::EndUser,
        EntityKind::TeamMember,
        EntityKind::Tag,
        EntityKind::Agent,
    ];

    /// Stable wire name for this category.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Key => "key",
            EntityKind::User => "user",
            EntityKind::Team => "team",
            EntityKind::Org => "org",
            EntityKind::EndUser => "end_user",
            EntityKind::TeamMember => "team_member",
            EntityKind::Tag => "tag",
            EntityKind::Agent => "agent",
            EntityKind::Unknown => "unknown",
        }
    }

    /// Table metadata for this category. `None` for [`EntityKind::Unknown`],
    /// which must never reach the writer.
    pub fn table_spec(&self) -> Option<TableSpec> {
        let spec = match self {
            EntityKind::Key => TableSpec {
                daily_table: "daily_key_spend",
                entity_column: "key_hash",
                totals_table: "gateway_keys",
            },
            EntityKind::User => TableSpec {
                daily_table: "daily_user_spend",
                entity_column: "user_id",
                totals_table: "gateway_users",
            },
            EntityKind::Team => TableSpec {
                daily_table: "daily_team_spend",
                entity_column: "team_id",
                totals_table: "gateway_teams",
            },
            EntityKind::Org => TableSpec {
                daily_table: "daily_org_spend",
                entity_column: "org_id",
                totals_table: "gateway_orgs",
            },
            EntityKind::EndUser => TableSpec {
                daily_table: "daily_end_user_spend",
                entity_column: "end_user_id",
                totals_table: "gateway_end_users",
            },
            EntityKind::TeamMember => TableSpec {
                daily_table: "daily_team_member_spend",
                entity_column: "member_id",
                totals_table: "gateway_team_members",
            },
            EntityKind::Tag => TableSpec {
                daily_table: "daily_tag_spend",
                entity_column: "tag",
                totals_table: "gateway_tags",
            },
            EntityKind::Agent => TableSpec {
                daily_table: "daily_agent_spend",
                entity_column: "agent_id",
                totals_table: "gateway_agents",
            },
            EntityKind::Unknown => return None,
        };
        Some(spec)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One level of the budget ancestry walked for every call, in check order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetLayer {
    Key,
    EndCustomer,
    User,
    Team,
    Org,
    Global,
}

impl BudgetLayer {
    /// Fixed walk order: innermost entity first, global last.
    pub const WALK_ORDER: [BudgetLayer; 6] = [
        BudgetLayer::Key,
        BudgetLayer::EndCustomer,
        BudgetLayer::User,
        BudgetLayer::Team,
        BudgetLayer::Org,
        BudgetLayer::Global,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetLayer::Key => "key",
            BudgetLayer::EndCustomer => "end_customer",
            BudgetLayer::User => "user",
            BudgetLayer::Team => "team",
            BudgetLayer::Org => "org",
            BudgetLayer::Global => "global",
        }
    }
}

impl fmt::Display for BudgetLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
