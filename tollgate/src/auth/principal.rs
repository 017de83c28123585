//! The resolved caller identity that every downstream check consumes.

use crate::types::BudgetLayer;
use serde::{Deserialize, Serialize};

/// Roles a principal can carry. Kept deliberately small; finer-grained access
/// is expressed through scopes and allow-lists, not new roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Full control-plane access. Skips route, scope, and model checks, but
    /// never tool allow-lists.
    Admin,
    /// Manages one team's keys and members
    TeamAdmin,
    /// Employee of the operator, trusted routes only
    InternalUser,
    /// Default role for external callers
    Customer,
}

impl Role {
    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

/// Budget ids attached at each layer of the caller's ancestry. `None` at a
/// layer means that layer is unbudgeted for this caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetRefs {
    pub key: Option<String>,
    pub end_customer: Option<String>,
    pub user: Option<String>,
    pub team: Option<String>,
    pub org: Option<String>,
}

impl BudgetRefs {
    /// Budget id for a walk layer. The global layer is deployment config,
    /// not part of the principal.
    pub fn for_layer(&self, layer: BudgetLayer) -> Option<&str> {
        match layer {
            BudgetLayer::Key => self.key.as_deref(),
            BudgetLayer::EndCustomer => self.end_customer.as_deref(),
            BudgetLayer::User => self.user.as_deref(),
            BudgetLayer::Team => self.team.as_deref(),
            BudgetLayer::Org => self.org.as_deref(),
            BudgetLayer::Global => None,
        }
    }
}

/// Per-principal rate ceilings, both per minute. `None` means uncapped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    pub rpm: Option<u32>,
    pub tpm: Option<u64>,
}

/// A fully resolved caller: credential, ancestry, entitlements, and limits.
///
/// Built once per call by identity resolution and treated as read-only
/// afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Principal {
    /// Hash of the opaque key secret. `None` for token-authenticated calls.
    pub key_hash: Option<String>,
    pub key_alias: Option<String>,
    pub user_id: Option<String>,
    pub team_id: Option<String>,
    pub org_id: Option<String>,
    /// End customer named by the request, if the caller attributed one
    pub end_customer_id: Option<String>,
    pub roles: Vec<Role>,
    pub scopes: Vec<String>,
    /// Key-level tool allow-list. `None` means unrestricted at this level.
    pub key_allowed_tools: Option<Vec<String>>,
    /// Team-level tool allow-list, enforced in addition to the key's.
    pub team_allowed_tools: Option<Vec<String>>,
    /// Key-level model allow-list
    pub allowed_models: Option<Vec<String>>,
    pub budgets: BudgetRefs,
    pub rate_limits: RateLimits,
    /// True when resolution ran fail-open during a storage outage. A
    /// degraded principal carries no budget refs and no entitlements beyond
    /// the credential itself.
    pub degraded: bool,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(Role::is_admin)
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    /// Entity id used for rate-limit bucketing: the key hash when present,
    /// otherwise the user id, otherwise empty.
    pub fn rate_key(&self) -> &str {
        self.key_hash
            .as_deref()
            .or(self.user_id.as_deref())
            .unwrap_or("")
    }
}
