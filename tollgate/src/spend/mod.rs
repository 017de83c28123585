//! Deferred spend accounting.
//!
//! Nothing on the request path writes spend to storage. Completed calls push
//! deltas onto two in-memory queues:
//!
//! - [`queue::SpendUpdateQueue`] — running per-entity cost totals, one bucket
//!   per [`EntityKind`](crate::types::EntityKind)
//! - [`queue::DailySpendQueue`] — per-day usage aggregates keyed by the full
//!   reporting dimensions (entity, date, key, model, provider, endpoint, tool)
//!
//! A single background [`writer::SpendWriter`] drains both on an interval and
//! commits them with idempotent additive upserts, sorted to keep concurrent
//! writers from deadlocking each other.

pub mod queue;
pub mod writer;

use crate::types::{CallId, EntityKind};
use bon::Builder;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One attribution delta: "this entity spent this much".
///
/// Producers may be remote peers, so both the entity id and the cost are
/// optional on the wire. The queue coerces a missing id to the empty-string
/// bucket and a missing cost to zero rather than dropping the update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpendUpdate {
    pub entity_type: EntityKind,
    pub entity_id: Option<String>,
    pub response_cost: Option<Decimal>,
}

/// Aggregated queue contents: per-entity cost totals for every category.
///
/// Every known [`EntityKind`] is present as a map key even when it collected
/// nothing, so consumers never need a missing-category branch.
pub type SpendByEntity = HashMap<EntityKind, HashMap<String, Decimal>>;

/// Usage facts for one completed call, as reported by the data plane.
#[derive(Debug, Clone, Builder)]
pub struct CallUsage {
    pub call_id: CallId,
    /// Hash of the credential that made the call. Never the raw secret.
    pub api_key: String,
    pub date: NaiveDate,
    pub model: String,
    /// Routing group the model belongs to. Empty when ungrouped.
    #[builder(default)]
    pub model_group: String,
    pub provider: String,
    #[builder(default)]
    pub endpoint: String,
    #[builder(default)]
    pub tool_name: String,
    /// Caller-attached attribution tags (cost centers, environments). Each
    /// tag collects its own spend aggregates.
    #[builder(default)]
    pub tags: Vec<String>,
    /// Agent the call ran on behalf of, when one was identified.
    pub agent_id: Option<String>,
    #[builder(default)]
    pub prompt_tokens: i64,
    #[builder(default)]
    pub completion_tokens: i64,
    #[builder(default)]
    pub cache_read_tokens: i64,
    #[builder(default)]
    pub cache_creation_tokens: i64,
    #[builder(default)]
    pub response_cost: Decimal,
    pub success: bool,
}

/// Full dimension set identifying one daily aggregate row.
///
/// `Ord` is derived so drained batches can be committed in a stable order;
/// concurrent writers that touch overlapping rows then always lock them in
/// the same sequence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DailySpendKey {
    pub entity_kind: EntityKind,
    pub entity_id: String,
    pub date: NaiveDate,
    pub api_key: String,
    pub model: String,
    /// Empty string when the model belongs to no routing group.
    pub model_group: String,
    pub provider: String,
    /// Empty string when the call had no distinguishable endpoint.
    pub endpoint: String,
    /// Empty string when no tool was invoked.
    pub tool_name: String,
}

/// Additive counters merged into one daily aggregate row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailySpendDelta {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_creation_tokens: i64,
    pub spend: Decimal,
    pub api_requests: i64,
    pub successful_requests: i64,
    pub failed_requests: i64,
}

impl DailySpendDelta {
    /// Delta for a single call.
    pub fn from_usage(usage: &CallUsage) -> Self {
        DailySpendDelta {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            cache_read_tokens: usage.cache_read_tokens,
            cache_creation_tokens: usage.cache_creation_tokens,
            spend: usage.response_cost,
            api_requests: 1,
            successful_requests: i64::from(usage.success),
            failed_requests: i64::from(!usage.success),
        }
    }

    pub fn merge(&mut self, other: &DailySpendDelta) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
        self.spend += other.spend;
        self.api_requests += other.api_requests;
        self.successful_requests += other.successful_requests;
        self.failed_requests += other.failed_requests;
    }
}
