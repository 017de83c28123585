//! Layered budget enforcement.
//!
//! Every admitted call walks a fixed ladder of budget layers, innermost
//! first: key, end customer, user, team, org, then the deployment-wide
//! global budget. The first exhausted layer rejects the call.
//!
//! Enforcement never writes storage. Records are loaded through a TTL cache;
//! spend since the last flush is tracked in a pending map so a burst inside
//! one cache window still counts against the ceiling.

pub mod rate;

use crate::auth::principal::Principal;
use crate::config::{BudgetConfig, StorageFailurePolicy};
use crate::db::errors::DbError;
use crate::db::models::BudgetRecord;
use crate::db::Storage;
use crate::errors::{Error, Result};
use crate::types::BudgetLayer;
use chrono::Utc;
use dashmap::DashMap;
use moka::future::Cache;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, warn};

pub struct BudgetGuard {
    storage: Arc<dyn Storage>,
    /// budget_id -> record, None caching "no such budget"
    cache: Cache<String, Option<Arc<BudgetRecord>>>,
    /// Spend observed since each budget's record was last loaded. Cleared on
    /// reload, when the persisted spend has caught up.
    pending: Arc<DashMap<String, Decimal>>,
    /// Budgets that already logged a soft-threshold warning this process
    warned: DashMap<String, ()>,
    global_budget_id: Option<String>,
    failure_policy: StorageFailurePolicy,
}

impl BudgetGuard {
    pub fn new(
        storage: Arc<dyn Storage>,
        config: &BudgetConfig,
        failure_policy: StorageFailurePolicy,
    ) -> Self {
        Self {
            storage,
            cache: Cache::builder()
                .time_to_live(config.record_cache_ttl)
                .max_capacity(config.record_cache_capacity)
                .build(),
            pending: Arc::new(DashMap::new()),
            warned: DashMap::new(),
            global_budget_id: config.global_budget_id.clone(),
            failure_policy,
        }
    }

    /// Walk every applicable layer and reject at the first exhausted one.
    /// A degraded principal has no budget refs and only hits the global
    /// layer, which is config, not ancestry.
    pub async fn check(&self, principal: &Principal, model: Option<&str>) -> Result<()> {
        for layer in BudgetLayer::WALK_ORDER {
            let budget_id = match layer {
                BudgetLayer::Global => self.global_budget_id.as_deref(),
                _ => principal.budgets.for_layer(layer),
            };
            let Some(budget_id) = budget_id else { continue };

            let record = match self.load(budget_id).await {
                Ok(record) => record,
                Err(Error::StorageUnavailable { message }) => {
                    match self.failure_policy {
                        StorageFailurePolicy::FailOpen => {
                            warn!(budget_id, %message, "storage outage during budget check, skipping layer");
                            continue;
                        }
                        StorageFailurePolicy::FailClosed => {
                            return Err(Error::StorageUnavailable { message })
                        }
                    }
                }
                Err(e) => return Err(e),
            };
            let Some(record) = record else { continue };

            self.check_record(layer, budget_id, &record, model)?;
        }
        Ok(())
    }

    fn check_record(
        &self,
        layer: BudgetLayer,
        budget_id: &str,
        record: &BudgetRecord,
        model: Option<&str>,
    ) -> Result<()> {
        let pending = self
            .pending
            .get(budget_id)
            .map(|e| *e.value())
            .unwrap_or(Decimal::ZERO);
        let effective = record.effective_spent(Utc::now()) + pending;

        if let Some(limit) = record.max_amount {
            if effective >= limit {
                return Err(Error::BudgetExceeded {
                    layer,
                    entity_id: budget_id.to_string(),
                    spent: effective,
                    limit,
                });
            }
        }

        if let Some(soft) = record.soft_threshold {
            if effective >= soft && self.warned.insert(budget_id.to_string(), ()).is_none() {
                warn!(
                    budget_id,
                    layer = %layer,
                    spent = %effective,
                    threshold = %soft,
                    "budget crossed its soft threshold"
                );
            }
        }

        if let Some(model) = model {
            if let Some(sub) = record.model_budgets.get(model) {
                if sub.spent >= sub.max_amount {
                    return Err(Error::BudgetExceeded {
                        layer,
                        entity_id: format!("{budget_id}/{model}"),
                        spent: sub.spent,
                        limit: sub.max_amount,
                    });
                }
            }
        }

        Ok(())
    }

    /// Count completed-call spend against every budget on the principal's
    /// ancestry, ahead of the background writer persisting it.
    pub fn note_spend(&self, principal: &Principal, cost: Decimal) {
        if cost == Decimal::ZERO {
            return;
        }
        for layer in BudgetLayer::WALK_ORDER {
            let budget_id = match layer {
                BudgetLayer::Global => self.global_budget_id.as_deref(),
                _ => principal.budgets.for_layer(layer),
            };
            if let Some(budget_id) = budget_id {
                *self
                    .pending
                    .entry(budget_id.to_string())
                    .or_insert(Decimal::ZERO) += cost;
            }
        }
    }

    async fn load(&self, budget_id: &str) -> Result<Option<Arc<BudgetRecord>>> {
        let storage = Arc::clone(&self.storage);
        let pending = Arc::clone(&self.pending);
        let id = budget_id.to_string();
        self.cache
            .try_get_with(budget_id.to_string(), async move {
                let record = storage.find_budget(&id).await?;
                // Fresh record includes recently persisted spend, so the
                // pending overlay restarts from zero.
                pending.remove(&id);
                Ok::<_, DbError>(record.map(Arc::new))
            })
            .await
            .map_err(|e: Arc<DbError>| match e.as_ref() {
                DbError::Unavailable { message } => Error::StorageUnavailable {
                    message: message.clone(),
                },
                other => {
                    error!(budget_id, error = %other, "budget lookup failed");
                    Error::StorageUnavailable {
                        message: other.to_string(),
                    }
                }
            })
    }

    /// Drop a cached record so the next check reloads it.
    pub async fn invalidate(&self, budget_id: &str) {
        self.cache.invalidate(&budget_id.to_string()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::principal::BudgetRefs;
    use crate::db::models::ModelBudget;
    use crate::db::MemoryStorage;
    use std::collections::HashMap;

    fn budget(id: &str, spent: i64, max: Option<i64>) -> BudgetRecord {
        BudgetRecord {
            budget_id: id.to_string(),
            max_amount: max.map(|m| Decimal::new(m, 0)),
            soft_threshold: None,
            spent: Decimal::new(spent, 0),
            budget_reset_at: None,
            reset_period_secs: None,
            model_budgets: HashMap::new(),
        }
    }

    fn principal_with_key_budget(id: &str) -> Principal {
        Principal {
            budgets: BudgetRefs {
                key: Some(id.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn guard(storage: Arc<MemoryStorage>) -> BudgetGuard {
        BudgetGuard::new(
            storage,
            &BudgetConfig::default(),
            StorageFailurePolicy::FailClosed,
        )
    }

    #[tokio::test]
    async fn test_under_budget_passes() {
        let storage = Arc::new(MemoryStorage::new());
        storage.seed_budget(budget("b-1", 10, Some(100))).await;
        let guard = guard(storage).await;
        assert!(guard
            .check(&principal_with_key_budget("b-1"), None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_exhausted_budget_rejects_with_layer() {
        let storage = Arc::new(MemoryStorage::new());
        storage.seed_budget(budget("b-1", 100, Some(100))).await;
        let guard = guard(storage).await;
        let err = guard
            .check(&principal_with_key_budget("b-1"), None)
            .await
            .unwrap_err();
        match err {
            Error::BudgetExceeded {
                layer, entity_id, ..
            } => {
                assert_eq!(layer, BudgetLayer::Key);
                assert_eq!(entity_id, "b-1");
            }
            other => panic!("expected BudgetExceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_innermost_layer_rejects_first() {
        let storage = Arc::new(MemoryStorage::new());
        storage.seed_budget(budget("b-key", 100, Some(100))).await;
        storage.seed_budget(budget("b-team", 100, Some(100))).await;
        let guard = guard(storage).await;

        let principal = Principal {
            budgets: BudgetRefs {
                key: Some("b-key".to_string()),
                team: Some("b-team".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = guard.check(&principal, None).await.unwrap_err();
        match err {
            Error::BudgetExceeded { layer, .. } => assert_eq!(layer, BudgetLayer::Key),
            other => panic!("expected BudgetExceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pending_spend_counts_before_persistence() {
        let storage = Arc::new(MemoryStorage::new());
        storage.seed_budget(budget("b-1", 90, Some(100))).await;
        let guard = guard(storage).await;
        let principal = principal_with_key_budget("b-1");

        assert!(guard.check(&principal, None).await.is_ok());
        guard.note_spend(&principal, Decimal::new(15, 0));
        let err = guard.check(&principal, None).await.unwrap_err();
        assert!(matches!(err, Error::BudgetExceeded { .. }));
    }

    #[tokio::test]
    async fn test_unlimited_budget_only_tracks() {
        let storage = Arc::new(MemoryStorage::new());
        storage.seed_budget(budget("b-1", 1_000_000, None)).await;
        let guard = guard(storage).await;
        assert!(guard
            .check(&principal_with_key_budget("b-1"), None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_missing_budget_record_skips_layer() {
        let storage = Arc::new(MemoryStorage::new());
        let guard = guard(storage).await;
        assert!(guard
            .check(&principal_with_key_budget("b-gone"), None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_model_sub_budget_rejects_only_that_model() {
        let storage = Arc::new(MemoryStorage::new());
        let mut record = budget("b-1", 10, Some(1000));
        record.model_budgets.insert(
            "gpt-4o".to_string(),
            ModelBudget {
                max_amount: Decimal::new(5, 0),
                spent: Decimal::new(5, 0),
            },
        );
        storage.seed_budget(record).await;
        let guard = guard(storage).await;
        let principal = principal_with_key_budget("b-1");

        assert!(guard.check(&principal, Some("gpt-4o-mini")).await.is_ok());
        let err = guard.check(&principal, Some("gpt-4o")).await.unwrap_err();
        match err {
            Error::BudgetExceeded { entity_id, .. } => assert_eq!(entity_id, "b-1/gpt-4o"),
            other => panic!("expected BudgetExceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_global_budget_applies_to_everyone() {
        let storage = Arc::new(MemoryStorage::new());
        storage.seed_budget(budget("b-global", 100, Some(100))).await;
        let guard = BudgetGuard::new(
            storage,
            &BudgetConfig {
                global_budget_id: Some("b-global".to_string()),
                ..Default::default()
            },
            StorageFailurePolicy::FailClosed,
        );
        let err = guard.check(&Principal::default(), None).await.unwrap_err();
        match err {
            Error::BudgetExceeded { layer, .. } => assert_eq!(layer, BudgetLayer::Global),
            other => panic!("expected BudgetExceeded, got {other:?}"),
        }
    }
}
