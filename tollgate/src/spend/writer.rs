//! Background spend writer.
//!
//! The only component that persists spend. On every tick it drains the
//! queues and commits additive upserts, entity categories in their fixed
//! order and rows sorted by id within each category, so concurrent gateway
//! instances touching the same rows always lock them in the same sequence.
//!
//! Failed commits retry with bounded exponential backoff; after the last
//! attempt the item is dropped and logged with enough context to replay it
//! by hand. Shutdown performs one final drain.

use crate::config::SpendConfig;
use crate::db::errors::DbError;
use crate::db::store::SpendStore;
use crate::spend::queue::{BudgetSpendQueue, DailySpendQueue, SpendUpdateQueue};
use crate::types::EntityKind;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub struct SpendWriter {
    storage: Arc<dyn SpendStore>,
    queue: Arc<SpendUpdateQueue>,
    daily_queue: Arc<DailySpendQueue>,
    budget_queue: Arc<BudgetSpendQueue>,
    config: SpendConfig,
}

impl SpendWriter {
    pub fn new(
        storage: Arc<dyn SpendStore>,
        queue: Arc<SpendUpdateQueue>,
        daily_queue: Arc<DailySpendQueue>,
        budget_queue: Arc<BudgetSpendQueue>,
        config: SpendConfig,
    ) -> Self {
        Self {
            storage,
            queue,
            daily_queue,
            budget_queue,
            config,
        }
    }

    /// Drain loop. Runs until cancelled, then drains once more so queued
    /// spend is not lost on shutdown.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_now().await;
                }
                _ = cancel.cancelled() => {
                    debug!("spend writer shutting down, draining queues");
                    self.flush_now().await;
                    break;
                }
            }
        }
    }

    /// Drain and commit everything queued so far. Also the test and
    /// shutdown hook.
    pub async fn flush_now(&self) {
        let mut by_entity = self.queue.flush();

        // Fixed category order, then id order within each category.
        for kind in EntityKind::ALL {
            let Some(per_entity) = by_entity.remove(&kind) else {
                continue;
            };
            let mut rows: Vec<_> = per_entity.into_iter().collect();
            rows.sort_by(|a, b| a.0.cmp(&b.0));
            let batch_size = rows.len();

            for (entity_id, amount) in rows {
                match self
                    .with_retry(|| self.storage.add_entity_spend(kind, &entity_id, amount))
                    .await
                {
                    Ok(()) => {
                        metrics::counter!("spend_writer_commits_total").increment(1);
                    }
                    Err(e) => {
                        error!(
                            entity_kind = %kind,
                            entity_id,
                            amount = %amount,
                            batch_size,
                            table = e.table(),
                            constraint = e.constraint(),
                            error = %e,
                            "dropping entity spend delta after exhausting retries"
                        );
                        metrics::counter!("spend_writer_dropped_total").increment(1);
                    }
                }
            }
        }

        let mut daily_rows: Vec<_> = self.daily_queue.flush().into_iter().collect();
        daily_rows.sort_by(|a, b| a.0.cmp(&b.0));
        let batch_size = daily_rows.len();
        for (key, delta) in daily_rows {
            if let Err(e) = self
                .with_retry(|| self.storage.upsert_daily_spend(&key, &delta))
                .await
            {
                error!(
                    entity_kind = %key.entity_kind,
                    entity_id = key.entity_id,
                    date = %key.date,
                    model = key.model,
                    spend = %delta.spend,
                    requests = delta.api_requests,
                    batch_size,
                    table = e.table(),
                    constraint = e.constraint(),
                    error = %e,
                    "dropping daily spend row after exhausting retries"
                );
                metrics::counter!("spend_writer_dropped_total").increment(1);
            }
        }

        let mut budget_rows: Vec<_> = self.budget_queue.flush().into_iter().collect();
        budget_rows.sort_by(|a, b| a.0.cmp(&b.0));
        let batch_size = budget_rows.len();
        for (budget_id, amount) in budget_rows {
            if let Err(e) = self
                .with_retry(|| self.storage.add_budget_spend(&budget_id, amount))
                .await
            {
                error!(
                    budget_id,
                    amount = %amount,
                    batch_size,
                    table = e.table(),
                    constraint = e.constraint(),
                    error = %e,
                    "dropping budget spend delta after exhausting retries"
                );
                metrics::counter!("spend_writer_dropped_total").increment(1);
            }
        }
    }

    /// Retry one commit with exponential backoff. The last failure comes
    /// back to the caller, which owns the context for the drop log.
    async fn with_retry<F, Fut>(&self, mut op: F) -> Result<(), DbError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), DbError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.config.max_retries => {
                    let delay = self
                        .config
                        .retry_base_delay_ms
                        .saturating_mul(1u64 << attempt.min(20))
                        .min(self.config.max_backoff_ms);
                    warn!(
                        attempt,
                        delay_ms = delay,
                        error = %e,
                        "spend commit failed, retrying"
                    );
                    sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::BudgetRecord;
    use crate::db::MemoryStorage;
    use crate::spend::{DailySpendDelta, DailySpendKey, SpendUpdate};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn writer_with(storage: Arc<dyn SpendStore>) -> (SpendWriter, Arc<SpendUpdateQueue>) {
        let queue = Arc::new(SpendUpdateQueue::new());
        let writer = SpendWriter::new(
            storage,
            Arc::clone(&queue),
            Arc::new(DailySpendQueue::new()),
            Arc::new(BudgetSpendQueue::new()),
            SpendConfig {
                flush_interval: Duration::from_millis(10),
                max_retries: 2,
                retry_base_delay_ms: 1,
                max_backoff_ms: 5,
                ..Default::default()
            },
        );
        (writer, queue)
    }

    #[test_log::test(tokio::test)]
    async fn test_flush_commits_entity_totals() {
        let storage = Arc::new(MemoryStorage::new());
        let (writer, queue) = writer_with(storage.clone());

        queue.push(SpendUpdate {
            entity_type: EntityKind::Key,
            entity_id: Some("k-1".to_string()),
            response_cost: Some(Decimal::new(5, 2)),
        });
        queue.push(SpendUpdate {
            entity_type: EntityKind::Key,
            entity_id: Some("k-1".to_string()),
            response_cost: Some(Decimal::new(5, 2)),
        });
        writer.flush_now().await;

        assert_eq!(
            storage.entity_total(EntityKind::Key, "k-1").await,
            Decimal::new(10, 2)
        );
        assert!(queue.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_flush_commits_daily_and_budget_rows() {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .seed_budget(BudgetRecord {
                budget_id: "b-1".to_string(),
                max_amount: None,
                soft_threshold: None,
                spent: Decimal::ZERO,
                budget_reset_at: None,
                reset_period_secs: None,
                model_budgets: Default::default(),
            })
            .await;

        let daily_queue = Arc::new(DailySpendQueue::new());
        let budget_queue = Arc::new(BudgetSpendQueue::new());
        let writer = SpendWriter::new(
            storage.clone(),
            Arc::new(SpendUpdateQueue::new()),
            Arc::clone(&daily_queue),
            Arc::clone(&budget_queue),
            SpendConfig::default(),
        );

        let key = DailySpendKey {
            entity_kind: EntityKind::User,
            entity_id: "u-1".to_string(),
            date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            api_key: "hash-a".to_string(),
            model: "gpt-4o".to_string(),
            model_group: String::new(),
            provider: "openai".to_string(),
            endpoint: String::new(),
            tool_name: String::new(),
        };
        daily_queue.push(
            key.clone(),
            DailySpendDelta {
                prompt_tokens: 7,
                api_requests: 1,
                successful_requests: 1,
                spend: Decimal::new(3, 2),
                ..Default::default()
            },
        );
        budget_queue.push("b-1", Decimal::new(3, 2));
        writer.flush_now().await;

        let row = storage.daily_row(&key).await.unwrap();
        assert_eq!(row.prompt_tokens, 7);
        let budget = storage.find_budget("b-1").await.unwrap().unwrap();
        assert_eq!(budget.spent, Decimal::new(3, 2));
    }

    /// Fails the first `failures` commits, then delegates.
    struct FlakyStore {
        inner: MemoryStorage,
        failures: AtomicU32,
    }

    impl FlakyStore {
        fn trip(&self) -> Result<(), DbError> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0).then(|| n - 1)
            }).is_ok()
            {
                Err(DbError::Unavailable {
                    message: "simulated outage".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl SpendStore for FlakyStore {
        async fn find_budget(
            &self,
            budget_id: &str,
        ) -> Result<Option<BudgetRecord>, DbError> {
            self.inner.find_budget(budget_id).await
        }
        async fn add_entity_spend(
            &self,
            kind: EntityKind,
            entity_id: &str,
            amount: Decimal,
        ) -> Result<(), DbError> {
            self.trip()?;
            self.inner.add_entity_spend(kind, entity_id, amount).await
        }
        async fn upsert_daily_spend(
            &self,
            key: &DailySpendKey,
            delta: &DailySpendDelta,
        ) -> Result<(), DbError> {
            self.trip()?;
            self.inner.upsert_daily_spend(key, delta).await
        }
        async fn add_budget_spend(
            &self,
            budget_id: &str,
            amount: Decimal,
        ) -> Result<(), DbError> {
            self.trip()?;
            self.inner.add_budget_spend(budget_id, amount).await
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_transient_failures_are_retried() {
        let storage = Arc::new(FlakyStore {
            inner: MemoryStorage::new(),
            failures: AtomicU32::new(2),
        });
        let (writer, queue) = writer_with(storage.clone());

        queue.push(SpendUpdate {
            entity_type: EntityKind::Team,
            entity_id: Some("t-1".to_string()),
            response_cost: Some(Decimal::ONE),
        });
        writer.flush_now().await;

        assert_eq!(
            storage.inner.entity_total(EntityKind::Team, "t-1").await,
            Decimal::ONE
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_exhausted_retries_drop_the_item() {
        let storage = Arc::new(FlakyStore {
            inner: MemoryStorage::new(),
            failures: AtomicU32::new(100),
        });
        let (writer, queue) = writer_with(storage.clone());

        queue.push(SpendUpdate {
            entity_type: EntityKind::Team,
            entity_id: Some("t-1".to_string()),
            response_cost: Some(Decimal::ONE),
        });
        writer.flush_now().await;

        // Dropped, not re-queued
        assert_eq!(
            storage.inner.entity_total(EntityKind::Team, "t-1").await,
            Decimal::ZERO
        );
        assert!(queue.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_cancellation_performs_final_drain() {
        let storage = Arc::new(MemoryStorage::new());
        let queue = Arc::new(SpendUpdateQueue::new());
        let writer = SpendWriter::new(
            storage.clone(),
            Arc::clone(&queue),
            Arc::new(DailySpendQueue::new()),
            Arc::new(BudgetSpendQueue::new()),
            SpendConfig {
                // Long enough that only the shutdown drain can commit
                flush_interval: Duration::from_secs(3600),
                ..Default::default()
            },
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(writer.run(cancel.clone()));
        // First tick of `interval` fires immediately; give it a moment.
        tokio::time::sleep(Duration::from_millis(50)).await;

        queue.push(SpendUpdate {
            entity_type: EntityKind::Org,
            entity_id: Some("o-1".to_string()),
            response_cost: Some(Decimal::ONE),
        });
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(
            storage.entity_total(EntityKind::Org, "o-1").await,
            Decimal::ONE
        );
    }
}
