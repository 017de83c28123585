//! In-memory spend queues.
//!
//! All three queues are mutex-guarded buffers: pushes are cheap, and the
//! writer drains with a buffer swap so the lock is never held across an
//! await. The update queue is bounded; when a stalled writer lets it fill,
//! the oldest updates are dropped rather than the process growing without
//! limit. Nothing here touches storage.

use crate::spend::{DailySpendDelta, DailySpendKey, SpendByEntity, SpendUpdate};
use crate::types::EntityKind;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::{debug, warn};

const DEFAULT_QUEUE_CAPACITY: usize = 100_000;

/// Bounded queue of per-entity cost deltas, aggregated at flush time.
///
/// At capacity the oldest update is discarded per push, counted in the
/// `spend_queue_overflow_total` metric. Recent spend survives a prolonged
/// writer stall; the tail that does not is already lost either way.
#[derive(Debug)]
pub struct SpendUpdateQueue {
    buffer: Mutex<VecDeque<SpendUpdate>>,
    capacity: usize,
}

impl Default for SpendUpdateQueue {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }
}

impl SpendUpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, update: SpendUpdate) {
        let mut buffer = self.buffer.lock().expect("spend queue poisoned");
        Self::push_locked(&mut buffer, self.capacity, update);
    }

    pub fn extend(&self, updates: impl IntoIterator<Item = SpendUpdate>) {
        let mut buffer = self.buffer.lock().expect("spend queue poisoned");
        for update in updates {
            Self::push_locked(&mut buffer, self.capacity, update);
        }
    }

    fn push_locked(buffer: &mut VecDeque<SpendUpdate>, capacity: usize, update: SpendUpdate) {
        metrics::counter!("spend_queue_updates_total").increment(1);
        if buffer.len() >= capacity {
            buffer.pop_front();
            metrics::counter!("spend_queue_overflow_total").increment(1);
            warn!(capacity, "spend queue full, dropping oldest update");
        }
        buffer.push_back(update);
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().expect("spend queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain and aggregate everything queued so far.
    ///
    /// The result always contains every known entity category, empty or not.
    /// Updates with a missing entity id fall into the empty-string bucket;
    /// a missing cost counts as zero. Both are producer bugs worth keeping
    /// visible in the output rather than silently dropping.
    pub fn flush(&self) -> SpendByEntity {
        let drained = std::mem::take(&mut *self.buffer.lock().expect("spend queue poisoned"));

        let mut result: SpendByEntity = EntityKind::ALL
            .into_iter()
            .map(|kind| (kind, HashMap::new()))
            .collect();

        for update in drained {
            if update.entity_type == EntityKind::Unknown {
                debug!("dropping spend update with unknown entity type");
                metrics::counter!("spend_queue_unknown_entity_total").increment(1);
                continue;
            }
            let entity_id = update.entity_id.unwrap_or_default();
            let cost = update.response_cost.unwrap_or(Decimal::ZERO);
            *result
                .get_mut(&update.entity_type)
                .expect("all known kinds are pre-seeded")
                .entry(entity_id)
                .or_insert(Decimal::ZERO) += cost;
        }

        result
    }
}

/// Queue of daily aggregate deltas, merged by dimension key as they arrive
/// so the flush is already one row per (entity, day, dimensions).
#[derive(Debug, Default)]
pub struct DailySpendQueue {
    buffer: Mutex<HashMap<DailySpendKey, DailySpendDelta>>,
}

impl DailySpendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, key: DailySpendKey, delta: DailySpendDelta) {
        metrics::counter!("daily_spend_queue_updates_total").increment(1);
        self.buffer
            .lock()
            .expect("daily spend queue poisoned")
            .entry(key)
            .or_default()
            .merge(&delta);
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().expect("daily spend queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flush(&self) -> HashMap<DailySpendKey, DailySpendDelta> {
        std::mem::take(&mut *self.buffer.lock().expect("daily spend queue poisoned"))
    }
}

/// Queue of per-budget spend deltas, merged by budget id.
#[derive(Debug, Default)]
pub struct BudgetSpendQueue {
    buffer: Mutex<HashMap<String, Decimal>>,
}

impl BudgetSpendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, budget_id: impl Into<String>, amount: Decimal) {
        *self
            .buffer
            .lock()
            .expect("budget spend queue poisoned")
            .entry(budget_id.into())
            .or_insert(Decimal::ZERO) += amount;
    }

    pub fn is_empty(&self) -> bool {
        self.buffer
            .lock()
            .expect("budget spend queue poisoned")
            .is_empty()
    }

    pub fn flush(&self) -> HashMap<String, Decimal> {
        std::mem::take(&mut *self.buffer.lock().expect("budget spend queue poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn update(kind: EntityKind, id: Option<&str>, cost: Option<&str>) -> SpendUpdate {
        SpendUpdate {
            entity_type: kind,
            entity_id: id.map(String::from),
            response_cost: cost.map(|c| c.parse().unwrap()),
        }
    }

    #[test]
    fn test_flush_aggregates_per_entity() {
        let queue = SpendUpdateQueue::new();
        queue.push(update(EntityKind::Key, Some("k-1"), Some("0.05")));
        queue.push(update(EntityKind::Key, Some("k-1"), Some("0.03")));
        queue.push(update(EntityKind::Key, Some("k-2"), Some("0.10")));
        queue.push(update(EntityKind::Team, Some("t-1"), Some("0.08")));

        let flushed = queue.flush();
        assert_eq!(
            flushed[&EntityKind::Key]["k-1"],
            "0.08".parse::<Decimal>().unwrap()
        );
        assert_eq!(
            flushed[&EntityKind::Key]["k-2"],
            "0.10".parse::<Decimal>().unwrap()
        );
        assert_eq!(
            flushed[&EntityKind::Team]["t-1"],
            "0.08".parse::<Decimal>().unwrap()
        );
    }

    #[test]
    fn test_flush_always_contains_every_category() {
        let queue = SpendUpdateQueue::new();
        queue.push(update(EntityKind::User, Some("u-1"), Some("1")));

        let flushed = queue.flush();
        for kind in EntityKind::ALL {
            assert!(flushed.contains_key(&kind), "missing category {kind}");
        }
        assert!(flushed[&EntityKind::Tag].is_empty());
    }

    #[test]
    fn test_missing_id_and_cost_are_coerced() {
        let queue = SpendUpdateQueue::new();
        queue.push(update(EntityKind::User, None, Some("0.50")));
        queue.push(update(EntityKind::User, Some("u-1"), None));

        let flushed = queue.flush();
        assert_eq!(
            flushed[&EntityKind::User][""],
            "0.50".parse::<Decimal>().unwrap()
        );
        assert_eq!(flushed[&EntityKind::User]["u-1"], Decimal::ZERO);
    }

    #[test]
    fn test_unknown_entity_type_aggregates_nowhere() {
        let queue = SpendUpdateQueue::new();
        queue.push(update(EntityKind::Unknown, Some("x"), Some("5")));

        let flushed = queue.flush();
        assert!(!flushed.contains_key(&EntityKind::Unknown));
        assert!(flushed.values().all(|per_entity| per_entity.is_empty()));
    }

    #[test]
    fn test_flush_empties_the_queue() {
        let queue = SpendUpdateQueue::new();
        queue.push(update(EntityKind::Key, Some("k-1"), Some("1")));
        assert_eq!(queue.len(), 1);
        queue.flush();
        assert!(queue.is_empty());
        let again = queue.flush();
        assert!(again[&EntityKind::Key].is_empty());
    }

    #[test]
    fn test_full_queue_drops_oldest_first() {
        let queue = SpendUpdateQueue::with_capacity(2);
        queue.push(update(EntityKind::Key, Some("k-1"), Some("1")));
        queue.push(update(EntityKind::Key, Some("k-2"), Some("1")));
        queue.push(update(EntityKind::Key, Some("k-3"), Some("1")));

        assert_eq!(queue.len(), 2);
        let flushed = queue.flush();
        assert!(!flushed[&EntityKind::Key].contains_key("k-1"));
        assert!(flushed[&EntityKind::Key].contains_key("k-2"));
        assert!(flushed[&EntityKind::Key].contains_key("k-3"));
    }

    #[test]
    fn test_concurrent_producers_lose_nothing_across_flushes() {
        use std::sync::Arc;
        use std::thread;

        let queue = Arc::new(SpendUpdateQueue::new());
        let producers = 8;
        let per_producer = 250;

        let handles: Vec<_> = (0..producers)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for _ in 0..per_producer {
                        queue.push(update(EntityKind::Key, Some("k-1"), Some("1")));
                    }
                })
            })
            .collect();

        // Flush while producers are still pushing; late pushes land in the
        // fresh buffer and come out on the next flush.
        let mid = queue.flush();
        for handle in handles {
            handle.join().unwrap();
        }
        let rest = queue.flush();

        let sum_for = |flushed: &SpendByEntity| {
            flushed[&EntityKind::Key]
                .get("k-1")
                .copied()
                .unwrap_or(Decimal::ZERO)
        };
        assert_eq!(
            sum_for(&mid) + sum_for(&rest),
            Decimal::new((producers * per_producer) as i64, 0)
        );
        assert!(queue.is_empty());
    }

    fn daily_key(id: &str, model: &str) -> DailySpendKey {
        DailySpendKey {
            entity_kind: EntityKind::User,
            entity_id: id.to_string(),
            date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            api_key: "hash-a".to_string(),
            model: model.to_string(),
            model_group: String::new(),
            provider: "openai".to_string(),
            endpoint: String::new(),
            tool_name: String::new(),
        }
    }

    #[test]
    fn test_daily_queue_merges_on_push() {
        let queue = DailySpendQueue::new();
        let delta = DailySpendDelta {
            prompt_tokens: 10,
            api_requests: 1,
            successful_requests: 1,
            ..Default::default()
        };
        queue.push(daily_key("u-1", "gpt-4o"), delta.clone());
        queue.push(daily_key("u-1", "gpt-4o"), delta.clone());
        queue.push(daily_key("u-1", "claude-sonnet"), delta);

        assert_eq!(queue.len(), 2);
        let flushed = queue.flush();
        assert_eq!(flushed[&daily_key("u-1", "gpt-4o")].prompt_tokens, 20);
        assert_eq!(flushed[&daily_key("u-1", "claude-sonnet")].prompt_tokens, 10);
        assert!(queue.is_empty());
    }
}
