//! # tollgate: Control-Plane Core for a Multi-Tenant AI Gateway
//!
//! `tollgate` is the admission and accounting layer that sits between a
//! gateway's data plane and its tenants. Every call presents a credential;
//! this crate decides whether the call may proceed and, once it completes,
//! attributes its cost to everyone who should pay for it.
//!
//! ## Request Flow
//!
//! Admission runs four stages, cheapest first, and the first failing stage
//! rejects the call:
//!
//! 1. **Identity** ([`auth::IdentityResolver`]) — the presented secret or
//!    signed token becomes a [`auth::Principal`]: the credential's ancestry
//!    (user, team, org, end customer) is walked to collect roles, scopes,
//!    allow-lists, rate ceilings, and budget references.
//! 2. **Policy** ([`auth::Authorizer`]) — route rules, scopes, model
//!    allow-lists, and tool allow-lists. Admins skip the first three but
//!    never the tool check.
//! 3. **Budgets** ([`budget::BudgetGuard`]) — a fixed ladder of budget
//!    layers is walked innermost first; an exhausted layer rejects with the
//!    layer named in the error.
//! 4. **Rates** ([`budget::rate::RateLimiter`]) — fixed-window RPM/TPM
//!    counters, with tokens reserved optimistically and corrected after the
//!    call reports actual usage.
//!
//! ## Spend Accounting
//!
//! Nothing on the request path writes spend. Completed calls push deltas
//! onto in-memory queues ([`spend::queue`]); one background
//! [`spend::writer::SpendWriter`] drains them on an interval and commits
//! idempotent additive upserts in a stable sort order, so any number of
//! gateway instances can flush into the same tables without deadlocking.
//!
//! ## Storage
//!
//! All persistence goes through the [`db::Storage`] trait. Production runs
//! against PostgreSQL ([`db::PgStorage`]); tests and embedded deployments
//! use [`db::MemoryStorage`], which mirrors the observable semantics.

pub mod auth;
pub mod budget;
pub mod cache;
pub mod config;
pub mod crypto;
pub mod db;
pub mod errors;
pub mod spend;
pub mod telemetry;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::Config;
pub use errors::{Error, Result};

use crate::auth::authorize::{Authorizer, RequestDescriptor};
use crate::auth::jwks::TokenVerifier;
use crate::auth::principal::Principal;
use crate::auth::IdentityResolver;
use crate::budget::rate::RateLimiter;
use crate::budget::BudgetGuard;
use crate::db::Storage;
use crate::spend::queue::{BudgetSpendQueue, DailySpendQueue, SpendUpdateQueue};
use crate::spend::writer::SpendWriter;
use crate::spend::{CallUsage, DailySpendDelta, DailySpendKey, SpendUpdate};
use crate::types::{BudgetLayer, CallId, EntityKind};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

/// An admitted call: everything [`AppState::record_completion`] needs to
/// settle it once the data plane reports the outcome.
#[derive(Debug)]
pub struct Admission {
    pub call_id: CallId,
    pub principal: Principal,
    model: String,
    estimated_tokens: u64,
}

/// Shared per-process state: storage, the admission pipeline, and the spend
/// queues the background writer drains.
pub struct AppState {
    pub storage: Arc<dyn Storage>,
    pub resolver: IdentityResolver,
    pub authorizer: Authorizer,
    pub budgets: BudgetGuard,
    pub rate: RateLimiter,
    spend_queue: Arc<SpendUpdateQueue>,
    daily_queue: Arc<DailySpendQueue>,
    budget_queue: Arc<BudgetSpendQueue>,
    global_budget_id: Option<String>,
    config: Config,
}

impl AppState {
    pub fn new(config: Config, storage: Arc<dyn Storage>, authorizer: Authorizer) -> Self {
        let resolver = IdentityResolver::new(Arc::clone(&storage), config.auth.clone());
        let budgets = BudgetGuard::new(
            Arc::clone(&storage),
            &config.budget,
            config.auth.storage_failure_policy,
        );
        let rate = RateLimiter::new(&config.rate);
        Self {
            storage,
            resolver,
            authorizer,
            budgets,
            rate,
            spend_queue: Arc::new(SpendUpdateQueue::with_capacity(config.spend.queue_capacity)),
            daily_queue: Arc::new(DailySpendQueue::new()),
            budget_queue: Arc::new(BudgetSpendQueue::new()),
            global_budget_id: config.budget.global_budget_id.clone(),
            config,
        }
    }

    /// Install a token verifier directly, bypassing JWKS discovery. For
    /// shared-secret deployments and tests.
    pub fn with_token_verifier(mut self, verifier: TokenVerifier) -> Self {
        self.resolver = self.resolver.with_verifier(verifier);
        self
    }

    /// Run the full admission pipeline for one call.
    ///
    /// `end_customer_id` is the caller-attributed end customer, if any;
    /// `estimated_tokens` is the data plane's pre-call token estimate, used
    /// for the optimistic TPM reservation.
    pub async fn check_request(
        &self,
        credential: &str,
        end_customer_id: Option<&str>,
        request: &RequestDescriptor<'_>,
        estimated_tokens: u64,
    ) -> Result<Admission> {
        let call_id = Uuid::new_v4();
        let model = request.model.unwrap_or_default().to_string();

        let outcome = async {
            let principal = self.resolver.resolve(credential, end_customer_id).await?;
            self.authorizer.authorize(&principal, request)?;
            self.budgets.check(&principal, request.model).await?;
            self.rate.check_and_reserve(&principal, &model, estimated_tokens)?;
            Ok(principal)
        }
        .await;

        match outcome {
            Ok(principal) => {
                metrics::counter!("gateway_requests_admitted_total").increment(1);
                debug!(
                    call_id = %types::abbrev_uuid(&call_id),
                    model,
                    degraded = principal.degraded,
                    "call admitted"
                );
                Ok(Admission {
                    call_id,
                    principal,
                    model,
                    estimated_tokens,
                })
            }
            Err(e) => {
                metrics::counter!("gateway_requests_rejected_total").increment(1);
                Err(e)
            }
        }
    }

    /// Settle a completed call: correct the rate reservation, count spend
    /// against the caller's budgets, and queue attribution deltas for the
    /// background writer. Never touches storage.
    pub fn record_completion(&self, admission: &Admission, usage: &CallUsage) {
        let actual_tokens =
            (usage.prompt_tokens + usage.completion_tokens).max(0) as u64;
        self.rate.record_usage(
            &admission.principal,
            &admission.model,
            admission.estimated_tokens,
            actual_tokens,
        );

        let cost = usage.response_cost;
        if cost != Decimal::ZERO {
            self.budgets.note_spend(&admission.principal, cost);
            for layer in BudgetLayer::WALK_ORDER {
                let budget_id = match layer {
                    BudgetLayer::Global => self.global_budget_id.as_deref(),
                    _ => admission.principal.budgets.for_layer(layer),
                };
                if let Some(budget_id) = budget_id {
                    self.budget_queue.push(budget_id, cost);
                }
            }
        }

        let entities = attributed_entities(&admission.principal, usage);
        self.spend_queue
            .extend(entities.iter().map(|(kind, id)| SpendUpdate {
                entity_type: *kind,
                entity_id: Some(id.clone()),
                response_cost: Some(cost),
            }));

        let delta = DailySpendDelta::from_usage(usage);
        for (kind, id) in entities {
            self.daily_queue.push(
                DailySpendKey {
                    entity_kind: kind,
                    entity_id: id,
                    date: usage.date,
                    api_key: usage.api_key.clone(),
                    model: usage.model.clone(),
                    model_group: usage.model_group.clone(),
                    provider: usage.provider.clone(),
                    endpoint: usage.endpoint.clone(),
                    tool_name: usage.tool_name.clone(),
                },
                delta.clone(),
            );
        }
    }

    /// A writer over this state's queues. Normally spawned through
    /// [`AppState::start_background`]; tests drive `flush_now` directly.
    pub fn spend_writer(&self) -> SpendWriter {
        let store: Arc<dyn db::store::SpendStore> = self.storage.clone();
        SpendWriter::new(
            store,
            Arc::clone(&self.spend_queue),
            Arc::clone(&self.daily_queue),
            Arc::clone(&self.budget_queue),
            self.config.spend.clone(),
        )
    }

    /// Spawn the background services. The returned handle owns their
    /// lifetime; dropping it without calling shutdown leaves them running.
    pub fn start_background(&self) -> BackgroundServices {
        let cancel = CancellationToken::new();
        let writer = self.spend_writer();
        let handle = tokio::spawn(writer.run(cancel.clone()));
        info!("background spend writer started");
        BackgroundServices {
            cancel,
            spend_writer: handle,
        }
    }
}

/// Entity categories a completed call is attributed to: the principal's
/// resolved ancestry, plus the call's own tags and agent.
fn attributed_entities(principal: &Principal, usage: &CallUsage) -> Vec<(EntityKind, String)> {
    let mut entities = Vec::with_capacity(8);
    if let Some(key_hash) = &principal.key_hash {
        entities.push((EntityKind::Key, key_hash.clone()));
    }
    if let Some(user_id) = &principal.user_id {
        entities.push((EntityKind::User, user_id.clone()));
    }
    if let Some(team_id) = &principal.team_id {
        entities.push((EntityKind::Team, team_id.clone()));
    }
    if let Some(org_id) = &principal.org_id {
        entities.push((EntityKind::Org, org_id.clone()));
    }
    if let Some(end_customer_id) = &principal.end_customer_id {
        entities.push((EntityKind::EndUser, end_customer_id.clone()));
    }
    // Membership rows are keyed team:user, one per member per team.
    if let (Some(team_id), Some(user_id)) = (&principal.team_id, &principal.user_id) {
        entities.push((EntityKind::TeamMember, format!("{team_id}:{user_id}")));
    }
    for tag in &usage.tags {
        entities.push((EntityKind::Tag, tag.clone()));
    }
    if let Some(agent_id) = &usage.agent_id {
        entities.push((EntityKind::Agent, agent_id.clone()));
    }
    entities
}

/// Running background tasks and the token that stops them.
pub struct BackgroundServices {
    cancel: CancellationToken,
    spend_writer: tokio::task::JoinHandle<()>,
}

impl BackgroundServices {
    /// Stop the writer and wait for its final drain.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.spend_writer.await {
            error!(error = %e, "spend writer task panicked during shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::authorize::RouteRule;
    use crate::crypto::hash_secret;
    use crate::db::store::SpendStore;
    use crate::db::MemoryStorage;
    use crate::test_utils::{key_fixture, seeded_graph, TEST_END_CUSTOMER, TEST_SECRET};
    use chrono::NaiveDate;

    fn app(storage: Arc<MemoryStorage>) -> AppState {
        AppState::new(
            Config::default(),
            storage,
            Authorizer::new(vec![RouteRule::new("/v1/*")]),
        )
    }

    fn chat_request<'a>() -> RequestDescriptor<'a> {
        RequestDescriptor {
            route: "/v1/chat/completions",
            model: Some("gpt-4o"),
            body: None,
        }
    }

    fn usage_for(admission: &Admission, cost: Decimal) -> CallUsage {
        CallUsage::builder()
            .call_id(admission.call_id)
            .api_key(admission.principal.key_hash.clone().unwrap_or_default())
            .date(NaiveDate::from_ymd_opt(2025, 6, 1).unwrap())
            .model("gpt-4o".to_string())
            .provider("openai".to_string())
            .endpoint("/v1/chat/completions".to_string())
            .prompt_tokens(120)
            .completion_tokens(30)
            .response_cost(cost)
            .success(true)
            .build()
    }

    #[tokio::test]
    async fn test_full_pipeline_attributes_spend_everywhere() {
        let storage = seeded_graph().await;
        let state = app(storage.clone());

        let admission = state
            .check_request(TEST_SECRET, Some(TEST_END_CUSTOMER), &chat_request(), 200)
            .await
            .unwrap();
        state.record_completion(&admission, &usage_for(&admission, Decimal::new(5, 0)));
        state.spend_writer().flush_now().await;

        let five = Decimal::new(5, 0);
        let key_hash = hash_secret(TEST_SECRET);
        assert_eq!(storage.entity_total(EntityKind::Key, &key_hash).await, five);
        assert_eq!(storage.entity_total(EntityKind::User, "u-1").await, five);
        assert_eq!(storage.entity_total(EntityKind::Team, "t-1").await, five);
        assert_eq!(storage.entity_total(EntityKind::Org, "o-1").await, five);
        assert_eq!(
            storage.entity_total(EntityKind::EndUser, TEST_END_CUSTOMER).await,
            five
        );

        let daily = storage
            .daily_row(&DailySpendKey {
                entity_kind: EntityKind::User,
                entity_id: "u-1".to_string(),
                date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
                api_key: key_hash,
                model: "gpt-4o".to_string(),
                model_group: String::new(),
                provider: "openai".to_string(),
                endpoint: "/v1/chat/completions".to_string(),
                tool_name: String::new(),
            })
            .await
            .unwrap();
        assert_eq!(daily.api_requests, 1);
        assert_eq!(daily.prompt_tokens, 120);
        assert_eq!(daily.spend, five);

        let key_budget = storage.find_budget("b-key").await.unwrap().unwrap();
        assert_eq!(key_budget.spent, five);
    }

    #[tokio::test]
    async fn test_tags_agent_and_membership_collect_spend() {
        let storage = seeded_graph().await;
        let state = app(storage.clone());

        let admission = state
            .check_request(TEST_SECRET, None, &chat_request(), 0)
            .await
            .unwrap();
        let usage = CallUsage::builder()
            .call_id(admission.call_id)
            .api_key(hash_secret(TEST_SECRET))
            .date(NaiveDate::from_ymd_opt(2025, 6, 1).unwrap())
            .model("gpt-4o".to_string())
            .provider("openai".to_string())
            .tags(vec!["env:prod".to_string(), "proj:atlas".to_string()])
            .agent_id("agent-9".to_string())
            .response_cost(Decimal::new(2, 0))
            .success(true)
            .build();
        state.record_completion(&admission, &usage);
        state.spend_writer().flush_now().await;

        let two = Decimal::new(2, 0);
        assert_eq!(storage.entity_total(EntityKind::Tag, "env:prod").await, two);
        assert_eq!(storage.entity_total(EntityKind::Tag, "proj:atlas").await, two);
        assert_eq!(storage.entity_total(EntityKind::Agent, "agent-9").await, two);
        assert_eq!(
            storage.entity_total(EntityKind::TeamMember, "t-1:u-1").await,
            two
        );
    }

    #[tokio::test]
    async fn test_unknown_credential_is_rejected() {
        let state = app(seeded_graph().await);
        let err = state
            .check_request("sk-never-issued", None, &chat_request(), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthFailed { .. }));
    }

    #[tokio::test]
    async fn test_unlisted_route_is_rejected() {
        let state = app(seeded_graph().await);
        let request = RequestDescriptor {
            route: "/admin/keys",
            ..Default::default()
        };
        let err = state
            .check_request(TEST_SECRET, None, &request, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn test_spend_counts_against_budget_before_flush() {
        let storage = seeded_graph().await;
        let state = app(storage);

        let admission = state
            .check_request(TEST_SECRET, None, &chat_request(), 0)
            .await
            .unwrap();
        // Blow through the key budget's 100 ceiling in one call.
        state.record_completion(&admission, &usage_for(&admission, Decimal::new(150, 0)));

        let err = state
            .check_request(TEST_SECRET, None, &chat_request(), 0)
            .await
            .unwrap_err();
        match err {
            Error::BudgetExceeded { layer, .. } => assert_eq!(layer, BudgetLayer::Key),
            other => panic!("expected BudgetExceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rpm_limit_rejects_within_window() {
        let storage = seeded_graph().await;
        let mut key = key_fixture(TEST_SECRET);
        key.rpm_limit = Some(1);
        storage.seed_key(key).await;
        let state = app(storage);

        assert!(state
            .check_request(TEST_SECRET, None, &chat_request(), 0)
            .await
            .is_ok());
        let err = state
            .check_request(TEST_SECRET, None, &chat_request(), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RateLimited { .. }));
    }

    #[tokio::test]
    async fn test_background_shutdown_drains_queued_spend() {
        let storage = seeded_graph().await;
        let state = app(storage.clone());
        let services = state.start_background();

        let admission = state
            .check_request(TEST_SECRET, None, &chat_request(), 0)
            .await
            .unwrap();
        state.record_completion(&admission, &usage_for(&admission, Decimal::ONE));
        services.shutdown().await;

        assert_eq!(
            storage.entity_total(EntityKind::User, "u-1").await,
            Decimal::ONE
        );
    }
}
