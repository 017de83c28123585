//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides.
//! Variables prefixed with `TOLLGATE_` override YAML values; nested fields use
//! double underscores (`TOLLGATE_AUTH__STORAGE_FAILURE_POLICY=fail_open` sets
//! `auth.storage_failure_policy`).
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration: fail-closed auth, opaque keys only, 5s spend flushes.

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What identity and budget resolution do when storage cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageFailurePolicy {
    /// Admit the call with a degraded principal (no budgets, no entitlements
    /// beyond the credential itself). Spend is still queued.
    FailOpen,
    /// Reject the call with a 503-class error.
    FailClosed,
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Identity resolution and token verification
    pub auth: AuthConfig,
    /// Budget enforcement
    pub budget: BudgetConfig,
    /// Request/token rate enforcement
    pub rate: RateLimitConfig,
    /// Spend queue and background writer
    pub spend: SpendConfig,
    /// Dynamic resource cache
    pub resource_cache: ResourceCacheConfig,
}

/// Identity resolution configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    /// Single deployment-wide posture for storage outages during resolution.
    /// Applies to identity and budget lookups; the spend writer retries
    /// regardless.
    pub storage_failure_policy: StorageFailurePolicy,
    /// Upper bound on one storage round of credential resolution
    #[serde(with = "humantime_serde")]
    pub resolve_timeout: Duration,
    /// Signed-token (JWT) authentication. Disabled by default; opaque keys
    /// always work.
    pub token: TokenAuthConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            storage_failure_policy: StorageFailurePolicy::FailClosed,
            resolve_timeout: Duration::from_secs(5),
            token: TokenAuthConfig::default(),
        }
    }
}

/// Signed-token authentication configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TokenAuthConfig {
    /// Enable bearer-token (JWT) credentials
    pub enabled: bool,
    /// JWKS endpoint for verification keys. Required when `enabled` unless a
    /// static key set is installed programmatically.
    pub jwks_url: Option<String>,
    /// Expected `aud` claim. When unset, audience validation is skipped.
    pub audience: Option<String>,
    /// How long fetched verification keys stay cached before a refetch
    #[serde(with = "humantime_serde")]
    pub key_cache_ttl: Duration,
    /// Create principals on first sight of a valid token instead of
    /// rejecting unknown subjects
    pub upsert_principals: bool,
    /// Which claims carry which identity fields
    pub claim_mappings: ClaimMappings,
}

impl Default for TokenAuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            jwks_url: None,
            audience: None,
            key_cache_ttl: Duration::from_secs(600),
            upsert_principals: false,
            claim_mappings: ClaimMappings::default(),
        }
    }
}

/// Claim-to-field mappings for token credentials.
///
/// Versioned so deployments can pin a mapping shape and newer shapes can be
/// introduced without breaking existing config files.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClaimMappings {
    /// Mapping shape version. Only version 1 exists today.
    pub version: u8,
    /// Claim holding the user identifier
    pub user_id: String,
    /// Claim holding the team identifier
    pub team_id: String,
    /// Claim holding the organization identifier
    pub org_id: String,
    /// Claim holding role names (array of strings)
    pub roles: String,
    /// Claim holding OAuth-style scopes (space-separated string or array)
    pub scopes: String,
    /// Claim holding the user's email
    pub email: String,
}

impl Default for ClaimMappings {
    fn default() -> Self {
        Self {
            version: 1,
            user_id: "sub".to_string(),
            team_id: "team_id".to_string(),
            org_id: "org_id".to_string(),
            roles: "roles".to_string(),
            scopes: "scope".to_string(),
            email: "email".to_string(),
        }
    }
}

/// Budget enforcement configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BudgetConfig {
    /// How long loaded budget records stay cached. Enforcement reads the
    /// cache, so this bounds how stale a ceiling comparison can be.
    #[serde(with = "humantime_serde")]
    pub record_cache_ttl: Duration,
    /// Maximum cached budget records
    pub record_cache_capacity: u64,
    /// Budget applied to the deployment as a whole, checked last in the
    /// layer walk. None disables the global layer.
    pub global_budget_id: Option<String>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            record_cache_ttl: Duration::from_secs(10),
            record_cache_capacity: 10_000,
            global_budget_id: None,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Enable RPM/TPM enforcement
    pub enabled: bool,
    /// Counting window. Limits are expressed per minute regardless; this
    /// only controls the bucket granularity.
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(60),
        }
    }
}

/// Spend queue and writer configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpendConfig {
    /// How often the writer drains the queues
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    /// Maximum buffered spend updates. When the writer stalls and the buffer
    /// fills, the oldest updates are dropped and counted in the
    /// `spend_queue_overflow_total` metric.
    pub queue_capacity: usize,
    /// Maximum retry attempts for a failed commit before the batch is
    /// dropped and logged with full context
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff between retries.
    /// Actual delay is base_delay * 2^attempt, capped at `max_backoff_ms`.
    pub retry_base_delay_ms: u64,
    /// Upper bound on a single backoff delay
    pub max_backoff_ms: u64,
}

impl Default for SpendConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(5),
            queue_capacity: 100_000,
            max_retries: 3,
            retry_base_delay_ms: 100,
            max_backoff_ms: 10_000,
        }
    }
}

/// Dynamic resource cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceCacheConfig {
    /// How long an idle resource lives before teardown
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Maximum live resources
    pub capacity: u64,
}

impl Default for ResourceCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            capacity: 1_000,
        }
    }
}

impl Config {
    /// Figment for the given config file path plus `TOLLGATE_` env overrides.
    pub fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("TOLLGATE_").split("__"))
    }

    #[allow(clippy::result_large_err)]
    pub fn load(path: &str) -> Result<Self, figment::Error> {
        Self::figment(path).extract()
    }
}
