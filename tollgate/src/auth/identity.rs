//! Credential resolution: turn a presented secret or token into a
//! [`Principal`].
//!
//! Opaque keys are hashed and looked up; signed tokens are verified and
//! mapped through the configured claim mappings. Either way the identity
//! graph is walked upwards (user, team, org, plus the request's end
//! customer) to collect roles, allow-lists, and budget refs.
//!
//! Every storage round is bounded by `resolve_timeout`. When storage cannot
//! answer, the deployment-wide failure policy decides: fail-closed rejects
//! with a 503-class error, fail-open admits a degraded principal that
//! carries no budget refs.

use crate::auth::jwks::TokenVerifier;
use crate::auth::principal::{Principal, Role};
use crate::config::{AuthConfig, StorageFailurePolicy};
use crate::crypto::hash_secret;
use crate::db::errors::DbError;
use crate::db::models::{TeamRecord, UserRecord};
use crate::db::Storage;
use crate::errors::{Error, Result};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::warn;

pub struct IdentityResolver {
    storage: Arc<dyn Storage>,
    config: AuthConfig,
    verifier: Option<TokenVerifier>,
}

/// A bearer credential is a JWT if it has the three-part dot shape; opaque
/// keys are issued with an `sk-` prefix and never contain two dots.
fn looks_like_token(credential: &str) -> bool {
    !credential.starts_with("sk-") && credential.split('.').count() == 3
}

impl IdentityResolver {
    pub fn new(storage: Arc<dyn Storage>, config: AuthConfig) -> Self {
        let verifier = if config.token.enabled {
            config.token.jwks_url.as_ref().map(|url| {
                let source = crate::auth::jwks::HttpJwks::new(url, config.token.key_cache_ttl);
                TokenVerifier::new(Arc::new(source), config.token.audience.clone())
            })
        } else {
            None
        };
        Self {
            storage,
            config,
            verifier,
        }
    }

    /// Install a verifier directly, bypassing JWKS config. Used when the key
    /// material is static (shared-secret deployments, tests).
    pub fn with_verifier(mut self, verifier: TokenVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Resolve a credential into a principal. `end_customer_id` is the
    /// caller-attributed end customer for this request, if any.
    pub async fn resolve(
        &self,
        credential: &str,
        end_customer_id: Option<&str>,
    ) -> Result<Principal> {
        if looks_like_token(credential) {
            self.resolve_token(credential, end_customer_id).await
        } else {
            self.resolve_opaque(credential, end_customer_id).await
        }
    }

    async fn resolve_opaque(
        &self,
        credential: &str,
        end_customer_id: Option<&str>,
    ) -> Result<Principal> {
        let key_hash = hash_secret(credential);

        let key = match self.bounded(self.storage.find_key_by_hash(&key_hash)).await {
            Ok(Some(key)) => key,
            Ok(None) => {
                return Err(Error::AuthFailed {
                    message: "unknown credential".to_string(),
                })
            }
            Err(DbError::Unavailable { message }) => {
                return match self.config.storage_failure_policy {
                    StorageFailurePolicy::FailOpen => {
                        warn!(%message, "storage outage during key lookup, admitting degraded principal");
                        Ok(Principal {
                            key_hash: Some(key_hash),
                            end_customer_id: end_customer_id.map(String::from),
                            degraded: true,
                            ..Default::default()
                        })
                    }
                    StorageFailurePolicy::FailClosed => Err(Error::StorageUnavailable { message }),
                };
            }
            Err(e) => return Err(e.into()),
        };

        if key.blocked {
            return Err(Error::AuthFailed {
                message: "credential is blocked".to_string(),
            });
        }
        if key.expires_at.is_some_and(|at| at <= Utc::now()) {
            return Err(Error::AuthFailed {
                message: "credential has expired".to_string(),
            });
        }

        let mut principal = Principal {
            key_hash: Some(key.key_hash),
            key_alias: key.alias,
            user_id: key.user_id,
            team_id: key.team_id,
            end_customer_id: end_customer_id.map(String::from),
            roles: if key.roles.is_empty() {
                vec![Role::Customer]
            } else {
                key.roles
            },
            scopes: key.scopes,
            key_allowed_tools: key.allowed_tools,
            allowed_models: key.allowed_models,
            rate_limits: crate::auth::principal::RateLimits {
                rpm: key.rpm_limit,
                tpm: key.tpm_limit,
            },
            ..Default::default()
        };
        principal.budgets.key = key.budget_id;

        self.walk_ancestry(&mut principal, true).await?;
        Ok(principal)
    }

    async fn resolve_token(
        &self,
        credential: &str,
        end_customer_id: Option<&str>,
    ) -> Result<Principal> {
        let Some(verifier) = &self.verifier else {
            return Err(Error::AuthFailed {
                message: "token credentials are not enabled".to_string(),
            });
        };
        let claims = verifier.verify(credential).await?;
        let mappings = &self.config.token.claim_mappings;

        let user_id = claims
            .get(&mappings.user_id)
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::AuthFailed {
                message: format!("token is missing the {} claim", mappings.user_id),
            })?
            .to_string();

        let claim_roles: Vec<Role> = claims
            .get(&mappings.roles)
            .and_then(|v| v.as_array())
            .map(|roles| {
                roles
                    .iter()
                    .filter_map(|r| serde_json::from_value(r.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();

        let scopes: Vec<String> = match claims.get(&mappings.scopes) {
            Some(serde_json::Value::String(s)) => {
                s.split_whitespace().map(String::from).collect()
            }
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            _ => Vec::new(),
        };

        let user = match self.bounded(self.storage.find_user(&user_id)).await {
            Ok(found) => found,
            Err(DbError::Unavailable { message }) => {
                return match self.config.storage_failure_policy {
                    StorageFailurePolicy::FailOpen => {
                        warn!(%message, "storage outage during token principal lookup, admitting degraded principal");
                        Ok(Principal {
                            user_id: Some(user_id),
                            end_customer_id: end_customer_id.map(String::from),
                            roles: claim_roles,
                            scopes,
                            degraded: true,
                            ..Default::default()
                        })
                    }
                    StorageFailurePolicy::FailClosed => Err(Error::StorageUnavailable { message }),
                };
            }
            Err(e) => return Err(e.into()),
        };

        let user = match user {
            Some(user) => user,
            None if self.config.token.upsert_principals => {
                let record = UserRecord {
                    user_id: user_id.clone(),
                    email: claims
                        .get(&mappings.email)
                        .and_then(|v| v.as_str())
                        .map(String::from),
                    team_id: claims
                        .get(&mappings.team_id)
                        .and_then(|v| v.as_str())
                        .map(String::from),
                    roles: claim_roles.clone(),
                    budget_id: None,
                    blocked: false,
                };
                self.bounded(self.storage.upsert_user(&record)).await?;
                if let Some(team_id) = record.team_id.clone() {
                    self.provision_team(team_id, &claims).await?;
                }
                record
            }
            None => {
                return Err(Error::AuthFailed {
                    message: "token subject is not a known principal".to_string(),
                })
            }
        };

        if user.blocked {
            return Err(Error::AuthFailed {
                message: "principal is blocked".to_string(),
            });
        }

        let mut roles = user.roles;
        for role in claim_roles {
            if !roles.contains(&role) {
                roles.push(role);
            }
        }
        if roles.is_empty() {
            roles.push(Role::Customer);
        }

        let mut principal = Principal {
            user_id: Some(user.user_id),
            team_id: user.team_id,
            end_customer_id: end_customer_id.map(String::from),
            roles,
            scopes,
            ..Default::default()
        };
        principal.budgets.user = user.budget_id;

        self.walk_ancestry(&mut principal, false).await?;
        Ok(principal)
    }

    /// Create the team a verified token names, when it is not in storage
    /// yet. The org claim is carried over; everything else starts empty and
    /// is managed through the admin surface afterwards.
    async fn provision_team(
        &self,
        team_id: String,
        claims: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        if self.bounded(self.storage.find_team(&team_id)).await?.is_some() {
            return Ok(());
        }
        let record = TeamRecord {
            team_id,
            org_id: claims
                .get(&self.config.token.claim_mappings.org_id)
                .and_then(|v| v.as_str())
                .map(String::from),
            allowed_tools: None,
            budget_id: None,
            blocked: false,
        };
        self.bounded(self.storage.upsert_team(&record)).await?;
        Ok(())
    }

    /// Walk user (optional), team, org, and end customer, accumulating
    /// budget refs and team entitlements. A storage outage mid-walk either
    /// fails the call (fail-closed) or degrades the principal, dropping all
    /// budget refs collected so far (fail-open).
    async fn walk_ancestry(&self, principal: &mut Principal, resolve_user: bool) -> Result<()> {
        macro_rules! step {
            ($fut:expr) => {
                match self.bounded($fut).await {
                    Ok(found) => found,
                    Err(DbError::Unavailable { message }) => {
                        return match self.config.storage_failure_policy {
                            StorageFailurePolicy::FailOpen => {
                                warn!(%message, "storage outage during ancestry walk, degrading principal");
                                principal.degraded = true;
                                principal.budgets = Default::default();
                                Ok(())
                            }
                            StorageFailurePolicy::FailClosed => {
                                Err(Error::StorageUnavailable { message })
                            }
                        };
                    }
                    Err(e) => return Err(e.into()),
                }
            };
        }

        if resolve_user {
            if let Some(user_id) = principal.user_id.clone() {
                if let Some(user) = step!(self.storage.find_user(&user_id)) {
                    if user.blocked {
                        return Err(Error::AuthFailed {
                            message: "principal is blocked".to_string(),
                        });
                    }
                    for role in user.roles {
                        if !principal.roles.contains(&role) {
                            principal.roles.push(role);
                        }
                    }
                    if principal.team_id.is_none() {
                        principal.team_id = user.team_id;
                    }
                    principal.budgets.user = user.budget_id;
                } else {
                    warn!(user_id, "credential references a user that does not exist");
                }
            }
        }

        if let Some(team_id) = principal.team_id.clone() {
            if let Some(team) = step!(self.storage.find_team(&team_id)) {
                if team.blocked {
                    return Err(Error::AuthFailed {
                        message: "team is blocked".to_string(),
                    });
                }
                principal.team_allowed_tools = team.allowed_tools;
                principal.org_id = team.org_id;
                principal.budgets.team = team.budget_id;
            } else {
                warn!(team_id, "credential references a team that does not exist");
            }
        }

        if let Some(org_id) = principal.org_id.clone() {
            if let Some(org) = step!(self.storage.find_org(&org_id)) {
                principal.budgets.org = org.budget_id;
            }
        }

        if let Some(end_customer_id) = principal.end_customer_id.clone() {
            if let Some(end_customer) = step!(self.storage.find_end_customer(&end_customer_id)) {
                principal.budgets.end_customer = end_customer.budget_id;
            }
        }

        Ok(())
    }

    /// Bound one storage round by the configured resolve timeout. A timeout
    /// is indistinguishable from an outage for policy purposes.
    async fn bounded<T, F>(&self, fut: F) -> std::result::Result<T, DbError>
    where
        F: Future<Output = std::result::Result<T, DbError>>,
    {
        match timeout(self.config.resolve_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(DbError::Unavailable {
                message: format!(
                    "storage did not answer within {:?}",
                    self.config.resolve_timeout
                ),
            }),
        }
    }
}
