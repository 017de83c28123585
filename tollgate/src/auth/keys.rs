//! Credential issuance.
//!
//! The raw secret is returned exactly once, at issue time; only its hash is
//! stored. Duplicate secrets are rejected at the storage write, so two
//! concurrent issuances of the same secret cannot both succeed no matter how
//! they interleave.

use crate::crypto::{generate_api_key, hash_secret};
use crate::db::errors::DbError;
use crate::db::models::KeyRecord;
use crate::db::Storage;
use crate::errors::{Error, Result};
use crate::auth::principal::Role;
use bon::Builder;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

/// Parameters for issuing a new key.
#[derive(Debug, Clone, Default, Builder)]
pub struct IssueKeyRequest {
    /// Use this secret instead of generating one. Callers migrating existing
    /// keys set this; everyone else lets the gateway generate.
    pub secret: Option<String>,
    pub alias: Option<String>,
    pub user_id: Option<String>,
    pub team_id: Option<String>,
    #[builder(default)]
    pub roles: Vec<Role>,
    #[builder(default)]
    pub scopes: Vec<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub allowed_models: Option<Vec<String>>,
    pub budget_id: Option<String>,
    pub rpm_limit: Option<u32>,
    pub tpm_limit: Option<u64>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A freshly issued key. `secret` is the only copy that will ever exist.
#[derive(Debug, Clone)]
pub struct IssuedKey {
    pub secret: String,
    pub record: KeyRecord,
}

pub async fn issue_key(storage: &Arc<dyn Storage>, request: IssueKeyRequest) -> Result<IssuedKey> {
    let secret = request.secret.unwrap_or_else(generate_api_key);
    let key_hash = hash_secret(&secret);

    // Friendly pre-check; the insert below is what actually guarantees
    // uniqueness under concurrency.
    if storage.find_key_by_hash(&key_hash).await?.is_some() {
        return Err(Error::DuplicateKey { key_hash });
    }

    let record = KeyRecord {
        key_hash: key_hash.clone(),
        alias: request.alias,
        user_id: request.user_id,
        team_id: request.team_id,
        roles: request.roles,
        scopes: request.scopes,
        allowed_tools: request.allowed_tools,
        allowed_models: request.allowed_models,
        budget_id: request.budget_id,
        rpm_limit: request.rpm_limit,
        tpm_limit: request.tpm_limit,
        blocked: false,
        expires_at: request.expires_at,
        created_at: Utc::now(),
    };

    match storage.insert_key(&record).await {
        Ok(()) => {
            info!(alias = ?record.alias, "issued new key");
            Ok(IssuedKey { secret, record })
        }
        Err(DbError::UniqueViolation { .. }) => Err(Error::DuplicateKey { key_hash }),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStorage;

    fn storage() -> Arc<dyn Storage> {
        Arc::new(MemoryStorage::new())
    }

    #[tokio::test]
    async fn test_issue_generates_secret_and_stores_hash() {
        let storage = storage();
        let issued = issue_key(
            &storage,
            IssueKeyRequest::builder().alias("ci".to_string()).build(),
        )
        .await
        .unwrap();

        assert!(issued.secret.starts_with("sk-"));
        assert_eq!(issued.record.key_hash, hash_secret(&issued.secret));
        assert_ne!(issued.record.key_hash, issued.secret);

        let stored = storage
            .find_key_by_hash(&issued.record.key_hash)
            .await
            .unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_secret_is_conflict() {
        let storage = storage();
        let request = || {
            IssueKeyRequest::builder()
                .secret("sk-test-dup".to_string())
                .build()
        };
        issue_key(&storage, request()).await.unwrap();
        let err = issue_key(&storage, request()).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateKey { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_issuance_of_same_secret_has_one_winner() {
        let storage = storage();
        let request = || {
            IssueKeyRequest::builder()
                .secret("sk-test-dup".to_string())
                .build()
        };
        let (a, b) = tokio::join!(
            issue_key(&storage, request()),
            issue_key(&storage, request())
        );
        // Exactly one side wins, the other sees the conflict.
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        for result in [a, b] {
            if let Err(e) = result {
                assert!(matches!(e, Error::DuplicateKey { .. }));
            }
        }
    }
}
