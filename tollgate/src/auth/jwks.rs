//! Verification key material for signed-token credentials.
//!
//! Keys are addressed by `kid`. [`StaticKeys`] serves fixed key sets
//! (tests, shared-secret deployments); [`HttpJwks`] fetches from a JWKS
//! endpoint and caches decoding keys with a TTL so one IdP fetch serves many
//! verifications.

use crate::errors::{Error, Result};
use async_trait::async_trait;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use moka::future::Cache;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Something that can produce the decoding key for a token's `kid`.
#[async_trait]
pub trait KeySource: Send + Sync {
    async fn key_for(&self, kid: Option<&str>) -> Result<(DecodingKey, Algorithm)>;
}

/// Fixed key set installed at startup.
#[derive(Default)]
pub struct StaticKeys {
    keys: HashMap<String, (DecodingKey, Algorithm)>,
    fallback: Option<(DecodingKey, Algorithm)>,
}

impl StaticKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kid: impl Into<String>, key: DecodingKey, alg: Algorithm) {
        self.keys.insert(kid.into(), (key, alg));
    }

    /// Key used when the token carries no `kid`.
    pub fn set_fallback(&mut self, key: DecodingKey, alg: Algorithm) {
        self.fallback = Some((key, alg));
    }
}

#[async_trait]
impl KeySource for StaticKeys {
    async fn key_for(&self, kid: Option<&str>) -> Result<(DecodingKey, Algorithm)> {
        let found = match kid {
            Some(kid) => self.keys.get(kid).or(self.fallback.as_ref()),
            None => self.fallback.as_ref(),
        };
        found.cloned().ok_or_else(|| Error::AuthFailed {
            message: format!("no verification key for kid {kid:?}"),
        })
    }
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct Jwk {
    kid: Option<String>,
    #[serde(default)]
    alg: Option<String>,
    kty: String,
    n: Option<String>,
    e: Option<String>,
}

/// JWKS endpoint client with a per-kid TTL cache.
pub struct HttpJwks {
    url: String,
    client: reqwest::Client,
    cache: Cache<String, (DecodingKey, Algorithm)>,
}

impl HttpJwks {
    pub fn new(url: impl Into<String>, ttl: Duration) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            cache: Cache::builder().time_to_live(ttl).max_capacity(64).build(),
        }
    }

    async fn fetch_key(&self, kid: &str) -> anyhow::Result<(DecodingKey, Algorithm)> {
        let doc: JwksDocument = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let jwk = doc
            .keys
            .iter()
            .find(|k| k.kid.as_deref() == Some(kid))
            .ok_or_else(|| anyhow::anyhow!("kid {kid} not present in JWKS"))?;

        if jwk.kty != "RSA" {
            anyhow::bail!("unsupported key type {} for kid {kid}", jwk.kty);
        }
        let n = jwk.n.as_deref().ok_or_else(|| anyhow::anyhow!("RSA key missing n"))?;
        let e = jwk.e.as_deref().ok_or_else(|| anyhow::anyhow!("RSA key missing e"))?;
        let key = DecodingKey::from_rsa_components(n, e)?;
        let alg: Algorithm = jwk
            .alg
            .as_deref()
            .unwrap_or("RS256")
            .parse()
            .map_err(|_| anyhow::anyhow!("unsupported algorithm for kid {kid}"))?;
        Ok((key, alg))
    }
}

#[async_trait]
impl KeySource for HttpJwks {
    async fn key_for(&self, kid: Option<&str>) -> Result<(DecodingKey, Algorithm)> {
        let kid = kid.ok_or_else(|| Error::AuthFailed {
            message: "token has no kid header".to_string(),
        })?;
        // try_get_with collapses concurrent fetches of the same kid into one
        // request.
        self.cache
            .try_get_with(kid.to_string(), self.fetch_key(kid))
            .await
            .map_err(|e: Arc<anyhow::Error>| Error::AuthFailed {
                message: format!("verification key unavailable: {e}"),
            })
    }
}

/// Verifies bearer tokens and hands back their raw claims.
pub struct TokenVerifier {
    source: Arc<dyn KeySource>,
    audience: Option<String>,
}

impl TokenVerifier {
    pub fn new(source: Arc<dyn KeySource>, audience: Option<String>) -> Self {
        Self { source, audience }
    }

    pub async fn verify(&self, token: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
        let header = decode_header(token).map_err(|e| Error::AuthFailed {
            message: format!("malformed token: {e}"),
        })?;

        let (key, alg) = self.source.key_for(header.kid.as_deref()).await?;

        let mut validation = Validation::new(alg);
        match &self.audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }

        let data = decode::<serde_json::Value>(token, &key, &validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            let message = match e.kind() {
                ErrorKind::ExpiredSignature => "token expired".to_string(),
                ErrorKind::InvalidAudience => "token audience mismatch".to_string(),
                ErrorKind::ImmatureSignature => "token not yet valid".to_string(),
                ErrorKind::InvalidSignature => "token signature invalid".to_string(),
                other => format!("token rejected: {other:?}"),
            };
            Error::AuthFailed { message }
        })?;

        match data.claims {
            serde_json::Value::Object(map) => Ok(map),
            _ => Err(Error::AuthFailed {
                message: "token claims are not an object".to_string(),
            }),
        }
    }
}
