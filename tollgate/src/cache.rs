//! Dynamic resource cache.
//!
//! Expensive per-configuration resources (upstream clients, router tables,
//! guardrail sessions) are built on first use, shared while hot, and torn
//! down when they idle out. Keys are canonical hashes of the resource
//! configuration, with embedded credential secrets replaced by their
//! identity hashes so two configurations that differ only in how they spell
//! the same credential share one resource.
//!
//! Lookups are single-flight: concurrent requests for the same key run one
//! build and everyone shares its result. Teardown runs exactly once per
//! instance, driven by the cache's eviction listener.

use crate::config::ResourceCacheConfig;
use crate::crypto::hash_secret;
use crate::errors::{Error, Result};
use moka::future::Cache;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// What to build, plus the configuration that identifies it.
#[derive(Debug, Clone)]
pub struct ResourceSpec {
    /// Resource family, e.g. "upstream_client"
    pub kind: String,
    pub config: Value,
}

impl ResourceSpec {
    pub fn new(kind: impl Into<String>, config: Value) -> Self {
        Self {
            kind: kind.into(),
            config,
        }
    }

    /// Canonical cache key: sha256 over the kind and the normalized config.
    ///
    /// serde_json serializes object keys in sorted order, so two configs
    /// that differ only in key ordering hash identically.
    pub fn cache_key(&self) -> String {
        let normalized = normalize(&self.config);
        let mut hasher = Sha256::new();
        hasher.update(self.kind.as_bytes());
        hasher.update(b"\0");
        hasher.update(normalized.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Replace embedded opaque secrets with their identity hashes so the raw
/// secret never feeds the cache key, and equivalent credentials converge.
fn normalize(value: &Value) -> Value {
    match value {
        Value::String(s) if s.starts_with("sk-") => Value::String(hash_secret(s)),
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), normalize(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

pub struct ResourceCache<R: Send + Sync + 'static> {
    cache: Cache<String, Arc<R>>,
}

impl<R: Send + Sync + 'static> ResourceCache<R> {
    /// Build a cache whose evictions hand the departing resource to
    /// `teardown` on the current runtime.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime: the eviction listener
    /// captures the current runtime handle to spawn teardown tasks.
    pub fn new<T, Fut>(config: &ResourceCacheConfig, teardown: T) -> Self
    where
        T: Fn(Arc<R>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        // The eviction listener is synchronous; captured handle lets it hand
        // async teardown back to the runtime.
        let handle = tokio::runtime::Handle::current();
        let cache = Cache::builder()
            .time_to_live(config.ttl)
            .max_capacity(config.capacity)
            .eviction_listener(move |key: Arc<String>, resource: Arc<R>, cause| {
                debug!(key = %key, ?cause, "tearing down evicted resource");
                handle.spawn(teardown(resource));
            })
            .build();
        Self { cache }
    }

    /// Return the live resource for this spec, building it if absent.
    /// Concurrent callers for the same key share one build.
    pub async fn get_or_build<F, Fut>(&self, spec: &ResourceSpec, build: F) -> Result<Arc<R>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        self.cache
            .try_get_with(spec.cache_key(), async move { build().await.map(Arc::new) })
            .await
            .map_err(|e: Arc<anyhow::Error>| {
                Error::Other(anyhow::anyhow!("resource build failed: {e}"))
            })
    }

    /// Evict now; teardown fires through the eviction listener.
    pub async fn invalidate(&self, spec: &ResourceSpec) {
        self.cache.invalidate(&spec.cache_key()).await;
    }

    pub fn live_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Flush pending cache maintenance so evictions (and their teardowns)
    /// are scheduled. Test hook.
    pub async fn sync(&self) {
        self.cache.run_pending_tasks().await;
    }
}
