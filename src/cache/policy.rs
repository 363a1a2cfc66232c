//! Adaptive TTL and request-derived keys for expensive computations
//!
//! Values that were slow (or costly) to produce are kept longer. The TTL
//! grows linearly with the observed cost and is clamped to a window:
//!
//! ```text
//! ttl = clamp(min_ttl + cost_seconds * ttl_per_cost_second, min_ttl, max_ttl)
//! ```
//!
//! Keys are derived from the whole request payload as canonical JSON (object
//! keys sorted at every depth), hashed with SHA-256 and prefixed by class, so
//! two requests that differ only in field order share an entry.

use crate::cache::coordinator::CacheCoordinator;
use crate::cache::types::CacheKey;
use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Class tag for cached AI provider responses
pub const AI_RESPONSE_CLASS: &str = "ai_response";

/// TTL proportional to the cost of producing a value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveTtlPolicy {
    /// Floor, and the TTL of a free value
    pub min_ttl: Duration,

    /// Ceiling before jitter
    pub max_ttl: Duration,

    /// Extra TTL granted per second of cost
    pub ttl_per_cost_second: Duration,

    /// Jitter factor (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for AdaptiveTtlPolicy {
    fn default() -> Self {
        Self {
            // 15 minutes
            min_ttl: Duration::from_secs(15 * 60),
            // 12 hours
            max_ttl: Duration::from_secs(12 * 60 * 60),
            // 30 minutes per second of cost
            ttl_per_cost_second: Duration::from_secs(30 * 60),
            jitter: 0.1,
        }
    }
}

impl AdaptiveTtlPolicy {
    /// TTL for a value that took `cost` to produce, without jitter
    ///
    /// If `max_ttl` is below `min_ttl`, `min_ttl` wins.
    pub fn ttl_for_cost(&self, cost: Duration) -> Duration {
        let min = self.min_ttl.as_secs_f64();
        let max = self.max_ttl.as_secs_f64();
        let secs = min + cost.as_secs_f64() * self.ttl_per_cost_second.as_secs_f64();

        Duration::from_secs_f64(secs.min(max).max(min))
    }

    /// TTL for `cost` with random jitter of up to `jitter * ttl` either way
    pub fn ttl_with_jitter(&self, cost: Duration) -> Duration {
        let base = self.ttl_for_cost(cost);
        if self.jitter <= 0.0 {
            return base;
        }

        let base_secs = base.as_secs_f64();
        let jitter_range = base_secs * self.jitter.min(1.0);
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        let final_secs = (base_secs + jitter).max(1.0);

        Duration::from_secs_f64(final_secs)
    }
}

/// Builder for keys made of named request parameters
///
/// Parameter order does not matter.
pub struct RequestKeyBuilder {
    class: String,
    params: BTreeMap<String, Value>,
}

impl RequestKeyBuilder {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            params: BTreeMap::new(),
        }
    }

    /// Add a parameter; a repeated name replaces the earlier value
    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Build the cache key
    pub fn build(self) -> CacheKey {
        let mut canonical = String::new();
        write_canonical(
            &Value::Object(self.params.into_iter().collect()),
            &mut canonical,
        );
        format!("{}:{}", self.class, hex::encode(Sha256::digest(canonical.as_bytes())))
    }
}

/// Derive a key from a whole serializable request
pub fn derive_key<T: Serialize + ?Sized>(class: &str, request: &T) -> Result<CacheKey> {
    let value = serde_json::to_value(request)?;
    let mut canonical = String::new();
    write_canonical(&value, &mut canonical);
    Ok(format!(
        "{}:{}",
        class,
        hex::encode(Sha256::digest(canonical.as_bytes()))
    ))
}

/// Compact JSON with object keys sorted at every depth
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Request/response cache over a [`CacheCoordinator`] with cost-based TTLs
#[derive(Clone)]
pub struct AdaptiveCache {
    cache: Arc<CacheCoordinator>,
    policy: AdaptiveTtlPolicy,
    class: String,
}

impl AdaptiveCache {
    /// Wrap a cache, tagging entries as AI responses
    pub fn new(cache: Arc<CacheCoordinator>) -> Self {
        Self {
            cache,
            policy: AdaptiveTtlPolicy::default(),
            class: AI_RESPONSE_CLASS.to_string(),
        }
    }

    pub fn with_policy(mut self, policy: AdaptiveTtlPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = class.into();
        self
    }

    pub fn policy(&self) -> &AdaptiveTtlPolicy {
        &self.policy
    }

    pub fn inner(&self) -> Arc<CacheCoordinator> {
        self.cache.clone()
    }

    pub fn key_for<R: Serialize + ?Sized>(&self, request: &R) -> Result<CacheKey> {
        derive_key(&self.class, request)
    }

    /// Cached response for `request`, if any
    pub async fn get<R, T>(&self, request: &R) -> Option<T>
    where
        R: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        match self.key_for(request) {
            Ok(key) => self.cache.get_json(&key).await,
            Err(e) => {
                warn!("Cannot derive cache key: {}", e);
                None
            }
        }
    }

    /// Cache `response` for `request`, with a TTL chosen from `cost`
    pub async fn put<R, T>(&self, request: &R, response: &T, cost: Duration) -> bool
    where
        R: Serialize + ?Sized,
        T: Serialize + ?Sized,
    {
        let key = match self.key_for(request) {
            Ok(key) => key,
            Err(e) => {
                warn!("Cannot derive cache key: {}", e);
                return false;
            }
        };

        let ttl = self.policy.ttl_with_jitter(cost);
        debug!("Caching {} for {:?} (cost {:?})", key, ttl, cost);
        self.cache
            .set_json(&key, response, Some(ttl), Some(&self.class))
            .await
    }

    /// Return the cached response, or compute, cache and return it
    ///
    /// The computation's own error is returned untouched; caching problems
    /// never fail the call.
    pub async fn get_or_compute<R, T, E, F, Fut>(
        &self,
        request: &R,
        compute: F,
    ) -> std::result::Result<T, E>
    where
        R: Serialize + ?Sized,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(cached) = self.get(request).await {
            return Ok(cached);
        }

        let started = Instant::now();
        let response = compute().await?;
        self.put(request, &response, started.elapsed()).await;

        Ok(response)
    }
}
