//! Query-result cache.
//!
//! A TTL store (moka) fronted by deterministic key generation and an
//! explicit per-entity-type key index. The store has no prefix scan, so
//! the index is what makes "drop everything cached for this type" cheap.
//!
//! Failure policy: a cache problem must never fail the read that hit it.
//! Serialization errors and store misbehavior are logged as warnings and
//! treated as a miss.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use moka::future::Cache;
use moka::Expiry;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::entity::Entity;
use crate::error::DalResult;
use crate::filter::Filter;
use crate::page::PageRequest;

/// TTL bounds in minutes; `0` selects the default.
pub const MIN_TTL_MINUTES: u64 = 1;
pub const MAX_TTL_MINUTES: u64 = 60;
pub const DEFAULT_TTL_MINUTES: u64 = 5;

/// Sliding-expiration ceiling.
const MAX_SLIDING: Duration = Duration::from_secs(10 * 60);

const DEFAULT_CAPACITY: u64 = 10_000;

type TypeIndex = Arc<RwLock<HashMap<String, HashSet<String>>>>;

#[derive(Clone)]
struct CachedValue {
    value: Arc<Value>,
    entity_type: Arc<str>,
    ttl: Duration,
    sliding: Duration,
}

/// Per-entry expiry: absolute TTL with a sliding window refreshed on
/// every read (`min(ttl/2, 10 min)`).
struct SlidingTtl;

impl Expiry<String, CachedValue> for SlidingTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedValue,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.sliding.min(value.ttl))
    }

    fn expire_after_read(
        &self,
        _key: &String,
        value: &CachedValue,
        read_at: Instant,
        _duration_until_expiry: Option<Duration>,
        last_modified_at: Instant,
    ) -> Option<Duration> {
        let elapsed = read_at.saturating_duration_since(last_modified_at);
        let remaining = value.ttl.saturating_sub(elapsed);
        Some(value.sliding.min(remaining))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CachedValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.sliding.min(value.ttl))
    }
}

/// Cache hit/miss counters.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

/// Process-wide query cache shared by all repositories.
pub struct QueryCache {
    store: Cache<String, CachedValue>,
    type_index: TypeIndex,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(max_capacity: u64) -> Self {
        let type_index: TypeIndex = Arc::new(RwLock::new(HashMap::new()));

        let index_for_listener = Arc::clone(&type_index);
        let store = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(SlidingTtl)
            .eviction_listener(move |key: Arc<String>, value: CachedValue, _cause| {
                let mut index = index_for_listener
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                if let Some(keys) = index.get_mut(value.entity_type.as_ref()) {
                    keys.remove(key.as_ref());
                    if keys.is_empty() {
                        index.remove(value.entity_type.as_ref());
                    }
                }
            })
            .build();

        Self {
            store,
            type_index,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Look up a cached value. Deserialization problems count as a miss.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let Some(cached) = self.store.get(key).await else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key, "cache miss");
            return None;
        };

        match serde_json::from_value(Value::clone(&cached.value)) {
            Ok(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key, "cache hit");
                Some(value)
            }
            Err(err) => {
                warn!(key, error = %err, "cached value failed to deserialize, treating as miss");
                self.store.invalidate(key).await;
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a value under an entity-scoped key. `ttl_minutes` is clamped
    /// to `[1, 60]`; `0` selects the default of 5. Serialization failures
    /// are logged and swallowed.
    pub async fn set<T: Serialize>(&self, entity_type: &str, key: String, value: &T, ttl_minutes: u64) {
        let json = match serde_json::to_value(value) {
            Ok(json) => json,
            Err(err) => {
                warn!(key, error = %err, "value failed to serialize, skipping cache insert");
                return;
            }
        };

        let ttl = clamp_ttl(ttl_minutes);
        let cached = CachedValue {
            value: Arc::new(json),
            entity_type: Arc::from(entity_type),
            ttl,
            sliding: sliding_window(ttl),
        };

        {
            let mut index = self
                .type_index
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            index
                .entry(entity_type.to_string())
                .or_default()
                .insert(key.clone());
        }
        self.store.insert(key, cached).await;
    }

    /// Cached read-through. Concurrent callers missing on the same key may
    /// each run `factory` once; one insert wins. The duplicate compute is
    /// accepted in exchange for keeping reads lock-free.
    pub async fn get_or_create<T, F, Fut>(
        &self,
        entity_type: &str,
        key: String,
        ttl_minutes: u64,
        factory: F,
    ) -> DalResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = DalResult<T>>,
    {
        if let Some(value) = self.get(&key).await {
            return Ok(value);
        }
        let value = factory().await?;
        self.set(entity_type, key, &value, ttl_minutes).await;
        Ok(value)
    }

    /// Drop one key.
    pub async fn remove(&self, key: &str) {
        self.store.invalidate(key).await;
    }

    /// Drop everything cached for one entity type.
    pub async fn invalidate_entity(&self, entity_type: &str) {
        let keys = {
            let mut index = self
                .type_index
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            index.remove(entity_type)
        };

        let Some(keys) = keys else {
            debug!(entity_type, "no cached entries for entity type");
            return;
        };

        let count = keys.len();
        for key in keys {
            self.store.invalidate(&key).await;
        }
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        debug!(entity_type, count, "invalidated cached entries for entity type");
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

fn clamp_ttl(minutes: u64) -> Duration {
    let minutes = if minutes == 0 {
        DEFAULT_TTL_MINUTES
    } else {
        minutes.clamp(MIN_TTL_MINUTES, MAX_TTL_MINUTES)
    };
    Duration::from_secs(minutes * 60)
}

fn sliding_window(ttl: Duration) -> Duration {
    (ttl / 2).min(MAX_SLIDING)
}

/// Key for a parameterized operation: `query:{type}:{op}:{params}`.
pub fn query_key<E: Entity>(operation: &str, params: &Value) -> String {
    format!("query:{}:{operation}:{params}", E::type_name())
}

/// Key for a condition-based operation; folds in the filter's canonical
/// form, literals included.
pub fn condition_key<E: Entity>(operation: &str, filter: &Filter) -> String {
    format!("query:{}:{operation}:{}", E::type_name(), filter.canonical())
}

/// Key for a paged operation.
pub fn paged_key<E: Entity>(operation: &str, page: &PageRequest, filter: Option<&Filter>) -> String {
    let base = format!(
        "query:{}:{operation}:{}:{}:{}:{}",
        E::type_name(),
        page.page_index(),
        page.page_size(),
        page.order_field().unwrap_or_else(|| E::id_field()),
        page.is_descending()
    );
    match filter {
        Some(filter) => format!("{base}:{}", filter.canonical()),
        None => base,
    }
}
