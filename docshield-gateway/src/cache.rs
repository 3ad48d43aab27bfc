//! In-memory TTL cache for gateway reads.
//!
//! Entries expire after their own time-to-live and are purged lazily on access
//! as well as by an optional background sweep. When the cache is full, the
//! entry stored longest ago is evicted before a new key is inserted.
//!
//! ```no_run
//! use docshield_gateway::cache::{CacheConfig, CacheKey, TtlCache};
//! use std::time::Duration;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CacheConfig::builder()
//!     .default_ttl(Duration::from_secs(120))
//!     .max_entries(500)
//!     .build()?;
//!
//! let cache = TtlCache::<CacheKey, String>::new(config);
//! cache.set(CacheKey::find_by_id("orders", "o-1"), "cached".to_string());
//! # Ok(())
//! # }
//! ```

use dashmap::DashMap;
use docshield_core::{canonical_params, QueryConstraint};
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Invalid cache configuration: {0}")]
    ConfigurationError(String),
}

/// Configuration for the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Time-to-live applied by [`TtlCache::set`].
    #[serde(with = "docshield_core::duration_millis")]
    pub default_ttl: Duration,

    /// Maximum number of entries held at once.
    pub max_entries: usize,

    /// Run a background sweep of expired entries.
    pub auto_cleanup: bool,

    #[serde(with = "docshield_core::duration_millis")]
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            max_entries: 1000,
            auto_cleanup: true,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        if self.max_entries == 0 {
            return Err(CacheError::ConfigurationError(
                "max_entries must be greater than 0".to_string(),
            ));
        }
        if self.auto_cleanup && self.cleanup_interval.is_zero() {
            return Err(CacheError::ConfigurationError(
                "cleanup_interval must be non-zero when auto_cleanup is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for creating CacheConfig instances.
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    default_ttl: Option<Duration>,
    max_entries: Option<usize>,
    auto_cleanup: Option<bool>,
    cleanup_interval: Option<Duration>,
}

impl CacheConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    pub fn max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max);
        self
    }

    pub fn auto_cleanup(mut self, enabled: bool) -> Self {
        self.auto_cleanup = Some(enabled);
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<CacheConfig, CacheError> {
        let default = CacheConfig::default();
        let config = CacheConfig {
            default_ttl: self.default_ttl.unwrap_or(default.default_ttl),
            max_entries: self.max_entries.unwrap_or(default.max_entries),
            auto_cleanup: self.auto_cleanup.unwrap_or(default.auto_cleanup),
            cleanup_interval: self.cleanup_interval.unwrap_or(default.cleanup_interval),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Which gateway read produced a cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheOperation {
    FindById,
    FindMany,
    /// Keys written by health probes
    Probe,
}

impl CacheOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOperation::FindById => "find_by_id",
            CacheOperation::FindMany => "find_many",
            CacheOperation::Probe => "probe",
        }
    }
}

/// Structured cache key: `collection:operation:params` when rendered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub collection: String,
    pub operation: CacheOperation,
    pub params: String,
}

impl CacheKey {
    pub fn new(
        collection: impl Into<String>,
        operation: CacheOperation,
        params: impl Into<String>,
    ) -> Self {
        Self {
            collection: collection.into(),
            operation,
            params: params.into(),
        }
    }

    pub fn find_by_id(collection: impl Into<String>, id: impl AsRef<str>) -> Self {
        Self::new(collection, CacheOperation::FindById, id.as_ref())
    }

    pub fn find_many(collection: impl Into<String>, constraints: &[QueryConstraint]) -> Self {
        Self::new(
            collection,
            CacheOperation::FindMany,
            canonical_params(constraints),
        )
    }

    pub fn probe(name: impl Into<String>) -> Self {
        Self::new("__health__", CacheOperation::Probe, name)
    }

    pub fn belongs_to(&self, collection: &str) -> bool {
        self.collection == collection
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.collection,
            self.operation.as_str(),
            self.params
        )
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            stored_at: Instant::now(),
            ttl,
        }
    }

    fn is_expired(&self) -> bool {
        self.stored_at.elapsed() > self.ttl
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
    pub max_entries: usize,
    pub default_ttl_ms: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Hits over lookups, 0.0 - 1.0
    pub hit_rate: f64,
}

struct CacheShared<K, V> {
    config: CacheConfig,
    entries: DashMap<K, CacheEntry<V>>,
    /// Held across the capacity check, eviction and insert of a write.
    admission: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K, V> CacheShared<K, V>
where
    K: Hash + Eq + Clone,
{
    fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        before.saturating_sub(self.entries.len())
    }
}

/// TTL cache backed by a `DashMap`.
///
/// Cloning is cheap and shares the underlying storage.
pub struct TtlCache<K, V> {
    shared: Arc<CacheShared<K, V>>,
}

impl<K, V> Clone for TtlCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates the cache and, when enabled and a Tokio runtime is available,
    /// starts the background sweep. The sweep ends once every handle to the
    /// cache is dropped.
    pub fn new(config: CacheConfig) -> Self {
        let shared = Arc::new(CacheShared {
            entries: DashMap::with_capacity(config.max_entries.min(4096)),
            admission: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            config,
        });

        if shared.config.auto_cleanup && !shared.config.cleanup_interval.is_zero() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let weak = Arc::downgrade(&shared);
                let interval = shared.config.cleanup_interval;
                handle.spawn(Self::cleanup_loop(weak, interval));
            }
        }

        Self { shared }
    }

    async fn cleanup_loop(weak: Weak<CacheShared<K, V>>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(shared) = weak.upgrade() else {
                break;
            };
            let purged = shared.purge_expired();
            if purged > 0 {
                debug!(purged, "Purged expired cache entries");
            }
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    pub fn set(&self, key: K, value: V) {
        self.set_with_ttl(key, value, self.shared.config.default_ttl);
    }

    pub fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let _admission = self.shared.admission.lock();
        let entries = &self.shared.entries;
        while entries.len() >= self.shared.config.max_entries && !entries.contains_key(&key) {
            if !self.evict_oldest() {
                break;
            }
        }
        entries.insert(key, CacheEntry::new(value, ttl));
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let entries = &self.shared.entries;
        if let Some(entry) = entries.get(key) {
            if entry.is_expired() {
                drop(entry);
                entries.remove_if(key, |_, e| e.is_expired());
                self.shared.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }

            self.shared.hits.fetch_add(1, Ordering::Relaxed);
            Some(entry.value.clone())
        } else {
            self.shared.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Like [`TtlCache::get`] but leaves the hit/miss counters alone.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.shared
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.value.clone())
    }

    /// Whether an unexpired entry exists. Does not touch hit/miss counters.
    pub fn has(&self, key: &K) -> bool {
        let entries = &self.shared.entries;
        match entries.get(key) {
            Some(entry) if entry.is_expired() => {
                drop(entry);
                entries.remove_if(key, |_, e| e.is_expired());
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    pub fn delete(&self, key: &K) -> Option<V> {
        self.shared.entries.remove(key).map(|(_, entry)| entry.value)
    }

    pub fn clear(&self) {
        self.shared.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.shared.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.entries.is_empty()
    }

    /// Removes every entry whose key matches `predicate`.
    pub fn invalidate_matching<F>(&self, predicate: F) -> usize
    where
        F: Fn(&K) -> bool,
    {
        let before = self.shared.entries.len();
        self.shared.entries.retain(|key, _| !predicate(key));
        let removed = before.saturating_sub(self.shared.entries.len());
        debug!(removed, "Invalidated cache entries");
        removed
    }

    /// Removes expired entries, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        self.shared.purge_expired()
    }

    pub fn stats(&self) -> CacheStats {
        let total_entries = self.shared.entries.len();
        let expired_entries = self
            .shared
            .entries
            .iter()
            .filter(|entry| entry.value().is_expired())
            .count();
        let hits = self.shared.hits.load(Ordering::Relaxed);
        let misses = self.shared.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        CacheStats {
            total_entries,
            valid_entries: total_entries.saturating_sub(expired_entries),
            expired_entries,
            max_entries: self.shared.config.max_entries,
            default_ttl_ms: self.shared.config.default_ttl.as_millis() as u64,
            hits,
            misses,
            evictions: self.shared.evictions.load(Ordering::Relaxed),
            hit_rate: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
        }
    }

    fn evict_oldest(&self) -> bool {
        let oldest = self
            .shared
            .entries
            .iter()
            .min_by_key(|entry| entry.value().stored_at)
            .map(|entry| entry.key().clone());

        match oldest {
            Some(key) => {
                if self.shared.entries.remove(&key).is_some() {
                    self.shared.evictions.fetch_add(1, Ordering::Relaxed);
                }
                true
            }
            None => false,
        }
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + fmt::Display + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Removes every entry whose rendered key matches `pattern`.
    pub fn invalidate_pattern(&self, pattern: &Regex) -> usize {
        self.invalidate_matching(|key| pattern.is_match(&key.to_string()))
    }
}
