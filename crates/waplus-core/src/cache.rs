use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::CacheUnavailable;
use crate::store::{Generation, IndicatorQuery, TimeWindow};
use crate::types::BasinIndicator;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_CACHE_MAX_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Timeseries,
    Summary,
    Rasters,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Timeseries => "timeseries",
            QueryKind::Summary => "summary",
            QueryKind::Rasters => "rasters",
        }
    }
}

/// Shape of a cached query. Empty basin or indicator sets mean "all", so such
/// keys intersect every pair on that axis.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: QueryKind,
    pub basins: BTreeSet<String>,
    pub indicators: BTreeSet<String>,
    pub window: Option<TimeWindow>,
}

impl CacheKey {
    pub fn for_query(kind: QueryKind, query: &IndicatorQuery) -> Self {
        Self {
            kind,
            basins: query.basins.clone(),
            indicators: query.indicators.clone(),
            window: query.window,
        }
    }

    pub fn rasters(basins: BTreeSet<String>) -> Self {
        Self {
            kind: QueryKind::Rasters,
            basins,
            indicators: BTreeSet::new(),
            window: None,
        }
    }

    /// Stable textual form used as the backend key.
    pub fn render(&self) -> String {
        fn set(values: &BTreeSet<String>) -> String {
            if values.is_empty() {
                "*".to_string()
            } else {
                values.iter().cloned().collect::<Vec<_>>().join(",")
            }
        }
        let window = match &self.window {
            Some(w) => format!("{}..{}", w.start.to_rfc3339(), w.end.to_rfc3339()),
            None => "*".to_string(),
        };
        format!(
            "{}|basins={}|indicators={}|window={}",
            self.kind.as_str(),
            set(&self.basins),
            set(&self.indicators),
            window
        )
    }

    pub fn intersects(&self, pair: &BasinIndicator) -> bool {
        (self.basins.is_empty() || self.basins.contains(&pair.basin_id))
            && (self.indicators.is_empty() || self.indicators.contains(&pair.indicator_id))
    }
}

#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub payload: serde_json::Value,
    pub generation: Generation,
    pub inserted_at: Instant,
}

/// Storage behind the cache manager. Failures never reach callers of the
/// manager; they are logged and treated as misses.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<StoredEntry>, CacheUnavailable>;
    /// Returns the keys evicted to make room, if any.
    async fn store(&self, key: &str, entry: StoredEntry) -> Result<Vec<String>, CacheUnavailable>;
    async fn remove(&self, key: &str) -> Result<(), CacheUnavailable>;
    async fn remove_prefix(&self, prefix: &str) -> Result<usize, CacheUnavailable>;
}

/// Bounded in-process backend; evicts the oldest entry when full.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, StoredEntry>>,
    max_entries: usize,
    available: AtomicBool,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates the backend going away; every call fails until restored.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<(), CacheUnavailable> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheUnavailable("memory cache disabled".to_string()))
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_MAX_ENTRIES)
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn load(&self, key: &str) -> Result<Option<StoredEntry>, CacheUnavailable> {
        self.check()?;
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn store(&self, key: &str, entry: StoredEntry) -> Result<Vec<String>, CacheUnavailable> {
        self.check()?;
        let mut entries = self.entries.lock();
        let mut evicted = Vec::new();
        if !entries.contains_key(key) && entries.len() >= self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
                evicted.push(oldest);
            }
        }
        entries.insert(key.to_string(), entry);
        Ok(evicted)
    }

    async fn remove(&self, key: &str) -> Result<(), CacheUnavailable> {
        self.check()?;
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<usize, CacheUnavailable> {
        self.check()?;
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before - entries.len())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_CACHE_TTL,
            max_entries: DEFAULT_CACHE_MAX_ENTRIES,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedValue {
    pub payload: serde_json::Value,
    pub generation: Generation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stale: u64,
}

/// Advisory read-through cache. Invalidation is recorded per pair as the
/// store generation that made it necessary; an entry is current only if it
/// was computed at or after every invalidation of the pairs it covers.
pub struct CacheManager {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
    invalidated_at: RwLock<HashMap<BasinIndicator, Generation>>,
    known_keys: Mutex<HashMap<String, CacheKey>>,
    hits: AtomicU64,
    misses: AtomicU64,
    stale: AtomicU64,
}

impl CacheManager {
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self {
            backend,
            ttl,
            invalidated_at: RwLock::new(HashMap::new()),
            known_keys: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale: AtomicU64::new(0),
        }
    }

    pub fn in_memory(config: CacheConfig) -> Self {
        Self::new(Arc::new(MemoryCache::new(config.max_entries)), config.ttl)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
        }
    }

    /// Number of keys tracked for scoped invalidation.
    pub fn tracked_keys(&self) -> usize {
        self.known_keys.lock().len()
    }

    pub async fn get(&self, key: &CacheKey) -> Option<CachedValue> {
        let rendered = key.render();
        let entry = match self.backend.load(&rendered).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                self.known_keys.lock().remove(&rendered);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            Err(err) => {
                warn!(key = %rendered, error = %err, "cache read failed; treating as miss");
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if entry.inserted_at.elapsed() >= self.ttl || self.invalidated_since(key, entry.generation) {
            self.stale.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            self.known_keys.lock().remove(&rendered);
            if let Err(err) = self.backend.remove(&rendered).await {
                warn!(key = %rendered, error = %err, "failed to drop stale cache entry");
            }
            return None;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(CachedValue {
            payload: entry.payload,
            generation: entry.generation,
        })
    }

    /// Stores `payload` as the result of `key` at store generation `generation`.
    pub async fn put(&self, key: &CacheKey, payload: serde_json::Value, generation: Generation) {
        if self.invalidated_since(key, generation) {
            debug!(key = %key.render(), generation, "skipping put older than a later invalidation");
            return;
        }
        let rendered = key.render();
        let entry = StoredEntry {
            payload,
            generation,
            inserted_at: Instant::now(),
        };
        match self.backend.store(&rendered, entry).await {
            Ok(evicted) => {
                let mut known = self.known_keys.lock();
                for gone in &evicted {
                    known.remove(gone);
                }
                known.insert(rendered, key.clone());
            }
            Err(err) => warn!(key = %rendered, error = %err, "cache write failed"),
        }
    }

    /// Marks every entry covering a pair in `scope` stale as of `generation`.
    pub async fn invalidate(&self, scope: &BTreeSet<BasinIndicator>, generation: Generation) {
        if scope.is_empty() {
            return;
        }
        {
            let mut invalidated = self.invalidated_at.write();
            for pair in scope {
                let slot = invalidated.entry(pair.clone()).or_insert(generation);
                *slot = (*slot).max(generation);
            }
        }

        let doomed: Vec<String> = {
            let mut known = self.known_keys.lock();
            let doomed: Vec<String> = known
                .iter()
                .filter(|(_, key)| scope.iter().any(|pair| key.intersects(pair)))
                .map(|(rendered, _)| rendered.clone())
                .collect();
            for rendered in &doomed {
                known.remove(rendered);
            }
            doomed
        };
        for rendered in &doomed {
            if let Err(err) = self.backend.remove(rendered).await {
                warn!(key = %rendered, error = %err, "cache eviction failed; entry will be rejected as stale");
            }
        }
        debug!(pairs = scope.len(), evicted = doomed.len(), generation, "cache invalidated");
    }

    /// Operator tool: drops every entry whose rendered key starts with `prefix`.
    pub async fn clear_prefix(&self, prefix: &str) -> usize {
        self.known_keys.lock().retain(|rendered, _| !rendered.starts_with(prefix));
        match self.backend.remove_prefix(prefix).await {
            Ok(removed) => removed,
            Err(err) => {
                warn!(prefix, error = %err, "cache prefix clear failed");
                0
            }
        }
    }

    /// Serves `key` from cache, or runs `compute` and caches its result at
    /// `generation`. Callers read the generation before computing.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &CacheKey,
        generation: Generation,
        compute: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(cached) = self.get(key).await {
            match serde_json::from_value::<T>(cached.payload) {
                Ok(value) => return Ok(value),
                Err(err) => warn!(key = %key.render(), error = %err, "cached payload has unexpected shape"),
            }
        }
        let value = compute().await?;
        match serde_json::to_value(&value) {
            Ok(payload) => self.put(key, payload, generation).await,
            Err(err) => warn!(key = %key.render(), error = %err, "result could not be cached"),
        }
        Ok(value)
    }

    fn invalidated_since(&self, key: &CacheKey, generation: Generation) -> bool {
        self.invalidated_at
            .read()
            .iter()
            .any(|(pair, at)| *at > generation && key.intersects(pair))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(basin: &str, indicator: &str) -> CacheKey {
        CacheKey::for_query(QueryKind::Summary, &IndicatorQuery::new([basin], [indicator]))
    }

    #[test]
    fn rendered_keys_are_order_independent() {
        let a = CacheKey::for_query(QueryKind::Timeseries, &IndicatorQuery::new(["B2", "B1"], ["et"]));
        let b = CacheKey::for_query(QueryKind::Timeseries, &IndicatorQuery::new(["B1", "B2"], ["et"]));
        assert_eq!(a.render(), b.render());
        assert_eq!(a.render(), "timeseries|basins=B1,B2|indicators=et|window=*");
    }

    #[test]
    fn wildcard_keys_intersect_everything_on_their_axis() {
        let all_basins = CacheKey::for_query(QueryKind::Summary, &IndicatorQuery::new(Vec::<String>::new(), ["et"]));
        assert!(all_basins.intersects(&BasinIndicator::new("B9", "et")));
        assert!(!all_basins.intersects(&BasinIndicator::new("B9", "runoff")));
        assert!(!key("B1", "et").intersects(&BasinIndicator::new("B2", "et")));
    }

    #[tokio::test]
    async fn invalidation_only_touches_intersecting_entries() {
        let cache = CacheManager::in_memory(CacheConfig::default());
        cache.put(&key("B1", "et"), serde_json::json!(1), 1).await;
        cache.put(&key("B2", "et"), serde_json::json!(2), 1).await;

        cache
            .invalidate(&[BasinIndicator::new("B1", "et")].into_iter().collect(), 2)
            .await;

        assert!(cache.get(&key("B1", "et")).await.is_none());
        assert_eq!(cache.get(&key("B2", "et")).await.map(|v| v.payload), Some(serde_json::json!(2)));
    }

    #[tokio::test]
    async fn backend_outage_degrades_to_misses() {
        let backend = Arc::new(MemoryCache::new(8));
        let cache = CacheManager::new(backend.clone(), DEFAULT_CACHE_TTL);
        cache.put(&key("B1", "et"), serde_json::json!(1), 1).await;
        backend.set_available(false);
        assert!(cache.get(&key("B1", "et")).await.is_none());
        cache.put(&key("B1", "et"), serde_json::json!(2), 1).await;
        backend.set_available(true);
        assert_eq!(cache.get(&key("B1", "et")).await.map(|v| v.payload), Some(serde_json::json!(1)));
    }

    #[tokio::test]
    async fn full_backend_evicts_oldest() {
        let backend = MemoryCache::new(2);
        let mut evicted = Vec::new();
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            evicted = backend
                .store(
                    name,
                    StoredEntry {
                        payload: serde_json::json!(i),
                        generation: 0,
                        inserted_at: Instant::now(),
                    },
                )
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(backend.len(), 2);
        assert_eq!(evicted, vec!["a".to_string()]);
        assert!(backend.load("a").await.unwrap().is_none());
        assert!(backend.load("c").await.unwrap().is_some());
    }
}
