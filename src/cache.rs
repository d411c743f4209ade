use std::{
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::constants::{METADATA_SUFFIX, QUOTA_EVICT_COUNT};
use crate::error::StoreError;
use crate::store::Store;

/// Source of "now" in epoch milliseconds.
pub trait Clock: Send {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default, Clone)]
pub struct ManualClock(Arc<AtomicI64>);

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self(Arc::new(AtomicI64::new(start_ms)))
    }

    pub fn advance(&self, by: Duration) {
        self.0.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Serialize, Deserialize)]
struct CacheEntry<T> {
    data: T,
    timestamp: i64,
    ttl: u64,
    expires: i64,
}

// Any stored entry, whatever its payload type.
type RawEntry = CacheEntry<serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMeta {
    pub key: String,
    pub created: i64,
    pub last_access: i64,
    pub access_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub size_bytes: usize,
}

impl CacheStats {
    pub fn size_kb(&self) -> f64 {
        self.size_bytes as f64 / 1024.0
    }

    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub data: T,
    pub from_cache: bool,
}

/// TTL cache over a [`Store`], namespaced by a key prefix.
///
/// Every storage failure is logged and degrades to a miss or a no-op; nothing
/// here returns a storage error to the caller. Recency bookkeeping lives in a
/// single metadata entry (`<prefix>metadata`) and only drives eviction.
pub struct CacheManager<S, C = SystemClock> {
    store: S,
    clock: C,
    prefix: String,
    default_ttl: Duration,
}

impl<S: Store> CacheManager<S> {
    pub fn new(store: S, prefix: impl Into<String>, default_ttl: Duration) -> Self {
        Self::with_clock(store, prefix, default_ttl, SystemClock)
    }
}

impl<S: Store, C: Clock> CacheManager<S, C> {
    pub fn with_clock(store: S, prefix: impl Into<String>, default_ttl: Duration, clock: C) -> Self {
        let mut manager = Self {
            store,
            clock,
            prefix: prefix.into(),
            default_ttl,
        };
        manager.cleanup();
        manager
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn metadata_key(&self) -> String {
        format!("{}{}", self.prefix, METADATA_SUFFIX)
    }

    // The metadata index shares the entry namespace.
    fn is_reserved(key: &str) -> bool {
        key == METADATA_SUFFIX
    }

    /// `endpoint?k1=v1&k2=v2` with parameters sorted by name.
    pub fn generate_key<K, V>(&self, endpoint: &str, params: &[(K, V)]) -> String
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut sorted: Vec<(&str, &str)> = params.iter().map(|(k, v)| (k.as_ref(), v.as_ref())).collect();
        sorted.sort_by(|a, b| a.0.cmp(b.0));
        let query = sorted
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        format!("{endpoint}?{query}")
    }

    pub fn set<T: Serialize>(&mut self, key: &str, data: &T, ttl: Duration) -> bool {
        if Self::is_reserved(key) {
            warn!("Refusing to cache under reserved key {key}");
            return false;
        }
        let now = self.clock.now_ms();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let entry = CacheEntry {
            data,
            timestamp: now,
            ttl: ttl_ms.unsigned_abs(),
            expires: now.saturating_add(ttl_ms),
        };
        let text = match serde_json::to_string(&entry) {
            Ok(text) => text,
            Err(e) => {
                warn!("Cache set failed for {key}: {e}");
                return false;
            }
        };

        let storage_key = self.storage_key(key);
        match self.store.set(&storage_key, &text) {
            Ok(()) => {}
            Err(StoreError::QuotaExceeded { .. }) => {
                warn!("Cache quota exceeded writing {key}, evicting {QUOTA_EVICT_COUNT} oldest");
                self.evict_oldest(QUOTA_EVICT_COUNT);
                if let Err(e) = self.store.set(&storage_key, &text) {
                    error!("Cache set retry failed for {key}: {e}");
                    return false;
                }
            }
            Err(e) => {
                warn!("Cache set failed for {key}: {e}");
                return false;
            }
        }

        self.record_write(key, now);
        true
    }

    pub fn get<T: DeserializeOwned>(&mut self, key: &str) -> Option<T> {
        if Self::is_reserved(key) {
            return None;
        }
        let storage_key = self.storage_key(key);
        let text = match self.store.get(&storage_key) {
            Ok(Some(text)) => text,
            Ok(None) => return None,
            Err(e) => {
                warn!("Cache get failed for {key}: {e}");
                return None;
            }
        };

        let entry: RawEntry = match serde_json::from_str(&text) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Dropping malformed cache entry {key}: {e}");
                self.remove(key);
                return None;
            }
        };
        if self.clock.now_ms() >= entry.expires {
            self.remove(key);
            return None;
        }

        match serde_json::from_value::<T>(entry.data) {
            Ok(data) => {
                self.record_access(key);
                Some(data)
            }
            Err(e) => {
                warn!("Cache entry {key} does not decode as the requested type: {e}");
                None
            }
        }
    }

    pub fn has(&mut self, key: &str) -> bool {
        self.get::<serde_json::Value>(key).is_some()
    }

    pub fn remove(&mut self, key: &str) {
        if Self::is_reserved(key) {
            return;
        }
        if let Err(e) = self.store.remove(&self.storage_key(key)) {
            warn!("Cache remove failed for {key}: {e}");
        }
        let mut metadata = self.metadata();
        let before = metadata.len();
        metadata.retain(|m| m.key != key);
        if metadata.len() != before {
            self.save_metadata(&metadata);
        }
    }

    /// Drops every entry under this prefix, metadata included.
    pub fn clear(&mut self) {
        let keys = match self.store.keys_with_prefix(&self.prefix) {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Cache clear failed: {e}");
                return;
            }
        };
        for key in keys {
            if let Err(e) = self.store.remove(&key) {
                warn!("Cache clear could not remove {key}: {e}");
            }
        }
        info!("Cache cleared");
    }

    /// Deletes expired and unreadable entries, returning how many went.
    pub fn cleanup(&mut self) -> usize {
        let keys = match self.store.keys_with_prefix(&self.prefix) {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Cache cleanup failed: {e}");
                return 0;
            }
        };
        let metadata_key = self.metadata_key();
        let now = self.clock.now_ms();

        let mut cleaned = 0;
        for storage_key in keys.into_iter().filter(|k| *k != metadata_key) {
            let live = match self.store.get(&storage_key) {
                Ok(Some(text)) => serde_json::from_str::<RawEntry>(&text)
                    .map(|entry| now < entry.expires)
                    .unwrap_or(false),
                Ok(None) => continue,
                Err(_) => false,
            };
            if !live {
                let key = storage_key[self.prefix.len()..].to_string();
                self.remove(&key);
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            info!("Cleaned {cleaned} expired cache entries");
        }
        cleaned
    }

    /// Removes the `count` entries with the oldest last access.
    pub fn evict_oldest(&mut self, count: usize) -> usize {
        let mut metadata = self.metadata();
        metadata.sort_by_key(|m| m.last_access);
        let victims: Vec<String> = metadata.into_iter().take(count).map(|m| m.key).collect();
        for key in &victims {
            debug!("Evicting cache entry {key}");
            self.remove(key);
        }
        victims.len()
    }

    /// Removes every entry whose key contains `pattern`.
    pub fn invalidate_pattern(&mut self, pattern: &str) -> usize {
        let keys = match self.store.keys_with_prefix(&self.prefix) {
            Ok(keys) => keys,
            Err(e) => {
                warn!("Invalidate pattern failed: {e}");
                return 0;
            }
        };
        let metadata_key = self.metadata_key();
        let matching: Vec<String> = keys
            .into_iter()
            .filter(|k| *k != metadata_key)
            .map(|k| k[self.prefix.len()..].to_string())
            .filter(|k| k.contains(pattern))
            .collect();
        for key in &matching {
            self.remove(key);
        }
        info!("Invalidated {} cache entries matching: {pattern}", matching.len());
        matching.len()
    }

    pub fn stats(&self) -> CacheStats {
        let keys = self.store.keys_with_prefix(&self.prefix).unwrap_or_default();
        keys.iter()
            .filter_map(|k| self.store.get(k).ok().flatten())
            .fold(CacheStats::default(), |acc, text| CacheStats {
                entries: acc.entries + 1,
                size_bytes: acc.size_bytes + text.len(),
            })
    }

    pub fn metadata(&self) -> Vec<EntryMeta> {
        match self.store.get(&self.metadata_key()) {
            Ok(Some(text)) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!("Get metadata failed: {e}");
                Vec::new()
            }),
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Get metadata failed: {e}");
                Vec::new()
            }
        }
    }

    fn save_metadata(&mut self, metadata: &[EntryMeta]) {
        let result = serde_json::to_string(metadata)
            .map_err(StoreError::from)
            .and_then(|text| self.store.set(&self.metadata_key(), &text));
        if let Err(e) = result {
            warn!("Metadata update failed: {e}");
        }
    }

    fn record_write(&mut self, key: &str, now: i64) {
        let mut metadata = self.metadata();
        match metadata.iter_mut().find(|m| m.key == key) {
            Some(existing) => {
                existing.last_access = now;
                existing.access_count += 1;
            }
            None => metadata.push(EntryMeta {
                key: key.to_string(),
                created: now,
                last_access: now,
                access_count: 1,
            }),
        }
        self.save_metadata(&metadata);
    }

    fn record_access(&mut self, key: &str) {
        let now = self.clock.now_ms();
        let mut metadata = self.metadata();
        if let Some(entry) = metadata.iter_mut().find(|m| m.key == key) {
            entry.last_access = now;
            entry.access_count += 1;
            self.save_metadata(&metadata);
        }
    }

    /// Cache-aside lookup: serve a live entry, otherwise call `fetch` and
    /// store its result. Errors from `fetch` are returned as they are.
    pub fn fetch_with_cache<T, E, F>(
        &mut self,
        url: &str,
        params: &[(String, String)],
        ttl: Duration,
        fetch: F,
    ) -> Result<Cached<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&str, &[(String, String)]) -> Result<T, E>,
    {
        let key = self.generate_key(url, params);
        if let Some(data) = self.get(&key) {
            debug!("Cache hit: {key}");
            return Ok(Cached { data, from_cache: true });
        }

        debug!("Cache miss, fetching: {url}");
        let data = fetch(url, params)?;
        self.set(&key, &data, ttl);
        Ok(Cached { data, from_cache: false })
    }
}

/// A [`CacheManager`] shared between the UI loop and fetch threads.
pub struct SharedCache<S, C = SystemClock>(Arc<Mutex<CacheManager<S, C>>>);

impl<S, C> Clone for SharedCache<S, C> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<S: Store, C: Clock> SharedCache<S, C> {
    pub fn new(manager: CacheManager<S, C>) -> Self {
        Self(Arc::new(Mutex::new(manager)))
    }

    pub fn lock(&self) -> MutexGuard<'_, CacheManager<S, C>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Same contract as [`CacheManager::fetch_with_cache`], but the lock is
    /// released while `fetch` runs.
    pub fn fetch_with_cache<T, E, F>(
        &self,
        url: &str,
        params: &[(String, String)],
        ttl: Duration,
        fetch: F,
    ) -> Result<Cached<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&str, &[(String, String)]) -> Result<T, E>,
    {
        let key = {
            let mut cache = self.lock();
            let key = cache.generate_key(url, params);
            if let Some(data) = cache.get(&key) {
                debug!("Cache hit: {key}");
                return Ok(Cached { data, from_cache: true });
            }
            key
        };

        debug!("Cache miss, fetching: {url}");
        let data = fetch(url, params)?;
        self.lock().set(&key, &data, ttl);
        Ok(Cached { data, from_cache: false })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    const TTL: Duration = Duration::from_millis(1000);

    fn manager(store: MemoryStore) -> (CacheManager<MemoryStore, ManualClock>, ManualClock) {
        let clock = ManualClock::new(1_700_000_000_000);
        let cache = CacheManager::with_clock(store, "netflow_", TTL, clock.clone());
        (cache, clock)
    }

    #[test]
    fn test_set_then_get_until_expiry() {
        let (mut cache, clock) = manager(MemoryStore::new());
        assert!(cache.set("k", &json!({"a": 1}), TTL));
        assert_eq!(cache.get::<serde_json::Value>("k"), Some(json!({"a": 1})));

        clock.advance(Duration::from_millis(1001));
        assert_eq!(cache.get::<serde_json::Value>("k"), None);
        assert_eq!(cache.store().get("netflow_k").unwrap(), None);
        assert!(cache.metadata().is_empty());
    }

    #[test]
    fn test_entry_expires_exactly_at_deadline() {
        let (mut cache, clock) = manager(MemoryStore::new());
        cache.set("k", &5u32, TTL);
        clock.advance(Duration::from_millis(999));
        assert_eq!(cache.get::<u32>("k"), Some(5));
        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.get::<u32>("k"), None);
    }

    #[test]
    fn test_generate_key_sorts_params() {
        let (cache, _) = manager(MemoryStore::new());
        let key = cache.generate_key("/api/v1/metrics/1/2", &[("start", "10"), ("end", "20")]);
        assert_eq!(key, "/api/v1/metrics/1/2?end=20&start=10");
        assert_eq!(cache.generate_key::<&str, &str>("/x", &[]), "/x?");
    }

    #[test]
    fn test_evict_oldest_removes_least_recent() {
        let (mut cache, clock) = manager(MemoryStore::new());
        for key in ["a", "b", "c", "d"] {
            cache.set(key, &key, Duration::from_secs(60));
            clock.advance(Duration::from_millis(10));
        }
        // Touch "a" so "b" becomes the oldest.
        assert_eq!(cache.get::<String>("a").as_deref(), Some("a"));

        assert_eq!(cache.evict_oldest(2), 2);
        assert!(!cache.has("b"));
        assert!(!cache.has("c"));
        assert!(cache.has("a"));
        assert!(cache.has("d"));

        assert_eq!(cache.evict_oldest(10), 2);
        assert!(cache.metadata().is_empty());
    }

    #[test]
    fn test_quota_evicts_then_retries() {
        let (mut cache, clock) = manager(MemoryStore::with_quota(1200));
        let payload = "x".repeat(100);
        let mut stored = 0;
        for i in 0..6 {
            if cache.set(&format!("key{i}"), &payload, Duration::from_secs(60)) {
                stored += 1;
            }
            clock.advance(Duration::from_millis(1));
        }
        assert_eq!(stored, 6);
        assert!(cache.has("key5"));
        assert!(!cache.has("key0"));
    }

    #[test]
    fn test_set_fails_when_value_never_fits() {
        let (mut cache, _) = manager(MemoryStore::with_quota(50));
        assert!(!cache.set("big", &"y".repeat(500), TTL));
        assert_eq!(cache.get::<String>("big"), None);
    }

    #[test]
    fn test_cleanup_drops_expired_and_malformed() {
        let mut store = MemoryStore::new();
        store.set("netflow_broken", "{nope").unwrap();
        store.set("elsewhere", "{nope").unwrap();
        let (mut cache, clock) = manager(store);
        assert!(cache.store().get("netflow_broken").unwrap().is_none());

        cache.set("short", &1, Duration::from_millis(10));
        cache.set("long", &2, Duration::from_secs(60));
        clock.advance(Duration::from_millis(20));
        assert_eq!(cache.cleanup(), 1);
        assert_eq!(cache.get::<i32>("long"), Some(2));
        assert!(cache.store().get("elsewhere").unwrap().is_some());
    }

    #[test]
    fn test_entry_missing_fields_is_removed() {
        let mut store = MemoryStore::new();
        let (mut cache, _) = manager(MemoryStore::new());
        store.set("netflow_bad", r#"{"expires": 9999999999999}"#).unwrap();
        store.set("netflow_typo", r#"{"data": 1, "timestamp": "x", "ttl": 1, "expires": 9999999999999}"#).unwrap();
        cache.store = store;

        assert_eq!(cache.get::<serde_json::Value>("bad"), None);
        assert!(cache.store().get("netflow_bad").unwrap().is_none());
        assert_eq!(cache.cleanup(), 1);
        assert!(cache.store().get("netflow_typo").unwrap().is_none());
    }

    #[test]
    fn test_wrong_payload_type_is_a_miss_not_a_delete() {
        let (mut cache, _) = manager(MemoryStore::new());
        cache.set("k", &"text", TTL);
        assert_eq!(cache.get::<u32>("k"), None);
        assert_eq!(cache.get::<String>("k").as_deref(), Some("text"));
    }

    #[test]
    fn test_metadata_key_is_reserved() {
        let (mut cache, _) = manager(MemoryStore::new());
        cache.set("k", &1, TTL);
        assert!(!cache.set(METADATA_SUFFIX, &"clobber", TTL));
        assert_eq!(cache.get::<serde_json::Value>(METADATA_SUFFIX), None);
        cache.remove(METADATA_SUFFIX);
        assert_eq!(cache.metadata().len(), 1);
        assert_eq!(cache.metadata()[0].key, "k");
    }

    #[test]
    fn test_huge_ttl_does_not_wrap_negative() {
        let (mut cache, clock) = manager(MemoryStore::new());
        assert!(cache.set("forever", &1, Duration::from_secs(u64::MAX)));
        clock.advance(Duration::from_secs(365 * 24 * 3600));
        assert_eq!(cache.get::<i32>("forever"), Some(1));
    }

    #[test]
    fn test_clear_and_invalidate() {
        let (mut cache, _) = manager(MemoryStore::new());
        cache.set("flows_agg_5min?exporter=eq.1", &1, TTL);
        cache.set("flows_agg_5min?exporter=eq.2", &2, TTL);
        cache.set("interface_metrics?exporter=eq.1", &3, TTL);

        assert_eq!(cache.invalidate_pattern("flows_agg"), 2);
        assert_eq!(cache.stats().entries, 2); // remaining entry + metadata

        cache.clear();
        assert_eq!(cache.stats(), CacheStats::default());
        assert!(cache.metadata().is_empty());
    }

    #[test]
    fn test_fetch_with_cache() {
        let (mut cache, _) = manager(MemoryStore::new());
        let params = vec![("end".to_string(), "2".to_string())];
        let mut calls = 0;

        let first = cache
            .fetch_with_cache("/rows", &params, TTL, |_, _| {
                calls += 1;
                Ok::<_, String>(vec![1, 2, 3])
            })
            .unwrap();
        assert!(!first.from_cache);

        let second = cache
            .fetch_with_cache::<Vec<i32>, _, _>("/rows", &params, TTL, |_, _| Err("should not be called".to_string()))
            .unwrap();
        assert!(second.from_cache);
        assert_eq!(second.data, vec![1, 2, 3]);
        assert_eq!(calls, 1);

        let err = cache
            .fetch_with_cache::<Vec<i32>, _, _>("/other", &params, TTL, |_, _| Err("HTTP 500".to_string()))
            .unwrap_err();
        assert_eq!(err, "HTTP 500");
    }

    #[test]
    fn test_shared_cache_fetch() {
        let (cache, _) = manager(MemoryStore::new());
        let shared = SharedCache::new(cache);
        let other = shared.clone();
        let got = shared
            .fetch_with_cache("/x", &[], TTL, |_, _| Ok::<_, ()>(json!([1])))
            .unwrap();
        assert!(!got.from_cache);
        let again = other
            .fetch_with_cache("/x", &[], TTL, |_, _| Err::<serde_json::Value, _>(()))
            .unwrap();
        assert!(again.from_cache);
    }
}
