//! Bounded LRU result cache with per-kind TTLs.
//!
//! Keys are lowercase hex of SHA-256 over the kind name and the canonical
//! JSON of the concrete arguments. Credential-resolved fields are replaced
//! with a stable placeholder before keying, upstream of this module, so no
//! secret ever participates in a key.

use indexmap::IndexMap;
use serde_json::Value;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use cascade_core::{hash_hex, CacheConfig};
use cascade_catalog::OperationKind;

/// Read-only counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub insertions: u64,
    pub size: usize,
}

#[derive(Debug)]
struct CacheEntry {
    value: Value,
    kind: OperationKind,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct CacheInner {
    /// Insertion/recency order: front is least recently used.
    entries: IndexMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
    insertions: u64,
}

/// Process-wide result cache, shared by concurrent executions.
#[derive(Debug)]
pub struct ResultCache {
    config: CacheConfig,
    inner: Mutex<CacheInner>,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// TTL for a kind: per-kind override, else the default for kinds the
    /// catalog marks cacheable. Zero means "never cache".
    pub fn ttl_for(&self, kind: OperationKind) -> Duration {
        if !self.config.enabled || !kind.descriptor().cacheable {
            return Duration::ZERO;
        }
        let seconds = self
            .config
            .per_kind_ttl_sec
            .get(kind.as_str())
            .copied()
            .unwrap_or(self.config.default_ttl_sec);
        Duration::from_secs(seconds)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let mut inner = self.inner.lock().expect("cache lock");
        let expired = match inner.entries.get(key) {
            None => {
                inner.misses += 1;
                return None;
            }
            Some(entry) => entry.expires_at <= Instant::now(),
        };
        if expired {
            inner.entries.shift_remove(key);
            inner.misses += 1;
            return None;
        }
        // Refresh recency: move the entry to the back of the order.
        let index = inner.entries.get_index_of(key).expect("present");
        let last = inner.entries.len() - 1;
        inner.entries.move_index(index, last);
        inner.hits += 1;
        inner.entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn set(&self, kind: OperationKind, key: String, value: Value) {
        let ttl = self.ttl_for(kind);
        if ttl.is_zero() {
            return;
        }
        let mut inner = self.inner.lock().expect("cache lock");
        while inner.entries.len() >= self.config.max_size && !inner.entries.contains_key(&key) {
            inner.entries.shift_remove_index(0);
            inner.evictions += 1;
        }
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                kind,
                expires_at: Instant::now() + ttl,
            },
        );
        inner.insertions += 1;
    }

    /// Drop entries for one kind, or everything.
    pub fn invalidate(&self, kind: Option<OperationKind>) {
        let mut inner = self.inner.lock().expect("cache lock");
        match kind {
            Some(kind) => inner.entries.retain(|_, entry| entry.kind != kind),
            None => inner.entries.clear(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("cache lock");
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            insertions: inner.insertions,
            size: inner.entries.len(),
        }
    }
}

/// Cache key for `(kind, canonicalArgs)`.
pub fn cache_key(kind: OperationKind, canonical_args: &Value) -> String {
    let payload = format!("{}\n{}", kind.as_str(), canonical_json(canonical_args));
    hash_hex(payload.as_bytes())
}

/// Compact JSON with recursively sorted object keys, so logically equal
/// argument trees key identically.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
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
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn small_cache(max_size: usize) -> ResultCache {
        ResultCache::new(CacheConfig {
            enabled: true,
            default_ttl_sec: 300,
            max_size,
            per_kind_ttl_sec: Default::default(),
        })
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let a = json!({"b": 1, "a": {"z": true, "y": [1, 2]}});
        let b = json!({"a": {"y": [1, 2], "z": true}, "b": 1});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":{"y":[1,2],"z":true},"b":1}"#);
    }

    #[test]
    fn test_key_depends_on_kind_and_args() {
        let args = json!({"url": "https://x/"});
        let k1 = cache_key(OperationKind::ApiCall, &args);
        let k2 = cache_key(OperationKind::FilterData, &args);
        let k3 = cache_key(OperationKind::ApiCall, &json!({"url": "https://y/"}));
        assert_ne!(k1, k2);
        assert_ne!(k1, k3);
        assert_eq!(k1, cache_key(OperationKind::ApiCall, &args));
        assert_eq!(k1.len(), 64);
    }

    #[test]
    fn test_hit_miss_counters() {
        let cache = small_cache(10);
        assert!(cache.get("k").is_none());
        cache.set(OperationKind::ApiCall, "k".into(), json!(1));
        assert_eq!(cache.get("k"), Some(json!(1)));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn test_lru_eviction_order() {
        let cache = small_cache(2);
        cache.set(OperationKind::ApiCall, "a".into(), json!(1));
        cache.set(OperationKind::ApiCall, "b".into(), json!(2));
        // touch "a" so "b" becomes least recently used
        assert!(cache.get("a").is_some());
        cache.set(OperationKind::ApiCall, "c".into(), json!(3));
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_non_cacheable_kind_never_stored() {
        let cache = small_cache(10);
        cache.set(OperationKind::Wait, "w".into(), json!(null));
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn test_per_kind_ttl_zero_disables() {
        let cache = ResultCache::new(CacheConfig {
            enabled: true,
            default_ttl_sec: 300,
            max_size: 10,
            per_kind_ttl_sec: [("FilterData".to_string(), 0u64)].into_iter().collect(),
        });
        cache.set(OperationKind::FilterData, "f".into(), json!([]));
        assert_eq!(cache.stats().size, 0);
        assert!(cache.ttl_for(OperationKind::FilterData).is_zero());
    }

    #[test]
    fn test_invalidate_by_kind() {
        let cache = small_cache(10);
        cache.set(OperationKind::ApiCall, "a".into(), json!(1));
        cache.set(OperationKind::FilterData, "f".into(), json!(2));
        cache.invalidate(Some(OperationKind::ApiCall));
        assert!(cache.get("a").is_none());
        assert!(cache.get("f").is_some());
        cache.invalidate(None);
        assert_eq!(cache.stats().size, 0);
    }
}
