//! Query result cache — TTL + version-scoped, bounded.
//!
//! Entries are keyed by `(canonical query text, canonical parameters)`
//! and stamped with a version string; a version change invalidates the
//! scope lazily on read. At capacity, expired entries are evicted first,
//! then the oldest 10% in insertion order.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

pub const DEFAULT_CAPACITY: usize = 10_000;

struct CacheEntry {
    value: Value,
    expires_at: Instant,
    version: String,
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    insertion_order: VecDeque<String>,
}

/// Bounded TTL cache of query results.
pub struct QueryCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
}

impl QueryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                insertion_order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    /// Cache key for a query and its parameters. Parameters serialize
    /// through a BTreeMap so ordering is canonical.
    pub fn key(query_text: &str, params: &HashMap<String, String>) -> String {
        let sorted: BTreeMap<&String, &String> = params.iter().collect();
        format!(
            "{query_text}|{}",
            serde_json::to_string(&sorted).unwrap_or_default()
        )
    }

    /// Look up an entry. Expired or version-mismatched entries are
    /// removed and count as misses.
    pub fn get(&self, key: &str, version: &str) -> Option<Value> {
        let mut inner = self.inner.lock().expect("cache lock");
        let hit = match inner.entries.get(key) {
            None => return None,
            Some(entry) => {
                if entry.version == version && entry.expires_at > Instant::now() {
                    Some(entry.value.clone())
                } else {
                    None
                }
            }
        };
        if hit.is_none() {
            inner.entries.remove(key);
            inner.insertion_order.retain(|k| k != key);
        }
        hit
    }

    /// Insert an entry, evicting as needed.
    pub fn put(&self, key: &str, value: Value, version: &str, ttl: Duration) {
        let mut inner = self.inner.lock().expect("cache lock");

        if inner.entries.contains_key(key) {
            inner.insertion_order.retain(|k| k != key);
        } else if inner.entries.len() >= self.capacity {
            evict(&mut inner, self.capacity);
        }

        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
                version: version.to_string(),
            },
        );
        inner.insertion_order.push_back(key.to_string());
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// Drop expired entries; if the cache is still full, drop the oldest
/// tenth by insertion order.
fn evict(inner: &mut CacheInner, capacity: usize) {
    let CacheInner {
        entries,
        insertion_order,
    } = inner;

    let now = Instant::now();
    let expired: Vec<String> = entries
        .iter()
        .filter(|(_, e)| e.expires_at <= now)
        .map(|(k, _)| k.clone())
        .collect();
    for key in &expired {
        entries.remove(key);
    }
    insertion_order.retain(|k| entries.contains_key(k));

    if entries.len() >= capacity {
        let batch = (capacity / 10).max(1);
        for _ in 0..batch {
            let Some(key) = insertion_order.pop_front() else {
                break;
            };
            entries.remove(&key);
        }
    }
    debug!(
        expired = expired.len(),
        remaining = entries.len(),
        "cache eviction"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn put_then_get_same_version() {
        let cache = QueryCache::new(10);
        cache.put("k", json!([1, 2]), "v1", TTL);
        assert_eq!(cache.get("k", "v1"), Some(json!([1, 2])));
    }

    #[test]
    fn version_mismatch_is_a_miss_and_removes() {
        let cache = QueryCache::new(10);
        cache.put("k", json!(1), "v1", TTL);
        assert_eq!(cache.get("k", "v2"), None);
        // The stale entry is gone even for the original version.
        assert_eq!(cache.get("k", "v1"), None);
    }

    #[test]
    fn expired_entry_is_removed_on_read() {
        let cache = QueryCache::new(10);
        cache.put("k", json!(1), "v1", Duration::ZERO);
        assert_eq!(cache.get("k", "v1"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn expired_entries_evicted_before_live_ones() {
        let cache = QueryCache::new(3);
        cache.put("dead1", json!(1), "v", Duration::ZERO);
        cache.put("dead2", json!(2), "v", Duration::ZERO);
        cache.put("live", json!(3), "v", TTL);
        // At capacity: the expired entries must be the ones to go.
        cache.put("new", json!(4), "v", TTL);
        assert_eq!(cache.get("live", "v"), Some(json!(3)));
        assert_eq!(cache.get("new", "v"), Some(json!(4)));
    }

    #[test]
    fn oldest_tenth_evicted_when_full_of_live_entries() {
        let cache = QueryCache::new(10);
        for i in 0..10 {
            cache.put(&format!("k{i}"), json!(i), "v", TTL);
        }
        cache.put("k10", json!(10), "v", TTL);
        // capacity/10 == 1: only the oldest entry goes.
        assert_eq!(cache.get("k0", "v"), None);
        assert_eq!(cache.get("k1", "v"), Some(json!(1)));
        assert_eq!(cache.get("k10", "v"), Some(json!(10)));
    }

    #[test]
    fn reinsert_refreshes_value_and_order() {
        let cache = QueryCache::new(10);
        cache.put("k", json!(1), "v", TTL);
        cache.put("k", json!(2), "v", TTL);
        assert_eq!(cache.get("k", "v"), Some(json!(2)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn key_is_canonical_in_params_order() {
        let mut p1 = HashMap::new();
        p1.insert("a".to_string(), "1".to_string());
        p1.insert("b".to_string(), "2".to_string());
        let mut p2 = HashMap::new();
        p2.insert("b".to_string(), "2".to_string());
        p2.insert("a".to_string(), "1".to_string());
        assert_eq!(QueryCache::key("q", &p1), QueryCache::key("q", &p2));

        let mut p3 = HashMap::new();
        p3.insert("a".to_string(), "9".to_string());
        assert_ne!(QueryCache::key("q", &p1), QueryCache::key("q", &p3));
    }
}
