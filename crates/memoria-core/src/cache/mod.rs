//! Ranking overlay caches: a generic TTL+LRU cache, the constitutional
//! prelude cache (singleflight, DB-mtime invalidated), a batched access
//! accumulator, and a bounded trigger-regex cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use regex::Regex;
use tokio::sync::Mutex;
use unicode_normalization::UnicodeNormalization;

use crate::error::CoreResult;
use crate::memory::{ImportanceTier, Memory};
use crate::storage::Storage;

/// `popularity = min(1, log10(count + 1) / 3)`, saturating around 1000
/// accesses. Distinct from the smart-ranking popularity term in
/// `search::fusion`, which uses a coarser `access_count/10` scale.
pub fn popularity_general(count: i64) -> f32 {
    (((count as f64 + 1.0).log10() / 3.0) as f32).min(1.0)
}

/// A single LRU slot with its own insertion time, for TTL expiry on top of
/// `lru`'s capacity-based eviction.
struct TtlEntry<V> {
    value: V,
    inserted_at: Instant,
}

/// Generic bounded cache with both an LRU capacity and a TTL. Used for
/// query-result caching and ad hoc memoization.
pub struct TtlCache<K: std::hash::Hash + Eq, V: Clone> {
    inner: LruCache<K, TtlEntry<V>>,
    ttl: Duration,
}

impl<K: std::hash::Hash + Eq, V: Clone> TtlCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        TtlCache {
            inner: LruCache::new(std::num::NonZeroUsize::new(capacity.max(1)).unwrap()),
            ttl,
        }
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        let expired = self.inner.peek(key).map(|e| e.inserted_at.elapsed() > self.ttl).unwrap_or(false);
        if expired {
            self.inner.pop(key);
            return None;
        }
        self.inner.get(key).map(|e| e.value.clone())
    }

    pub fn put(&mut self, key: K, value: V) {
        self.inner.put(key, TtlEntry { value, inserted_at: Instant::now() });
    }

    pub fn delete(&mut self, key: &K) {
        self.inner.pop(key);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

struct ConstitutionalSnapshot {
    memories: HashMap<Option<String>, Vec<Memory>>,
    loaded_at: Instant,
    db_mtime: Option<std::time::SystemTime>,
}

const CONSTITUTIONAL_TTL: Duration = Duration::from_secs(5 * 60);

/// The constitutional prelude cache: loaded at most once concurrently
/// (singleflight), with a 5-minute TTL and invalidation on external DB
/// writes detected via file mtime.
pub struct ConstitutionalCache {
    state: Mutex<Option<ConstitutionalSnapshot>>,
}

impl Default for ConstitutionalCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstitutionalCache {
    pub fn new() -> Self {
        ConstitutionalCache { state: Mutex::new(None) }
    }

    /// Return the constitutional set for `spec_folder` (or global scope when
    /// `None`), loading from storage only if the cache is cold, stale, or the
    /// DB file has been modified since the last load. Concurrent callers
    /// serialize on the same lock rather than issuing duplicate DB loads;
    /// that serialization point *is* the singleflight behavior.
    pub async fn get(&self, storage: &Storage, spec_folder: Option<&str>) -> CoreResult<Vec<Memory>> {
        let mut guard = self.state.lock().await;
        let current_mtime = std::fs::metadata(storage.db_path()).and_then(|m| m.modified()).ok();

        let stale = match guard.as_ref() {
            None => true,
            Some(snapshot) => {
                snapshot.loaded_at.elapsed() > CONSTITUTIONAL_TTL || snapshot.db_mtime != current_mtime
            }
        };

        if stale {
            let memories = storage.get_memories_by_tier(ImportanceTier::Constitutional, spec_folder)?;
            let mut by_scope = match guard.take() {
                Some(snapshot) => snapshot.memories,
                None => HashMap::new(),
            };
            by_scope.insert(spec_folder.map(|s| s.to_string()), memories);
            *guard = Some(ConstitutionalSnapshot {
                memories: by_scope,
                loaded_at: Instant::now(),
                db_mtime: current_mtime,
            });
        }

        Ok(guard
            .as_ref()
            .and_then(|s| s.memories.get(&spec_folder.map(|s| s.to_string())))
            .cloned()
            .unwrap_or_default())
    }

    pub async fn invalidate(&self) {
        *self.state.lock().await = None;
    }
}

const ACCESS_INCREMENT: f32 = 0.1;
const ACCESS_FLUSH_THRESHOLD: f32 = 0.5;

/// Batches access-count increments so a burst of reads doesn't become a
/// burst of writes: each access adds 0.1 to an in-memory accumulator, and
/// `take_flushable` returns (and clears) entries that crossed 0.5.
#[derive(Debug, Default)]
pub struct AccessAccumulator {
    pending: HashMap<i64, f32>,
}

impl AccessAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, id: i64) {
        *self.pending.entry(id).or_insert(0.0) += ACCESS_INCREMENT;
    }

    /// Track multiple accesses, silently dropping any id that isn't a clean
    /// integer (mirrors `trackMultipleAccesses` filtering non-integer ids
    /// from a loosely-typed caller).
    pub fn track_multiple(&mut self, ids: &[serde_json::Value]) {
        for id in ids {
            if let Some(i) = id.as_i64() {
                self.track(i);
            } else if let Some(f) = id.as_f64() {
                if f.fract() == 0.0 {
                    self.track(f as i64);
                }
            }
        }
    }

    /// Entries at or above the flush threshold, removed from the
    /// accumulator so they aren't double-flushed.
    pub fn take_flushable(&mut self) -> HashMap<i64, f32> {
        let ready: Vec<i64> = self
            .pending
            .iter()
            .filter(|(_, &delta)| delta >= ACCESS_FLUSH_THRESHOLD)
            .map(|(&id, _)| id)
            .collect();
        let mut flushed = HashMap::new();
        for id in ready {
            if let Some(delta) = self.pending.remove(&id) {
                flushed.insert(id, delta);
            }
        }
        flushed
    }

    /// Drain everything regardless of threshold, for shutdown flush hooks
    /// (`exit`, `SIGINT`, `SIGTERM`). Callers must log failures rather than
    /// propagate them during shutdown.
    pub fn take_all(&mut self) -> HashMap<i64, f32> {
        std::mem::take(&mut self.pending)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

const TRIGGER_REGEX_CAPACITY: usize = 100;

/// Bounded cache of compiled trigger-phrase regexes, keyed on the
/// NFC-normalized, optionally accent-stripped phrase.
pub struct TriggerRegexCache {
    inner: LruCache<String, Arc<Regex>>,
}

impl Default for TriggerRegexCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TriggerRegexCache {
    pub fn new() -> Self {
        TriggerRegexCache {
            inner: LruCache::new(std::num::NonZeroUsize::new(TRIGGER_REGEX_CAPACITY).unwrap()),
        }
    }

    /// Fetch (compiling and caching on miss) a case-insensitive word-boundary
    /// regex for `phrase`.
    pub fn get_or_compile(&mut self, phrase: &str) -> Option<Arc<Regex>> {
        let key = normalize_for_matching(phrase);
        if let Some(existing) = self.inner.get(&key) {
            return Some(existing.clone());
        }
        let pattern = format!(r"(?i)\b{}\b", regex::escape(&key));
        let compiled = Regex::new(&pattern).ok()?;
        let compiled = Arc::new(compiled);
        self.inner.put(key, compiled.clone());
        Some(compiled)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Unicode NFC normalization before trigger matching so accented and
/// unaccented variants of a phrase match the same trigger.
pub fn normalize_for_matching(text: &str) -> String {
    text.nfc().collect::<String>().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn popularity_saturates_near_1000() {
        assert!(popularity_general(1000) >= 0.99);
        assert!(popularity_general(0) < 0.2);
    }

    #[test]
    fn ttl_cache_expires_entries() {
        let mut cache: TtlCache<&str, i32> = TtlCache::new(4, Duration::from_millis(1));
        cache.put("a", 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(&"a"), None);
    }

    #[test]
    fn access_accumulator_flushes_at_threshold() {
        let mut acc = AccessAccumulator::new();
        acc.track(42);
        acc.track(42);
        acc.track(42);
        acc.track(42);
        acc.track(42);
        let flushed = acc.take_flushable();
        assert!((flushed[&42] - 0.5).abs() < 1e-6);
        assert!(acc.is_empty());
    }

    #[test]
    fn access_accumulator_filters_non_integer_ids() {
        let mut acc = AccessAccumulator::new();
        acc.track_multiple(&[serde_json::json!(1), serde_json::json!(2.5), serde_json::json!("x")]);
        assert!(acc.pending.contains_key(&1));
        assert_eq!(acc.pending.len(), 1);
    }

    #[test]
    fn trigger_regex_cache_reuses_compiled_matcher() {
        let mut cache = TriggerRegexCache::new();
        let first = cache.get_or_compile("Fix Login Bug").unwrap();
        let second = cache.get_or_compile("fix login bug").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.is_match("we should fix login bug today"));
    }
}
