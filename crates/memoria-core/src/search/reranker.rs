//! Reranker orchestration: a pluggable `Reranker` trait, a bounded
//! cache keyed on query + candidate set, and a P95-latency rolling window
//! that auto-disables reranking for the rest of the session if the provider
//! gets too slow.
//!
//! Falls back to BM25-like term overlap scoring when no network-backed
//! cross-encoder is configured.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::search::fusion::length_penalty;

pub const DEFAULT_MAX_CANDIDATES: usize = 20;
const CACHE_TTL: Duration = Duration::from_secs(5 * 60);
const CACHE_CAPACITY: usize = 256;
const EVICTION_FRACTION: f64 = 0.10;
const LATENCY_WINDOW: usize = 100;
const DEFAULT_P95_DISABLE_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct RerankCandidate {
    pub id: i64,
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct RerankedItem {
    pub id: i64,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct RerankOptions {
    pub top_k: usize,
    pub max_candidates: usize,
    pub apply_length_penalty: bool,
    pub use_cache: bool,
}

impl Default for RerankOptions {
    fn default() -> Self {
        RerankOptions {
            top_k: 10,
            max_candidates: DEFAULT_MAX_CANDIDATES,
            apply_length_penalty: true,
            use_cache: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RerankMetadata {
    pub provider: &'static str,
    pub used_cache: bool,
    pub disabled_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RerankOutcome {
    pub results: Vec<RerankedItem>,
    pub metadata: RerankMetadata,
}

/// A pluggable relevance scorer. Implementations return one score per
/// candidate, aligned by index.
pub trait Reranker {
    fn name(&self) -> &'static str;
    fn score(&self, query: &str, candidates: &[RerankCandidate]) -> Vec<f32>;
}

/// Passthrough: returns candidates unchanged, used when no provider applies.
pub struct NoopReranker;

impl Reranker for NoopReranker {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn score(&self, _query: &str, candidates: &[RerankCandidate]) -> Vec<f32> {
        let n = candidates.len() as f32;
        (0..candidates.len()).map(|i| (n - i as f32) / n.max(1.0)).collect()
    }
}

/// BM25-like term overlap fallback, standing in for any network-backed
/// cross-encoder.
pub struct HeuristicReranker;

impl Reranker for HeuristicReranker {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn score(&self, query: &str, candidates: &[RerankCandidate]) -> Vec<f32> {
        let query_terms: Vec<String> = query.to_lowercase().split_whitespace().map(String::from).collect();
        const K1: f32 = 1.2;
        const B: f32 = 0.75;
        const AVG_DOC_LEN: f32 = 500.0;

        candidates
            .iter()
            .map(|c| {
                let text = format!("{} {}", c.title, c.content).to_lowercase();
                let doc_len = text.len() as f32;
                if doc_len == 0.0 || query_terms.is_empty() {
                    return 0.0;
                }
                let mut score = 0.0;
                for term in &query_terms {
                    let tf = text.matches(term.as_str()).count() as f32;
                    if tf > 0.0 {
                        let numerator = tf * (K1 + 1.0);
                        let denominator = tf + K1 * (1.0 - B + B * (doc_len / AVG_DOC_LEN));
                        score += numerator / denominator;
                    }
                }
                score / query_terms.len() as f32
            })
            .collect()
    }
}

fn cache_key(query: &str, candidate_ids: &[i64]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    for id in candidate_ids {
        hasher.update(id.to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}

struct CacheEntry {
    results: Vec<RerankedItem>,
    inserted_at: Instant,
}

/// Bounded LRU-ish cache keyed on `(query, candidate ids)`; at capacity,
/// evicts the oldest 10% rather than one entry at a time.
struct RerankCache {
    entries: HashMap<String, CacheEntry>,
    order: Vec<String>,
}

impl RerankCache {
    fn new() -> Self {
        RerankCache { entries: HashMap::new(), order: Vec::new() }
    }

    fn get(&mut self, key: &str) -> Option<Vec<RerankedItem>> {
        let entry = self.entries.get(key)?;
        if entry.inserted_at.elapsed() > CACHE_TTL {
            self.entries.remove(key);
            self.order.retain(|k| k != key);
            return None;
        }
        Some(entry.results.clone())
    }

    fn insert(&mut self, key: String, results: Vec<RerankedItem>) {
        if self.entries.len() >= CACHE_CAPACITY {
            let evict_count = ((CACHE_CAPACITY as f64) * EVICTION_FRACTION).ceil() as usize;
            for _ in 0..evict_count.max(1) {
                if self.order.is_empty() {
                    break;
                }
                let oldest = self.order.remove(0);
                self.entries.remove(&oldest);
            }
        }
        self.order.push(key.clone());
        self.entries.insert(key, CacheEntry { results, inserted_at: Instant::now() });
    }
}

/// Rolling P95 latency tracker over the last `LATENCY_WINDOW` samples;
/// auto-disables the reranker for the rest of the session once P95 exceeds
/// the configured threshold.
pub struct LatencyTracker {
    samples: Vec<u64>,
    disable_threshold_ms: u64,
    disabled: bool,
    disabled_reason: Option<String>,
}

impl LatencyTracker {
    pub fn new(disable_threshold_ms: u64) -> Self {
        LatencyTracker {
            samples: Vec::with_capacity(LATENCY_WINDOW),
            disable_threshold_ms,
            disabled: false,
            disabled_reason: None,
        }
    }

    pub fn record(&mut self, latency: Duration) {
        if self.samples.len() == LATENCY_WINDOW {
            self.samples.remove(0);
        }
        self.samples.push(latency.as_millis() as u64);

        if let Some(p95) = self.p95() {
            if p95 > self.disable_threshold_ms {
                self.disabled = true;
                self.disabled_reason =
                    Some(format!("p95 latency {p95}ms exceeded {}ms over last {} samples", self.disable_threshold_ms, self.samples.len()));
            }
        }
    }

    pub fn p95(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64) * 0.95).ceil() as usize;
        Some(sorted[idx.saturating_sub(1).min(sorted.len() - 1)])
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }
}

pub struct RerankOrchestrator {
    provider: Box<dyn Reranker>,
    cache: RerankCache,
    latency: LatencyTracker,
    enabled: bool,
}

impl RerankOrchestrator {
    pub fn new(provider: Box<dyn Reranker>, enabled: bool) -> Self {
        RerankOrchestrator {
            provider,
            cache: RerankCache::new(),
            latency: LatencyTracker::new(DEFAULT_P95_DISABLE_MS),
            enabled,
        }
    }

    /// `rerank(query, candidates, options) -> {results, metadata}`.
    pub fn rerank(
        &mut self,
        query: &str,
        mut candidates: Vec<RerankCandidate>,
        options: &RerankOptions,
    ) -> RerankOutcome {
        if !self.enabled {
            return self.passthrough(candidates, options, "reranking disabled by configuration".into());
        }
        if self.latency.is_disabled() {
            let reason = self.latency.disabled_reason.clone().unwrap_or_default();
            return self.passthrough(candidates, options, reason);
        }

        candidates.truncate(options.max_candidates);
        let candidate_ids: Vec<i64> = candidates.iter().map(|c| c.id).collect();

        if options.use_cache {
            let key = cache_key(query, &candidate_ids);
            if let Some(cached) = self.cache.get(&key) {
                let mut results = cached;
                results.truncate(options.top_k);
                return RerankOutcome {
                    results,
                    metadata: RerankMetadata { provider: self.provider.name(), used_cache: true, disabled_reason: None },
                };
            }
        }

        let started = Instant::now();
        let scores = self.provider.score(query, &candidates);
        self.latency.record(started.elapsed());

        let mut results: Vec<RerankedItem> = candidates
            .iter()
            .zip(scores)
            .map(|(c, score)| {
                let score = if options.apply_length_penalty {
                    score * length_penalty(c.content.len())
                } else {
                    score
                };
                RerankedItem { id: c.id, score }
            })
            .collect();

        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap().then_with(|| a.id.cmp(&b.id)));

        if options.use_cache {
            let key = cache_key(query, &candidate_ids);
            self.cache.insert(key, results.clone());
        }

        results.truncate(options.top_k);
        RerankOutcome {
            results,
            metadata: RerankMetadata { provider: self.provider.name(), used_cache: false, disabled_reason: None },
        }
    }

    fn passthrough(&self, mut candidates: Vec<RerankCandidate>, options: &RerankOptions, reason: String) -> RerankOutcome {
        candidates.truncate(options.top_k);
        let n = candidates.len();
        let results = candidates
            .into_iter()
            .enumerate()
            .map(|(rank, c)| RerankedItem { id: c.id, score: (n - rank) as f32 })
            .collect();
        RerankOutcome {
            results,
            metadata: RerankMetadata { provider: "none", used_cache: false, disabled_reason: Some(reason) },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(id: i64, title: &str, content: &str) -> RerankCandidate {
        RerankCandidate { id, title: title.into(), content: content.into() }
    }

    #[test]
    fn heuristic_ranks_matching_candidate_first() {
        let orch = RerankOrchestrator::new(Box::new(HeuristicReranker), true);
        let mut orch = orch;
        let outcome = orch.rerank(
            "fox",
            vec![cand(1, "The quick brown fox", ""), cand(2, "A lazy dog sleeps", "")],
            &RerankOptions { apply_length_penalty: false, ..Default::default() },
        );
        assert_eq!(outcome.results[0].id, 1);
    }

    #[test]
    fn disabled_config_returns_passthrough_with_reason() {
        let mut orch = RerankOrchestrator::new(Box::new(HeuristicReranker), false);
        let outcome = orch.rerank("fox", vec![cand(1, "fox", "")], &RerankOptions::default());
        assert!(outcome.metadata.disabled_reason.is_some());
    }

    #[test]
    fn repeated_query_hits_cache() {
        let mut orch = RerankOrchestrator::new(Box::new(HeuristicReranker), true);
        let candidates = vec![cand(1, "fox", "quick fox"), cand(2, "dog", "lazy dog")];
        let first = orch.rerank("fox", candidates.clone(), &RerankOptions::default());
        assert!(!first.metadata.used_cache);
        let second = orch.rerank("fox", candidates, &RerankOptions::default());
        assert!(second.metadata.used_cache);
    }

    #[test]
    fn p95_auto_disable_after_slow_samples() {
        let mut tracker = LatencyTracker::new(10);
        for _ in 0..LATENCY_WINDOW {
            tracker.record(Duration::from_millis(50));
        }
        assert!(tracker.is_disabled());
    }

    #[test]
    fn cache_key_is_order_sensitive_on_candidate_set() {
        let a = cache_key("q", &[1, 2]);
        let b = cache_key("q", &[2, 1]);
        assert_ne!(a, b);
    }
}
