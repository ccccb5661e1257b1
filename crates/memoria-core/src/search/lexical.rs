//! Lexical index: custom BM25 scoring plus FTS5 passthrough.

use std::collections::{HashMap, HashSet};

use crate::error::CoreResult;
use crate::storage::Storage;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is",
    "it", "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there",
    "these", "they", "this", "to", "was", "will", "with", "from", "has", "have", "had", "its",
    "do", "does", "did", "can", "could", "would",
];

/// Lowercase, keep `[a-z0-9_]`, strip stopwords, stem. Never produces tokens
/// shorter than 2 characters.
pub fn tokenize(text: &str) -> Vec<String> {
    let stopwords: HashSet<&str> = STOPWORDS.iter().copied().collect();
    text.to_lowercase()
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| !w.is_empty())
        .filter(|w| !stopwords.contains(w))
        .map(stem)
        .filter(|w| w.len() >= 2)
        .collect()
}

/// Deterministic suffix-stripping stemmer with a fixed rule list, tried
/// longest-suffix-first so collisions resolve predictably.
fn stem(word: String) -> String {
    let rules: &[(&str, &str)] = &[
        ("ment", ""),
        ("ness", ""),
        ("able", ""),
        ("ible", ""),
        ("tion", "t"),
        ("sion", "s"),
        ("ally", ""),
        ("ful", ""),
        ("less", ""),
        ("ive", ""),
        ("ize", ""),
        ("ise", ""),
        ("ies", "i"),
        ("ing", ""),
        ("ed", ""),
        ("es", ""),
        ("s", ""),
    ];

    for (suffix, replacement) in rules {
        if word.len() > suffix.len() + 2 && word.ends_with(suffix) {
            let stem = &word[..word.len() - suffix.len()];
            let candidate = format!("{stem}{replacement}");
            if candidate.len() >= 2 {
                return candidate;
            }
        }
    }
    word
}

#[derive(Debug, Clone, Default)]
struct DocEntry {
    length: usize,
    term_freqs: HashMap<String, usize>,
}

/// In-memory BM25 index. The durable store keeps the raw content; this
/// structure is rebuilt from it at startup and maintained incrementally as
/// memories are added and removed.
#[derive(Debug, Default)]
pub struct Bm25Index {
    docs: HashMap<i64, DocEntry>,
    doc_frequency: HashMap<String, usize>,
    total_length: usize,
}

pub const K1: f64 = 1.2;
pub const B: f64 = 0.75;
pub const MIN_DOC_LENGTH: usize = 10;

impl Bm25Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_docs(&self) -> usize {
        self.docs.len()
    }

    pub fn avgdl(&self) -> f64 {
        if self.docs.is_empty() {
            0.0
        } else {
            self.total_length as f64 / self.docs.len() as f64
        }
    }

    pub fn doc_frequency(&self, term: &str) -> usize {
        self.doc_frequency.get(term).copied().unwrap_or(0)
    }

    /// Index (or re-index) a document. Documents under `MIN_DOC_LENGTH`
    /// tokens are still stored — the minimum only affects scoring
    /// confidence, not indexability.
    pub fn add(&mut self, id: i64, content: &str) {
        self.remove(id);
        let tokens = tokenize(content);
        let mut term_freqs = HashMap::new();
        for t in &tokens {
            *term_freqs.entry(t.clone()).or_insert(0) += 1;
        }
        for term in term_freqs.keys() {
            *self.doc_frequency.entry(term.clone()).or_insert(0) += 1;
        }
        self.total_length += tokens.len();
        self.docs.insert(
            id,
            DocEntry {
                length: tokens.len(),
                term_freqs,
            },
        );
    }

    /// Symmetric with `add`: after `add(d); remove(d)`, `total_docs`,
    /// `avgdl`, and doc frequencies equal their pre-add values.
    pub fn remove(&mut self, id: i64) {
        if let Some(entry) = self.docs.remove(&id) {
            self.total_length -= entry.length;
            for term in entry.term_freqs.keys() {
                if let Some(count) = self.doc_frequency.get_mut(term) {
                    *count -= 1;
                    if *count == 0 {
                        self.doc_frequency.remove(term);
                    }
                }
            }
        }
    }

    /// Standard BM25 scoring over the union of query terms' posting lists.
    pub fn search(&self, query: &str, limit: usize) -> Vec<(i64, f64)> {
        let query_terms = tokenize(query);
        if query_terms.is_empty() || self.docs.is_empty() {
            return Vec::new();
        }

        let n = self.docs.len() as f64;
        let avgdl = self.avgdl().max(1.0);

        let idf: HashMap<&str, f64> = query_terms
            .iter()
            .map(|t| {
                let n_t = self.doc_frequency(t) as f64;
                let score = ((n - n_t + 0.5) / (n_t + 0.5) + 1.0).ln();
                (t.as_str(), score)
            })
            .collect();

        let mut candidate_ids: HashSet<i64> = HashSet::new();
        for term in &query_terms {
            for (&id, entry) in &self.docs {
                if entry.term_freqs.contains_key(term) {
                    candidate_ids.insert(id);
                }
            }
        }

        let mut scored: Vec<(i64, f64)> = candidate_ids
            .into_iter()
            .map(|id| {
                let entry = &self.docs[&id];
                let score: f64 = query_terms
                    .iter()
                    .map(|term| {
                        let tf = *entry.term_freqs.get(term).unwrap_or(&0) as f64;
                        if tf == 0.0 {
                            return 0.0;
                        }
                        let idf_t = idf[term.as_str()];
                        let denom = tf + K1 * (1.0 - B + B * (entry.length as f64 / avgdl));
                        idf_t * (tf * (K1 + 1.0)) / denom
                    })
                    .sum();
                (id, score)
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap().then_with(|| a.0.cmp(&b.0)));
        scored.truncate(limit);
        scored
    }
}

/// Escape/neutralize FTS5 special syntax before handing a query to the
/// engine. Boolean operators and special characters are quoted rather than
/// interpreted.
pub fn sanitize_fts5_query(query: &str) -> String {
    let cleaned: String = query
        .chars()
        .filter(|c| !"*:()^{}[]+-\"".contains(*c))
        .collect();

    cleaned
        .split_whitespace()
        .map(|term| {
            let upper = term.to_uppercase();
            if matches!(upper.as_str(), "AND" | "OR" | "NOT") {
                format!("\"{term}\"")
            } else {
                term.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Query the `memories_fts` virtual table for `query`, excluding deprecated
/// memories and (when given) scoping to one folder. Returns `(memory_id,
/// score)` pairs with higher scores ranked first — FTS5's implicit `rank`
/// column is more-negative-is-better, so the sign is flipped to match
/// `combine_lexical`'s higher-is-better convention.
pub fn fts_search(storage: &Storage, query: &str, spec_folder: Option<&str>, limit: usize) -> CoreResult<Vec<(i64, f64)>> {
    let sanitized = sanitize_fts5_query(query);
    if sanitized.trim().is_empty() {
        return Ok(Vec::new());
    }

    storage.with_reader(|conn| {
        let rows: Vec<(i64, f64)> = match spec_folder {
            Some(folder) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT f.rowid, -rank FROM memories_fts f
                     JOIN memories m ON m.id = f.rowid
                     WHERE memories_fts MATCH ?1 AND m.importance_tier != 'deprecated' AND m.spec_folder = ?2
                     ORDER BY rank LIMIT ?3",
                )?;
                stmt.query_map(rusqlite::params![sanitized, folder, limit as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare_cached(
                    "SELECT f.rowid, -rank FROM memories_fts f
                     JOIN memories m ON m.id = f.rowid
                     WHERE memories_fts MATCH ?1 AND m.importance_tier != 'deprecated'
                     ORDER BY rank LIMIT ?2",
                )?;
                stmt.query_map(rusqlite::params![sanitized, limit as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(rows)
    })
}

/// Merge FTS and BM25 result sets: normalize each by its own max score, then
/// sort by the mean of normalized scores, preferring ids present in both.
pub fn combine_lexical(fts: &[(i64, f64)], bm25: &[(i64, f64)]) -> Vec<(i64, f64)> {
    let fts_max = fts.iter().map(|(_, s)| *s).fold(0.0_f64, f64::max).max(f64::EPSILON);
    let bm25_max = bm25.iter().map(|(_, s)| *s).fold(0.0_f64, f64::max).max(f64::EPSILON);

    let fts_norm: HashMap<i64, f64> = fts.iter().map(|(id, s)| (*id, s / fts_max)).collect();
    let bm25_norm: HashMap<i64, f64> = bm25.iter().map(|(id, s)| (*id, s / bm25_max)).collect();

    let mut ids: HashSet<i64> = fts_norm.keys().copied().collect();
    ids.extend(bm25_norm.keys().copied());

    let mut merged: Vec<(i64, f64, bool)> = ids
        .into_iter()
        .map(|id| {
            let f = fts_norm.get(&id).copied();
            let b = bm25_norm.get(&id).copied();
            let both = f.is_some() && b.is_some();
            let mean = (f.unwrap_or(0.0) + b.unwrap_or(0.0)) / if both { 2.0 } else { 1.0 };
            (id, mean, both)
        })
        .collect();

    merged.sort_by(|a, b| {
        b.2.cmp(&a.2)
            .then_with(|| b.1.partial_cmp(&a.1).unwrap())
            .then_with(|| a.0.cmp(&b.0))
    });
    merged.into_iter().map(|(id, score, _)| (id, score)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bm25_symmetry_on_add_remove() {
        let mut idx = Bm25Index::new();
        idx.add(1, "existing doc to keep stats stable");
        let docs_before = idx.total_docs();
        let avgdl_before = idx.avgdl();
        let df_before = idx.doc_frequency("exist");

        idx.add(7, "user authentication flow handles JWT refresh");
        idx.remove(7);

        assert_eq!(idx.total_docs(), docs_before);
        assert_eq!(idx.avgdl(), avgdl_before);
        assert_eq!(idx.doc_frequency("exist"), df_before);
    }

    #[test]
    fn tokenizer_strips_stopwords_and_stems() {
        let tokens = tokenize("The quick running of tests");
        assert!(!tokens.contains(&"the".to_string()));
        assert!(tokens.contains(&"run".to_string()));
    }

    #[test]
    fn fts_sanitizer_quotes_boolean_keywords() {
        let sanitized = sanitize_fts5_query("cats AND dogs OR (fish)");
        assert!(sanitized.contains("\"AND\""));
        assert!(!sanitized.contains('('));
    }

    #[test]
    fn bm25_search_ranks_exact_term_match_first() {
        let mut idx = Bm25Index::new();
        idx.add(1, "authentication flow handles token refresh");
        idx.add(2, "unrelated document about cooking recipes");
        let results = idx.search("authentication token", 10);
        assert_eq!(results[0].0, 1);
    }

    #[test]
    fn combine_lexical_prefers_ids_present_in_both_sources() {
        let fts = vec![(1_i64, 2.0), (2, 1.0)];
        let bm25 = vec![(2_i64, 3.0), (3, 1.0)];
        let merged = combine_lexical(&fts, &bm25);
        assert_eq!(merged[0].0, 2, "id 2 appears in both lists and should rank first");
    }

    #[test]
    fn fts_search_finds_memories_by_title_via_the_sync_triggers() {
        let dir = tempfile::tempdir().unwrap();
        let storage = crate::storage::Storage::open(&dir.path().join("fts.sqlite"), 3).unwrap();

        storage
            .index_memory(crate::storage::NewMemory {
                spec_folder: "default".into(),
                file_path: "auth.md".into(),
                anchor_id: None,
                title: "authentication token refresh flow".into(),
                trigger_phrases: vec![],
                content_hash: "a".into(),
                content: "body".into(),
                context_type: crate::memory::ContextType::General,
                importance_tier: crate::memory::ImportanceTier::Normal,
                memory_type: crate::memory::MemoryType::Declarative,
                channel: "default".into(),
                embedding: None,
            })
            .unwrap();
        storage
            .index_memory(crate::storage::NewMemory {
                spec_folder: "default".into(),
                file_path: "cooking.md".into(),
                anchor_id: None,
                title: "slow cooker recipes".into(),
                trigger_phrases: vec![],
                content_hash: "b".into(),
                content: "body".into(),
                context_type: crate::memory::ContextType::General,
                importance_tier: crate::memory::ImportanceTier::Normal,
                memory_type: crate::memory::MemoryType::Declarative,
                channel: "default".into(),
                embedding: None,
            })
            .unwrap();

        let hits = fts_search(&storage, "authentication token", None, 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].1 > 0.0, "score should be flipped to higher-is-better");
    }

    #[test]
    fn fts_search_returns_empty_for_a_query_that_sanitizes_to_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = crate::storage::Storage::open(&dir.path().join("fts_empty.sqlite"), 3).unwrap();
        let hits = fts_search(&storage, "(((", None, 10).unwrap();
        assert!(hits.is_empty());
    }
}
