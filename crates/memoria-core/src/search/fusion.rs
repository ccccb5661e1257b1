//! Reciprocal Rank Fusion and ranking overlays.

use std::collections::HashMap;

/// Named result source, used for RRF fusion and the `sources[]` field
/// surfaced on each fused result. `Bm25` covers the combined lexical
/// contribution (in-memory BM25 merged with the durable FTS5 index) —
/// callers fuse the two before this module ever sees the result list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Source {
    Vector,
    Bm25,
    Graph,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Vector => "vector",
            Source::Bm25 => "bm25",
            Source::Graph => "graph",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FusedResult {
    pub id: i64,
    pub score: f64,
    pub sources: Vec<Source>,
    pub per_source_rank: HashMap<Source, usize>,
}

/// Reciprocal Rank Fusion: `score = Σ 1/(k + rank)` per source, ranks
/// 0-indexed on input into the formula as `rank + 1`. A +10% convergence
/// bonus applies when a document appears in more than one source; the graph
/// source's own contribution is boosted 1.5x before the bonus check.
pub fn reciprocal_rank_fusion(
    vector_results: &[i64],
    bm25_results: &[i64],
    graph_results: &[i64],
    k: f64,
    graph_boost: f64,
) -> Vec<FusedResult> {
    let mut scores: HashMap<i64, f64> = HashMap::new();
    let mut sources: HashMap<i64, Vec<Source>> = HashMap::new();
    let mut ranks: HashMap<i64, HashMap<Source, usize>> = HashMap::new();

    let mut accumulate = |ids: &[i64], source: Source, boost: f64| {
        for (idx, &id) in ids.iter().enumerate() {
            let rank = idx + 1;
            let contribution = (1.0 / (k + rank as f64)) * boost;
            *scores.entry(id).or_insert(0.0) += contribution;
            sources.entry(id).or_default().push(source);
            ranks.entry(id).or_default().insert(source, rank);
        }
    };

    accumulate(vector_results, Source::Vector, 1.0);
    accumulate(bm25_results, Source::Bm25, 1.0);
    accumulate(graph_results, Source::Graph, graph_boost);

    for (id, score) in scores.iter_mut() {
        let source_count = sources.get(id).map(|s| s.len()).unwrap_or(0);
        if source_count > 1 {
            *score *= 1.1;
        }
    }

    let mut fused: Vec<FusedResult> = scores
        .into_iter()
        .map(|(id, score)| FusedResult {
            id,
            score,
            sources: sources.remove(&id).unwrap_or_default(),
            per_source_rank: ranks.remove(&id).unwrap_or_default(),
        })
        .collect();

    fused.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap().then_with(|| a.id.cmp(&b.id)));
    fused
}

/// Per-candidate inputs to the smart ranking overlay.
pub struct SmartRankingInput {
    pub similarity_0_100: f32,
    pub age_days: f64,
    pub access_count: i64,
}

/// Configurable smart-ranking weights, default
/// `similarity(0.5) + recency(0.3) + popularity(0.2)`.
#[derive(Debug, Clone, Copy)]
pub struct SmartRankingWeights {
    pub similarity: f32,
    pub recency: f32,
    pub popularity: f32,
}

impl Default for SmartRankingWeights {
    fn default() -> Self {
        SmartRankingWeights {
            similarity: 0.5,
            recency: 0.3,
            popularity: 0.2,
        }
    }
}

pub fn recency_score(age_days: f64) -> f32 {
    if age_days < 7.0 {
        1.0
    } else if age_days < 30.0 {
        0.8
    } else {
        0.5
    }
}

pub fn popularity_score(access_count: i64) -> f32 {
    ((access_count as f32) / 10.0).min(1.0)
}

/// `composite = similarity*w.similarity + recency*w.recency + popularity*w.popularity`.
pub fn smart_rank_score(input: &SmartRankingInput, weights: &SmartRankingWeights) -> f32 {
    let similarity = input.similarity_0_100 / 100.0;
    let recency = recency_score(input.age_days);
    let popularity = popularity_score(input.access_count);
    similarity * weights.similarity + recency * weights.recency + popularity * weights.popularity
}

/// MMR-style diversity input: relevance plus the diversity proxy fields.
pub struct DiversityCandidate<T> {
    pub item: T,
    pub relevance: f32,
    pub spec_folder: String,
    pub date: String,
}

/// Maximal-marginal-relevance-style re-rank: always keep the top-1, then
/// greedily pick by `relevance - lambda * max_similarity_to_selected`, where
/// similarity is proxied by `spec_folder` match (0.8) or same-date match
/// (0.5).
pub fn diversify<T>(mut candidates: Vec<DiversityCandidate<T>>, lambda: f32) -> Vec<T> {
    if candidates.is_empty() {
        return Vec::new();
    }
    candidates.sort_by(|a, b| b.relevance.partial_cmp(&a.relevance).unwrap());

    let first = candidates.remove(0);
    let mut selected_folders = vec![first.spec_folder.clone()];
    let mut selected_dates = vec![first.date.clone()];
    let mut ordered = vec![first.item];

    let mut remaining = candidates;
    while !remaining.is_empty() {
        let mut best_idx = 0;
        let mut best_score = f32::MIN;
        for (idx, cand) in remaining.iter().enumerate() {
            let max_similarity = selected_folders
                .iter()
                .zip(selected_dates.iter())
                .map(|(folder, date)| {
                    if folder == &cand.spec_folder {
                        0.8
                    } else if date == &cand.date {
                        0.5
                    } else {
                        0.0
                    }
                })
                .fold(0.0_f32, f32::max);
            let score = cand.relevance - lambda * max_similarity;
            if score > best_score {
                best_score = score;
                best_idx = idx;
            }
        }
        let picked = remaining.remove(best_idx);
        selected_folders.push(picked.spec_folder.clone());
        selected_dates.push(picked.date.clone());
        ordered.push(picked.item);
    }

    ordered
}

/// Post-rerank length penalty: `0.8 + (len/100) * 0.2`, clamped to
/// `[0.8, 1.0]`.
pub fn length_penalty(content_len: usize) -> f32 {
    if content_len >= 100 {
        return 1.0;
    }
    (0.8 + (content_len as f32 / 100.0) * 0.2).clamp(0.8, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fusion_determinism_scenario() {
        let fused = reciprocal_rank_fusion(&[1, 2, 3], &[2, 1, 4], &[3, 5], 60.0, 1.5);
        let order: Vec<i64> = fused.iter().map(|f| f.id).collect();
        assert_eq!(order, vec![2, 1, 3, 5, 4]);

        let doc2 = fused.iter().find(|f| f.id == 2).unwrap();
        assert_eq!(doc2.sources.len(), 2);

        let doc3 = fused.iter().find(|f| f.id == 3).unwrap();
        assert!(doc3.sources.contains(&Source::Graph));
    }

    #[test]
    fn rrf_score_decreases_with_rank() {
        let better = reciprocal_rank_fusion(&[1], &[], &[], 60.0, 1.5);
        let worse = reciprocal_rank_fusion(&[9, 9999, 1], &[], &[], 60.0, 1.5);
        let s_better = better[0].score;
        let s_worse = worse.iter().find(|f| f.id == 1).unwrap().score;
        assert!(s_better > s_worse);
    }

    #[test]
    fn convergence_bonus_is_exactly_ten_percent() {
        let k = 60.0;
        let single = reciprocal_rank_fusion(&[1], &[], &[], k, 1.5);
        let both = reciprocal_rank_fusion(&[1], &[1], &[], k, 1.5);
        let base = 1.0 / (k + 1.0);
        assert!((single[0].score - base).abs() < 1e-9);
        assert!((both[0].score - base * 2.0 * 1.1).abs() < 1e-9);
    }

    #[test]
    fn length_penalty_boundaries() {
        assert_eq!(length_penalty(0), 0.8);
        assert_eq!(length_penalty(100), 1.0);
        assert_eq!(length_penalty(150), 1.0);
        assert!((length_penalty(50) - 0.9).abs() < 1e-6);
    }

    #[test]
    fn diversify_keeps_top1_and_penalizes_same_folder() {
        let candidates = vec![
            DiversityCandidate { item: "a", relevance: 0.9, spec_folder: "x".into(), date: "2024-01-01".into() },
            DiversityCandidate { item: "b", relevance: 0.89, spec_folder: "x".into(), date: "2024-01-02".into() },
            DiversityCandidate { item: "c", relevance: 0.5, spec_folder: "y".into(), date: "2024-01-03".into() },
        ];
        let result = diversify(candidates, 0.3);
        assert_eq!(result[0], "a");
        assert_eq!(result[1], "c");
    }
}
