//! Full `memory_search` orchestration: vector search, lexical
//! search, RRF fusion, the smart-ranking overlay, MMR diversity, and the
//! constitutional prelude, composed into the one operation the tool surface
//! calls. Embeddings are supplied by the caller — this crate has no
//! `EmbeddingProvider` of its own (an external collaborator per scope).

use std::collections::HashMap;

use chrono::Utc;

use crate::error::{CoreError, CoreResult, ErrorCode};
use crate::memory::{ContextType, ImportanceTier, Memory};
use crate::search::fusion::{
    diversify, reciprocal_rank_fusion, smart_rank_score, DiversityCandidate, FusedResult,
    SmartRankingInput,
};
use crate::search::lexical::{combine_lexical, fts_search, Bm25Index};
use crate::search::query::{classify_intent, expand_query_with_fuzzy, intent_weight_overrides, ExpandedQuery, IntentClassification};
use crate::search::vector;
use crate::storage::Storage;

const DEFAULT_LIMIT: usize = 10;
const CANDIDATE_POOL: usize = 50;
const RRF_K: f64 = 60.0;
const GRAPH_BOOST: f64 = 1.5;
const MMR_LAMBDA: f32 = 0.3;
const CONSTITUTIONAL_TOKEN_BUDGET_CHARS: usize = 2_000 * 4;

pub struct SearchRequest {
    pub query: Option<String>,
    pub concepts: Vec<Vec<f32>>,
    pub spec_folder: Option<String>,
    pub limit: usize,
    pub min_similarity: f64,
    pub include_content: bool,
    pub tier: Option<ImportanceTier>,
    pub context_type: Option<ContextType>,
    pub include_constitutional: bool,
    pub expand_fuzzy: bool,
}

impl Default for SearchRequest {
    fn default() -> Self {
        SearchRequest {
            query: None,
            concepts: Vec::new(),
            spec_folder: None,
            limit: DEFAULT_LIMIT,
            min_similarity: 0.0,
            include_content: false,
            tier: None,
            context_type: None,
            include_constitutional: true,
            expand_fuzzy: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub memory: Memory,
    pub score: f64,
    pub sources: Vec<String>,
    pub source_count: usize,
    pub similarity: Option<f64>,
    pub is_constitutional: bool,
}

pub struct SearchResponse {
    pub results: Vec<SearchHit>,
    pub expanded_query: Option<ExpandedQuery>,
    pub intent: Option<IntentClassification>,
}

/// Run the hybrid pipeline. Exactly one of `req.query`/`req.concepts` must be
/// set; `query_embedding` is the single-concept embedding for `req.query`
/// (ignored when `req.concepts` has 2+ entries, which takes the AND path).
pub fn search(
    storage: &Storage,
    lexical: &Bm25Index,
    query_embedding: Option<&[f32]>,
    req: SearchRequest,
) -> CoreResult<SearchResponse> {
    if req.query.is_none() && req.concepts.is_empty() {
        return Err(CoreError::new(ErrorCode::QueryEmpty, "either `query` or `concepts` must be provided"));
    }
    if req.query.is_some() && !req.concepts.is_empty() {
        return Err(CoreError::new(
            ErrorCode::ParamInvalid,
            "`query` and `concepts` are mutually exclusive",
        ));
    }

    let (expanded, intent) = match &req.query {
        Some(q) if req.expand_fuzzy => (Some(expand_query_with_fuzzy(q)), Some(classify_intent(q))),
        Some(q) => (None, Some(classify_intent(q))),
        None => (None, None),
    };

    let lexical_query = expanded.as_ref().map(|e| e.expanded.clone()).or_else(|| req.query.clone());
    let pool = req.limit.saturating_mul(2).max(CANDIDATE_POOL);

    let (vector_ids, similarity_by_id) = resolve_vector_candidates(storage, query_embedding, &req, pool)?;

    // The lexical side of fusion is a single combined source: the in-memory
    // BM25 index and the durable `memories_fts` index are merged before
    // ranking, rather than wired in as two separate RRF inputs.
    let lexical_ids: Vec<i64> = match lexical_query.as_deref() {
        Some(q) => {
            let bm25_hits = lexical.search(q, pool);
            let fts_hits = fts_search(storage, q, req.spec_folder.as_deref(), pool)?;
            combine_lexical(&fts_hits, &bm25_hits).into_iter().map(|(id, _)| id).collect()
        }
        None => Vec::new(),
    };

    let fused = reciprocal_rank_fusion(&vector_ids, &lexical_ids, &[], RRF_K, GRAPH_BOOST);
    let weights = intent.as_ref().map(|i| intent_weight_overrides(i.intent)).unwrap_or_default();
    let now = Utc::now();

    let mut diversity_input = Vec::with_capacity(fused.len());
    for fused_result in &fused {
        let Some(memory) = storage.get_memory(fused_result.id)? else { continue };
        if !memory.is_searchable_by_default(now) || memory.importance_tier == ImportanceTier::Constitutional {
            continue;
        }
        if req.tier.is_some_and(|t| memory.importance_tier != t) {
            continue;
        }
        if req.context_type.is_some_and(|c| memory.context_type != c) {
            continue;
        }

        let similarity = similarity_by_id.get(&fused_result.id).copied();
        let age_days = (now - memory.updated_at).num_seconds() as f64 / 86_400.0;
        let composite = smart_rank_score(
            &SmartRankingInput {
                similarity_0_100: similarity.unwrap_or(0.0) as f32,
                age_days,
                access_count: memory.access_count,
            },
            &weights,
        );
        let relevance = fused_result.score as f32 + composite;

        diversity_input.push(DiversityCandidate {
            relevance,
            spec_folder: memory.spec_folder.clone(),
            date: memory.updated_at.date_naive().to_string(),
            item: (fused_result.clone(), memory, similarity),
        });
    }

    let diversified = diversify(diversity_input, MMR_LAMBDA);

    let mut results: Vec<SearchHit> = diversified
        .into_iter()
        .take(req.limit.max(1))
        .map(|(fused, mut memory, similarity)| {
            if !req.include_content {
                memory.content = None;
            }
            SearchHit {
                score: fused.score,
                sources: fused.sources.iter().map(|s| s.as_str().to_string()).collect(),
                source_count: fused.sources.len(),
                similarity,
                is_constitutional: false,
                memory,
            }
        })
        .collect();

    if req.include_constitutional {
        let prelude = constitutional_prelude(storage, req.spec_folder.as_deref(), req.include_content)?;
        let prelude_hits = prelude.into_iter().map(|memory| SearchHit {
            score: 0.0,
            sources: vec!["constitutional".to_string()],
            source_count: 1,
            similarity: None,
            is_constitutional: true,
            memory,
        });
        results = prelude_hits.chain(results).collect();
    }

    Ok(SearchResponse { results, expanded_query: expanded, intent })
}

fn resolve_vector_candidates(
    storage: &Storage,
    query_embedding: Option<&[f32]>,
    req: &SearchRequest,
    pool: usize,
) -> CoreResult<(Vec<i64>, HashMap<i64, f64>)> {
    if req.concepts.len() >= 2 {
        let hits = vector::search_multi_concept(storage, &req.concepts, req.spec_folder.as_deref(), req.min_similarity, pool)?;
        let ids = hits.iter().map(|(id, _, _)| *id).collect();
        let sims = hits
            .into_iter()
            .map(|(id, avg_distance, _)| (id, vector::distance_to_similarity(avg_distance)))
            .collect();
        return Ok((ids, sims));
    }
    let embedding = query_embedding.or_else(|| req.concepts.first().map(|v| v.as_slice()));
    match embedding {
        Some(embedding) => {
            let hits = vector::search(storage, embedding, req.spec_folder.as_deref(), req.min_similarity, pool)?;
            let ids = hits.iter().map(|h| h.id).collect();
            let sims = hits.into_iter().map(|h| (h.id, h.similarity)).collect();
            Ok((ids, sims))
        }
        None => Ok((Vec::new(), HashMap::new())),
    }
}

/// Constitutional prelude. A single entry whose own length exceeds the
/// budget is still included as the last one taken; truncation only stops
/// accepting further memories once the running total exceeds budget.
fn constitutional_prelude(storage: &Storage, spec_folder: Option<&str>, include_content: bool) -> CoreResult<Vec<Memory>> {
    let memories = storage.get_memories_by_tier(ImportanceTier::Constitutional, spec_folder)?;
    let mut running = 0usize;
    let mut kept = Vec::new();
    for mut memory in memories {
        if running > CONSTITUTIONAL_TOKEN_BUDGET_CHARS && !kept.is_empty() {
            break;
        }
        running += memory.content.as_deref().map(str::len).unwrap_or(0);
        if !include_content {
            memory.content = None;
        }
        kept.push(memory);
    }
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryType;
    use crate::storage::NewMemory;

    fn new_storage() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(&dir.path().join("t.sqlite"), 3).unwrap();
        (dir, storage)
    }

    fn insert(storage: &Storage, title: &str, content: &str, tier: ImportanceTier, embedding: Option<Vec<f32>>) -> i64 {
        storage
            .index_memory(NewMemory {
                spec_folder: "default".into(),
                file_path: format!("{title}.md"),
                anchor_id: None,
                title: title.into(),
                trigger_phrases: vec![],
                content_hash: "h".into(),
                content: content.into(),
                context_type: ContextType::General,
                importance_tier: tier,
                memory_type: MemoryType::Declarative,
                channel: "default".into(),
                embedding,
            })
            .unwrap()
    }

    #[test]
    fn rejects_both_query_and_concepts() {
        let (_dir, storage) = new_storage();
        let lexical = Bm25Index::new();
        let req = SearchRequest { query: Some("x".into()), concepts: vec![vec![1.0, 0.0, 0.0]], ..Default::default() };
        let err = search(&storage, &lexical, None, req).unwrap_err();
        assert_eq!(err.code, ErrorCode::ParamInvalid);
    }

    #[test]
    fn rejects_neither_query_nor_concepts() {
        let (_dir, storage) = new_storage();
        let lexical = Bm25Index::new();
        let err = search(&storage, &lexical, None, SearchRequest::default()).unwrap_err();
        assert_eq!(err.code, ErrorCode::QueryEmpty);
    }

    #[test]
    fn lexical_only_search_finds_matching_memory() {
        let (_dir, storage) = new_storage();
        insert(&storage, "auth flow", "user authentication token refresh flow", ImportanceTier::Normal, None);
        let mut lexical = Bm25Index::new();
        lexical.add(1, "user authentication token refresh flow");

        let req = SearchRequest {
            query: Some("authentication token".into()),
            include_constitutional: false,
            ..Default::default()
        };
        let resp = search(&storage, &lexical, None, req).unwrap();
        assert_eq!(resp.results.len(), 1);
        assert_eq!(resp.results[0].memory.title, "auth flow");
    }

    #[test]
    fn constitutional_memories_are_prepended() {
        let (_dir, storage) = new_storage();
        insert(&storage, "rule one", "always do X", ImportanceTier::Constitutional, None);
        insert(&storage, "normal note", "some note about testing", ImportanceTier::Normal, None);
        let mut lexical = Bm25Index::new();
        lexical.add(2, "some note about testing");

        let req = SearchRequest { query: Some("testing".into()), ..Default::default() };
        let resp = search(&storage, &lexical, None, req).unwrap();
        assert!(resp.results[0].is_constitutional);
        assert_eq!(resp.results[0].memory.title, "rule one");
    }

    #[test]
    fn tier_filter_excludes_non_matching_results() {
        let (_dir, storage) = new_storage();
        insert(&storage, "important note", "deploy checklist for releases", ImportanceTier::Important, None);
        let mut lexical = Bm25Index::new();
        lexical.add(1, "deploy checklist for releases");

        let req = SearchRequest {
            query: Some("deploy checklist".into()),
            tier: Some(ImportanceTier::Critical),
            include_constitutional: false,
            ..Default::default()
        };
        let resp = search(&storage, &lexical, None, req).unwrap();
        assert!(resp.results.is_empty());
    }
}
