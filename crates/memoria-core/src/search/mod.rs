//! Hybrid search: vector cosine scan, custom lexical BM25/FTS, Reciprocal
//! Rank Fusion, query expansion/intent classification, and optional
//! cross-encoder-style reranking.

pub mod fusion;
pub mod lexical;
pub mod pipeline;
pub mod query;
pub mod reranker;
pub mod vector;

pub use fusion::{
    diversify, length_penalty, reciprocal_rank_fusion, smart_rank_score, DiversityCandidate,
    FusedResult, Source, SmartRankingInput, SmartRankingWeights,
};
pub use lexical::{sanitize_fts5_query, Bm25Index};
pub use pipeline::{search, SearchHit, SearchRequest, SearchResponse};
pub use query::{classify_intent, expand_query_with_fuzzy, intent_weight_overrides, Intent};
pub use reranker::{HeuristicReranker, NoopReranker, Reranker, RerankOptions, RerankOrchestrator};
pub use vector::{search as vector_search, search_multi_concept, VectorHit};
