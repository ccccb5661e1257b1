//! `CoreRuntime`: the single owner of all shared mutable state — the
//! catalog, caches, and the access accumulator — passed by reference into
//! every operation instead of living behind module-level statics.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::cache::{AccessAccumulator, ConstitutionalCache, TriggerRegexCache, TtlCache};
use crate::config::Config;
use crate::error::{CoreError, CoreResult, ErrorCode};
use crate::search::reranker::{HeuristicReranker, NoopReranker, RerankOrchestrator};
use crate::search::{self, Bm25Index, SearchRequest, SearchResponse};
use crate::storage::Storage;

/// Resolve the catalog path: explicit `db_path`, else `db_dir/memoria.sqlite`,
/// else the platform data directory.
fn resolve_db_path(config: &Config) -> CoreResult<PathBuf> {
    if let Some(path) = &config.db_path {
        return Ok(path.clone());
    }
    if let Some(dir) = &config.db_dir {
        return Ok(dir.join("memoria.sqlite"));
    }
    directories::ProjectDirs::from("dev", "memoria", "memoria")
        .map(|dirs| dirs.data_dir().join("memoria.sqlite"))
        .ok_or_else(|| CoreError::new(ErrorCode::FileAccessDenied, "could not resolve a default data directory"))
}

/// Owns the catalog, every cache, and the batched access accumulator for one
/// process. No global/static state lives outside this struct; every
/// operation takes a `&CoreRuntime` (or `&mut` where it mutates a cache).
pub struct CoreRuntime {
    pub config: Config,
    pub storage: Storage,
    pub constitutional_cache: ConstitutionalCache,
    pub query_cache: Mutex<TtlCache<String, serde_json::Value>>,
    pub trigger_cache: Mutex<TriggerRegexCache>,
    pub access_accumulator: Mutex<AccessAccumulator>,
    pub reranker: Mutex<RerankOrchestrator>,
    pub lexical_index: Mutex<Bm25Index>,
}

const QUERY_CACHE_CAPACITY: usize = 512;
const QUERY_CACHE_TTL: Duration = Duration::from_secs(60);

impl CoreRuntime {
    pub fn open(config: Config) -> CoreResult<Self> {
        let db_path = resolve_db_path(&config)?;
        let storage = Storage::open(&db_path, config.embedding_dim_fallback)?;

        let reranker: Box<dyn crate::search::Reranker> = if config.enable_cross_encoder {
            Box::new(HeuristicReranker)
        } else {
            Box::new(NoopReranker)
        };
        let orchestrator = RerankOrchestrator::new(reranker, config.enable_cross_encoder);

        let mut lexical_index = Bm25Index::new();
        for memory in storage.get_all_memories()? {
            if let Some(content) = &memory.content {
                lexical_index.add(memory.id, content);
            }
        }

        Ok(CoreRuntime {
            query_cache: Mutex::new(TtlCache::new(QUERY_CACHE_CAPACITY, QUERY_CACHE_TTL)),
            trigger_cache: Mutex::new(TriggerRegexCache::new()),
            access_accumulator: Mutex::new(AccessAccumulator::new()),
            constitutional_cache: ConstitutionalCache::new(),
            reranker: Mutex::new(orchestrator),
            lexical_index: Mutex::new(lexical_index),
            storage,
            config,
        })
    }

    /// Rebuild the in-memory lexical index from the catalog. Called by
    /// `memory_index_scan` and whenever a memory's content changes.
    pub async fn rebuild_lexical_index(&self) -> CoreResult<usize> {
        let memories = self.storage.get_all_memories()?;
        let mut index = Bm25Index::new();
        for memory in &memories {
            if let Some(content) = &memory.content {
                index.add(memory.id, content);
            }
        }
        let count = index.total_docs();
        *self.lexical_index.lock().await = index;
        Ok(count)
    }

    /// Run the hybrid search pipeline against the owned catalog and lexical
    /// index, then apply the optional cross-encoder-style rerank pass over
    /// the non-constitutional results. `query_embedding` is the
    /// provider-generated vector for `req.query`, if any (an external
    /// collaborator supplies it).
    pub async fn search(&self, query_embedding: Option<&[f32]>, req: SearchRequest) -> CoreResult<SearchResponse> {
        let query = req.query.clone();
        let mut response = {
            let lexical = self.lexical_index.lock().await;
            search::search(&self.storage, &lexical, query_embedding, req)?
        };

        let Some(query) = query else { return Ok(response) };

        let split = response.results.iter().take_while(|h| h.is_constitutional).count();
        let rerankable = &response.results[split..];
        if rerankable.len() < 2 {
            return Ok(response);
        }

        let candidates = rerankable
            .iter()
            .map(|hit| crate::search::reranker::RerankCandidate {
                id: hit.memory.id,
                title: hit.memory.title.clone(),
                content: hit.memory.content.clone().unwrap_or_default(),
            })
            .collect::<Vec<_>>();
        let top_k = candidates.len();

        let outcome = {
            let mut orchestrator = self.reranker.lock().await;
            orchestrator.rerank(
                &query,
                candidates,
                &crate::search::reranker::RerankOptions { top_k, ..Default::default() },
            )
        };

        let mut by_id: std::collections::HashMap<i64, crate::search::SearchHit> =
            response.results.split_off(split).into_iter().map(|h| (h.memory.id, h)).collect();
        for item in outcome.results {
            if let Some(hit) = by_id.remove(&item.id) {
                response.results.push(hit);
            }
        }
        Ok(response)
    }

    /// Index a memory in the catalog and keep the in-memory lexical index in
    /// sync in the same call, so callers never re-index by hand. Before
    /// writing, gates the proposed content against its closest existing
    /// near-duplicate (see `crate::conflict`) and resolves the write as a
    /// fresh insert, an update, a supersession, or a reinforcement.
    pub async fn save_memory(&self, input: crate::storage::NewMemory) -> CoreResult<i64> {
        let resolution = crate::conflict::resolve(&self.storage, &input)?;
        crate::conflict::record(&self.storage, &input, &resolution)?;

        let id = match resolution {
            crate::conflict::Resolution::Create => {
                let content = input.content.clone();
                let id = self.storage.index_memory(input)?;
                self.lexical_index.lock().await.add(id, &content);
                id
            }
            crate::conflict::Resolution::Reinforce { existing_id, .. } => {
                self.storage.reinforce_memory(existing_id)?;
                existing_id
            }
            crate::conflict::Resolution::Update { existing_id, .. } => {
                self.storage.apply_conflict_update(existing_id, &input)?;
                self.lexical_index.lock().await.add(existing_id, &input.content);
                existing_id
            }
            crate::conflict::Resolution::Supersede { existing_id, similarity } => {
                self.storage.mark_deprecated(existing_id)?;
                let content = input.content.clone();
                let new_id = self.storage.index_memory(input)?;
                self.lexical_index.lock().await.add(new_id, &content);
                if let Err(err) = self.storage.add_related_memory(
                    new_id,
                    crate::memory::RelatedMemory { id: existing_id, similarity: similarity as f32 },
                ) {
                    tracing::warn!(new_id, existing_id, error = %err, "skipping related-memory back-reference");
                }
                new_id
            }
        };
        Ok(id)
    }

    /// Delete a memory from the catalog and its lexical posting lists.
    pub async fn delete_memory(&self, id: i64) -> CoreResult<bool> {
        let deleted = self.storage.delete_memory(id)?;
        if deleted {
            self.lexical_index.lock().await.remove(id);
        }
        Ok(deleted)
    }

    /// Record an access and flush it to the catalog immediately if it
    /// crossed the batching threshold.
    pub async fn track_access(&self, id: i64) -> CoreResult<()> {
        let flushable = {
            let mut acc = self.access_accumulator.lock().await;
            acc.track(id);
            acc.take_flushable()
        };
        if !flushable.is_empty() {
            self.storage.flush_access_counts(&flushable)?;
        }
        Ok(())
    }

    /// Flush every pending access delta regardless of threshold. Call from
    /// shutdown hooks (`exit`, `SIGINT`, `SIGTERM`); log failures rather than
    /// propagate them since shutdown must not hang on a DB error.
    pub async fn flush_all_access(&self) -> CoreResult<()> {
        let all = self.access_accumulator.lock().await.take_all();
        if all.is_empty() {
            return Ok(());
        }
        self.storage.flush_access_counts(&all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_creates_catalog_at_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_env();
        config.db_path = Some(dir.path().join("rt.sqlite"));
        config.embedding_dim_fallback = 4;
        let runtime = CoreRuntime::open(config).unwrap();
        assert!(runtime.storage.db_path().exists());
    }

    #[tokio::test]
    async fn track_access_flushes_at_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_env();
        config.db_path = Some(dir.path().join("rt.sqlite"));
        config.embedding_dim_fallback = 4;
        let runtime = CoreRuntime::open(config).unwrap();

        let id = runtime
            .storage
            .index_memory(crate::storage::NewMemory {
                spec_folder: "default".into(),
                file_path: "a.md".into(),
                anchor_id: None,
                title: "t".into(),
                trigger_phrases: vec![],
                content_hash: "h".into(),
                content: "c".into(),
                context_type: crate::memory::ContextType::General,
                importance_tier: crate::memory::ImportanceTier::Normal,
                memory_type: crate::memory::MemoryType::Declarative,
                channel: "default".into(),
                embedding: None,
            })
            .unwrap();

        for _ in 0..5 {
            runtime.track_access(id).await.unwrap();
        }
        let memory = runtime.storage.get_memory(id).unwrap().unwrap();
        assert!(memory.access_count >= 1);
    }

    #[tokio::test]
    async fn save_memory_is_searchable_without_a_separate_index_call() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_env();
        config.db_path = Some(dir.path().join("rt.sqlite"));
        config.embedding_dim_fallback = 4;
        let runtime = CoreRuntime::open(config).unwrap();

        runtime
            .save_memory(crate::storage::NewMemory {
                spec_folder: "default".into(),
                file_path: "auth.md".into(),
                anchor_id: None,
                title: "auth notes".into(),
                trigger_phrases: vec![],
                content_hash: "h".into(),
                content: "token refresh authentication flow".into(),
                context_type: crate::memory::ContextType::General,
                importance_tier: crate::memory::ImportanceTier::Normal,
                memory_type: crate::memory::MemoryType::Declarative,
                channel: "default".into(),
                embedding: None,
            })
            .await
            .unwrap();

        let resp = runtime
            .search(
                None,
                crate::search::SearchRequest {
                    query: Some("authentication token".into()),
                    include_constitutional: false,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(resp.results.len(), 1);
    }

    #[tokio::test]
    async fn save_memory_reinforces_an_identical_near_duplicate_instead_of_inserting() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_env();
        config.db_path = Some(dir.path().join("rt.sqlite"));
        config.embedding_dim_fallback = 3;
        let runtime = CoreRuntime::open(config).unwrap();

        let first = crate::storage::NewMemory {
            spec_folder: "default".into(),
            file_path: "a.md".into(),
            anchor_id: None,
            title: "auth notes".into(),
            trigger_phrases: vec![],
            content_hash: "h1".into(),
            content: "the api uses basic auth for every request".into(),
            context_type: crate::memory::ContextType::General,
            importance_tier: crate::memory::ImportanceTier::Normal,
            memory_type: crate::memory::MemoryType::Declarative,
            channel: "default".into(),
            embedding: Some(vec![1.0, 0.0, 0.0]),
        };
        let id = runtime.save_memory(first).await.unwrap();

        let duplicate = crate::storage::NewMemory {
            spec_folder: "default".into(),
            file_path: "b.md".into(),
            anchor_id: None,
            title: "auth notes".into(),
            trigger_phrases: vec![],
            content_hash: "h1".into(),
            content: "the api uses basic auth for every request".into(),
            context_type: crate::memory::ContextType::General,
            importance_tier: crate::memory::ImportanceTier::Normal,
            memory_type: crate::memory::MemoryType::Declarative,
            channel: "default".into(),
            embedding: Some(vec![1.0, 0.0, 0.0]),
        };
        let reinforced_id = runtime.save_memory(duplicate).await.unwrap();

        assert_eq!(reinforced_id, id);
        let memory = runtime.storage.get_memory(id).unwrap().unwrap();
        assert!(memory.access_count >= 1);
        assert_eq!(runtime.storage.get_conflicts(Some(id), 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn save_memory_supersedes_a_contradicted_near_duplicate_and_links_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_env();
        config.db_path = Some(dir.path().join("rt.sqlite"));
        config.embedding_dim_fallback = 3;
        let runtime = CoreRuntime::open(config).unwrap();

        let original = crate::storage::NewMemory {
            spec_folder: "default".into(),
            file_path: "a.md".into(),
            anchor_id: None,
            title: "auth notes".into(),
            trigger_phrases: vec![],
            content_hash: "h1".into(),
            content: "the api uses basic auth for every request".into(),
            context_type: crate::memory::ContextType::General,
            importance_tier: crate::memory::ImportanceTier::Normal,
            memory_type: crate::memory::MemoryType::Declarative,
            channel: "default".into(),
            embedding: Some(vec![1.0, 0.0, 0.0]),
        };
        let original_id = runtime.save_memory(original).await.unwrap();

        let correction = crate::storage::NewMemory {
            spec_folder: "default".into(),
            file_path: "b.md".into(),
            anchor_id: None,
            title: "auth notes revised".into(),
            trigger_phrases: vec![],
            content_hash: "h2".into(),
            content: "the api no longer uses basic auth, it is deprecated and incorrect".into(),
            context_type: crate::memory::ContextType::General,
            importance_tier: crate::memory::ImportanceTier::Normal,
            memory_type: crate::memory::MemoryType::Declarative,
            channel: "default".into(),
            embedding: Some(vec![0.99, 0.01, 0.0]),
        };
        let new_id = runtime.save_memory(correction).await.unwrap();

        assert_ne!(new_id, original_id);
        let original_memory = runtime.storage.get_memory(original_id).unwrap().unwrap();
        assert_eq!(original_memory.importance_tier, crate::memory::ImportanceTier::Deprecated);
        let new_memory = runtime.storage.get_memory(new_id).unwrap().unwrap();
        assert!(new_memory.related_memories.iter().any(|r| r.id == original_id));
    }

    #[tokio::test]
    async fn delete_memory_removes_it_from_the_lexical_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_env();
        config.db_path = Some(dir.path().join("rt.sqlite"));
        config.embedding_dim_fallback = 4;
        let runtime = CoreRuntime::open(config).unwrap();

        let id = runtime
            .save_memory(crate::storage::NewMemory {
                spec_folder: "default".into(),
                file_path: "auth.md".into(),
                anchor_id: None,
                title: "auth notes".into(),
                trigger_phrases: vec![],
                content_hash: "h".into(),
                content: "token refresh authentication flow".into(),
                context_type: crate::memory::ContextType::General,
                importance_tier: crate::memory::ImportanceTier::Normal,
                memory_type: crate::memory::MemoryType::Declarative,
                channel: "default".into(),
                embedding: None,
            })
            .await
            .unwrap();

        assert!(runtime.delete_memory(id).await.unwrap());
        assert_eq!(runtime.lexical_index.lock().await.total_docs(), 0);
    }
}
