//! `memory_health`.

use memoria_core::config::EmbeddingsProvider;
use memoria_core::CoreRuntime;
use serde_json::{json, Value};

use crate::envelope;

fn provider_name(provider: EmbeddingsProvider) -> &'static str {
    match provider {
        EmbeddingsProvider::Voyage => "voyage",
        EmbeddingsProvider::OpenAi => "openai",
        EmbeddingsProvider::HfLocal => "hf-local",
        EmbeddingsProvider::Ollama => "ollama",
        EmbeddingsProvider::Auto => "auto",
    }
}

pub fn memory_health(runtime: &CoreRuntime) -> (Value, bool) {
    match runtime.storage.get_stats() {
        Ok(stats) => {
            let data = json!({
                "dbPath": stats.db_path,
                "schemaVersion": stats.schema_version,
                "provider": provider_name(runtime.config.embeddings_provider),
                "dimension": runtime.storage.embedding_dimension(),
                "totalMemories": stats.total_memories,
                "totalEmbeddings": stats.total_embeddings,
                "totalCheckpoints": stats.total_checkpoints,
                "byTier": stats.by_tier,
                "byEmbeddingStatus": stats.by_embedding_status,
                "version": memoria_core::VERSION,
            });
            (envelope::success("memory_health", "catalog healthy", data, vec![]), false)
        }
        Err(err) => (envelope::error("memory_health", &err), true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoria_core::Config;

    fn test_runtime() -> CoreRuntime {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_env();
        config.db_path = Some(dir.path().join("health.sqlite"));
        config.embedding_dim_fallback = 4;
        CoreRuntime::open(config).unwrap()
    }

    #[test]
    fn reports_provider_and_counts_on_an_empty_catalog() {
        let runtime = test_runtime();
        let (data, is_error) = memory_health(&runtime);
        assert!(!is_error);
        assert_eq!(data["data"]["totalMemories"], 0);
        assert_eq!(data["data"]["provider"], "auto");
    }
}
