//! Configuration: environment toggles and the optional JSONC
//! `search-weights.json` overlay.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => !matches!(v.to_lowercase().as_str(), "0" | "false" | "off"),
        Err(_) => default,
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingsProvider {
    Voyage,
    OpenAi,
    HfLocal,
    Ollama,
    Auto,
}

impl EmbeddingsProvider {
    fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "voyage" => EmbeddingsProvider::Voyage,
            "openai" => EmbeddingsProvider::OpenAi,
            "hf-local" | "hf_local" => EmbeddingsProvider::HfLocal,
            "ollama" => EmbeddingsProvider::Ollama,
            _ => EmbeddingsProvider::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossEncoderProvider {
    Voyage,
    Cohere,
    Local,
    Auto,
}

impl CrossEncoderProvider {
    fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "voyage" => CrossEncoderProvider::Voyage,
            "cohere" => CrossEncoderProvider::Cohere,
            "local" => CrossEncoderProvider::Local,
            _ => CrossEncoderProvider::Auto,
        }
    }
}

/// Process-wide configuration, resolved once at startup from the
/// environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: Option<PathBuf>,
    pub db_dir: Option<PathBuf>,
    pub allowed_paths: Vec<PathBuf>,
    pub embeddings_provider: EmbeddingsProvider,
    pub voyage_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub enable_bm25: bool,
    pub enable_rrf_fusion: bool,
    pub enable_fuzzy_match: bool,
    pub enable_cross_encoder: bool,
    pub cross_encoder_provider: CrossEncoderProvider,
    pub max_rerank_candidates: usize,
    pub rerank_p95_threshold_ms: u64,
    pub rerank_cache_ttl_secs: u64,
    pub rerank_cache_size: usize,
    pub embedding_dim_fallback: usize,
    pub search_weights: SearchWeightsFile,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

impl Config {
    pub fn from_env() -> Self {
        let allowed_paths = env_string("MEMORY_ALLOWED_PATHS")
            .map(|s| s.split(':').map(PathBuf::from).collect())
            .unwrap_or_default();

        Config {
            db_path: env_string("MEMORY_DB_PATH").map(PathBuf::from),
            db_dir: env_string("MEMORY_DB_DIR").map(PathBuf::from),
            allowed_paths,
            embeddings_provider: env_string("EMBEDDINGS_PROVIDER")
                .map(|v| EmbeddingsProvider::parse(&v))
                .unwrap_or(EmbeddingsProvider::Auto),
            voyage_api_key: env_string("VOYAGE_API_KEY"),
            openai_api_key: env_string("OPENAI_API_KEY"),
            enable_bm25: env_flag("ENABLE_BM25", true),
            enable_rrf_fusion: env_flag("ENABLE_RRF_FUSION", true),
            enable_fuzzy_match: env_flag("ENABLE_FUZZY_MATCH", true),
            enable_cross_encoder: env_flag("ENABLE_CROSS_ENCODER", false),
            cross_encoder_provider: env_string("CROSS_ENCODER_PROVIDER")
                .map(|v| CrossEncoderProvider::parse(&v))
                .unwrap_or(CrossEncoderProvider::Auto),
            max_rerank_candidates: env_parsed("MAX_RERANK_CANDIDATES", 20),
            rerank_p95_threshold_ms: env_parsed("RERANK_P95_THRESHOLD", 500),
            rerank_cache_ttl_secs: env_parsed("RERANK_CACHE_TTL", 300),
            rerank_cache_size: env_parsed("RERANK_CACHE_SIZE", 256),
            embedding_dim_fallback: env_parsed("EMBEDDING_DIM", 768),
            search_weights: SearchWeightsFile::default(),
        }
    }

    /// Load `search-weights.json` (JSONC: `//` line comments stripped before
    /// parsing) relative to the given directory, falling back to defaults on
    /// any parse failure.
    pub fn load_search_weights(dir: &std::path::Path) -> SearchWeightsFile {
        let path = dir.join("search-weights.json");
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return SearchWeightsFile::default();
        };
        let stripped = strip_jsonc_comments(&raw);
        match serde_json::from_str(&stripped) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "invalid search-weights.json, using defaults");
                SearchWeightsFile::default()
            }
        }
    }
}

/// Strip `//` line comments outside of string literals. Block comments are
/// not supported; this is a minimal JSONC dialect, not a full parser.
fn strip_jsonc_comments(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for line in input.lines() {
        let mut in_string = false;
        let mut escaped = false;
        let mut cut_at = None;
        for (i, c) in line.char_indices() {
            if in_string {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    in_string = false;
                }
                continue;
            }
            match c {
                '"' => in_string = true,
                '/' if line[i..].starts_with("//") => {
                    cut_at = Some(i);
                    break;
                }
                _ => {}
            }
        }
        out.push_str(match cut_at {
            Some(pos) => &line[..pos],
            None => line,
        });
        out.push('\n');
    }
    out
}

/// Overlay config recognized in `search-weights.json`. Unknown keys are
/// tolerated via `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchWeightsFile {
    #[serde(default)]
    pub hybrid_search: HybridSearchSection,
    #[serde(default)]
    pub memory_decay: MemoryDecaySection,
    #[serde(default)]
    pub composite_scoring: CompositeScoringSection,
    #[serde(default)]
    pub smart_ranking: SmartRankingSection,
    #[serde(default = "default_max_triggers")]
    pub max_triggers_per_memory: usize,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_max_triggers() -> usize {
    crate::memory::catalog::DEFAULT_MAX_TRIGGERS
}

impl Default for SearchWeightsFile {
    fn default() -> Self {
        SearchWeightsFile {
            hybrid_search: HybridSearchSection::default(),
            memory_decay: MemoryDecaySection::default(),
            composite_scoring: CompositeScoringSection::default(),
            smart_ranking: SmartRankingSection::default(),
            max_triggers_per_memory: default_max_triggers(),
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HybridSearchSection {
    pub enabled: bool,
    pub vector_weight: f32,
    pub fts_weight: f32,
}

impl Default for HybridSearchSection {
    fn default() -> Self {
        HybridSearchSection {
            enabled: true,
            vector_weight: 0.7,
            fts_weight: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryDecaySection {
    pub enabled: bool,
    pub decay_weight: f32,
    pub scale_days: f64,
}

impl Default for MemoryDecaySection {
    fn default() -> Self {
        MemoryDecaySection {
            enabled: true,
            decay_weight: 0.1,
            scale_days: 90.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeScoringSection {
    pub enabled: bool,
}

impl Default for CompositeScoringSection {
    fn default() -> Self {
        CompositeScoringSection { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartRankingSection {
    pub recency_weight: f32,
    pub access_weight: f32,
    pub relevance_weight: f32,
}

impl Default for SmartRankingSection {
    fn default() -> Self {
        SmartRankingSection {
            recency_weight: 0.3,
            access_weight: 0.2,
            relevance_weight: 0.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonc_strips_line_comments_outside_strings() {
        let input = "{\n  \"a\": 1, // a comment\n  \"b\": \"http://x\" // another\n}";
        let stripped = strip_jsonc_comments(input);
        let value: serde_json::Value = serde_json::from_str(&stripped).unwrap();
        assert_eq!(value["a"], 1);
        assert_eq!(value["b"], "http://x");
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let raw = r#"{"smartRanking": {"recencyWeight": 0.4, "accessWeight": 0.2, "relevanceWeight": 0.4}, "somethingUnknown": 42}"#;
        let parsed: SearchWeightsFile = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.smart_ranking.recency_weight, 0.4);
        assert_eq!(parsed.extra.get("somethingUnknown").unwrap(), 42);
    }

    #[test]
    fn invalid_json_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("search-weights.json"), "{ not json").unwrap();
        let loaded = Config::load_search_weights(dir.path());
        assert_eq!(loaded.smart_ranking.recency_weight, 0.3);
    }
}
