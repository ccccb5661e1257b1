//! Memory - the fundamental unit of the catalog.
//!
//! A `Memory` is the typed record behind a markdown memory file: identity,
//! classification, scoring inputs, and lifecycle fields. See `catalog` for
//! the parsing contract that produces one from a file on disk.

pub mod catalog;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// ENUMS
// ============================================================================

/// Ordinal importance label with fixed search-boost behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ImportanceTier {
    /// Highest priority, never decaying, always prepended to results.
    Constitutional,
    Critical,
    Important,
    #[default]
    Normal,
    Temporary,
    /// Excluded from default searches.
    Deprecated,
}

impl ImportanceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportanceTier::Constitutional => "constitutional",
            ImportanceTier::Critical => "critical",
            ImportanceTier::Important => "important",
            ImportanceTier::Normal => "normal",
            ImportanceTier::Temporary => "temporary",
            ImportanceTier::Deprecated => "deprecated",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "constitutional" => ImportanceTier::Constitutional,
            "critical" => ImportanceTier::Critical,
            "important" => ImportanceTier::Important,
            "temporary" => ImportanceTier::Temporary,
            "deprecated" => ImportanceTier::Deprecated,
            _ => ImportanceTier::Normal,
        }
    }
}

impl std::fmt::Display for ImportanceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Coarse category describing the intent that produced a memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContextType {
    Research,
    Implementation,
    Decision,
    Discovery,
    #[default]
    General,
}

impl ContextType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextType::Research => "research",
            ContextType::Implementation => "implementation",
            ContextType::Decision => "decision",
            ContextType::Discovery => "discovery",
            ContextType::General => "general",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "research" => ContextType::Research,
            "implementation" => ContextType::Implementation,
            "decision" => ContextType::Decision,
            "discovery" => ContextType::Discovery,
            _ => ContextType::General,
        }
    }
}

/// 9-type cognitive memory taxonomy. Each variant carries a default decay
/// half-life in days (see `MemoryType::default_half_life_days`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Working,
    Episodic,
    Prospective,
    Implicit,
    #[default]
    Declarative,
    Procedural,
    Semantic,
    Autobiographical,
    #[serde(rename = "meta-cognitive")]
    MetaCognitive,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Working => "working",
            MemoryType::Episodic => "episodic",
            MemoryType::Prospective => "prospective",
            MemoryType::Implicit => "implicit",
            MemoryType::Declarative => "declarative",
            MemoryType::Procedural => "procedural",
            MemoryType::Semantic => "semantic",
            MemoryType::Autobiographical => "autobiographical",
            MemoryType::MetaCognitive => "meta-cognitive",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "working" => MemoryType::Working,
            "episodic" => MemoryType::Episodic,
            "prospective" => MemoryType::Prospective,
            "implicit" => MemoryType::Implicit,
            "procedural" => MemoryType::Procedural,
            "semantic" => MemoryType::Semantic,
            "autobiographical" => MemoryType::Autobiographical,
            "meta-cognitive" | "metacognitive" => MemoryType::MetaCognitive,
            _ => MemoryType::Declarative,
        }
    }

    /// Default decay half-life in days. `None` means never decays.
    pub fn default_half_life_days(&self) -> Option<f64> {
        match self {
            MemoryType::Working => Some(1.0),
            MemoryType::Episodic => Some(7.0),
            MemoryType::Prospective => Some(14.0),
            MemoryType::Implicit => Some(30.0),
            MemoryType::Declarative => Some(60.0),
            MemoryType::Procedural => Some(90.0),
            MemoryType::Semantic => Some(180.0),
            MemoryType::Autobiographical => Some(365.0),
            MemoryType::MetaCognitive => None,
        }
    }
}

/// Embedding generation state for a memory's paired vector row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingStatus {
    #[default]
    Pending,
    Success,
    Failed,
    Retry,
}

impl EmbeddingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingStatus::Pending => "pending",
            EmbeddingStatus::Success => "success",
            EmbeddingStatus::Failed => "failed",
            EmbeddingStatus::Retry => "retry",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "success" => EmbeddingStatus::Success,
            "failed" => EmbeddingStatus::Failed,
            "retry" => EmbeddingStatus::Retry,
            _ => EmbeddingStatus::Pending,
        }
    }
}

/// A related memory reference with cached similarity, as stored in
/// `Memory::related_memories`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedMemory {
    pub id: i64,
    pub similarity: f32,
}

// ============================================================================
// MEMORY
// ============================================================================

/// The catalog's central entity: one row per indexed memory, carrying its
/// identity, classification, scoring inputs, and lifecycle timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    pub id: i64,

    // Identity
    pub spec_folder: String,
    pub file_path: String,
    pub anchor_id: Option<String>,

    // Attributes
    pub title: String,
    pub trigger_phrases: Vec<String>,
    pub content_hash: String,
    pub embedding_model: Option<String>,
    pub embedding_status: EmbeddingStatus,
    pub retry_count: i32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,

    // Classification
    pub importance_tier: ImportanceTier,
    pub context_type: ContextType,
    pub memory_type: MemoryType,
    pub channel: String,

    // Scoring inputs
    pub importance_weight: f32,
    pub base_importance: f32,
    pub decay_half_life_days: f64,
    pub access_count: i64,
    pub last_accessed: i64,
    pub is_pinned: bool,
    pub confidence: f32,
    pub validation_count: i32,
    pub stability: f64,
    pub difficulty: f64,
    pub review_count: i32,
    pub last_review: Option<DateTime<Utc>>,

    // Lifecycle
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub related_memories: Vec<RelatedMemory>,

    // Not persisted directly: full text content, hydrated on demand by the
    // parsing collaborator and carried through the write path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl Memory {
    pub fn is_searchable_by_default(&self, now: DateTime<Utc>) -> bool {
        if self.importance_tier == ImportanceTier::Deprecated {
            return false;
        }
        if let Some(expires_at) = self.expires_at {
            if expires_at <= now {
                return false;
            }
        }
        true
    }

    /// Effective half-life: the memory's own value when set, otherwise the
    /// cognitive type's default, otherwise the global default (90 days).
    pub fn effective_half_life_days(&self) -> f64 {
        if self.decay_half_life_days > 0.0 {
            return self.decay_half_life_days;
        }
        self.memory_type.default_half_life_days().unwrap_or(90.0)
    }

    /// Effective importance under decay. Pinned or constitutional memories
    /// never decay.
    pub fn effective_importance(&self, now: DateTime<Utc>) -> f32 {
        if self.is_pinned || self.importance_tier == ImportanceTier::Constitutional {
            return self.importance_weight;
        }
        let half_life = self.effective_half_life_days().max(f64::EPSILON);
        let age_days = (now - self.updated_at).num_seconds() as f64 / 86_400.0;
        let decay = 0.5_f64.powf(age_days / half_life);
        self.importance_weight * decay as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_roundtrip() {
        for t in [
            ImportanceTier::Constitutional,
            ImportanceTier::Critical,
            ImportanceTier::Important,
            ImportanceTier::Normal,
            ImportanceTier::Temporary,
            ImportanceTier::Deprecated,
        ] {
            assert_eq!(ImportanceTier::parse(t.as_str()), t);
        }
    }

    #[test]
    fn memory_type_half_lives() {
        assert_eq!(MemoryType::Working.default_half_life_days(), Some(1.0));
        assert_eq!(MemoryType::MetaCognitive.default_half_life_days(), None);
    }

    #[test]
    fn deprecated_excluded_from_default_search() {
        let mut m = sample_memory();
        m.importance_tier = ImportanceTier::Deprecated;
        assert!(!m.is_searchable_by_default(Utc::now()));
    }

    #[test]
    fn expired_excluded_from_default_search() {
        let mut m = sample_memory();
        m.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(!m.is_searchable_by_default(Utc::now()));
    }

    #[test]
    fn pinned_never_decays() {
        let mut m = sample_memory();
        m.is_pinned = true;
        m.updated_at = Utc::now() - chrono::Duration::days(400);
        assert_eq!(m.effective_importance(Utc::now()), m.importance_weight);
    }

    pub(crate) fn sample_memory() -> Memory {
        let now = Utc::now();
        Memory {
            id: 1,
            spec_folder: "default".to_string(),
            file_path: "specs/example.md".to_string(),
            anchor_id: None,
            title: "Example".to_string(),
            trigger_phrases: vec!["example".to_string()],
            content_hash: "deadbeef".to_string(),
            embedding_model: None,
            embedding_status: EmbeddingStatus::Pending,
            retry_count: 0,
            last_retry_at: None,
            failure_reason: None,
            importance_tier: ImportanceTier::Normal,
            context_type: ContextType::General,
            memory_type: MemoryType::Declarative,
            channel: "default".to_string(),
            importance_weight: 0.5,
            base_importance: 0.5,
            decay_half_life_days: 90.0,
            access_count: 0,
            last_accessed: now.timestamp_millis(),
            is_pinned: false,
            confidence: 0.5,
            validation_count: 0,
            stability: 1.0,
            difficulty: 5.0,
            review_count: 0,
            last_review: None,
            created_at: now,
            updated_at: now,
            expires_at: None,
            related_memories: vec![],
            content: None,
        }
    }
}
