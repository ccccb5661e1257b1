//! Conflict/contradiction gating: before a new memory is committed over an
//! existing near-duplicate, the proposed write is classified against its
//! closest existing match and the decision is left as an audit row in
//! `memory_conflicts`.

use crate::error::CoreResult;
use crate::search::lexical::tokenize;
use crate::search::vector;
use crate::storage::{NewMemory, Storage};

/// Similarity (0-100 scale, same scale as `vector::distance_to_similarity`)
/// above which a proposed write is compared against an existing memory
/// instead of being treated as an unrelated fresh insert.
pub const SIMILARITY_THRESHOLD: f64 = 85.0;

/// Fraction of the smaller content's tokens that must also appear in the
/// other content before a negation marker is trusted as a genuine
/// contradiction signal, rather than an unrelated memory that happens to
/// use a word like "not".
const CONTRADICTION_OVERLAP_THRESHOLD: f64 = 0.3;

const NEGATION_MARKERS: &[&str] = &[
    "no longer",
    "not ",
    "isn't",
    "aren't",
    "doesn't",
    "don't",
    "never",
    "instead of",
    "deprecated",
    "incorrect",
    "outdated",
    "replaced by",
    "supersedes",
    "contradicts",
    "wrong",
];

/// The four outcomes a proposed write can be gated into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictAction {
    Create,
    Update,
    Supersede,
    Reinforce,
}

impl ConflictAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictAction::Create => "CREATE",
            ConflictAction::Update => "UPDATE",
            ConflictAction::Supersede => "SUPERSEDE",
            ConflictAction::Reinforce => "REINFORCE",
        }
    }
}

/// The gating decision for one proposed write. `Create` needs no audit row;
/// the other three are written to `memory_conflicts` by `record`.
#[derive(Debug, Clone, Copy)]
pub enum Resolution {
    /// No sufficiently similar existing memory: proceed as a fresh insert.
    Create,
    /// Existing content is materially the same; bump its access stats
    /// rather than duplicate it.
    Reinforce { existing_id: i64, similarity: f64 },
    /// Existing content is similar but differs; update it in place.
    Update { existing_id: i64, similarity: f64 },
    /// Incoming content contradicts the existing memory's claim; deprecate
    /// the old row and insert the new one as its replacement.
    Supersede { existing_id: i64, similarity: f64 },
}

impl Resolution {
    pub fn action(&self) -> ConflictAction {
        match self {
            Resolution::Create => ConflictAction::Create,
            Resolution::Reinforce { .. } => ConflictAction::Reinforce,
            Resolution::Update { .. } => ConflictAction::Update,
            Resolution::Supersede { .. } => ConflictAction::Supersede,
        }
    }
}

fn token_overlap(a: &str, b: &str) -> f64 {
    let ta: std::collections::HashSet<String> = tokenize(a).into_iter().collect();
    let tb: std::collections::HashSet<String> = tokenize(b).into_iter().collect();
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let shared = ta.intersection(&tb).count() as f64;
    shared / ta.len().min(tb.len()) as f64
}

/// A negation marker alone is weak evidence — two unrelated memories can
/// both contain the word "not". Requiring substantial token overlap as well
/// keeps false positives rare.
fn looks_contradictory(existing_content: &str, new_content: &str) -> bool {
    let lowered = new_content.to_lowercase();
    let has_marker = NEGATION_MARKERS.iter().any(|m| lowered.contains(m));
    has_marker && token_overlap(existing_content, new_content) >= CONTRADICTION_OVERLAP_THRESHOLD
}

/// Classify `input` against the catalog. Read-only: callers act on the
/// returned `Resolution` and then call `record` to leave an audit trail.
pub fn resolve(storage: &Storage, input: &NewMemory) -> CoreResult<Resolution> {
    let Some(embedding) = &input.embedding else {
        return Ok(Resolution::Create);
    };

    let hits = vector::search(storage, embedding, Some(&input.spec_folder), SIMILARITY_THRESHOLD, 5)?;

    let mut closest = None;
    for hit in hits {
        let Some(existing) = storage.get_memory(hit.id)? else { continue };
        let same_row = existing.spec_folder == input.spec_folder
            && existing.file_path == input.file_path
            && existing.anchor_id.as_deref() == input.anchor_id.as_deref();
        if !same_row {
            closest = Some((existing, hit.similarity));
            break;
        }
    }

    let Some((existing, similarity)) = closest else {
        return Ok(Resolution::Create);
    };

    if existing.content_hash == input.content_hash {
        return Ok(Resolution::Reinforce { existing_id: existing.id, similarity });
    }

    let existing_content = existing.content.as_deref().unwrap_or("");
    if looks_contradictory(existing_content, &input.content) {
        return Ok(Resolution::Supersede { existing_id: existing.id, similarity });
    }

    Ok(Resolution::Update { existing_id: existing.id, similarity })
}

/// Write the audit row for a non-`Create` resolution. A no-op for `Create`.
pub fn record(storage: &Storage, input: &NewMemory, resolution: &Resolution) -> CoreResult<()> {
    let (existing_id, similarity) = match resolution {
        Resolution::Create => return Ok(()),
        Resolution::Reinforce { existing_id, similarity }
        | Resolution::Update { existing_id, similarity }
        | Resolution::Supersede { existing_id, similarity } => (*existing_id, *similarity),
    };
    let contradiction_detected = matches!(resolution, Resolution::Supersede { .. });
    storage.record_conflict(
        &input.content_hash,
        Some(existing_id),
        Some(similarity),
        resolution.action().as_str(),
        contradiction_detected,
        None,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{ContextType, ImportanceTier, MemoryType};

    fn new_memory(spec_folder: &str, path: &str, hash: &str, content: &str, embedding: Vec<f32>) -> NewMemory {
        NewMemory {
            spec_folder: spec_folder.into(),
            file_path: path.into(),
            anchor_id: None,
            title: "t".into(),
            trigger_phrases: vec![],
            content_hash: hash.into(),
            content: content.into(),
            context_type: ContextType::General,
            importance_tier: ImportanceTier::Normal,
            memory_type: MemoryType::Declarative,
            channel: "default".into(),
            embedding: Some(embedding),
        }
    }

    fn open() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(&dir.path().join("conflict.sqlite"), 3).unwrap();
        (dir, storage)
    }

    #[test]
    fn no_similar_memory_resolves_to_create() {
        let (_dir, storage) = open();
        let input = new_memory("default", "a.md", "h1", "cache invalidation runs every five minutes", vec![1.0, 0.0, 0.0]);
        let resolution = resolve(&storage, &input).unwrap();
        assert!(matches!(resolution, Resolution::Create));
    }

    #[test]
    fn identical_hash_on_a_near_duplicate_resolves_to_reinforce() {
        let (_dir, storage) = open();
        let existing = new_memory("default", "a.md", "h1", "cache invalidation runs every five minutes", vec![1.0, 0.0, 0.0]);
        let existing_id = storage.index_memory(existing).unwrap();

        let duplicate = new_memory("default", "b.md", "h1", "cache invalidation runs every five minutes", vec![1.0, 0.0, 0.0]);
        let resolution = resolve(&storage, &duplicate).unwrap();
        match resolution {
            Resolution::Reinforce { existing_id: id, .. } => assert_eq!(id, existing_id),
            other => panic!("expected Reinforce, got {other:?}"),
        }
    }

    #[test]
    fn similar_but_differing_content_resolves_to_update() {
        let (_dir, storage) = open();
        let existing = new_memory("default", "a.md", "h1", "cache invalidation runs every five minutes", vec![1.0, 0.0, 0.0]);
        storage.index_memory(existing).unwrap();

        let revised = new_memory("default", "b.md", "h2", "cache invalidation runs every ten minutes", vec![0.99, 0.01, 0.0]);
        let resolution = resolve(&storage, &revised).unwrap();
        assert!(matches!(resolution, Resolution::Update { .. }));
    }

    #[test]
    fn negation_against_a_near_duplicate_resolves_to_supersede() {
        let (_dir, storage) = open();
        let existing = new_memory(
            "default",
            "a.md",
            "h1",
            "the api uses basic auth for every request",
            vec![1.0, 0.0, 0.0],
        );
        storage.index_memory(existing).unwrap();

        let correction = new_memory(
            "default",
            "b.md",
            "h2",
            "the api no longer uses basic auth for every request, it is deprecated and incorrect",
            vec![0.99, 0.01, 0.0],
        );
        let resolution = resolve(&storage, &correction).unwrap();
        assert!(matches!(resolution, Resolution::Supersede { .. }));
    }

    #[test]
    fn missing_embedding_skips_gating_entirely() {
        let (_dir, storage) = open();
        let mut input = new_memory("default", "a.md", "h1", "anything", vec![1.0, 0.0, 0.0]);
        input.embedding = None;
        assert!(matches!(resolve(&storage, &input).unwrap(), Resolution::Create));
    }

    #[test]
    fn record_writes_nothing_for_create() {
        let (_dir, storage) = open();
        let input = new_memory("default", "a.md", "h1", "anything", vec![1.0, 0.0, 0.0]);
        record(&storage, &input, &Resolution::Create).unwrap();
        assert!(storage.get_conflicts(None, 10).unwrap().is_empty());
    }

    #[test]
    fn record_writes_a_supersede_row_with_contradiction_flagged() {
        let (_dir, storage) = open();
        let existing = new_memory("default", "a.md", "h1", "uses basic auth", vec![1.0, 0.0, 0.0]);
        let existing_id = storage.index_memory(existing).unwrap();
        let input = new_memory("default", "b.md", "h2", "no longer uses basic auth, deprecated", vec![0.99, 0.01, 0.0]);
        record(&storage, &input, &Resolution::Supersede { existing_id, similarity: 97.0 }).unwrap();

        let rows = storage.get_conflicts(Some(existing_id), 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].action, "SUPERSEDE");
        assert!(rows[0].contradiction_detected);
    }
}
