//! Vector search: brute-force cosine distance over embeddings held in the
//! catalog's `embeddings` table.
//!
//! The catalog is small enough (thousands, not millions, of memories — a
//! per-developer/per-project context store) that an HNSW index buys little
//! over a direct scan, so this module scans rather than maintaining a
//! separate ANN structure.

use crate::storage::Storage;

/// One scored vector hit: similarity on a 0-100 scale.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub id: i64,
    pub distance: f64,
    pub similarity: f64,
    pub effective_importance: f32,
}

/// `pinned ⇒ importance_weight; else importance_weight × 0.5^(age/half_life)`.
/// Mirrors `Memory::effective_importance` without hydrating a full `Memory`
/// row for every scan candidate.
fn effective_importance(
    importance_weight: f32,
    is_pinned: bool,
    constitutional: bool,
    decay_half_life_days: f64,
    updated_at: &str,
    now: chrono::DateTime<chrono::Utc>,
) -> f32 {
    if is_pinned || constitutional {
        return importance_weight;
    }
    let half_life = if decay_half_life_days > 0.0 { decay_half_life_days } else { 90.0 }.max(f64::EPSILON);
    let updated_at = crate::storage::parse_rfc3339(updated_at).unwrap_or(now);
    let age_days = (now - updated_at).num_seconds() as f64 / 86_400.0;
    let decay = 0.5_f64.powf(age_days / half_life);
    importance_weight * decay as f32
}

pub fn cosine_distance(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 2.0;
    }
    let cosine_similarity = (dot / (norm_a * norm_b)).clamp(-1.0, 1.0);
    1.0 - cosine_similarity
}

/// `similarity = round((1 - distance/2) * 100, 2)`.
pub fn distance_to_similarity(distance: f64) -> f64 {
    (((1.0 - distance / 2.0) * 100.0) * 100.0).round() / 100.0
}

/// `distance <= 2 * (1 - min_similarity/100)`.
pub fn distance_cutoff(min_similarity: f64) -> f64 {
    2.0 * (1.0 - min_similarity / 100.0)
}

/// Scan every embedding in `spec_folder` (or the whole catalog) and return
/// hits passing the similarity cutoff, best first.
pub fn search(
    storage: &Storage,
    query_embedding: &[f32],
    spec_folder: Option<&str>,
    min_similarity: f64,
    limit: usize,
) -> crate::error::CoreResult<Vec<VectorHit>> {
    let cutoff = distance_cutoff(min_similarity);
    let now = chrono::Utc::now();

    type Row = (i64, Vec<u8>, f32, i64, f64, String, String);
    storage.with_reader(|conn| {
        let rows: Vec<Row> = match spec_folder {
            Some(folder) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT e.memory_id, e.embedding, m.importance_weight, m.is_pinned,
                            m.decay_half_life_days, m.updated_at, m.importance_tier
                     FROM embeddings e
                     JOIN memories m ON m.id = e.memory_id
                     WHERE m.spec_folder = ?1 AND m.importance_tier NOT IN ('deprecated', 'constitutional')",
                )?;
                stmt.query_map([folder], row_to_candidate)?.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare_cached(
                    "SELECT e.memory_id, e.embedding, m.importance_weight, m.is_pinned,
                            m.decay_half_life_days, m.updated_at, m.importance_tier
                     FROM embeddings e
                     JOIN memories m ON m.id = e.memory_id
                     WHERE m.importance_tier NOT IN ('deprecated', 'constitutional')",
                )?;
                stmt.query_map([], row_to_candidate)?.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };

        let mut hits: Vec<VectorHit> = rows
            .into_iter()
            .filter_map(|(id, blob, importance_weight, is_pinned, half_life, updated_at, tier)| {
                let vector = crate::storage::unmarshal_embedding(&blob)?;
                if vector.len() != query_embedding.len() {
                    return None;
                }
                let distance = cosine_distance(query_embedding, &vector);
                if distance <= cutoff {
                    let importance = effective_importance(importance_weight, is_pinned != 0, tier == "constitutional", half_life, &updated_at, now);
                    Some(VectorHit {
                        id,
                        distance,
                        similarity: distance_to_similarity(distance),
                        effective_importance: importance,
                    })
                } else {
                    None
                }
            })
            .collect();

        // Rank expression: (distance - effective_importance * 0.1) ASC — a
        // higher-importance, non-decayed memory outranks an otherwise
        // closer-but-stale one.
        hits.sort_by(|a, b| {
            let rank_a = a.distance - a.effective_importance as f64 * 0.1;
            let rank_b = b.distance - b.effective_importance as f64 * 0.1;
            rank_a.partial_cmp(&rank_b).unwrap()
        });
        hits.truncate(limit);
        Ok(hits)
    })
}

fn row_to_candidate(row: &rusqlite::Row) -> rusqlite::Result<(i64, Vec<u8>, f32, i64, f64, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?, row.get(6)?))
}

/// Multi-concept AND search (2-5 embeddings): every concept must individually
/// pass the cutoff; ordering is by average distance across concepts.
pub fn search_multi_concept(
    storage: &Storage,
    query_embeddings: &[Vec<f32>],
    spec_folder: Option<&str>,
    min_similarity: f64,
    limit: usize,
) -> crate::error::CoreResult<Vec<(i64, f64, Vec<f64>)>> {
    if !(2..=5).contains(&query_embeddings.len()) {
        return Err(crate::error::CoreError::new(
            crate::error::ErrorCode::ParamOutOfRange,
            "multi-concept search requires 2-5 embeddings",
        ));
    }

    let per_concept: Vec<Vec<VectorHit>> = query_embeddings
        .iter()
        .map(|emb| search(storage, emb, spec_folder, min_similarity, usize::MAX))
        .collect::<crate::error::CoreResult<Vec<_>>>()?;

    let mut candidate_ids: Option<std::collections::HashSet<i64>> = None;
    for hits in &per_concept {
        let ids: std::collections::HashSet<i64> = hits.iter().map(|h| h.id).collect();
        candidate_ids = Some(match candidate_ids {
            Some(existing) => existing.intersection(&ids).copied().collect(),
            None => ids,
        });
    }
    let candidate_ids = candidate_ids.unwrap_or_default();

    let mut results: Vec<(i64, f64, Vec<f64>)> = candidate_ids
        .into_iter()
        .map(|id| {
            let similarities: Vec<f64> = per_concept
                .iter()
                .map(|hits| hits.iter().find(|h| h.id == id).map(|h| h.similarity).unwrap_or(0.0))
                .collect();
            let distances: Vec<f64> = per_concept
                .iter()
                .map(|hits| hits.iter().find(|h| h.id == id).map(|h| h.distance).unwrap_or(2.0))
                .collect();
            let avg_distance = distances.iter().sum::<f64>() / distances.len() as f64;
            (id, avg_distance, similarities)
        })
        .collect();

    results.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
    results.truncate(limit);
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_vectors_have_zero_distance() {
        let v = vec![1.0_f32, 2.0, 3.0];
        assert!(cosine_distance(&v, &v) < 1e-9);
    }

    #[test]
    fn orthogonal_vectors_have_unit_distance() {
        let a = vec![1.0_f32, 0.0];
        let b = vec![0.0_f32, 1.0];
        assert!((cosine_distance(&a, &b) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn similarity_formula_converts_distance_to_percentage() {
        assert_eq!(distance_to_similarity(0.0), 100.0);
        assert_eq!(distance_to_similarity(2.0), 0.0);
    }

    #[test]
    fn pinned_memory_never_loses_effective_importance() {
        let now = chrono::Utc::now();
        let stale = (now - chrono::Duration::days(400)).to_rfc3339();
        let importance = effective_importance(0.8, true, false, 90.0, &stale, now);
        assert_eq!(importance, 0.8);
    }

    #[test]
    fn stale_unpinned_memory_decays_below_its_base_weight() {
        let now = chrono::Utc::now();
        let stale = (now - chrono::Duration::days(90)).to_rfc3339();
        let importance = effective_importance(0.8, false, false, 90.0, &stale, now);
        assert!((importance - 0.4).abs() < 0.01);
    }

    #[test]
    fn decay_lets_a_fresher_slightly_farther_memory_outrank_a_heavily_decayed_exact_match() {
        let dir = tempfile::tempdir().unwrap();
        let storage = crate::storage::Storage::open(&dir.path().join("decay.sqlite"), 3).unwrap();

        let stale_id = storage
            .index_memory(crate::storage::NewMemory {
                spec_folder: "default".into(),
                file_path: "stale.md".into(),
                anchor_id: None,
                title: "stale".into(),
                trigger_phrases: vec![],
                content_hash: "a".into(),
                content: "stale content".into(),
                context_type: crate::memory::ContextType::General,
                importance_tier: crate::memory::ImportanceTier::Normal,
                memory_type: crate::memory::MemoryType::Declarative,
                channel: "default".into(),
                embedding: Some(vec![1.0, 0.0, 0.0]),
            })
            .unwrap();
        storage
            .with_writer(|conn| {
                conn.execute(
                    "UPDATE memories SET importance_weight = 0.9, updated_at = ?1 WHERE id = ?2",
                    rusqlite::params![(chrono::Utc::now() - chrono::Duration::days(400)).to_rfc3339(), stale_id],
                )?;
                Ok(())
            })
            .unwrap();

        let fresh_id = storage
            .index_memory(crate::storage::NewMemory {
                spec_folder: "default".into(),
                file_path: "fresh.md".into(),
                anchor_id: None,
                title: "fresh".into(),
                trigger_phrases: vec![],
                content_hash: "b".into(),
                content: "fresh content".into(),
                context_type: crate::memory::ContextType::General,
                importance_tier: crate::memory::ImportanceTier::Normal,
                memory_type: crate::memory::MemoryType::Declarative,
                channel: "default".into(),
                embedding: Some(vec![0.99, 0.01, 0.0]),
            })
            .unwrap();

        let hits = search(&storage, &[1.0, 0.0, 0.0], None, 0.0, 10).unwrap();
        // `stale_id` is the exact nearest neighbor (distance 0) but its
        // importance has decayed to a fraction of `fresh_id`'s default
        // weight over 400 days against a 90-day half-life, so the rank
        // expression still places the fresher candidate first.
        assert_eq!(hits[0].id, fresh_id);
        assert_eq!(hits[1].id, stale_id);
    }

    #[test]
    fn cutoff_excludes_low_similarity() {
        let cutoff = distance_cutoff(90.0);
        assert!((cutoff - 0.2).abs() < 1e-9);
    }

    #[test]
    fn multi_concept_requires_two_to_five_embeddings() {
        let dir = tempfile::tempdir().unwrap();
        let storage = crate::storage::Storage::open(&dir.path().join("t.sqlite"), 3).unwrap();
        let err = search_multi_concept(&storage, &[vec![1.0, 0.0, 0.0]], None, 0.0, 10).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::ParamOutOfRange);
    }
}
