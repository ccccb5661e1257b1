//! Checkpoint snapshot/restore: a compressed point-in-time capture of
//! the catalog (optionally scoped to a `spec_folder`), with UPSERT
//! reconciliation on restore and a retention policy applied after create.

use std::collections::HashMap;
use std::io::{Read, Write};

use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rusqlite::{params, OptionalExtension};

use crate::error::{CoreError, CoreResult, ErrorCode};
use crate::memory::{EmbeddingStatus, Memory};
use crate::storage::{anchor_for_db, anchor_from_db, marshal_embedding, parse_rfc3339, row_to_memory, unmarshal_embedding, Storage};

const MAX_UNCOMPRESSED_BYTES: usize = 100 * 1024 * 1024;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointSnapshot {
    pub created_at: chrono::DateTime<Utc>,
    pub memory_count: usize,
    pub embedding_count: usize,
    pub spec_folder: Option<String>,
    pub memories: Vec<Memory>,
    pub embeddings: HashMap<i64, Vec<f32>>,
}

/// Either shape a stored snapshot might take: the legacy format was a bare
/// memory array with no embeddings, the current format is the full object.
#[derive(serde::Deserialize)]
#[serde(untagged)]
enum StoredSnapshot {
    Current(CheckpointSnapshot),
    Legacy(Vec<Memory>),
}

#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub max_per_scope: usize,
    pub ttl_days: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy { max_per_scope: 10, ttl_days: 30 }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSummary {
    pub name: String,
    pub memory_count: usize,
    pub embedding_count: usize,
    pub retained: i64,
    pub pruned: i64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreSummary {
    pub inserted: i64,
    pub updated: i64,
    pub skipped: i64,
    pub cleared: i64,
    pub deprecated: i64,
    pub embeddings_restored: i64,
    pub embeddings_skipped: i64,
    pub total_in_snapshot: i64,
    pub note: Option<String>,
}

pub struct RestoreOptions {
    pub clear_existing: bool,
    pub reinsert_memories: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        RestoreOptions { clear_existing: false, reinsert_memories: true }
    }
}

/// Collect the current catalog (optionally scoped), compress, and persist it
/// under `name`. Duplicate names fail rather than silently overwrite.
pub fn create(storage: &Storage, name: &str, spec_folder: Option<&str>, git_branch: Option<&str>, retention: RetentionPolicy) -> CoreResult<CreateSummary> {
    let memories = match spec_folder {
        Some(folder) => storage.get_memories_by_folder(folder)?,
        None => storage.with_reader(|conn| {
            let mut stmt = conn.prepare_cached("SELECT * FROM memories ORDER BY id")?;
            let rows = stmt.query_map([], row_to_memory)?.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?,
    };

    let embeddings: HashMap<i64, Vec<f32>> = storage.with_reader(|conn| {
        let mut stmt = conn.prepare_cached("SELECT memory_id, embedding FROM embeddings")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(id, blob)| unmarshal_embedding(&blob).map(|v| (id, v)))
            .filter(|(id, _)| memories.iter().any(|m| m.id == *id))
            .collect())
    })?;

    let snapshot = CheckpointSnapshot {
        created_at: Utc::now(),
        memory_count: memories.len(),
        embedding_count: embeddings.len(),
        spec_folder: spec_folder.map(|s| s.to_string()),
        memories,
        embeddings,
    };

    let json = serde_json::to_vec(&snapshot)
        .map_err(|e| CoreError::new(ErrorCode::CheckpointCreateFailed, format!("serializing snapshot: {e}")))?;
    if json.len() > MAX_UNCOMPRESSED_BYTES {
        return Err(CoreError::new(
            ErrorCode::CheckpointCreateFailed,
            format!("uncompressed snapshot is {} bytes, exceeds {MAX_UNCOMPRESSED_BYTES}", json.len()),
        ));
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| CoreError::new(ErrorCode::CheckpointCreateFailed, format!("compressing snapshot: {e}")))?;
    let compressed = encoder
        .finish()
        .map_err(|e| CoreError::new(ErrorCode::CheckpointCreateFailed, format!("compressing snapshot: {e}")))?;

    let metadata = serde_json::json!({
        "createdAt": snapshot.created_at.to_rfc3339(),
        "memoryCount": snapshot.memory_count,
        "embeddingCount": snapshot.embedding_count,
    });

    let (memory_count, embedding_count, retained, pruned) = storage.with_writer(|conn| {
        let tx = conn.transaction()?;

        let affected = tx.execute(
            "INSERT OR IGNORE INTO checkpoints (name, created_at, spec_folder, git_branch, memory_snapshot, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![name, snapshot.created_at.to_rfc3339(), spec_folder, git_branch, compressed, metadata.to_string()],
        )?;
        if affected == 0 {
            return Err(CoreError::new(
                ErrorCode::CheckpointCreateFailed,
                format!("a checkpoint named '{name}' already exists"),
            ));
        }

        let (retained, pruned) = apply_retention(&tx, spec_folder, retention)?;
        tx.commit()?;
        Ok((snapshot.memory_count, snapshot.embedding_count, retained, pruned))
    })?;

    Ok(CreateSummary { name: name.to_string(), memory_count, embedding_count, retained, pruned })
}

fn apply_retention(tx: &rusqlite::Transaction, spec_folder: Option<&str>, retention: RetentionPolicy) -> CoreResult<(i64, i64)> {
    let names: Vec<String> = {
        let mut stmt = match spec_folder {
            Some(_) => tx.prepare_cached("SELECT name FROM checkpoints WHERE spec_folder = ?1 ORDER BY created_at DESC")?,
            None => tx.prepare_cached("SELECT name FROM checkpoints ORDER BY created_at DESC")?,
        };
        let rows = match spec_folder {
            Some(folder) => stmt.query_map(params![folder], |r| r.get::<_, String>(0))?.collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt.query_map([], |r| r.get::<_, String>(0))?.collect::<rusqlite::Result<Vec<_>>>()?,
        };
        rows
    };

    let overflow: Vec<&String> = names.iter().skip(retention.max_per_scope).collect();
    let mut pruned = 0i64;
    for name in &overflow {
        pruned += tx.execute("DELETE FROM checkpoints WHERE name = ?1", params![name])?;
    }

    let cutoff = (Utc::now() - chrono::Duration::days(retention.ttl_days)).to_rfc3339();
    pruned += tx.execute("DELETE FROM checkpoints WHERE created_at < ?1", params![cutoff])? as i64;

    let retained: i64 = tx.query_row("SELECT COUNT(*) FROM checkpoints", [], |r| r.get(0))?;
    Ok((retained, pruned))
}

/// Decompress, reconcile against the live catalog, and report counts.
pub fn restore(storage: &Storage, name: &str, options: RestoreOptions) -> CoreResult<RestoreSummary> {
    let compressed: Vec<u8> = storage.with_reader(|conn| {
        conn.query_row("SELECT memory_snapshot FROM checkpoints WHERE name = ?1", params![name], |r| r.get(0))
            .optional()
            .map_err(CoreError::from)?
            .ok_or_else(|| CoreError::new(ErrorCode::CheckpointNotFound, format!("no checkpoint named '{name}'")))
    })?;

    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut json = Vec::new();
    decoder
        .read_to_end(&mut json)
        .map_err(|e| CoreError::new(ErrorCode::CheckpointRestoreFailed, format!("decompressing snapshot: {e}")))?;

    let stored: StoredSnapshot = serde_json::from_slice(&json)
        .map_err(|e| CoreError::new(ErrorCode::CheckpointRestoreFailed, format!("parsing snapshot: {e}")))?;

    let is_legacy = matches!(stored, StoredSnapshot::Legacy(_));
    let snapshot = match stored {
        StoredSnapshot::Current(s) => s,
        StoredSnapshot::Legacy(memories) => {
            let count = memories.len();
            CheckpointSnapshot {
                created_at: Utc::now(),
                memory_count: count,
                embedding_count: 0,
                spec_folder: None,
                memories,
                embeddings: HashMap::new(),
            }
        }
    };

    let total_in_snapshot = snapshot.memories.len() as i64;

    storage.with_writer(|conn| {
        let tx = conn.transaction()?;
        let mut cleared = 0i64;
        let mut deprecated = 0i64;

        if options.clear_existing {
            cleared = match &snapshot.spec_folder {
                Some(folder) => {
                    let ids: Vec<i64> = {
                        let mut stmt = tx.prepare_cached("SELECT id FROM memories WHERE spec_folder = ?1")?;
                        stmt.query_map(params![folder], |r| r.get(0))?.collect::<rusqlite::Result<Vec<_>>>()?
                    };
                    for chunk in ids.chunks(500) {
                        let placeholders = chunk.iter().map(|_| "?").collect::<Vec<_>>().join(",");
                        tx.execute(&format!("DELETE FROM embeddings WHERE memory_id IN ({placeholders})"), rusqlite::params_from_iter(chunk))?;
                    }
                    tx.execute("DELETE FROM memories WHERE spec_folder = ?1", params![folder])? as i64
                }
                None => {
                    tx.execute("DELETE FROM embeddings", [])?;
                    tx.execute("DELETE FROM memories", [])? as i64
                }
            };
        } else if let Some(folder) = &snapshot.spec_folder {
            deprecated = tx.execute(
                "UPDATE memories SET importance_tier = 'deprecated', updated_at = ?1 WHERE spec_folder = ?2",
                params![Utc::now().to_rfc3339(), folder],
            )? as i64;
        }

        let mut inserted = 0i64;
        let mut updated = 0i64;
        let mut skipped = 0i64;
        let mut embeddings_restored = 0i64;
        let mut embeddings_skipped = 0i64;
        let mut old_to_new: HashMap<i64, i64> = HashMap::new();

        if options.reinsert_memories {
            for memory in &snapshot.memories {
                let anchor = anchor_for_db(memory.anchor_id.as_deref());
                let existing: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM memories WHERE spec_folder = ?1 AND file_path = ?2 AND anchor_id = ?3",
                        params![memory.spec_folder, memory.file_path, anchor],
                        |r| r.get(0),
                    )
                    .optional()?;

                let has_embedding = snapshot.embeddings.contains_key(&memory.id);
                let triggers_json = serde_json::to_string(&memory.trigger_phrases).unwrap_or_default();
                let related_json = serde_json::to_string(&memory.related_memories).unwrap_or_default();

                let new_id = match existing {
                    Some(id) => {
                        tx.execute(
                            "UPDATE memories SET title = ?1, trigger_phrases = ?2, content_hash = ?3, content = ?4,
                                 context_type = ?5, importance_tier = ?6, memory_type = ?7, channel = ?8,
                                 importance_weight = ?9, updated_at = ?10
                             WHERE id = ?11",
                            params![
                                memory.title,
                                triggers_json,
                                memory.content_hash,
                                memory.content.clone().unwrap_or_default(),
                                memory.context_type.as_str(),
                                memory.importance_tier.as_str(),
                                memory.memory_type.as_str(),
                                memory.channel,
                                memory.importance_weight,
                                Utc::now().to_rfc3339(),
                                id,
                            ],
                        )?;
                        updated += 1;
                        id
                    }
                    None => {
                        tx.execute(
                            "INSERT INTO memories (
                                spec_folder, file_path, anchor_id, title, trigger_phrases, content_hash, content,
                                context_type, importance_tier, memory_type, channel, importance_weight,
                                embedding_status, related_memories, created_at, updated_at
                            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?15)",
                            params![
                                memory.spec_folder,
                                memory.file_path,
                                anchor,
                                memory.title,
                                triggers_json,
                                memory.content_hash,
                                memory.content.clone().unwrap_or_default(),
                                memory.context_type.as_str(),
                                memory.importance_tier.as_str(),
                                memory.memory_type.as_str(),
                                memory.channel,
                                memory.importance_weight,
                                EmbeddingStatus::Pending.as_str(),
                                related_json,
                                memory.created_at.to_rfc3339(),
                            ],
                        )?;
                        inserted += 1;
                        tx.last_insert_rowid()
                    }
                };
                old_to_new.insert(memory.id, new_id);

                if !has_embedding {
                    tx.execute(
                        "UPDATE memories SET embedding_status = 'pending' WHERE id = ?1",
                        params![new_id],
                    )?;
                }
            }

            for (old_id, vector) in &snapshot.embeddings {
                let Some(&new_id) = old_to_new.get(old_id) else {
                    skipped += 1;
                    continue;
                };
                if vector.is_empty() {
                    embeddings_skipped += 1;
                    tx.execute("UPDATE memories SET embedding_status = 'pending' WHERE id = ?1", params![new_id])?;
                    continue;
                }
                let blob = marshal_embedding(vector);
                tx.execute(
                    "INSERT OR REPLACE INTO embeddings (memory_id, embedding, dimension, created_at) VALUES (?1, ?2, ?3, ?4)",
                    params![new_id, blob, vector.len() as i64, Utc::now().to_rfc3339()],
                )?;
                tx.execute(
                    "UPDATE memories SET embedding_status = 'success' WHERE id = ?1",
                    params![new_id],
                )?;
                embeddings_restored += 1;
            }
        }

        tx.commit()?;

        Ok(RestoreSummary {
            inserted,
            updated,
            skipped,
            cleared,
            deprecated,
            embeddings_restored,
            embeddings_skipped,
            total_in_snapshot,
            note: is_legacy.then(|| "legacy snapshot shape (no embeddings)".to_string()),
        })
    })
}

pub fn list(storage: &Storage, spec_folder: Option<&str>) -> CoreResult<Vec<(String, chrono::DateTime<Utc>, Option<String>)>> {
    storage.with_reader(|conn| {
        let rows = match spec_folder {
            Some(folder) => {
                let mut stmt = conn.prepare_cached("SELECT name, created_at, spec_folder FROM checkpoints WHERE spec_folder = ?1 ORDER BY created_at DESC")?;
                stmt.query_map(params![folder], row_checkpoint_listing)?.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = conn.prepare_cached("SELECT name, created_at, spec_folder FROM checkpoints ORDER BY created_at DESC")?;
                stmt.query_map([], row_checkpoint_listing)?.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(rows)
    })
}

fn row_checkpoint_listing(row: &rusqlite::Row) -> rusqlite::Result<(String, chrono::DateTime<Utc>, Option<String>)> {
    let created_at: String = row.get(1)?;
    Ok((row.get(0)?, parse_rfc3339(&created_at).unwrap_or_else(Utc::now), row.get(2)?))
}

pub fn delete(storage: &Storage, name: &str) -> CoreResult<bool> {
    storage.with_writer(|conn| Ok(conn.execute("DELETE FROM checkpoints WHERE name = ?1", params![name])? > 0))
}
