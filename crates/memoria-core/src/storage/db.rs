//! SQLite-backed catalog: the durable home for memories, embeddings,
//! history, conflicts, and checkpoints.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{CoreError, CoreResult, ErrorCode};
use crate::memory::{
    ContextType, EmbeddingStatus, ImportanceTier, Memory, MemoryType, RelatedMemory,
};

use super::migrations;

/// Sentinel used in place of SQL `NULL` for "no anchor", see migrations.rs.
const NO_ANCHOR: &str = "";

pub(crate) fn anchor_for_db(anchor_id: Option<&str>) -> &str {
    anchor_id.unwrap_or(NO_ANCHOR)
}

pub(crate) fn anchor_from_db(anchor_id: &str) -> Option<String> {
    if anchor_id.is_empty() {
        None
    } else {
        Some(anchor_id.to_string())
    }
}

/// Pack an f32 vector as a tightly packed little-endian byte buffer, matching
/// the `embeddings.embedding` column's on-disk layout.
pub fn marshal_embedding(vector: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf
}

/// Inverse of `marshal_embedding`. Returns `None` on a buffer whose length
/// isn't a multiple of 4 bytes.
pub fn unmarshal_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

/// Input to `Storage::index_memory`: the parsed-collaborator output plus an
/// optional embedding to persist in the same transaction.
#[derive(Debug, Clone)]
pub struct NewMemory {
    pub spec_folder: String,
    pub file_path: String,
    pub anchor_id: Option<String>,
    pub title: String,
    pub trigger_phrases: Vec<String>,
    pub content_hash: String,
    pub content: String,
    pub context_type: ContextType,
    pub importance_tier: ImportanceTier,
    pub memory_type: MemoryType,
    pub channel: String,
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub total_memories: i64,
    pub by_tier: Vec<(String, i64)>,
    pub by_embedding_status: Vec<(String, i64)>,
    pub total_embeddings: i64,
    pub total_checkpoints: i64,
    pub schema_version: u32,
    pub db_path: String,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub orphan_embeddings: i64,
    pub missing_embeddings_for_success: i64,
    pub cleaned: i64,
}

/// Durable catalog + embedding store.
///
/// Uses separate reader/writer connections: one writer, WAL-enabled
/// concurrent readers. All methods take `&self`; interior mutability comes
/// from the connection mutexes, so `Storage` is `Send + Sync` and callers
/// share it behind an `Arc`.
pub struct Storage {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    db_path: PathBuf,
    embedding_dimension: usize,
}

impl Storage {
    fn configure_connection(conn: &Connection) -> CoreResult<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA cache_size = -64000;
             PRAGMA mmap_size = 268435456;
             PRAGMA synchronous = NORMAL;
             PRAGMA temp_store = MEMORY;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(())
    }

    /// Open (creating if absent) the catalog at `path`, resolving the
    /// embedding dimension against any pre-existing rows. Rejects a
    /// dimension mismatch up front rather than silently opening a DB built
    /// for a different provider profile.
    pub fn open(path: &Path, embedding_dimension: usize) -> CoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CoreError::new(ErrorCode::FileAccessDenied, format!("creating db directory: {e}"))
            })?;
        }

        let writer_conn = Connection::open(path)?;
        Self::configure_connection(&writer_conn)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if path.exists() {
                let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
            }
        }

        let mut writer_conn = writer_conn;
        migrations::apply_migrations(&mut writer_conn)?;

        if let Some(existing_dim) = Self::existing_embedding_dimension(&writer_conn)? {
            if existing_dim != embedding_dimension as i64 {
                return Err(CoreError::new(
                    ErrorCode::EmbeddingDimensionInvalid,
                    format!(
                        "database was built for dimension {existing_dim}, active provider uses {embedding_dimension}"
                    ),
                ));
            }
        }

        let reader_conn = Connection::open(path)?;
        Self::configure_connection(&reader_conn)?;

        Ok(Storage {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
            db_path: path.to_path_buf(),
            embedding_dimension,
        })
    }

    fn existing_embedding_dimension(conn: &Connection) -> CoreResult<Option<i64>> {
        let dim: Option<i64> = conn
            .query_row("SELECT dimension FROM embeddings LIMIT 1", [], |row| row.get(0))
            .optional()?;
        Ok(dim)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn embedding_dimension(&self) -> usize {
        self.embedding_dimension
    }

    fn writer(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.writer.lock().expect("writer lock poisoned")
    }

    fn reader(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.reader.lock().expect("reader lock poisoned")
    }

    /// Reader handle for modules (vector/lexical search) that need direct
    /// read-only SQL access without duplicating connection management.
    pub(crate) fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> CoreResult<T>) -> CoreResult<T> {
        f(&self.reader())
    }

    /// Writer handle for modules (checkpoint create/restore) that need
    /// transactional SQL access beyond the catalog's own CRUD surface.
    pub(crate) fn with_writer<T>(&self, f: impl FnOnce(&mut Connection) -> CoreResult<T>) -> CoreResult<T> {
        f(&mut self.writer())
    }

    /// Parse → upsert. Idempotent on unchanged content: if a row with the
    /// same `(spec_folder, file_path, anchor_id)` already has the same
    /// `content_hash`, only `last_accessed` bookkeeping changes — `id` and
    /// `updated_at` are untouched.
    pub fn index_memory(&self, input: NewMemory) -> CoreResult<i64> {
        if input.embedding.as_ref().is_some_and(|e| e.len() != self.embedding_dimension) {
            return Err(CoreError::new(
                ErrorCode::EmbeddingDimensionInvalid,
                format!(
                    "embedding has {} dimensions, expected {}",
                    input.embedding.as_ref().unwrap().len(),
                    self.embedding_dimension
                ),
            ));
        }

        let now = Utc::now();
        let anchor = anchor_for_db(input.anchor_id.as_deref());
        let triggers_json = serde_json::to_string(&input.trigger_phrases).unwrap_or_default();

        let mut conn = self.writer();
        let tx = conn.transaction()?;

        let existing: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, content_hash FROM memories WHERE spec_folder = ?1 AND file_path = ?2 AND anchor_id = ?3",
                params![input.spec_folder, input.file_path, anchor],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let id = match existing {
            Some((id, hash)) if hash == input.content_hash => id,
            Some((id, _)) => {
                tx.execute(
                    "UPDATE memories SET title = ?1, trigger_phrases = ?2, content_hash = ?3,
                         content = ?4, context_type = ?5, importance_tier = ?6, memory_type = ?7,
                         channel = ?8, updated_at = ?9
                     WHERE id = ?10",
                    params![
                        input.title,
                        triggers_json,
                        input.content_hash,
                        input.content,
                        input.context_type.as_str(),
                        input.importance_tier.as_str(),
                        input.memory_type.as_str(),
                        input.channel,
                        now.to_rfc3339(),
                        id,
                    ],
                )?;
                id
            }
            None => {
                tx.execute(
                    "INSERT INTO memories (
                        spec_folder, file_path, anchor_id, title, trigger_phrases, content_hash,
                        content, context_type, importance_tier, memory_type, channel,
                        embedding_status, created_at, updated_at
                    ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?13)",
                    params![
                        input.spec_folder,
                        input.file_path,
                        anchor,
                        input.title,
                        triggers_json,
                        input.content_hash,
                        input.content,
                        input.context_type.as_str(),
                        input.importance_tier.as_str(),
                        input.memory_type.as_str(),
                        input.channel,
                        EmbeddingStatus::Pending.as_str(),
                        now.to_rfc3339(),
                    ],
                )?;
                tx.last_insert_rowid()
            }
        };

        if let Some(embedding) = &input.embedding {
            let blob = marshal_embedding(embedding);
            tx.execute(
                "INSERT INTO embeddings (memory_id, embedding, dimension, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(memory_id) DO UPDATE SET embedding = excluded.embedding,
                     dimension = excluded.dimension, created_at = excluded.created_at",
                params![id, blob, embedding.len() as i64, now.to_rfc3339()],
            )?;
            tx.execute(
                "UPDATE memories SET embedding_status = ?1, embedding_model = ?2 WHERE id = ?3",
                params![EmbeddingStatus::Success.as_str(), "default", id],
            )?;
        }

        tx.commit()?;
        Ok(id)
    }

    pub fn update_memory(&self, id: i64, importance_weight: Option<f32>, is_pinned: Option<bool>) -> CoreResult<()> {
        let conn = self.writer();
        if let Some(w) = importance_weight {
            conn.execute(
                "UPDATE memories SET importance_weight = ?1, updated_at = ?2 WHERE id = ?3",
                params![w, Utc::now().to_rfc3339(), id],
            )?;
        }
        if let Some(pinned) = is_pinned {
            conn.execute(
                "UPDATE memories SET is_pinned = ?1, updated_at = ?2 WHERE id = ?3",
                params![pinned as i64, Utc::now().to_rfc3339(), id],
            )?;
        }
        Ok(())
    }

    /// Deletion order: history rows, then the vector row, then the catalog
    /// row.
    pub fn delete_memory(&self, id: i64) -> CoreResult<bool> {
        let conn = self.writer();
        conn.execute("DELETE FROM history WHERE memory_id = ?1", params![id])?;
        conn.execute("DELETE FROM embeddings WHERE memory_id = ?1", params![id])?;
        let affected = conn.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    pub fn delete_memory_by_path(&self, spec_folder: &str, file_path: &str, anchor_id: Option<&str>) -> CoreResult<bool> {
        let id: Option<i64> = self.writer().query_row(
            "SELECT id FROM memories WHERE spec_folder = ?1 AND file_path = ?2 AND anchor_id = ?3",
            params![spec_folder, file_path, anchor_for_db(anchor_id)],
            |row| row.get(0),
        ).optional()?;
        match id {
            Some(id) => self.delete_memory(id),
            None => Ok(false),
        }
    }

    pub fn get_memory(&self, id: i64) -> CoreResult<Option<Memory>> {
        let reader = self.reader();
        let row = reader
            .query_row("SELECT * FROM memories WHERE id = ?1", params![id], row_to_memory)
            .optional()?;
        Ok(row)
    }

    pub fn get_memories_by_folder(&self, spec_folder: &str) -> CoreResult<Vec<Memory>> {
        let reader = self.reader();
        let mut stmt = reader.prepare_cached("SELECT * FROM memories WHERE spec_folder = ?1 ORDER BY id")?;
        let rows = stmt
            .query_map(params![spec_folder], row_to_memory)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Every memory in the catalog regardless of folder, used to rebuild the
    /// in-memory lexical index on startup and by `memory_index_scan`.
    pub fn get_all_memories(&self) -> CoreResult<Vec<Memory>> {
        let reader = self.reader();
        let mut stmt = reader.prepare_cached("SELECT * FROM memories ORDER BY id")?;
        let rows = stmt.query_map([], row_to_memory)?.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Fetch all memories matching an importance tier, used by the
    /// constitutional prelude and by tier-scoped search.
    pub fn get_memories_by_tier(&self, tier: ImportanceTier, spec_folder: Option<&str>) -> CoreResult<Vec<Memory>> {
        let reader = self.reader();
        let rows = match spec_folder {
            Some(folder) => {
                let mut stmt = reader.prepare_cached(
                    "SELECT * FROM memories WHERE importance_tier = ?1 AND spec_folder = ?2 AND embedding_status = 'success'
                     ORDER BY importance_weight DESC, created_at DESC",
                )?;
                stmt.query_map(params![tier.as_str(), folder], row_to_memory)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = reader.prepare_cached(
                    "SELECT * FROM memories WHERE importance_tier = ?1 AND embedding_status = 'success'
                     ORDER BY importance_weight DESC, created_at DESC",
                )?;
                stmt.query_map(params![tier.as_str()], row_to_memory)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(rows)
    }

    pub fn get_stats(&self) -> CoreResult<StorageStats> {
        let reader = self.reader();
        let total_memories: i64 = reader.query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))?;
        let total_embeddings: i64 = reader.query_row("SELECT COUNT(*) FROM embeddings", [], |r| r.get(0))?;
        let total_checkpoints: i64 = reader.query_row("SELECT COUNT(*) FROM checkpoints", [], |r| r.get(0))?;
        let schema_version = migrations::get_current_version(&reader)?;

        let mut by_tier = Vec::new();
        let mut stmt = reader.prepare_cached("SELECT importance_tier, COUNT(*) FROM memories GROUP BY importance_tier")?;
        for row in stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))? {
            by_tier.push(row?);
        }
        drop(stmt);

        let mut by_embedding_status = Vec::new();
        let mut stmt = reader.prepare_cached("SELECT embedding_status, COUNT(*) FROM memories GROUP BY embedding_status")?;
        for row in stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))? {
            by_embedding_status.push(row?);
        }

        Ok(StorageStats {
            total_memories,
            by_tier,
            by_embedding_status,
            total_embeddings,
            total_checkpoints,
            schema_version,
            db_path: self.db_path.display().to_string(),
        })
    }

    /// Reports orphan embeddings (no matching memory row) and success-status
    /// rows missing their embedding; optionally deletes the orphans.
    pub fn verify_integrity(&self, auto_clean: bool) -> CoreResult<IntegrityReport> {
        let reader = self.reader();
        let orphan_embeddings: i64 = reader.query_row(
            "SELECT COUNT(*) FROM embeddings e WHERE NOT EXISTS (SELECT 1 FROM memories m WHERE m.id = e.memory_id)",
            [],
            |r| r.get(0),
        )?;
        let missing_embeddings_for_success: i64 = reader.query_row(
            "SELECT COUNT(*) FROM memories m WHERE m.embedding_status = 'success'
             AND NOT EXISTS (SELECT 1 FROM embeddings e WHERE e.memory_id = m.id)",
            [],
            |r| r.get(0),
        )?;
        drop(reader);

        let cleaned = if auto_clean && orphan_embeddings > 0 {
            self.writer().execute(
                "DELETE FROM embeddings WHERE NOT EXISTS (SELECT 1 FROM memories m WHERE m.id = embeddings.memory_id)",
                [],
            )? as i64
        } else {
            0
        };

        Ok(IntegrityReport {
            orphan_embeddings,
            missing_embeddings_for_success,
            cleaned,
        })
    }

    pub fn update_embedding_status(&self, id: i64, status: EmbeddingStatus, failure_reason: Option<&str>) -> CoreResult<()> {
        let conn = self.writer();
        conn.execute(
            "UPDATE memories SET embedding_status = ?1, failure_reason = ?2,
                 retry_count = retry_count + (CASE WHEN ?1 = 'retry' THEN 1 ELSE 0 END),
                 last_retry_at = CASE WHEN ?1 = 'retry' THEN ?3 ELSE last_retry_at END
             WHERE id = ?4",
            params![status.as_str(), failure_reason, Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// `memory_validate`: nudges `confidence` toward 1.0 or 0.0 depending on
    /// usefulness feedback and bumps `validation_count`.
    pub fn update_confidence(&self, id: i64, useful: bool) -> CoreResult<(f32, i32)> {
        let conn = self.writer();
        let current: (f32, i32) = conn.query_row(
            "SELECT confidence, validation_count FROM memories WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let step = 0.1_f32;
        let new_confidence = if useful {
            (current.0 + step).min(1.0)
        } else {
            (current.0 - step).max(0.0)
        };
        let new_count = current.1 + 1;
        conn.execute(
            "UPDATE memories SET confidence = ?1, validation_count = ?2 WHERE id = ?3",
            params![new_confidence, new_count, id],
        )?;
        Ok((new_confidence, new_count))
    }

    /// Apply a batch of accumulated access deltas in one transaction; see
    /// `cache::AccessAccumulator` for the batching policy.
    pub fn flush_access_counts(&self, deltas: &std::collections::HashMap<i64, f32>) -> CoreResult<()> {
        if deltas.is_empty() {
            return Ok(());
        }
        let mut conn = self.writer();
        let tx = conn.transaction()?;
        let now_ms = Utc::now().timestamp_millis();
        for (&id, &delta) in deltas {
            let increments = delta.floor().max(1.0) as i64;
            tx.execute(
                "UPDATE memories SET access_count = access_count + ?1, last_accessed = ?2 WHERE id = ?3",
                params![increments, now_ms, id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Record a history event.
    pub fn record_history(&self, memory_id: i64, event: &str, prev_value: Option<&str>, new_value: Option<&str>, actor: &str) -> CoreResult<()> {
        self.writer().execute(
            "INSERT INTO history (memory_id, event, prev_value, new_value, timestamp, actor) VALUES (?1,?2,?3,?4,?5,?6)",
            params![memory_id, event, prev_value, new_value, Utc::now().to_rfc3339(), actor],
        )?;
        Ok(())
    }

    /// Read back history events, most recent first, optionally scoped to one
    /// memory. Backs `memory_get_learning_history`.
    pub fn get_history(&self, memory_id: Option<i64>, limit: usize) -> CoreResult<Vec<HistoryEvent>> {
        let reader = self.reader();
        let rows = match memory_id {
            Some(id) => {
                let mut stmt = reader.prepare_cached(
                    "SELECT memory_id, event, prev_value, new_value, timestamp, actor FROM history
                     WHERE memory_id = ?1 ORDER BY timestamp DESC LIMIT ?2",
                )?;
                stmt.query_map(params![id, limit as i64], row_to_history_event)?.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = reader.prepare_cached(
                    "SELECT memory_id, event, prev_value, new_value, timestamp, actor FROM history
                     ORDER BY timestamp DESC LIMIT ?1",
                )?;
                stmt.query_map(params![limit as i64], row_to_history_event)?.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(rows)
    }

    /// Write an audit row for an automatic conflict-resolution decision; see
    /// `crate::conflict`. Returns the new row's id.
    pub fn record_conflict(
        &self,
        new_memory_hash: &str,
        existing_memory_id: Option<i64>,
        similarity: Option<f64>,
        action: &str,
        contradiction_detected: bool,
        notes: Option<&str>,
    ) -> CoreResult<i64> {
        let conn = self.writer();
        conn.execute(
            "INSERT INTO memory_conflicts
                (timestamp, new_memory_hash, existing_memory_id, similarity, action, contradiction_detected, notes)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                Utc::now().to_rfc3339(),
                new_memory_hash,
                existing_memory_id,
                similarity,
                action,
                contradiction_detected as i64,
                notes,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Read back conflict audit rows, most recent first, optionally scoped
    /// to one existing memory.
    pub fn get_conflicts(&self, existing_memory_id: Option<i64>, limit: usize) -> CoreResult<Vec<Conflict>> {
        let reader = self.reader();
        let rows = match existing_memory_id {
            Some(id) => {
                let mut stmt = reader.prepare_cached(
                    "SELECT id, timestamp, new_memory_hash, existing_memory_id, similarity, action,
                            contradiction_detected, notes
                     FROM memory_conflicts WHERE existing_memory_id = ?1 ORDER BY timestamp DESC LIMIT ?2",
                )?;
                stmt.query_map(params![id, limit as i64], row_to_conflict)?.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = reader.prepare_cached(
                    "SELECT id, timestamp, new_memory_hash, existing_memory_id, similarity, action,
                            contradiction_detected, notes
                     FROM memory_conflicts ORDER BY timestamp DESC LIMIT ?1",
                )?;
                stmt.query_map(params![limit as i64], row_to_conflict)?.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(rows)
    }

    /// `REINFORCE`: existing content is materially the same as a proposed
    /// write. Bump `access_count` and nudge `confidence` up rather than
    /// duplicate the row.
    pub fn reinforce_memory(&self, id: i64) -> CoreResult<()> {
        self.writer().execute(
            "UPDATE memories SET access_count = access_count + 1,
                 confidence = MIN(1.0, confidence + 0.05), last_accessed = ?1 WHERE id = ?2",
            params![Utc::now().timestamp_millis(), id],
        )?;
        Ok(())
    }

    /// `SUPERSEDE`: the existing row is retired in favor of its replacement.
    pub fn mark_deprecated(&self, id: i64) -> CoreResult<()> {
        self.writer().execute(
            "UPDATE memories SET importance_tier = ?1, updated_at = ?2 WHERE id = ?3",
            params![ImportanceTier::Deprecated.as_str(), Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    /// `UPDATE`: the existing row's content is replaced by a near-duplicate
    /// proposed write, in place, preserving its id and scoring history.
    pub fn apply_conflict_update(&self, id: i64, input: &NewMemory) -> CoreResult<()> {
        let triggers_json = serde_json::to_string(&input.trigger_phrases).unwrap_or_default();
        let now = Utc::now();
        let conn = self.writer();
        conn.execute(
            "UPDATE memories SET title = ?1, trigger_phrases = ?2, content_hash = ?3, content = ?4,
                 context_type = ?5, memory_type = ?6, updated_at = ?7 WHERE id = ?8",
            params![
                input.title,
                triggers_json,
                input.content_hash,
                input.content,
                input.context_type.as_str(),
                input.memory_type.as_str(),
                now.to_rfc3339(),
                id,
            ],
        )?;
        if let Some(embedding) = &input.embedding {
            let blob = marshal_embedding(embedding);
            conn.execute(
                "INSERT INTO embeddings (memory_id, embedding, dimension, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(memory_id) DO UPDATE SET embedding = excluded.embedding,
                     dimension = excluded.dimension, created_at = excluded.created_at",
                params![id, blob, embedding.len() as i64, now.to_rfc3339()],
            )?;
        }
        Ok(())
    }

    /// Whether a path already exists from `start` to `target` along
    /// `related_memories` edges. Bounded so a malformed graph can't spin
    /// forever.
    fn related_path_exists(&self, start: i64, target: i64) -> CoreResult<bool> {
        let mut visited = HashSet::new();
        let mut stack = vec![start];
        while let Some(current) = stack.pop() {
            if current == target {
                return Ok(true);
            }
            if !visited.insert(current) || visited.len() > 10_000 {
                continue;
            }
            if let Some(memory) = self.get_memory(current)? {
                stack.extend(memory.related_memories.iter().map(|r| r.id));
            }
        }
        Ok(false)
    }

    /// Append a `related_memories` edge `from -> related.id`, deduping by
    /// id. Rejects an edge that would close a cycle in the co-activation
    /// graph with `GraphCycleDetected` rather than persisting it.
    pub fn add_related_memory(&self, from: i64, related: RelatedMemory) -> CoreResult<()> {
        if from == related.id {
            return Err(CoreError::new(ErrorCode::GraphCycleDetected, "a memory cannot relate to itself"));
        }
        if self.related_path_exists(related.id, from)? {
            return Err(CoreError::new(
                ErrorCode::GraphCycleDetected,
                format!("relating {from} to {} would close a cycle in the co-activation graph", related.id),
            ));
        }

        let mut memory = self
            .get_memory(from)?
            .ok_or_else(|| CoreError::new(ErrorCode::MemoryNotFound, format!("memory {from} not found")))?;
        memory.related_memories.retain(|r| r.id != related.id);
        memory.related_memories.push(related);
        let json = serde_json::to_string(&memory.related_memories).unwrap_or_default();
        self.writer().execute("UPDATE memories SET related_memories = ?1 WHERE id = ?2", params![json, from])?;
        Ok(())
    }
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEvent {
    pub memory_id: i64,
    pub event: String,
    pub prev_value: Option<String>,
    pub new_value: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
}

/// One row of the `memory_conflicts` audit trail: a prediction-error gating
/// decision made on a proposed write. See `crate::conflict`.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub new_memory_hash: String,
    pub existing_memory_id: Option<i64>,
    pub similarity: Option<f64>,
    pub action: String,
    pub contradiction_detected: bool,
    pub notes: Option<String>,
}

fn row_to_conflict(row: &rusqlite::Row) -> rusqlite::Result<Conflict> {
    let timestamp: String = row.get(1)?;
    Ok(Conflict {
        id: row.get(0)?,
        timestamp: parse_rfc3339(&timestamp).unwrap_or_else(Utc::now),
        new_memory_hash: row.get(2)?,
        existing_memory_id: row.get(3)?,
        similarity: row.get(4)?,
        action: row.get(5)?,
        contradiction_detected: row.get::<_, i64>(6)? != 0,
        notes: row.get(7)?,
    })
}

fn row_to_history_event(row: &rusqlite::Row) -> rusqlite::Result<HistoryEvent> {
    let timestamp: String = row.get(4)?;
    Ok(HistoryEvent {
        memory_id: row.get(0)?,
        event: row.get(1)?,
        prev_value: row.get(2)?,
        new_value: row.get(3)?,
        timestamp: parse_rfc3339(&timestamp).unwrap_or_else(Utc::now),
        actor: row.get(5)?,
    })
}

pub(crate) fn row_to_memory(row: &rusqlite::Row) -> rusqlite::Result<Memory> {
    let trigger_phrases: String = row.get("trigger_phrases")?;
    let related_memories: String = row.get("related_memories")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let expires_at: Option<String> = row.get("expires_at")?;
    let last_retry_at: Option<String> = row.get("last_retry_at")?;
    let last_review: Option<String> = row.get("last_review")?;
    let anchor_id: String = row.get("anchor_id")?;

    Ok(Memory {
        id: row.get("id")?,
        spec_folder: row.get("spec_folder")?,
        file_path: row.get("file_path")?,
        anchor_id: anchor_from_db(&anchor_id),
        title: row.get("title")?,
        trigger_phrases: serde_json::from_str(&trigger_phrases).unwrap_or_default(),
        content_hash: row.get("content_hash")?,
        embedding_model: row.get("embedding_model")?,
        embedding_status: EmbeddingStatus::parse(&row.get::<_, String>("embedding_status")?),
        retry_count: row.get("retry_count")?,
        last_retry_at: last_retry_at.and_then(|s| parse_rfc3339(&s)),
        failure_reason: row.get("failure_reason")?,
        importance_tier: ImportanceTier::parse(&row.get::<_, String>("importance_tier")?),
        context_type: ContextType::parse(&row.get::<_, String>("context_type")?),
        memory_type: MemoryType::parse(&row.get::<_, String>("memory_type")?),
        channel: row.get("channel")?,
        importance_weight: row.get("importance_weight")?,
        base_importance: row.get("base_importance")?,
        decay_half_life_days: row.get("decay_half_life_days")?,
        access_count: row.get("access_count")?,
        last_accessed: row.get("last_accessed")?,
        is_pinned: row.get::<_, i64>("is_pinned")? != 0,
        confidence: row.get("confidence")?,
        validation_count: row.get("validation_count")?,
        stability: row.get("stability")?,
        difficulty: row.get("difficulty")?,
        review_count: row.get("review_count")?,
        last_review: last_review.and_then(|s| parse_rfc3339(&s)),
        created_at: parse_rfc3339(&created_at).unwrap_or_else(Utc::now),
        updated_at: parse_rfc3339(&updated_at).unwrap_or_else(Utc::now),
        expires_at: expires_at.and_then(|s| parse_rfc3339(&s)),
        related_memories: serde_json::from_str::<Vec<RelatedMemory>>(&related_memories).unwrap_or_default(),
        content: row.get("content").ok(),
    })
}

pub(crate) fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|d| d.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_tmp() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(&dir.path().join("test.sqlite"), 4).unwrap();
        (dir, storage)
    }

    fn sample(spec_folder: &str, path: &str) -> NewMemory {
        NewMemory {
            spec_folder: spec_folder.to_string(),
            file_path: path.to_string(),
            anchor_id: None,
            title: "Title".to_string(),
            trigger_phrases: vec!["alpha".to_string()],
            content_hash: "hash1".to_string(),
            content: "body text".to_string(),
            context_type: ContextType::General,
            importance_tier: ImportanceTier::Normal,
            memory_type: MemoryType::Declarative,
            channel: "default".to_string(),
            embedding: Some(vec![0.1, 0.2, 0.3, 0.4]),
        }
    }

    #[test]
    fn embedding_roundtrips_bit_identical() {
        let v = vec![0.5_f32, -1.25, 3.0, f32::MIN_POSITIVE];
        let bytes = marshal_embedding(&v);
        let back = unmarshal_embedding(&bytes).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn index_then_get_roundtrips() {
        let (_dir, storage) = open_tmp();
        let id = storage.index_memory(sample("default", "a.md")).unwrap();
        let memory = storage.get_memory(id).unwrap().unwrap();
        assert_eq!(memory.title, "Title");
        assert_eq!(memory.embedding_status, EmbeddingStatus::Success);
    }

    #[test]
    fn reindexing_unchanged_content_is_idempotent() {
        let (_dir, storage) = open_tmp();
        let id1 = storage.index_memory(sample("default", "a.md")).unwrap();
        let m1 = storage.get_memory(id1).unwrap().unwrap();
        let id2 = storage.index_memory(sample("default", "a.md")).unwrap();
        let m2 = storage.get_memory(id2).unwrap().unwrap();
        assert_eq!(id1, id2);
        assert_eq!(m1.updated_at, m2.updated_at);
    }

    #[test]
    fn dimension_mismatch_on_insert_is_rejected() {
        let (_dir, storage) = open_tmp();
        let mut input = sample("default", "a.md");
        input.embedding = Some(vec![0.1, 0.2]);
        let err = storage.index_memory(input).unwrap_err();
        assert_eq!(err.code, ErrorCode::EmbeddingDimensionInvalid);
    }

    #[test]
    fn delete_removes_history_and_embedding_first() {
        let (_dir, storage) = open_tmp();
        let id = storage.index_memory(sample("default", "a.md")).unwrap();
        storage.record_history(id, "ADD", None, Some("x"), "system").unwrap();
        assert!(storage.delete_memory(id).unwrap());
        assert!(storage.get_memory(id).unwrap().is_none());
    }

    #[test]
    fn deprecated_tier_excluded_from_constitutional_fetch() {
        let (_dir, storage) = open_tmp();
        let mut input = sample("default", "const.md");
        input.importance_tier = ImportanceTier::Constitutional;
        storage.index_memory(input).unwrap();
        let rows = storage.get_memories_by_tier(ImportanceTier::Constitutional, None).unwrap();
        assert_eq!(rows.len(), 1);
        let rows = storage.get_memories_by_tier(ImportanceTier::Deprecated, None).unwrap();
        assert!(rows.is_empty());
    }
}
