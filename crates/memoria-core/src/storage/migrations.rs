//! Database Migrations
//!
//! Schema migration definitions for the storage layer.

/// Migration definitions, applied strictly in order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Initial schema: memories, embeddings, FTS5 shadow index",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Checkpoints, history, and conflict audit tables",
        up: MIGRATION_V2_UP,
    },
    Migration {
        version: 3,
        description: "Indexes for common filter/sort paths",
        up: MIGRATION_V3_UP,
    },
];

/// A single database migration.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub up: &'static str,
}

/// V1: core catalog + embedding table + FTS5 shadow index.
///
/// `anchor_id` uses `''` rather than `NULL` as the "no anchor" sentinel so a
/// single `UNIQUE` constraint can enforce the `(spec_folder, file_path,
/// anchor_id)` identity — SQLite treats distinct `NULL`s as non-equal,
/// which would defeat the constraint.
const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,

    spec_folder TEXT NOT NULL DEFAULT 'default',
    file_path TEXT NOT NULL,
    anchor_id TEXT NOT NULL DEFAULT '',

    title TEXT NOT NULL DEFAULT '',
    trigger_phrases TEXT NOT NULL DEFAULT '[]',
    content_hash TEXT NOT NULL,
    content TEXT NOT NULL DEFAULT '',
    embedding_model TEXT,
    embedding_status TEXT NOT NULL DEFAULT 'pending',
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_retry_at TEXT,
    failure_reason TEXT,

    importance_tier TEXT NOT NULL DEFAULT 'normal',
    context_type TEXT NOT NULL DEFAULT 'general',
    memory_type TEXT NOT NULL DEFAULT 'declarative',
    channel TEXT NOT NULL DEFAULT 'default',

    importance_weight REAL NOT NULL DEFAULT 0.5,
    base_importance REAL NOT NULL DEFAULT 0.5,
    decay_half_life_days REAL NOT NULL DEFAULT 90.0,
    access_count INTEGER NOT NULL DEFAULT 0,
    last_accessed INTEGER NOT NULL DEFAULT 0,
    is_pinned INTEGER NOT NULL DEFAULT 0,
    confidence REAL NOT NULL DEFAULT 0.5,
    validation_count INTEGER NOT NULL DEFAULT 0,
    stability REAL NOT NULL DEFAULT 1.0,
    difficulty REAL NOT NULL DEFAULT 5.0,
    review_count INTEGER NOT NULL DEFAULT 0,
    last_review TEXT,

    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    expires_at TEXT,
    related_memories TEXT NOT NULL DEFAULT '[]',

    UNIQUE(spec_folder, file_path, anchor_id)
);

CREATE INDEX IF NOT EXISTS idx_memories_folder ON memories(spec_folder);
CREATE INDEX IF NOT EXISTS idx_memories_tier ON memories(importance_tier);
CREATE INDEX IF NOT EXISTS idx_memories_embedding_status ON memories(embedding_status);
CREATE INDEX IF NOT EXISTS idx_memories_content_hash ON memories(content_hash);

CREATE TABLE IF NOT EXISTS embeddings (
    memory_id INTEGER PRIMARY KEY REFERENCES memories(id) ON DELETE CASCADE,
    embedding BLOB NOT NULL,
    dimension INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
    title,
    trigger_phrases,
    file_path,
    content='memories',
    content_rowid='id',
    tokenize='porter ascii'
);

CREATE TRIGGER IF NOT EXISTS memories_fts_ai AFTER INSERT ON memories BEGIN
    INSERT INTO memories_fts(rowid, title, trigger_phrases, file_path)
    VALUES (NEW.id, NEW.title, NEW.trigger_phrases, NEW.file_path);
END;

CREATE TRIGGER IF NOT EXISTS memories_fts_ad AFTER DELETE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, title, trigger_phrases, file_path)
    VALUES ('delete', OLD.id, OLD.title, OLD.trigger_phrases, OLD.file_path);
END;

CREATE TRIGGER IF NOT EXISTS memories_fts_au AFTER UPDATE ON memories BEGIN
    INSERT INTO memories_fts(memories_fts, rowid, title, trigger_phrases, file_path)
    VALUES ('delete', OLD.id, OLD.title, OLD.trigger_phrases, OLD.file_path);
    INSERT INTO memories_fts(rowid, title, trigger_phrases, file_path)
    VALUES (NEW.id, NEW.title, NEW.trigger_phrases, NEW.file_path);
END;

CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);

INSERT OR IGNORE INTO schema_version (id, version, updated_at) VALUES (1, 1, datetime('now'));
"#;

/// V2: checkpoints, history events, and conflict audit rows.
const MIGRATION_V2_UP: &str = r#"
CREATE TABLE IF NOT EXISTS checkpoints (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    spec_folder TEXT,
    git_branch TEXT,
    memory_snapshot BLOB NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_checkpoints_folder ON checkpoints(spec_folder);
CREATE INDEX IF NOT EXISTS idx_checkpoints_created ON checkpoints(created_at);

CREATE TABLE IF NOT EXISTS history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    memory_id INTEGER NOT NULL,
    event TEXT NOT NULL,
    prev_value TEXT,
    new_value TEXT,
    timestamp TEXT NOT NULL,
    actor TEXT NOT NULL DEFAULT 'system'
);

CREATE INDEX IF NOT EXISTS idx_history_memory ON history(memory_id);
CREATE INDEX IF NOT EXISTS idx_history_timestamp ON history(timestamp);

CREATE TABLE IF NOT EXISTS memory_conflicts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    new_memory_hash TEXT NOT NULL,
    existing_memory_id INTEGER,
    similarity REAL,
    action TEXT NOT NULL,
    contradiction_detected INTEGER NOT NULL DEFAULT 0,
    notes TEXT
);

CREATE INDEX IF NOT EXISTS idx_conflicts_existing ON memory_conflicts(existing_memory_id);

UPDATE schema_version SET version = 2, updated_at = datetime('now');
"#;

/// V3: indexes for the filter/sort combinations the query pipeline leans on.
const MIGRATION_V3_UP: &str = r#"
CREATE INDEX IF NOT EXISTS idx_memories_context_type ON memories(context_type);
CREATE INDEX IF NOT EXISTS idx_memories_memory_type ON memories(memory_type);
CREATE INDEX IF NOT EXISTS idx_memories_updated_at ON memories(updated_at);
CREATE INDEX IF NOT EXISTS idx_memories_expires_at ON memories(expires_at);
CREATE INDEX IF NOT EXISTS idx_memories_pinned ON memories(is_pinned);

UPDATE schema_version SET version = 3, updated_at = datetime('now');
"#;

/// Current applied schema version, or 0 for a freshly created database.
pub fn get_current_version(conn: &rusqlite::Connection) -> rusqlite::Result<u32> {
    let table_exists: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |_| Ok(true),
        )
        .unwrap_or(false);
    if !table_exists {
        return Ok(0);
    }
    conn.query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
        row.get(0)
    })
}

/// Apply all migrations newer than the current version in a single
/// transaction, so a mid-migration failure leaves no partial schema behind.
pub fn apply_migrations(conn: &mut rusqlite::Connection) -> rusqlite::Result<u32> {
    let current_version = get_current_version(conn)?;
    let mut applied = 0;

    let tx = conn.transaction()?;
    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                description = migration.description,
                "applying migration"
            );
            tx.execute_batch(migration.up)?;
            applied += 1;
        }
    }
    tx.commit()?;

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_memory() -> rusqlite::Connection {
        rusqlite::Connection::open_in_memory().unwrap()
    }

    #[test]
    fn fresh_db_has_version_zero() {
        let conn = open_memory();
        assert_eq!(get_current_version(&conn).unwrap(), 0);
    }

    #[test]
    fn apply_migrations_reaches_latest_version() {
        let mut conn = open_memory();
        let applied = apply_migrations(&mut conn).unwrap();
        assert_eq!(applied, MIGRATIONS.len() as u32);
        assert_eq!(
            get_current_version(&conn).unwrap(),
            MIGRATIONS.last().unwrap().version
        );
    }

    #[test]
    fn migrations_are_idempotent_on_rerun() {
        let mut conn = open_memory();
        apply_migrations(&mut conn).unwrap();
        let applied_again = apply_migrations(&mut conn).unwrap();
        assert_eq!(applied_again, 0);
    }
}
