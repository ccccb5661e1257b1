//! Storage Module
//!
//! SQLite-based catalog: schema, migrations, prepared statements,
//! transactions, WAL mode, and the CRUD surface the rest of the engine is
//! built on.

mod db;
mod migrations;

pub use db::{
    marshal_embedding, unmarshal_embedding, HistoryEvent, IntegrityReport, NewMemory, Storage, StorageStats,
};
pub use migrations::MIGRATIONS;

/// Internals shared with `checkpoint` for snapshot/restore SQL that goes
/// beyond the catalog's public CRUD surface.
pub(crate) use db::{anchor_for_db, anchor_from_db, parse_rfc3339, row_to_memory};
