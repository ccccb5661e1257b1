//! # Memoria Core
//!
//! Hybrid vector + lexical memory engine: a SQLite-backed catalog of markdown
//! memories, fused vector/BM25/FTS search with Reciprocal Rank Fusion,
//! importance-tier and decay overlays, and checkpoint snapshot/restore.
//!
//! This crate owns the retrieval and ranking engine plus its storage
//! substrate. MCP transport, markdown parsing internals, and provider HTTP
//! clients are external collaborators specified only at their interface
//! seams — see `memoria-mcp` and the `EmbeddingProvider`/`Reranker` traits.

#![warn(rustdoc::missing_crate_level_docs)]

pub mod cache;
pub mod checkpoint;
pub mod conflict;
pub mod config;
pub mod error;
pub mod memory;
pub mod runtime;
pub mod search;
pub mod storage;

pub use config::Config;
pub use error::{CoreError, CoreResult, ErrorCode};
pub use memory::{ContextType, EmbeddingStatus, ImportanceTier, Memory, MemoryType, RelatedMemory};
pub use runtime::CoreRuntime;
pub use storage::{NewMemory, Storage};

/// Crate version, surfaced by `memory_health`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod prelude {
    pub use crate::{
        CoreError, CoreResult, CoreRuntime, ErrorCode, ImportanceTier, Memory, MemoryType,
        NewMemory, Storage,
    };
}
