//! `memoria` CLI: operator commands for inspecting and maintaining the
//! catalog outside of an MCP client (stats, checkpoints, re-indexing).

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use colored::Colorize;
use memoria_core::checkpoint::{self, RestoreOptions, RetentionPolicy};
use memoria_core::memory::catalog::{
    content_hash, extract_anchors, extract_trigger_phrases, infer_memory_type, is_path_allowed, DEFAULT_MAX_TRIGGERS,
};
use memoria_core::memory::{ContextType, ImportanceTier};
use memoria_core::storage::NewMemory;
use memoria_core::{Config, CoreRuntime};
use walkdir::WalkDir;

#[derive(Parser)]
#[command(name = "memoria")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Operator CLI for the memoria hybrid vector + lexical memory catalog")]
struct Cli {
    /// Override the catalog's SQLite file path.
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show catalog statistics (row counts, tier/embedding-status breakdown).
    Stats,

    /// Run the integrity check over the embeddings table.
    Health,

    /// Walk the allow-listed roots and index changed markdown memories.
    IndexScan {
        /// Only scan one spec folder.
        #[arg(long)]
        spec_folder: Option<String>,
        /// Re-index every file regardless of content hash.
        #[arg(long)]
        force: bool,
    },

    /// Checkpoint management.
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(Subcommand)]
enum CheckpointAction {
    /// Snapshot the current catalog under a named checkpoint.
    Create {
        name: String,
        #[arg(long)]
        spec_folder: Option<String>,
        #[arg(long)]
        git_branch: Option<String>,
    },
    /// List existing checkpoints.
    List {
        #[arg(long)]
        spec_folder: Option<String>,
    },
    /// Restore the catalog from a named checkpoint.
    Restore {
        name: String,
        #[arg(long)]
        clear_existing: bool,
    },
    /// Delete a named checkpoint.
    Delete { name: String },
}

fn open_runtime(db_path: Option<PathBuf>) -> anyhow::Result<CoreRuntime> {
    let mut config = Config::from_env();
    if let Some(db_path) = db_path {
        config.db_path = Some(db_path);
    }
    Ok(CoreRuntime::open(config)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let runtime = open_runtime(cli.db_path)?;

    match cli.command {
        Commands::Stats => run_stats(&runtime),
        Commands::Health => run_health(&runtime),
        Commands::IndexScan { spec_folder, force } => run_index_scan(&runtime, spec_folder, force).await,
        Commands::Checkpoint { action } => run_checkpoint(&runtime, action),
    }
}

fn run_stats(runtime: &CoreRuntime) -> anyhow::Result<()> {
    let stats = runtime.storage.get_stats()?;

    println!("{}", "=== Memoria Catalog Statistics ===".cyan().bold());
    println!();
    println!("{}: {}", "Database".white().bold(), stats.db_path);
    println!("{}: {}", "Schema Version".white().bold(), stats.schema_version);
    println!("{}: {}", "Total Memories".white().bold(), stats.total_memories);
    println!("{}: {}", "Total Embeddings".white().bold(), stats.total_embeddings);
    println!("{}: {}", "Total Checkpoints".white().bold(), stats.total_checkpoints);

    if !stats.by_tier.is_empty() {
        println!();
        println!("{}", "By Tier".yellow().bold());
        for (tier, count) in &stats.by_tier {
            println!("  {}: {}", tier, count);
        }
    }

    if !stats.by_embedding_status.is_empty() {
        println!();
        println!("{}", "By Embedding Status".yellow().bold());
        for (status, count) in &stats.by_embedding_status {
            println!("  {}: {}", status, count);
        }
    }

    Ok(())
}

fn run_health(runtime: &CoreRuntime) -> anyhow::Result<()> {
    let report = runtime.storage.verify_integrity()?;
    println!("{}", "=== Integrity Report ===".cyan().bold());
    println!("{}: {}", "Orphan Embeddings".white().bold(), report.orphan_embeddings);
    println!("{}: {}", "Missing Embeddings For Success".white().bold(), report.missing_embeddings_for_success);

    if report.orphan_embeddings == 0 && report.missing_embeddings_for_success == 0 {
        println!("{}", "catalog is consistent".green());
    } else {
        println!("{}", "inconsistencies found; consider memoria index-scan --force".yellow());
    }
    Ok(())
}

/// Walk the allow-listed roots directly against `memoria_core`, independent
/// of the MCP `memory_index_scan` tool (this binary does not link against
/// the server's own tool modules).
async fn run_index_scan(runtime: &CoreRuntime, spec_folder_filter: Option<String>, force: bool) -> anyhow::Result<()> {
    let mut roots = vec![PathBuf::from("./specs"), PathBuf::from("./.opencode")];
    roots.extend(runtime.config.allowed_paths.iter().cloned());
    roots.retain(|p| p.exists());

    if roots.is_empty() {
        println!("{}", "no allow-listed root exists on disk; nothing to scan".yellow());
        return Ok(());
    }

    let (mut indexed, mut skipped, mut failed) = (0usize, 0usize, 0usize);
    for root in &roots {
        for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() || entry.path().extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            if !is_path_allowed(entry.path(), &roots) {
                failed += 1;
                continue;
            }
            match scan_one(runtime, entry.path(), spec_folder_filter.as_deref(), force).await {
                Ok(true) => indexed += 1,
                Ok(false) => skipped += 1,
                Err(_) => failed += 1,
            }
        }
    }

    runtime.rebuild_lexical_index().await?;
    println!("indexed {indexed}, skipped {skipped}, failed {failed}");
    Ok(())
}

/// Strip a leading `---\n...\n---` YAML frontmatter block, if present.
fn strip_frontmatter(raw: &str) -> &str {
    let Some(rest) = raw.strip_prefix("---\n").or_else(|| raw.strip_prefix("---\r\n")) else {
        return raw;
    };
    match rest.find("\n---") {
        Some(end) => rest[end + 4..].strip_prefix('\n').unwrap_or(&rest[end + 4..]),
        None => raw,
    }
}

async fn scan_one(runtime: &CoreRuntime, path: &Path, spec_folder_filter: Option<&str>, force: bool) -> anyhow::Result<bool> {
    let spec_folder = path
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "default".to_string());
    if let Some(filter) = spec_folder_filter {
        if filter != spec_folder {
            return Ok(false);
        }
    }

    let raw = std::fs::read_to_string(path)?;
    let body = strip_frontmatter(&raw);
    let (_anchors, _warnings) = extract_anchors(body);
    let file_path = path.to_string_lossy().to_string();
    let hash = content_hash(body);

    if !force {
        let existing = runtime.storage.get_memories_by_folder(&spec_folder)?;
        if existing.iter().any(|m| m.file_path == file_path && m.content_hash == hash) {
            return Ok(false);
        }
    }

    let (memory_type, _confidence) = infer_memory_type(None, ImportanceTier::Normal, &file_path, body);
    let trigger_phrases = extract_trigger_phrases(&serde_yaml::Value::Null, body, DEFAULT_MAX_TRIGGERS);
    let title = body
        .lines()
        .find(|l| l.starts_with("# "))
        .map(|l| l.trim_start_matches("# ").to_string())
        .unwrap_or_else(|| path.file_name().unwrap().to_string_lossy().to_string());

    runtime
        .save_memory(NewMemory {
            spec_folder,
            file_path,
            anchor_id: None,
            title,
            trigger_phrases,
            content_hash: hash,
            content: body.to_string(),
            context_type: ContextType::General,
            importance_tier: ImportanceTier::Normal,
            memory_type,
            channel: "default".to_string(),
            embedding: None,
        })
        .await?;
    Ok(true)
}

fn run_checkpoint(runtime: &CoreRuntime, action: CheckpointAction) -> anyhow::Result<()> {
    match action {
        CheckpointAction::Create { name, spec_folder, git_branch } => {
            let summary = checkpoint::create(
                &runtime.storage,
                &name,
                spec_folder.as_deref(),
                git_branch.as_deref(),
                RetentionPolicy::default(),
            )?;
            println!(
                "{} '{}': {} memories, {} embeddings ({} retained, {} pruned)",
                "created checkpoint".green(),
                summary.name,
                summary.memory_count,
                summary.embedding_count,
                summary.retained,
                summary.pruned
            );
        }
        CheckpointAction::List { spec_folder } => {
            let entries = checkpoint::list(&runtime.storage, spec_folder.as_deref())?;
            if entries.is_empty() {
                println!("{}", "no checkpoints found".dimmed());
            }
            for (name, created_at, folder) in entries {
                match folder {
                    Some(folder) => println!("{} — {} ({})", name.bold(), created_at, folder),
                    None => println!("{} — {}", name.bold(), created_at),
                }
            }
        }
        CheckpointAction::Restore { name, clear_existing } => {
            let options = RestoreOptions { clear_existing, reinsert_memories: true };
            let summary = checkpoint::restore(&runtime.storage, &name, options)?;
            println!(
                "{}: {} inserted, {} updated, {} skipped, {} deprecated",
                "restored".green(),
                summary.inserted,
                summary.updated,
                summary.skipped,
                summary.deprecated
            );
            if let Some(note) = summary.note {
                println!("{}", note.dimmed());
            }
        }
        CheckpointAction::Delete { name } => {
            let deleted = checkpoint::delete(&runtime.storage, &name)?;
            if deleted {
                println!("{} '{}'", "deleted checkpoint".green(), name);
            } else {
                println!("{}", "no checkpoint with that name existed".yellow());
            }
        }
    }
    Ok(())
}
