//! `memory_index_scan`: walk the allow-listed roots, parse frontmatter +
//! body out of each markdown file, and index the changed ones.

use std::path::{Path, PathBuf};

use memoria_core::memory::catalog::{content_hash, extract_anchors, extract_trigger_phrases, infer_memory_type, is_path_allowed, DEFAULT_MAX_TRIGGERS};
use memoria_core::memory::{ContextType, ImportanceTier};
use memoria_core::storage::NewMemory;
use memoria_core::CoreRuntime;
use serde_json::{json, Value};
use walkdir::WalkDir;

use crate::envelope;

/// Split a markdown file's leading `---\n...\n---` YAML frontmatter block
/// from its body. Returns `(frontmatter, body)`; a missing/malformed block
/// yields an empty frontmatter and the whole file as body.
fn split_frontmatter(raw: &str) -> (serde_yaml::Value, &str) {
    let Some(rest) = raw.strip_prefix("---\n").or_else(|| raw.strip_prefix("---\r\n")) else {
        return (serde_yaml::Value::Null, raw);
    };
    let Some(end) = rest.find("\n---") else {
        return (serde_yaml::Value::Null, raw);
    };
    let yaml = &rest[..end];
    let after = &rest[end + 4..];
    let body = after.strip_prefix('\n').unwrap_or(after);
    let frontmatter = serde_yaml::from_str(yaml).unwrap_or(serde_yaml::Value::Null);
    (frontmatter, body)
}

fn default_roots(config: &memoria_core::Config) -> Vec<PathBuf> {
    let mut roots = vec![PathBuf::from("./specs"), PathBuf::from("./.opencode")];
    roots.extend(config.allowed_paths.iter().cloned());
    roots.retain(|p| p.exists());
    roots
}

struct ScanCounts {
    indexed: usize,
    skipped: usize,
    failed: usize,
}

async fn scan_root(
    runtime: &CoreRuntime,
    root: &Path,
    spec_folder_filter: Option<&str>,
    force: bool,
    allowed_roots: &[PathBuf],
) -> ScanCounts {
    let mut counts = ScanCounts { indexed: 0, skipped: 0, failed: 0 };

    for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.path().extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        if !is_path_allowed(entry.path(), allowed_roots) {
            counts.failed += 1;
            continue;
        }

        let spec_folder = entry
            .path()
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "default".to_string());
        if let Some(filter) = spec_folder_filter {
            if filter != spec_folder {
                continue;
            }
        }

        let raw = match std::fs::read_to_string(entry.path()) {
            Ok(s) => s,
            Err(_) => {
                counts.failed += 1;
                continue;
            }
        };
        let (frontmatter, body) = split_frontmatter(&raw);
        let (anchors, _warnings) = extract_anchors(body);
        let file_path = entry.path().to_string_lossy().to_string();

        let frontmatter_type = frontmatter.get("memory_type").or_else(|| frontmatter.get("type")).and_then(|v| v.as_str());
        let tier = frontmatter
            .get("importance_tier")
            .or_else(|| frontmatter.get("tier"))
            .and_then(|v| v.as_str())
            .map(ImportanceTier::parse)
            .unwrap_or_default();
        let context_type = frontmatter
            .get("context_type")
            .and_then(|v| v.as_str())
            .map(ContextType::parse)
            .unwrap_or_default();
        let title = frontmatter
            .get("title")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .or_else(|| body.lines().find(|l| l.starts_with("# ")).map(|l| l.trim_start_matches("# ").to_string()))
            .unwrap_or_else(|| entry.file_name().to_string_lossy().to_string());

        let hash = content_hash(body);
        if !force {
            if let Ok(existing) = runtime.storage.get_memories_by_folder(&spec_folder) {
                if existing.iter().any(|m| m.file_path == file_path && m.content_hash == hash) {
                    counts.skipped += 1;
                    continue;
                }
            }
        }

        let (memory_type, _confidence) = infer_memory_type(frontmatter_type, tier, &file_path, body);
        let trigger_phrases = extract_trigger_phrases(&frontmatter, body, DEFAULT_MAX_TRIGGERS);

        let anchor_entries: Vec<(Option<String>, String)> = if anchors.is_empty() {
            vec![(None, body.to_string())]
        } else {
            anchors.into_iter().map(|(id, text)| (Some(id), text)).collect()
        };

        for (anchor_id, content) in anchor_entries {
            let input = NewMemory {
                spec_folder: spec_folder.clone(),
                file_path: file_path.clone(),
                anchor_id,
                title: title.clone(),
                trigger_phrases: trigger_phrases.clone(),
                content_hash: hash.clone(),
                content,
                context_type,
                importance_tier: tier,
                memory_type,
                channel: "default".to_string(),
                embedding: None,
            };
            match runtime.save_memory(input).await {
                Ok(_) => counts.indexed += 1,
                Err(_) => counts.failed += 1,
            }
        }
    }

    counts
}

pub async fn memory_index_scan(runtime: &CoreRuntime, args: &Value) -> (Value, bool) {
    let spec_folder_filter = args.get("specFolder").and_then(|v| v.as_str());
    let force = args.get("force").and_then(|v| v.as_bool()).unwrap_or(false);

    let mut allowed_roots = runtime.config.allowed_paths.clone();
    allowed_roots.push(PathBuf::from("./specs"));
    allowed_roots.push(PathBuf::from("./.opencode"));

    let roots = default_roots(&runtime.config);
    let mut indexed = 0;
    let mut skipped = 0;
    let mut failed = 0;

    for root in &roots {
        let counts = scan_root(runtime, root, spec_folder_filter, force, &allowed_roots).await;
        indexed += counts.indexed;
        skipped += counts.skipped;
        failed += counts.failed;
    }

    if let Err(err) = runtime.rebuild_lexical_index().await {
        return (envelope::error("memory_index_scan", &err), true);
    }

    let data = json!({"indexed": indexed, "skipped": skipped, "failed": failed});
    let hints = if roots.is_empty() {
        vec!["no allow-listed root exists on disk; nothing was scanned".to_string()]
    } else {
        vec![]
    };
    (
        envelope::success("memory_index_scan", format!("indexed {indexed}, skipped {skipped}, failed {failed}"), data, hints),
        false,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoria_core::Config;

    fn test_runtime(db_path: PathBuf) -> CoreRuntime {
        let mut config = Config::from_env();
        config.db_path = Some(db_path);
        config.embedding_dim_fallback = 4;
        CoreRuntime::open(config).unwrap()
    }

    #[test]
    fn splits_frontmatter_and_body() {
        let raw = "---\ntitle: Foo\n---\n# Foo\nbody text\n";
        let (frontmatter, body) = split_frontmatter(raw);
        assert_eq!(frontmatter.get("title").and_then(|v| v.as_str()), Some("Foo"));
        assert_eq!(body, "# Foo\nbody text\n");
    }

    #[test]
    fn missing_frontmatter_yields_whole_file_as_body() {
        let raw = "# Foo\nbody text\n";
        let (frontmatter, body) = split_frontmatter(raw);
        assert!(frontmatter.is_null());
        assert_eq!(body, raw);
    }

    #[tokio::test]
    async fn scan_indexes_markdown_files_under_an_allowed_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("spec_folder");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(
            root.join("notes.md"),
            "---\ntitle: Notes\n---\n# Notes\nAlways validate the session token before dispatch.\n",
        )
        .unwrap();

        let db_dir = tempfile::tempdir().unwrap();
        let mut runtime = test_runtime(db_dir.path().join("scan.sqlite"));
        runtime.config.allowed_paths = vec![root.clone()];

        let (data, is_error) = memory_index_scan(&runtime, &serde_json::json!({})).await;
        assert!(!is_error);
        assert_eq!(data["data"]["indexed"], 1);

        // Re-scanning unchanged content should skip, not re-index.
        let (data, is_error) = memory_index_scan(&runtime, &serde_json::json!({})).await;
        assert!(!is_error);
        assert_eq!(data["data"]["indexed"], 0);
        assert_eq!(data["data"]["skipped"], 1);
    }
}
