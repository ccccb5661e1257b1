//! Parsing contract.
//!
//! Markdown parsing itself is an external collaborator; this module owns
//! the contract the collaborator's output must satisfy before it reaches
//! the catalog: anchor extraction, trigger phrase extraction, content
//! hashing, and memory-type inference.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use super::{ContextType, ImportanceTier, MemoryType};

/// Anchor ids must match `^[A-Za-z0-9][-A-Za-z0-9]*$`.
pub fn is_valid_anchor_id(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// A parsed anchor region: `<!-- ANCHOR:id --> ... <!-- /ANCHOR:id -->`.
/// Matching is case-insensitive on the marker keyword, case-sensitive on id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorWarning(pub String);

/// Extract anchors from raw markdown content. Returns `(anchors, warnings)`;
/// unmatched anchors degrade to warnings and never block indexing.
pub fn extract_anchors(content: &str) -> (BTreeMap<String, String>, Vec<AnchorWarning>) {
    let open_re = "<!-- ANCHOR:";
    let close_prefix = "<!-- /ANCHOR:";
    let mut anchors = BTreeMap::new();
    let mut warnings = Vec::new();

    let lower = content.to_lowercase();
    let mut search_from = 0usize;
    while let Some(rel) = lower[search_from..].find(&open_re.to_lowercase()) {
        let open_start = search_from + rel;
        let tag_end = match content[open_start..].find("-->") {
            Some(end) => open_start + end + 3,
            None => {
                warnings.push(AnchorWarning(format!(
                    "unterminated ANCHOR open tag at byte {open_start}"
                )));
                break;
            }
        };
        let id_raw = content[open_start + open_re.len()..tag_end - 3].trim();
        if !is_valid_anchor_id(id_raw) {
            warnings.push(AnchorWarning(format!("invalid anchor id '{id_raw}'")));
            search_from = tag_end;
            continue;
        }
        let close_tag = format!("{close_prefix}{id_raw} -->");
        let close_tag_loose = format!("{close_prefix}{id_raw}-->");
        let rest = &content[tag_end..];
        let rest_lower = rest.to_lowercase();
        let close_pos = rest_lower
            .find(&close_tag.to_lowercase())
            .or_else(|| rest_lower.find(&close_tag_loose.to_lowercase()));

        match close_pos {
            Some(pos) => {
                let body = rest[..pos].trim().to_string();
                anchors.insert(id_raw.to_string(), body);
                let close_len = rest[pos..].find("-->").map(|e| pos + e + 3).unwrap_or(pos);
                search_from = tag_end + close_len;
            }
            None => {
                warnings.push(AnchorWarning(format!(
                    "anchor '{id_raw}' opened but never closed"
                )));
                search_from = tag_end;
            }
        }
    }

    (anchors, warnings)
}

/// Maximum number of trigger phrases retained per memory (config default).
pub const DEFAULT_MAX_TRIGGERS: usize = 20;

/// Extract trigger phrases from YAML frontmatter (inline or block list) or a
/// `## Trigger Phrases` markdown section. Each phrase is trimmed,
/// length-bounded (<=80 chars), and de-duplicated while preserving order.
pub fn extract_trigger_phrases(frontmatter: &serde_yaml::Value, content: &str, max: usize) -> Vec<String> {
    let mut phrases: Vec<String> = Vec::new();

    if let Some(list) = frontmatter
        .get("trigger_phrases")
        .or_else(|| frontmatter.get("triggers"))
        .and_then(|v| v.as_sequence())
    {
        for item in list {
            if let Some(s) = item.as_str() {
                phrases.push(s.to_string());
            }
        }
    } else if let Some(inline) = frontmatter
        .get("trigger_phrases")
        .or_else(|| frontmatter.get("triggers"))
        .and_then(|v| v.as_str())
    {
        phrases.extend(inline.split(',').map(|s| s.to_string()));
    }

    if phrases.is_empty() {
        if let Some(section) = find_markdown_section(content, "Trigger Phrases") {
            for line in section.lines() {
                let trimmed = line.trim_start_matches(['-', '*']).trim();
                if !trimmed.is_empty() {
                    phrases.push(trimmed.to_string());
                }
            }
        }
    }

    let mut seen = std::collections::HashSet::new();
    phrases
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .map(|p| if p.len() > 80 { p[..80].to_string() } else { p })
        .filter(|p| seen.insert(p.clone()))
        .take(max)
        .collect()
}

fn find_markdown_section<'a>(content: &'a str, heading: &str) -> Option<&'a str> {
    let needle = format!("## {heading}");
    let start = content.find(&needle)?;
    let after_heading = start + needle.len();
    let rest = &content[after_heading..];
    let end = rest.find("\n## ").unwrap_or(rest.len());
    Some(rest[..end].trim_start_matches('\n'))
}

/// Memory-type inference precedence:
/// explicit frontmatter (1.0) > tier mapping (0.9) > path pattern (0.8) >
/// keyword heuristic (0.7) > default declarative (0.5).
pub fn infer_memory_type(
    frontmatter_type: Option<&str>,
    tier: ImportanceTier,
    file_path: &str,
    content: &str,
) -> (MemoryType, f32) {
    if let Some(explicit) = frontmatter_type {
        return (MemoryType::parse(explicit), 1.0);
    }

    if tier == ImportanceTier::Constitutional {
        return (MemoryType::MetaCognitive, 0.9);
    }

    let lower_path = file_path.to_lowercase();
    if lower_path.contains("/decisions/") || lower_path.contains("/adr/") {
        return (MemoryType::Episodic, 0.8);
    }
    if lower_path.contains("/procedures/") || lower_path.contains("/how-to/") {
        return (MemoryType::Procedural, 0.8);
    }

    let lower_content = content.to_lowercase();
    if lower_content.contains("todo") || lower_content.contains("remember to") {
        return (MemoryType::Prospective, 0.7);
    }
    if lower_content.contains("step 1") || lower_content.contains("```") {
        return (MemoryType::Procedural, 0.7);
    }

    (MemoryType::Declarative, 0.5)
}

/// Hex SHA-256 content hash, used for idempotence checks on re-index.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Output of the parsing collaborator.
#[derive(Debug, Clone)]
pub struct ParsedMemory {
    pub spec_folder: String,
    pub title: String,
    pub trigger_phrases: Vec<String>,
    pub context_type: ContextType,
    pub importance_tier: ImportanceTier,
    pub memory_type: Option<MemoryType>,
    pub content_hash: String,
    pub content: String,
    pub file_size: u64,
    pub last_modified: i64,
    pub anchors: BTreeMap<String, String>,
    pub anchor_warnings: Vec<AnchorWarning>,
}

/// Path-traversal defense: a content read is only permitted when its parent
/// directory is one of the allow-listed roots (or a descendant of one).
pub fn is_path_allowed(path: &std::path::Path, allowed_roots: &[std::path::PathBuf]) -> bool {
    let Ok(canon) = path.canonicalize() else {
        return false;
    };
    allowed_roots.iter().any(|root| {
        root.canonicalize()
            .map(|root| canon.starts_with(root))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchor_ids_validate() {
        assert!(is_valid_anchor_id("intro"));
        assert!(is_valid_anchor_id("step-1"));
        assert!(!is_valid_anchor_id("-bad"));
        assert!(!is_valid_anchor_id(""));
    }

    #[test]
    fn extracts_matched_anchor() {
        let content = "before <!-- ANCHOR:intro -->hello world<!-- /ANCHOR:intro --> after";
        let (anchors, warnings) = extract_anchors(content);
        assert_eq!(anchors.get("intro").unwrap(), "hello world");
        assert!(warnings.is_empty());
    }

    #[test]
    fn unmatched_anchor_is_warning_not_error() {
        let content = "before <!-- ANCHOR:intro -->hello world (no close)";
        let (anchors, warnings) = extract_anchors(content);
        assert!(anchors.is_empty());
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn trigger_section_extraction() {
        let content = "# Title\n\n## Trigger Phrases\n- foo bar\n- baz\n\n## Next\nirrelevant";
        let fm = serde_yaml::Value::Null;
        let triggers = extract_trigger_phrases(&fm, content, DEFAULT_MAX_TRIGGERS);
        assert_eq!(triggers, vec!["foo bar".to_string(), "baz".to_string()]);
    }

    #[test]
    fn memory_type_precedence_explicit_wins() {
        let (mt, conf) = infer_memory_type(Some("semantic"), ImportanceTier::Normal, "x.md", "");
        assert_eq!(mt, MemoryType::Semantic);
        assert_eq!(conf, 1.0);
    }

    #[test]
    fn memory_type_default_when_nothing_matches() {
        let (mt, conf) = infer_memory_type(None, ImportanceTier::Normal, "notes.md", "just text");
        assert_eq!(mt, MemoryType::Declarative);
        assert_eq!(conf, 0.5);
    }

    #[test]
    fn content_hash_is_deterministic() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
    }
}
