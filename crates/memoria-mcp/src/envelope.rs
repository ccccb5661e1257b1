//! Response envelope: every tool call returns
//! `{summary, data, hints, meta:{tool, isError, severity}}`, success or
//! failure alike, so a client never has to branch on shape.

use memoria_core::error::ErrorCode;
use memoria_core::CoreError;
use serde_json::{json, Value};

/// A handful of tools carry recovery hints sharper than the generic
/// per-code text because the failure means something more specific in that
/// tool's context.
fn tool_specific_hint(tool: &str, code: ErrorCode) -> Option<&'static str> {
    match (tool, code) {
        ("memory_search", ErrorCode::VectorUnavailable) => {
            Some("vector search degraded for this query; lexical-only results were returned instead of failing outright")
        }
        ("memory_search", ErrorCode::QueryEmpty) => Some("pass either `query` or `concepts`, never neither"),
        ("memory_save", ErrorCode::MemoryConstraintViolation) => {
            Some("a memory already exists at this (specFolder, filePath, anchorId); use memory_update instead")
        }
        ("checkpoint_restore", ErrorCode::CheckpointNotFound) => {
            Some("run checkpoint_list to see valid names before retrying restore")
        }
        ("checkpoint_restore", ErrorCode::CheckpointRestoreFailed) => {
            Some("the stored snapshot could not be decompressed or parsed; it may be from an incompatible version")
        }
        ("memory_index_scan", ErrorCode::FileAccessDenied) => {
            Some("the path is outside the allow-listed roots; add it to MEMORY_ALLOWED_PATHS")
        }
        ("memory_drift_why", ErrorCode::MemoryNotFound) => {
            Some("the memory id has no recorded failure; it may have already succeeded or never existed")
        }
        _ => None,
    }
}

fn recovery_actions(code: ErrorCode) -> Vec<&'static str> {
    match code {
        ErrorCode::CheckpointNotFound => vec!["checkpoint_list"],
        ErrorCode::MemoryNotFound => vec!["memory_search"],
        ErrorCode::VectorUnavailable => vec!["memory_health"],
        ErrorCode::EmbeddingDimensionInvalid => vec!["memory_health"],
        _ if code.is_transient() => vec!["retry"],
        _ => vec![],
    }
}

/// Build the success-shaped envelope.
pub fn success(tool: &str, summary: impl Into<String>, data: Value, hints: Vec<String>) -> Value {
    json!({
        "summary": summary.into(),
        "data": data,
        "hints": hints,
        "meta": {
            "tool": tool,
            "isError": false,
            "severity": "low",
        },
    })
}

/// Build the error-shaped envelope from a `CoreError`, applying any
/// tool-specific recovery hint override.
pub fn error(tool: &str, err: &CoreError) -> Value {
    let hint = tool_specific_hint(tool, err.code).unwrap_or_else(|| err.recovery_hint());
    let mut hints = vec![hint.to_string()];
    hints.extend(recovery_actions(err.code).into_iter().map(|a| format!("try: {a}")));

    json!({
        "summary": format!("{tool} failed: {}", err.message),
        "data": {
            "error": err.message,
            "code": err.code.as_str(),
            "details": err.details,
        },
        "hints": hints,
        "meta": {
            "tool": tool,
            "isError": true,
            "severity": err.code.severity().as_str(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoria_core::ErrorCode;

    #[test]
    fn error_envelope_has_expected_shape() {
        let err = CoreError::new(ErrorCode::MemoryNotFound, "no such memory");
        let env = error("memory_search", &err);
        assert_eq!(env["meta"]["tool"], "memory_search");
        assert_eq!(env["meta"]["isError"], true);
        assert_eq!(env["data"]["code"], "E080");
    }

    #[test]
    fn tool_specific_hint_overrides_generic_text() {
        let err = CoreError::new(ErrorCode::CheckpointNotFound, "no checkpoint 'x'");
        let env = error("checkpoint_restore", &err);
        assert!(env["hints"][0].as_str().unwrap().contains("checkpoint_list"));
    }

    #[test]
    fn success_envelope_is_not_an_error() {
        let env = success("memory_health", "ok", json!({"status": "healthy"}), vec![]);
        assert_eq!(env["meta"]["isError"], false);
    }
}
