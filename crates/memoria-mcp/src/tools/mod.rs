//! Tool implementations exposed over `tools/call`.
//!
//! Each module owns one or a few related tool names and returns the
//! envelope-shaped JSON value directly (success or error) so `server.rs`
//! never has to branch on a tool's internal `Result` type.

pub mod checkpoint;
pub mod drift;
pub mod health;
pub mod index;
pub mod memory;
pub mod search;
pub mod task;

use memoria_core::CoreRuntime;
use serde_json::Value;

use crate::protocol::messages::ToolDescription;

/// Build the `tools/list` response body: one entry per exposed tool name.
pub fn descriptions() -> Vec<ToolDescription> {
    vec![
        describe(
            "memory_search",
            "Hybrid vector + lexical search over the memory catalog, with fusion, ranking, and an optional rerank pass.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "queryEmbedding": {"type": "array", "items": {"type": "number"}},
                    "concepts": {"type": "array", "items": {"type": "array", "items": {"type": "number"}}},
                    "limit": {"type": "integer"},
                    "specFolder": {"type": "string"},
                    "includeContent": {"type": "boolean"},
                    "anchors": {"type": "array", "items": {"type": "string"}},
                    "tier": {"type": "string"},
                    "contextType": {"type": "string"},
                    "includeConstitutional": {"type": "boolean"},
                },
            }),
        ),
        describe(
            "memory_match_triggers",
            "Find memories whose trigger phrases match a prompt, exactly or via normalized substring match.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "prompt": {"type": "string"},
                    "limit": {"type": "integer"},
                },
                "required": ["prompt"],
            }),
        ),
        describe(
            "memory_save",
            "Index a new memory from a parsed descriptor.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "specFolder": {"type": "string"},
                    "filePath": {"type": "string"},
                    "anchorId": {"type": "string"},
                    "title": {"type": "string"},
                    "content": {"type": "string"},
                    "contextType": {"type": "string"},
                    "importanceTier": {"type": "string"},
                    "memoryType": {"type": "string"},
                    "channel": {"type": "string"},
                    "triggerPhrases": {"type": "array", "items": {"type": "string"}},
                },
                "required": ["specFolder", "filePath", "title", "content"],
            }),
        ),
        describe(
            "memory_update",
            "Update a memory's importance weight and/or pinned state.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "id": {"type": "integer"},
                    "importanceWeight": {"type": "number"},
                    "isPinned": {"type": "boolean"},
                },
                "required": ["id"],
            }),
        ),
        describe(
            "memory_delete",
            "Delete a memory by id.",
            serde_json::json!({
                "type": "object",
                "properties": {"id": {"type": "integer"}},
                "required": ["id"],
            }),
        ),
        describe(
            "memory_validate",
            "Record usefulness feedback for a memory, nudging its confidence score.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "id": {"type": "integer"},
                    "useful": {"type": "boolean"},
                },
                "required": ["id", "useful"],
            }),
        ),
        describe(
            "memory_index_scan",
            "Walk the allow-listed roots, parse markdown memories, and index changed ones.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "specFolder": {"type": "string"},
                    "force": {"type": "boolean"},
                },
            }),
        ),
        describe(
            "checkpoint_create",
            "Snapshot the current catalog under a named checkpoint.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                    "specFolder": {"type": "string"},
                    "gitBranch": {"type": "string"},
                },
                "required": ["name"],
            }),
        ),
        describe(
            "checkpoint_list",
            "List existing checkpoints, optionally scoped to one spec folder.",
            serde_json::json!({
                "type": "object",
                "properties": {"specFolder": {"type": "string"}},
            }),
        ),
        describe(
            "checkpoint_restore",
            "Restore the catalog from a named checkpoint.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                    "clearExisting": {"type": "boolean"},
                },
                "required": ["name"],
            }),
        ),
        describe(
            "checkpoint_delete",
            "Delete a named checkpoint.",
            serde_json::json!({
                "type": "object",
                "properties": {"name": {"type": "string"}},
                "required": ["name"],
            }),
        ),
        describe(
            "memory_health",
            "Report catalog location, schema version, embedding provider, and row counts.",
            serde_json::json!({"type": "object", "properties": {}}),
        ),
        describe(
            "task_preflight",
            "Record the start of a task against the learning history.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "taskId": {"type": "string"},
                    "summary": {"type": "string"},
                },
                "required": ["taskId"],
            }),
        ),
        describe(
            "task_postflight",
            "Record the outcome of a task against the learning history.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "taskId": {"type": "string"},
                    "outcome": {"type": "string"},
                },
                "required": ["taskId", "outcome"],
            }),
        ),
        describe(
            "memory_get_learning_history",
            "Read back recorded task/history events, most recent first.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "memoryId": {"type": "integer"},
                    "limit": {"type": "integer"},
                },
            }),
        ),
        describe(
            "memory_drift_why",
            "Explain why a memory's embedding generation is stuck in retry or failure.",
            serde_json::json!({
                "type": "object",
                "properties": {"id": {"type": "integer"}},
                "required": ["id"],
            }),
        ),
    ]
}

fn describe(name: &str, description: &str, input_schema: Value) -> ToolDescription {
    ToolDescription { name: name.to_string(), description: description.to_string(), input_schema }
}

/// Dispatch one `tools/call` invocation to its handler, returning the
/// envelope JSON and whether it represents an error.
pub async fn dispatch(runtime: &CoreRuntime, name: &str, arguments: &Value) -> (Value, bool) {
    match name {
        "memory_search" => search::memory_search(runtime, arguments).await,
        "memory_match_triggers" => search::memory_match_triggers(runtime, arguments).await,
        "memory_save" => memory::memory_save(runtime, arguments).await,
        "memory_update" => memory::memory_update(runtime, arguments).await,
        "memory_delete" => memory::memory_delete(runtime, arguments).await,
        "memory_validate" => memory::memory_validate(runtime, arguments).await,
        "memory_index_scan" => index::memory_index_scan(runtime, arguments).await,
        "checkpoint_create" => checkpoint::checkpoint_create(runtime, arguments),
        "checkpoint_list" => checkpoint::checkpoint_list(runtime, arguments),
        "checkpoint_restore" => checkpoint::checkpoint_restore(runtime, arguments),
        "checkpoint_delete" => checkpoint::checkpoint_delete(runtime, arguments),
        "memory_health" => health::memory_health(runtime),
        "task_preflight" => task::task_preflight(runtime, arguments),
        "task_postflight" => task::task_postflight(runtime, arguments),
        "memory_get_learning_history" => task::memory_get_learning_history(runtime, arguments),
        "memory_drift_why" => drift::memory_drift_why(runtime, arguments),
        other => {
            let err = memoria_core::CoreError::new(
                memoria_core::ErrorCode::ParamInvalid,
                format!("unknown tool '{other}'"),
            );
            (crate::envelope::error(name, &err), true)
        }
    }
}
