//! `memory_save`, `memory_update`, `memory_delete`, `memory_validate`.

use memoria_core::memory::catalog::{content_hash, extract_trigger_phrases, infer_memory_type};
use memoria_core::memory::{ContextType, ImportanceTier, MemoryType};
use memoria_core::storage::NewMemory;
use memoria_core::{CoreError, CoreRuntime, ErrorCode};
use serde_json::{json, Value};

use crate::envelope;

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, CoreError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| CoreError::new(ErrorCode::ParamMissing, format!("`{key}` is required")))
}

fn required_i64(args: &Value, key: &str) -> Result<i64, CoreError> {
    args.get(key)
        .and_then(|v| v.as_i64())
        .ok_or_else(|| CoreError::new(ErrorCode::ParamMissing, format!("`{key}` is required")))
}

pub async fn memory_save(runtime: &CoreRuntime, args: &Value) -> (Value, bool) {
    let build = || -> Result<NewMemory, CoreError> {
        let spec_folder = required_str(args, "specFolder")?.to_string();
        let file_path = required_str(args, "filePath")?.to_string();
        let title = required_str(args, "title")?.to_string();
        let content = required_str(args, "content")?.to_string();
        let anchor_id = args.get("anchorId").and_then(|v| v.as_str()).map(|s| s.to_string());
        let context_type = args.get("contextType").and_then(|v| v.as_str()).map(ContextType::parse).unwrap_or_default();
        let importance_tier =
            args.get("importanceTier").and_then(|v| v.as_str()).map(ImportanceTier::parse).unwrap_or_default();
        let channel = args.get("channel").and_then(|v| v.as_str()).unwrap_or("default").to_string();

        let explicit_type = args.get("memoryType").and_then(|v| v.as_str());
        let memory_type = match explicit_type {
            Some(t) => MemoryType::parse(t),
            None => infer_memory_type(None, importance_tier, &file_path, &content).0,
        };

        let trigger_phrases = match args.get("triggerPhrases").and_then(|v| v.as_array()) {
            Some(arr) => arr.iter().filter_map(|v| v.as_str().map(|s| s.to_string())).collect(),
            None => extract_trigger_phrases(&serde_yaml::Value::Null, &content, memoria_core::memory::catalog::DEFAULT_MAX_TRIGGERS),
        };

        Ok(NewMemory {
            spec_folder,
            file_path,
            anchor_id,
            title,
            trigger_phrases,
            content_hash: content_hash(&content),
            content,
            context_type,
            importance_tier,
            memory_type,
            channel,
            embedding: args.get("embedding").and_then(|v| v.as_array()).map(|arr| {
                arr.iter().filter_map(|n| n.as_f64().map(|f| f as f32)).collect()
            }),
        })
    };

    match build() {
        Ok(input) => match runtime.save_memory(input).await {
            Ok(id) => {
                let _ = runtime.storage.record_history(id, "ADD", None, None, "memory_save");
                (envelope::success("memory_save", format!("memory {id} saved"), json!({"id": id}), vec![]), false)
            }
            Err(err) => (envelope::error("memory_save", &err), true),
        },
        Err(err) => (envelope::error("memory_save", &err), true),
    }
}

pub async fn memory_update(runtime: &CoreRuntime, args: &Value) -> (Value, bool) {
    let id = match required_i64(args, "id") {
        Ok(id) => id,
        Err(err) => return (envelope::error("memory_update", &err), true),
    };
    let importance_weight = args.get("importanceWeight").and_then(|v| v.as_f64()).map(|f| f as f32);
    let is_pinned = args.get("isPinned").and_then(|v| v.as_bool());

    match runtime.storage.update_memory(id, importance_weight, is_pinned) {
        Ok(()) => {
            let _ = runtime.storage.record_history(id, "UPDATE", None, None, "memory_update");
            (envelope::success("memory_update", format!("memory {id} updated"), json!({"id": id}), vec![]), false)
        }
        Err(err) => (envelope::error("memory_update", &err), true),
    }
}

pub async fn memory_delete(runtime: &CoreRuntime, args: &Value) -> (Value, bool) {
    let id = match required_i64(args, "id") {
        Ok(id) => id,
        Err(err) => return (envelope::error("memory_delete", &err), true),
    };

    match runtime.delete_memory(id).await {
        Ok(deleted) => {
            let data = json!({"id": id, "deleted": deleted});
            let hints = if deleted { vec![] } else { vec!["no memory with that id existed".to_string()] };
            (envelope::success("memory_delete", format!("memory {id} deleted: {deleted}"), data, hints), false)
        }
        Err(err) => (envelope::error("memory_delete", &err), true),
    }
}

pub async fn memory_validate(runtime: &CoreRuntime, args: &Value) -> (Value, bool) {
    let id = match required_i64(args, "id") {
        Ok(id) => id,
        Err(err) => return (envelope::error("memory_validate", &err), true),
    };
    let Some(useful) = args.get("useful").and_then(|v| v.as_bool()) else {
        let err = CoreError::new(ErrorCode::ParamMissing, "`useful` is required");
        return (envelope::error("memory_validate", &err), true);
    };

    match runtime.storage.update_confidence(id, useful) {
        Ok((confidence, validation_count)) => {
            let _ = runtime.storage.record_history(
                id,
                "UPDATE",
                None,
                Some(&format!("useful={useful}")),
                "memory_validate",
            );
            let data = json!({"id": id, "confidence": confidence, "validationCount": validation_count});
            (envelope::success("memory_validate", format!("memory {id} validated"), data, vec![]), false)
        }
        Err(err) => (envelope::error("memory_validate", &err), true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoria_core::Config;

    fn test_runtime() -> CoreRuntime {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_env();
        config.db_path = Some(dir.path().join("memory.sqlite"));
        config.embedding_dim_fallback = 4;
        CoreRuntime::open(config).unwrap()
    }

    #[tokio::test]
    async fn save_infers_type_and_triggers_when_not_supplied() {
        let runtime = test_runtime();
        let (data, is_error) = memory_save(
            &runtime,
            &json!({
                "specFolder": "default",
                "filePath": "auth.md",
                "title": "auth notes",
                "content": "Always validate the session token before dispatch.",
            }),
        )
        .await;
        assert!(!is_error);
        let id = data["data"]["id"].as_i64().unwrap();
        let memory = runtime.storage.get_memory(id).unwrap().unwrap();
        assert!(!memory.trigger_phrases.is_empty());
    }

    #[tokio::test]
    async fn save_missing_required_field_is_a_param_error() {
        let runtime = test_runtime();
        let (data, is_error) = memory_save(&runtime, &json!({"specFolder": "default"})).await;
        assert!(is_error);
        assert_eq!(data["data"]["code"], "E031");
    }

    #[tokio::test]
    async fn update_then_delete_round_trips() {
        let runtime = test_runtime();
        let (saved, _) = memory_save(
            &runtime,
            &json!({"specFolder": "default", "filePath": "a.md", "title": "t", "content": "some content"}),
        )
        .await;
        let id = saved["data"]["id"].as_i64().unwrap();

        let (updated, is_error) = memory_update(&runtime, &json!({"id": id, "isPinned": true})).await;
        assert!(!is_error);
        assert_eq!(updated["data"]["id"], id);

        let (deleted, is_error) = memory_delete(&runtime, &json!({"id": id})).await;
        assert!(!is_error);
        assert_eq!(deleted["data"]["deleted"], true);
    }

    #[tokio::test]
    async fn validate_nudges_confidence() {
        let runtime = test_runtime();
        let (saved, _) = memory_save(
            &runtime,
            &json!({"specFolder": "default", "filePath": "a.md", "title": "t", "content": "some content"}),
        )
        .await;
        let id = saved["data"]["id"].as_i64().unwrap();

        let (data, is_error) = memory_validate(&runtime, &json!({"id": id, "useful": true})).await;
        assert!(!is_error);
        assert!(data["data"]["confidence"].as_f64().is_some());
    }
}
