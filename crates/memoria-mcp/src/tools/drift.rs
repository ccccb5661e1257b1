//! `memory_drift_why`: explain a stuck embedding-generation retry/failure.

use memoria_core::{CoreError, CoreRuntime, ErrorCode};
use serde_json::{json, Value};

use crate::envelope;

pub fn memory_drift_why(runtime: &CoreRuntime, args: &Value) -> (Value, bool) {
    let Some(id) = args.get("id").and_then(|v| v.as_i64()) else {
        let err = CoreError::new(ErrorCode::ParamMissing, "`id` is required");
        return (envelope::error("memory_drift_why", &err), true);
    };

    match runtime.storage.get_memory(id) {
        Ok(Some(memory)) => {
            let data = json!({
                "id": id,
                "embeddingStatus": memory.embedding_status,
                "retryCount": memory.retry_count,
                "failureReason": memory.failure_reason,
            });
            let hint = match memory.failure_reason {
                Some(_) => "the embedding provider reported a failure for this memory; memory_index_scan will retry it on the next pass",
                None => "no failure is recorded; embedding generation may still be pending",
            };
            (envelope::success("memory_drift_why", "drift explanation", data, vec![hint.to_string()]), false)
        }
        Ok(None) => {
            let err = CoreError::new(ErrorCode::MemoryNotFound, format!("no memory with id {id}"));
            (envelope::error("memory_drift_why", &err), true)
        }
        Err(err) => (envelope::error("memory_drift_why", &err), true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoria_core::memory::{ContextType, ImportanceTier, MemoryType};
    use memoria_core::storage::NewMemory;
    use memoria_core::Config;
    use serde_json::json;

    fn test_runtime() -> CoreRuntime {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_env();
        config.db_path = Some(dir.path().join("drift.sqlite"));
        config.embedding_dim_fallback = 4;
        CoreRuntime::open(config).unwrap()
    }

    #[test]
    fn missing_id_is_a_param_error() {
        let runtime = test_runtime();
        let (data, is_error) = memory_drift_why(&runtime, &json!({}));
        assert!(is_error);
        assert_eq!(data["data"]["code"], "E031");
    }

    #[test]
    fn unknown_id_is_memory_not_found() {
        let runtime = test_runtime();
        let (data, is_error) = memory_drift_why(&runtime, &json!({"id": 999}));
        assert!(is_error);
        assert_eq!(data["data"]["code"], "E080");
    }

    #[test]
    fn pending_memory_has_no_failure_reason() {
        let runtime = test_runtime();
        let id = runtime
            .storage
            .index_memory(NewMemory {
                spec_folder: "default".into(),
                file_path: "a.md".into(),
                anchor_id: None,
                title: "t".into(),
                trigger_phrases: vec![],
                content_hash: "h".into(),
                content: "c".into(),
                context_type: ContextType::General,
                importance_tier: ImportanceTier::Normal,
                memory_type: MemoryType::Declarative,
                channel: "default".into(),
                embedding: None,
            })
            .unwrap();

        let (data, is_error) = memory_drift_why(&runtime, &json!({"id": id}));
        assert!(!is_error);
        assert!(data["data"]["failureReason"].is_null());
    }
}
