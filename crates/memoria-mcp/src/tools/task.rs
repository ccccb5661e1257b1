//! `task_preflight`, `task_postflight`, `memory_get_learning_history`.
//!
//! A lighter-weight integration point than the rest of the catalog: these
//! just ride the existing history table rather than a dedicated learning
//! subsystem.

use memoria_core::{CoreError, CoreRuntime, ErrorCode};
use serde_json::{json, Value};

use crate::envelope;

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, CoreError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| CoreError::new(ErrorCode::ParamMissing, format!("`{key}` is required")))
}

pub fn task_preflight(runtime: &CoreRuntime, args: &Value) -> (Value, bool) {
    let task_id = match required_str(args, "taskId") {
        Ok(t) => t,
        Err(err) => return (envelope::error("task_preflight", &err), true),
    };
    let summary = args.get("summary").and_then(|v| v.as_str());

    match runtime.storage.record_history(0, "TASK_START", None, summary, task_id) {
        Ok(()) => (envelope::success("task_preflight", format!("task '{task_id}' started"), json!({"taskId": task_id}), vec![]), false),
        Err(err) => (envelope::error("task_preflight", &err), true),
    }
}

pub fn task_postflight(runtime: &CoreRuntime, args: &Value) -> (Value, bool) {
    let task_id = match required_str(args, "taskId") {
        Ok(t) => t,
        Err(err) => return (envelope::error("task_postflight", &err), true),
    };
    let outcome = match required_str(args, "outcome") {
        Ok(o) => o,
        Err(err) => return (envelope::error("task_postflight", &err), true),
    };

    match runtime.storage.record_history(0, "TASK_END", None, Some(outcome), task_id) {
        Ok(()) => (
            envelope::success("task_postflight", format!("task '{task_id}' finished: {outcome}"), json!({"taskId": task_id, "outcome": outcome}), vec![]),
            false,
        ),
        Err(err) => (envelope::error("task_postflight", &err), true),
    }
}

pub fn memory_get_learning_history(runtime: &CoreRuntime, args: &Value) -> (Value, bool) {
    let memory_id = args.get("memoryId").and_then(|v| v.as_i64());
    let limit = args.get("limit").and_then(|v| v.as_u64()).unwrap_or(50) as usize;

    match runtime.storage.get_history(memory_id, limit) {
        Ok(events) => {
            let data = json!({"events": events});
            (envelope::success("memory_get_learning_history", format!("{} events", events_len(&data)), data, vec![]), false)
        }
        Err(err) => (envelope::error("memory_get_learning_history", &err), true),
    }
}

fn events_len(data: &Value) -> usize {
    data["events"].as_array().map(Vec::len).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoria_core::Config;

    fn test_runtime() -> CoreRuntime {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_env();
        config.db_path = Some(dir.path().join("task.sqlite"));
        config.embedding_dim_fallback = 4;
        CoreRuntime::open(config).unwrap()
    }

    #[test]
    fn preflight_then_postflight_round_trips_through_history() {
        let runtime = test_runtime();
        let (_, err1) = task_preflight(&runtime, &json!({"taskId": "t1", "summary": "start"}));
        assert!(!err1);
        let (_, err2) = task_postflight(&runtime, &json!({"taskId": "t1", "outcome": "done"}));
        assert!(!err2);

        let (data, is_error) = memory_get_learning_history(&runtime, &json!({}));
        assert!(!is_error);
        assert_eq!(events_len(&data["data"]), 2);
    }

    #[test]
    fn preflight_without_task_id_is_a_param_error() {
        let runtime = test_runtime();
        let (data, is_error) = task_preflight(&runtime, &json!({}));
        assert!(is_error);
        assert_eq!(data["data"]["code"], "E031");
    }
}
