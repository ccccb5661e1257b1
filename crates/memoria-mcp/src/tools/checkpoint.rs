//! Thin wrappers over `memoria_core::checkpoint`'s free functions.

use memoria_core::checkpoint::{self, RestoreOptions, RetentionPolicy};
use memoria_core::{CoreError, CoreRuntime, ErrorCode};
use serde_json::{json, Value};

use crate::envelope;

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, CoreError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| CoreError::new(ErrorCode::ParamMissing, format!("`{key}` is required")))
}

pub fn checkpoint_create(runtime: &CoreRuntime, args: &Value) -> (Value, bool) {
    let name = match required_str(args, "name") {
        Ok(n) => n,
        Err(err) => return (envelope::error("checkpoint_create", &err), true),
    };
    let spec_folder = args.get("specFolder").and_then(|v| v.as_str());
    let git_branch = args.get("gitBranch").and_then(|v| v.as_str());

    match checkpoint::create(&runtime.storage, name, spec_folder, git_branch, RetentionPolicy::default()) {
        Ok(summary) => {
            let data = json!({
                "name": summary.name,
                "memoryCount": summary.memory_count,
                "embeddingCount": summary.embedding_count,
                "retained": summary.retained,
                "pruned": summary.pruned,
            });
            (envelope::success("checkpoint_create", format!("checkpoint '{name}' created"), data, vec![]), false)
        }
        Err(err) => (envelope::error("checkpoint_create", &err), true),
    }
}

pub fn checkpoint_list(runtime: &CoreRuntime, args: &Value) -> (Value, bool) {
    let spec_folder = args.get("specFolder").and_then(|v| v.as_str());
    match checkpoint::list(&runtime.storage, spec_folder) {
        Ok(entries) => {
            let list: Vec<Value> = entries
                .into_iter()
                .map(|(name, created_at, spec_folder)| json!({"name": name, "createdAt": created_at, "specFolder": spec_folder}))
                .collect();
            let data = json!({"checkpoints": list});
            (envelope::success("checkpoint_list", format!("{} checkpoints", data["checkpoints"].as_array().unwrap().len()), data, vec![]), false)
        }
        Err(err) => (envelope::error("checkpoint_list", &err), true),
    }
}

pub fn checkpoint_restore(runtime: &CoreRuntime, args: &Value) -> (Value, bool) {
    let name = match required_str(args, "name") {
        Ok(n) => n,
        Err(err) => return (envelope::error("checkpoint_restore", &err), true),
    };
    let options = RestoreOptions {
        clear_existing: args.get("clearExisting").and_then(|v| v.as_bool()).unwrap_or(false),
        reinsert_memories: args.get("reinsertMemories").and_then(|v| v.as_bool()).unwrap_or(true),
    };

    match checkpoint::restore(&runtime.storage, name, options) {
        Ok(summary) => {
            let data = json!({
                "inserted": summary.inserted,
                "updated": summary.updated,
                "skipped": summary.skipped,
                "cleared": summary.cleared,
                "deprecated": summary.deprecated,
                "embeddingsRestored": summary.embeddings_restored,
                "embeddingsSkipped": summary.embeddings_skipped,
                "totalInSnapshot": summary.total_in_snapshot,
                "note": summary.note,
            });
            (envelope::success("checkpoint_restore", format!("checkpoint '{name}' restored"), data, vec![]), false)
        }
        Err(err) => (envelope::error("checkpoint_restore", &err), true),
    }
}

pub fn checkpoint_delete(runtime: &CoreRuntime, args: &Value) -> (Value, bool) {
    let name = match required_str(args, "name") {
        Ok(n) => n,
        Err(err) => return (envelope::error("checkpoint_delete", &err), true),
    };

    match checkpoint::delete(&runtime.storage, name) {
        Ok(deleted) => {
            let data = json!({"name": name, "deleted": deleted});
            (envelope::success("checkpoint_delete", format!("checkpoint '{name}' deleted: {deleted}"), data, vec![]), false)
        }
        Err(err) => (envelope::error("checkpoint_delete", &err), true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoria_core::Config;

    fn test_runtime() -> CoreRuntime {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_env();
        config.db_path = Some(dir.path().join("checkpoint.sqlite"));
        config.embedding_dim_fallback = 4;
        CoreRuntime::open(config).unwrap()
    }

    #[test]
    fn create_list_restore_delete_round_trip() {
        let runtime = test_runtime();

        let (created, err) = checkpoint_create(&runtime, &json!({"name": "snap1"}));
        assert!(!err);
        assert_eq!(created["data"]["name"], "snap1");

        let (listed, err) = checkpoint_list(&runtime, &json!({}));
        assert!(!err);
        assert_eq!(listed["data"]["checkpoints"].as_array().unwrap().len(), 1);

        let (restored, err) = checkpoint_restore(&runtime, &json!({"name": "snap1"}));
        assert!(!err);
        assert_eq!(restored["data"]["inserted"], 0);

        let (deleted, err) = checkpoint_delete(&runtime, &json!({"name": "snap1"}));
        assert!(!err);
        assert_eq!(deleted["data"]["deleted"], true);
    }

    #[test]
    fn restore_of_missing_checkpoint_is_an_error() {
        let runtime = test_runtime();
        let (data, is_error) = checkpoint_restore(&runtime, &json!({"name": "nope"}));
        assert!(is_error);
        assert_eq!(data["data"]["code"], "E062");
    }
}
