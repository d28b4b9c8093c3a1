//! Atomic batch execution: `batch`.
//!
//! Operations run in listed order through the regular dispatcher, so every
//! guard and history record applies per operation. With `atomic=true`, the
//! whole tasks directory is snapshotted to a temp sibling first; the first
//! failing operation restores the directory wholesale and the response
//! carries `rolled_back: true`.

use crate::core::time::now_nanos;
use crate::intents::Dispatcher;
use crate::intents::response::{AIResponse, codes, error_response};
use crate::intents::validate::{self, MAX_ARRAY_LENGTH, Payload, validate_task_id};
use serde_json::{Value, json};
use std::fs;
use std::path::Path;

fn copy_dir(src: &Path, dst: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dst)?;
    if !src.exists() {
        return Ok(());
    }
    let mut stack = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = stack.pop() {
        fs::create_dir_all(&to)?;
        for entry in fs::read_dir(&from)? {
            let entry = entry?;
            let path = entry.path();
            let target = to.join(entry.file_name());
            if path.is_dir() {
                stack.push((path, target));
            } else {
                fs::copy(&path, &target)?;
            }
        }
    }
    Ok(())
}

fn restore_dir(backup: &Path, target: &Path) -> std::io::Result<()> {
    if target.exists() {
        fs::remove_dir_all(target)?;
    }
    copy_dir(backup, target)
}

pub fn handle_batch(d: &Dispatcher, data: &Payload) -> AIResponse {
    let Some(ops_raw) = data.get("operations") else {
        return error_response("batch", codes::MISSING_OPERATIONS, "operations is required");
    };
    let Some(ops) = ops_raw.as_array() else {
        return error_response(
            "batch",
            codes::INVALID_OPERATIONS,
            "operations must be a non-empty array",
        );
    };
    if ops.is_empty() {
        return error_response(
            "batch",
            codes::INVALID_OPERATIONS,
            "operations must be a non-empty array",
        );
    }
    let atomic = validate::get_bool(data, "atomic", false);

    let default_task = match data.get("task") {
        Some(value) => match validate_task_id(Some(value)) {
            Ok(id) => Some(id),
            Err(msg) => return error_response("batch", codes::INVALID_TASK, &msg),
        },
        None => None,
    };

    // Batch-level safe-write defaults flow into every operation.
    let batch_expected_target_id = data.get("expected_target_id").cloned();
    let batch_expected_kind = data.get("expected_kind").cloned();
    let batch_strict_targeting = validate::get_bool(data, "strict_targeting", false);

    // Batch-level optimistic concurrency applies to the default task only.
    let expected_revision = data
        .get("expected_revision")
        .or_else(|| data.get("expected_version"));
    if let Some(raw) = expected_revision {
        if raw.is_boolean() || raw.as_i64().is_none() || raw.as_i64().unwrap_or(-1) < 0 {
            return error_response(
                "batch",
                codes::INVALID_EXPECTED_REVISION,
                "expected_revision must be an integer",
            )
            .with_recovery(
                "Pass expected_revision as an integer (etag-like). Fetch the current revision via radar/resume.",
            );
        }
        let expected = raw.as_i64().unwrap_or(0) as u64;
        let Some(default_task) = default_task.as_deref() else {
            return error_response(
                "batch",
                codes::MISSING_TASK,
                "task is required with a batch-level expected_revision",
            )
            .with_recovery(
                "Pass task=TASK-###|PLAN-### at the batch level or move expected_revision into a single operation.",
            );
        };
        if let Some(current) = d.load_item(default_task) {
            if current.revision != expected {
                return d.revision_mismatch_response("batch", default_task, expected, current.revision);
            }
        }
    }

    let initial_latest_id = d.history().ok().and_then(|h| h.latest_id());

    // `paths` sugar: one operation fans out into one clone per step path.
    let mut expanded: Vec<Value> = Vec::new();
    for op in ops {
        let Some(map) = op.as_object() else {
            expanded.push(op.clone());
            continue;
        };
        if let Some(paths) = map.get("paths").and_then(Value::as_array) {
            for raw_path in paths {
                let path_value = raw_path.as_str().unwrap_or_default();
                if crate::core::ident::StepPath::parse(path_value).is_err() {
                    return error_response(
                        "batch",
                        codes::INVALID_PATH,
                        &format!("invalid path in paths: {}", path_value),
                    )
                    .with_result(json!({"path": path_value}));
                }
                let mut cloned = map.clone();
                cloned.remove("paths");
                cloned.insert("path".into(), json!(path_value));
                expanded.push(Value::Object(cloned));
            }
            continue;
        }
        expanded.push(op.clone());
    }

    if expanded.len() > MAX_ARRAY_LENGTH {
        return error_response(
            "batch",
            codes::INVALID_OPERATIONS,
            &format!("too many operations after paths expansion (max {})", MAX_ARRAY_LENGTH),
        );
    }
    if expanded.is_empty() {
        return AIResponse::ok(
            "batch",
            json!({
                "total": 0,
                "completed": 0,
                "results": [],
                "latest_id": initial_latest_id,
                "operation_ids": [],
            }),
        );
    }

    let total = expanded.len();
    let mut completed = 0usize;
    let mut results: Vec<Value> = Vec::new();
    let mut operation_ids: Vec<String> = Vec::new();

    // Full-directory snapshot for all-or-nothing semantics.
    let backup_root = std::env::temp_dir().join(format!("taskplane_batch_{}", now_nanos()));
    let backup_dir = backup_root.join("backup");
    if atomic {
        if let Err(err) = copy_dir(d.repo().root(), &backup_dir) {
            return error_response(
                "batch",
                codes::INTERNAL_ERROR,
                &format!("failed to snapshot tasks dir: {}", err),
            );
        }
    }

    let outcome = (|| -> AIResponse {
        for op in &expanded {
            let Some(map) = op.as_object() else {
                return error_response("batch", codes::INVALID_OPERATIONS, "operation must be an object")
                    .with_result(json!({
                        "total": total,
                        "completed": completed,
                        "results": results.clone(),
                    }));
            };
            let mut payload = map.clone();
            let intent = validate::get_trimmed(&payload, "intent");
            if let Some(default_task) = &default_task {
                if !payload.contains_key("task")
                    && !matches!(intent.as_str(), "context" | "storage" | "history")
                {
                    payload.insert("task".into(), json!(default_task));
                }
            }
            if let Some(expected_target_id) = &batch_expected_target_id {
                payload
                    .entry("expected_target_id".to_string())
                    .or_insert(expected_target_id.clone());
            }
            if let Some(expected_kind) = &batch_expected_kind {
                payload
                    .entry("expected_kind".to_string())
                    .or_insert(expected_kind.clone());
            }
            if batch_strict_targeting && !payload.contains_key("strict_targeting") {
                payload.insert("strict_targeting".into(), json!(true));
            }

            let resp = d.process_intent(&Value::Object(payload));
            if !resp.success {
                let (latest_id, rolled_back) = if atomic {
                    let _ = restore_dir(&backup_dir, d.repo().root());
                    (initial_latest_id.clone(), true)
                } else {
                    (d.history().ok().and_then(|h| h.latest_id()), false)
                };
                let mut failed = error_response(
                    "batch",
                    resp.error_code.as_deref().unwrap_or(codes::BATCH_FAILED),
                    resp.error_message.as_deref().unwrap_or("batch failed"),
                );
                failed.result = json!({
                    "total": total,
                    "completed": completed,
                    "results": results.clone(),
                    "latest_id": latest_id,
                    "operation_ids": operation_ids.clone(),
                    "rolled_back": rolled_back,
                });
                return failed;
            }
            if let Some(op_id) = resp.meta.get("operation_id").and_then(Value::as_str) {
                operation_ids.push(op_id.to_string());
            }
            results.push(resp.to_value());
            completed += 1;
        }
        let latest_id = d.history().ok().and_then(|h| h.latest_id());
        AIResponse::ok(
            "batch",
            json!({
                "total": total,
                "completed": completed,
                "results": results.clone(),
                "latest_id": latest_id,
                "operation_ids": operation_ids.clone(),
            }),
        )
    })();

    if atomic {
        let _ = fs::remove_dir_all(&backup_root);
    }
    outcome
}
