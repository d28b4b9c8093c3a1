//! Batch execution: ordering, defaults, paths sugar, atomic rollback.

use serde_json::json;
use taskplane::Dispatcher;
use tempfile::{TempDir, tempdir};

fn engine() -> (TempDir, Dispatcher) {
    let tmp = tempdir().unwrap();
    let dispatcher = Dispatcher::with_project_root(tmp.path(), tmp.path()).unwrap();
    (tmp, dispatcher)
}

fn seed_task(d: &Dispatcher) -> String {
    let resp = d.process_intent(&json!({"intent": "create", "kind": "plan", "title": "P"}));
    let plan_id = resp.result["plan_id"].as_str().unwrap().to_string();
    let resp = d.process_intent(&json!({
        "intent": "create", "kind": "task", "title": "T", "parent": plan_id,
        "steps": [
            {"title": "First step title long enough", "success_criteria": ["c"], "tests": ["t"]},
            {"title": "Second step title long enough", "success_criteria": ["c"], "tests": ["t"]},
        ],
    }));
    resp.result["task_id"].as_str().unwrap().to_string()
}

#[test]
fn test_batch_runs_in_order_with_default_task() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    let resp = d.process_intent(&json!({
        "intent": "batch",
        "task": task_id,
        "operations": [
            {"intent": "note", "path": "s:0", "note": "A"},
            {"intent": "note", "path": "s:0", "note": "B"},
        ],
    }));
    assert!(resp.success, "{:?}", resp.error_message);
    assert_eq!(resp.result["total"], json!(2));
    assert_eq!(resp.result["completed"], json!(2));
    assert_eq!(resp.result["operation_ids"].as_array().unwrap().len(), 2);
    assert!(resp.result["latest_id"].is_string());

    let resume = d.process_intent(&json!({"intent": "resume", "task": task_id}));
    let notes = resume.result["task"]["steps"][0]["progress_notes"].as_array().unwrap();
    assert_eq!(notes, &vec![json!("A"), json!("B")]);
}

#[test]
fn test_atomic_rollback_restores_directory() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    // The second op fails (gating): the note from the first op must be gone.
    let resp = d.process_intent(&json!({
        "intent": "batch",
        "atomic": true,
        "task": task_id,
        "operations": [
            {"intent": "note", "path": "s:0", "note": "A"},
            {"intent": "progress", "path": "s:0", "completed": true},
        ],
    }));
    assert!(!resp.success);
    assert_eq!(resp.result["rolled_back"], json!(true));
    assert_eq!(resp.result["completed"], json!(1));

    let resume = d.process_intent(&json!({"intent": "resume", "task": task_id}));
    let step = &resume.result["task"]["steps"][0];
    assert!(
        step.get("progress_notes").is_none()
            || step["progress_notes"].as_array().unwrap().is_empty(),
        "rollback left the note behind"
    );
}

#[test]
fn test_non_atomic_failure_keeps_partial_results() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    let resp = d.process_intent(&json!({
        "intent": "batch",
        "task": task_id,
        "operations": [
            {"intent": "note", "path": "s:0", "note": "A"},
            {"intent": "progress", "path": "s:0", "completed": true},
        ],
    }));
    assert!(!resp.success);
    assert_eq!(resp.result["rolled_back"], json!(false));
    let resume = d.process_intent(&json!({"intent": "resume", "task": task_id}));
    let notes = resume.result["task"]["steps"][0]["progress_notes"].as_array().unwrap();
    assert_eq!(notes, &vec![json!("A")]);
}

#[test]
fn test_paths_sugar_expands_in_order() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    let resp = d.process_intent(&json!({
        "intent": "batch",
        "task": task_id,
        "operations": [
            {"intent": "note", "paths": ["s:0", "s:1"], "note": "sweep"},
        ],
    }));
    assert!(resp.success, "{:?}", resp.error_message);
    assert_eq!(resp.result["total"], json!(2));

    let resume = d.process_intent(&json!({"intent": "resume", "task": task_id}));
    for idx in 0..2 {
        let notes = resume.result["task"]["steps"][idx]["progress_notes"].as_array().unwrap();
        assert_eq!(notes, &vec![json!("sweep")]);
    }
}

#[test]
fn test_paths_sugar_rejects_invalid_paths() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    let resp = d.process_intent(&json!({
        "intent": "batch",
        "task": task_id,
        "operations": [{"intent": "note", "paths": ["s:0", "bogus"], "note": "x"}],
    }));
    assert!(!resp.success);
    assert_eq!(resp.error_code.as_deref(), Some("INVALID_PATH"));
}

#[test]
fn test_batch_level_expected_revision_preflight() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    let resp = d.process_intent(&json!({
        "intent": "batch",
        "task": task_id,
        "expected_revision": 999,
        "operations": [{"intent": "note", "path": "s:0", "note": "x"}],
    }));
    assert!(!resp.success);
    assert_eq!(resp.error_code.as_deref(), Some("REVISION_MISMATCH"));

    // Without a default task the batch-level guard has nothing to bind to.
    let resp = d.process_intent(&json!({
        "intent": "batch",
        "expected_revision": 1,
        "operations": [{"intent": "note", "task": task_id, "path": "s:0", "note": "x"}],
    }));
    assert!(!resp.success);
    assert_eq!(resp.error_code.as_deref(), Some("MISSING_TASK"));
}

#[test]
fn test_batch_safe_write_defaults_propagate() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    let resp = d.process_intent(&json!({
        "intent": "batch",
        "task": task_id,
        "strict_targeting": true,
        "expected_target_id": "TASK-999",
        "expected_kind": "task",
        "operations": [{"intent": "note", "path": "s:0", "note": "x"}],
    }));
    assert!(!resp.success);
    assert_eq!(resp.error_code.as_deref(), Some("EXPECTED_TARGET_MISMATCH"));
}

#[test]
fn test_empty_operations_rejected() {
    let (_tmp, d) = engine();
    let resp = d.process_intent(&json!({"intent": "batch", "operations": []}));
    assert!(!resp.success);
    assert_eq!(resp.error_code.as_deref(), Some("INVALID_OPERATIONS"));

    let resp = d.process_intent(&json!({"intent": "batch"}));
    assert!(!resp.success);
    assert_eq!(resp.error_code.as_deref(), Some("MISSING_OPERATIONS"));
}

#[test]
fn test_golden_path_batch_from_radar_suggestion() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    let resp = d.process_intent(&json!({"intent": "focus_set", "task": task_id}));
    assert!(resp.success);
    let radar = d.process_intent(&json!({"intent": "radar", "task": task_id}));
    assert!(radar.success);
    let suggestion = radar
        .suggestions
        .iter()
        .find(|s| s.action == "batch")
        .expect("radar should emit the golden-path batch");
    let mut params = suggestion.params.clone().unwrap().as_object().unwrap().clone();
    params.insert("intent".into(), json!("batch"));

    let resp = d.process_intent(&serde_json::Value::Object(params));
    assert!(resp.success, "{:?}", resp.error_message);
    let resume = d.process_intent(&json!({"intent": "resume", "task": task_id}));
    assert_eq!(resume.result["task"]["steps"][0]["completed"], json!(true));
}
