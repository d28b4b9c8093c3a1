//! The close-task runway: dry-run previews, recipes, atomic apply.

use serde_json::{Value, json};
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
        "success_criteria": ["done means done"],
        "steps": [{"title": "Step title long enough", "success_criteria": ["c"], "tests": ["t"]}],
    }));
    resp.result["task_id"].as_str().unwrap().to_string()
}

fn close_all_steps(d: &Dispatcher, task_id: &str) {
    let resp = d.process_intent(&json!({
        "intent": "close_step",
        "task": task_id,
        "path": "s:0",
        "checkpoints": {"criteria": {"confirmed": true}, "tests": {"confirmed": true}},
    }));
    assert!(resp.success, "{:?}", resp.error_message);
}

fn revision_of(d: &Dispatcher, task_id: &str) -> u64 {
    d.process_intent(&json!({"intent": "resume", "task": task_id})).result["task"]["revision"]
        .as_u64()
        .unwrap()
}

#[test]
fn test_dry_run_reports_runway_and_recipe_for_missing_dod() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    close_all_steps(&d, &task_id);
    // Drop the definition of done; the task must not be completable as-is.
    let resp = d.process_intent(&json!({
        "intent": "patch",
        "task": task_id,
        "ops": [{"op": "set", "field": "success_criteria", "value": []}],
    }));
    assert!(resp.success, "{:?}", resp.error_message);
    // The step-tree promotion may have marked it DONE; reopen for the runway.
    let resp = d.process_intent(&json!({"intent": "complete", "task": task_id, "status": "ACTIVE", }));
    assert!(resp.success, "{:?}", resp.error_message);
    let expected_revision = revision_of(&d, &task_id);

    let resp = d.process_intent(&json!({"intent": "close_task", "task": task_id}));
    assert!(resp.success, "{:?}", resp.error_message);
    assert_eq!(resp.result["dry_run"], json!(true));

    let runway = &resp.result["runway"];
    assert_eq!(runway["open"], json!(false));
    let recipe = &runway["recipe"];
    assert_eq!(recipe["intent"], json!("patch"));
    assert_eq!(recipe["strict_targeting"], json!(true));
    assert_eq!(recipe["expected_target_id"], json!(task_id));
    assert_eq!(recipe["expected_kind"], json!("task"));
    assert_eq!(recipe["expected_revision"], json!(expected_revision));

    let diff = &resp.result["diff"];
    assert_eq!(diff["patch_results"], json!([]));
    let patches = diff["patches"].as_array().unwrap();
    assert_eq!(patches.len(), 1);
    assert_eq!(patches[0]["kind"], json!("task_detail"));
    assert_eq!(patches[0]["strict_targeting"], json!(true));
    assert_eq!(patches[0]["expected_target_id"], json!(task_id));
    assert_eq!(patches[0]["expected_revision"], json!(expected_revision));
    let ops = patches[0]["ops"].as_array().unwrap();
    assert_eq!(ops[0]["field"], json!("success_criteria"));

    // The emitted patch is directly executable through the patch intent.
    let mut patch_request = patches[0].as_object().unwrap().clone();
    patch_request.insert("intent".into(), json!("patch"));
    patch_request.insert("task".into(), json!(task_id));
    let applied = d.process_intent(&Value::Object(patch_request));
    assert!(applied.success, "{:?}", applied.error_message);
    let resume = d.process_intent(&json!({"intent": "resume", "task": task_id}));
    assert!(
        !resume.result["task"]["success_criteria"]
            .as_array()
            .unwrap()
            .is_empty()
    );
}

#[test]
fn test_dry_run_includes_apply_package_when_open() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    close_all_steps(&d, &task_id);
    let resp = d.process_intent(&json!({"intent": "complete", "task": task_id, "status": "ACTIVE"}));
    assert!(resp.success);
    let expected_revision = revision_of(&d, &task_id);

    let resp = d.process_intent(&json!({"intent": "close_task", "task": task_id}));
    assert!(resp.success);
    let apply = &resp.result["diff"]["apply"];
    assert_eq!(apply["atomic"], json!(true));
    assert_eq!(apply["task"], json!(task_id));
    assert_eq!(apply["strict_targeting"], json!(true));
    assert_eq!(apply["expected_target_id"], json!(task_id));
    assert_eq!(apply["expected_kind"], json!("task"));
    assert_eq!(apply["expected_revision"], json!(expected_revision));
    let operations = apply["operations"].as_array().unwrap();
    assert_eq!(operations.last().unwrap()["intent"], json!("complete"));
}

#[test]
fn test_apply_completes_when_ready() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    close_all_steps(&d, &task_id);
    let resp = d.process_intent(&json!({"intent": "complete", "task": task_id, "status": "ACTIVE"}));
    assert!(resp.success);

    let resp = d.process_intent(&json!({"intent": "close_task", "task": task_id, "apply": true}));
    assert!(resp.success, "{:?}", resp.error_message);
    let resume = d.process_intent(&json!({"intent": "resume", "task": task_id}));
    assert_eq!(resume.result["task"]["status"], json!("DONE"));
}

#[test]
fn test_apply_autofills_dod_from_contract_done() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    close_all_steps(&d, &task_id);
    let resp = d.process_intent(&json!({
        "intent": "patch",
        "task": task_id,
        "ops": [
            {"op": "set", "field": "success_criteria", "value": []},
            {"op": "append", "field": "contract_data.done", "value": "All checks green"},
        ],
    }));
    assert!(resp.success, "{:?}", resp.error_message);
    let resp = d.process_intent(&json!({"intent": "complete", "task": task_id, "status": "ACTIVE"}));
    assert!(resp.success);

    let resp = d.process_intent(&json!({"intent": "close_task", "task": task_id, "apply": true}));
    assert!(resp.success, "{:?}", resp.error_message);
    let resume = d.process_intent(&json!({"intent": "resume", "task": task_id}));
    assert_eq!(resume.result["task"]["status"], json!("DONE"));
    assert!(
        resume.result["task"]["success_criteria"]
            .as_array()
            .unwrap()
            .contains(&json!("All checks green"))
    );
}

#[test]
fn test_apply_autofills_placeholder_dod() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    close_all_steps(&d, &task_id);
    let resp = d.process_intent(&json!({
        "intent": "patch",
        "task": task_id,
        "ops": [{"op": "set", "field": "success_criteria", "value": []}],
    }));
    assert!(resp.success);
    let resp = d.process_intent(&json!({"intent": "complete", "task": task_id, "status": "ACTIVE"}));
    assert!(resp.success);

    let resp = d.process_intent(&json!({"intent": "close_task", "task": task_id, "apply": true}));
    assert!(resp.success, "{:?}", resp.error_message);
    let resume = d.process_intent(&json!({"intent": "resume", "task": task_id}));
    assert_eq!(resume.result["task"]["status"], json!("DONE"));
    assert!(
        resume.result["task"]["success_criteria"]
            .as_array()
            .unwrap()
            .contains(&json!("<definition of done>"))
    );
}

#[test]
fn test_apply_blocks_when_runway_closed() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    // The step is still pending: no patch can make this safe.
    let resp = d.process_intent(&json!({"intent": "close_task", "task": task_id, "apply": true}));
    assert!(!resp.success);
    assert_eq!(resp.error_code.as_deref(), Some("RUNWAY_CLOSED"));
    // Atomic safety: no noisy payloads, a single validated recipe suggestion.
    assert!(resp.result.get("diff").is_none());
    assert!(resp.result.get("runway").is_none());
    assert!(resp.result.get("lint").is_none());
    assert_eq!(resp.suggestions.len(), 1);
    let sug = &resp.suggestions[0];
    assert_eq!(sug.validated, Some(true));
    let params = sug.params.as_ref().unwrap();
    assert_eq!(params["strict_targeting"], json!(true));
    assert_eq!(params["expected_target_id"], json!(task_id));
    assert!(params["expected_revision"].is_u64());

    // Nothing mutated.
    let resume = d.process_intent(&json!({"intent": "resume", "task": task_id}));
    assert_ne!(resume.result["task"]["status"], json!("DONE"));
}

#[test]
fn test_preview_keeps_user_patches_before_recipe() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    close_all_steps(&d, &task_id);
    let resp = d.process_intent(&json!({
        "intent": "patch",
        "task": task_id,
        "ops": [{"op": "set", "field": "success_criteria", "value": []}],
    }));
    assert!(resp.success);
    let resp = d.process_intent(&json!({"intent": "complete", "task": task_id, "status": "ACTIVE"}));
    assert!(resp.success);

    let resp = d.process_intent(&json!({
        "intent": "close_task",
        "task": task_id,
        "patches": [{"kind": "task_detail", "ops": [{"op": "append", "field": "next_steps", "value": "x"}]}],
    }));
    assert!(resp.success, "{:?}", resp.error_message);
    let patches = resp.result["diff"]["patches"].as_array().unwrap();
    assert_eq!(patches.len(), 2);
    let fields: Vec<&str> = patches
        .iter()
        .map(|p| p["ops"][0]["field"].as_str().unwrap())
        .collect();
    assert_eq!(fields, vec!["next_steps", "success_criteria"]);
}

#[test]
fn test_apply_lands_user_patches_too() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    close_all_steps(&d, &task_id);
    let resp = d.process_intent(&json!({
        "intent": "patch",
        "task": task_id,
        "ops": [{"op": "set", "field": "success_criteria", "value": []}],
    }));
    assert!(resp.success);
    let resp = d.process_intent(&json!({"intent": "complete", "task": task_id, "status": "ACTIVE"}));
    assert!(resp.success);

    let resp = d.process_intent(&json!({
        "intent": "close_task",
        "task": task_id,
        "apply": true,
        "patches": [{"kind": "task_detail", "ops": [{"op": "append", "field": "next_steps", "value": "x"}]}],
    }));
    assert!(resp.success, "{:?}", resp.error_message);
    let resume = d.process_intent(&json!({"intent": "resume", "task": task_id}));
    assert_eq!(resume.result["task"]["status"], json!("DONE"));
    assert!(
        resume.result["task"]["next_steps"]
            .as_array()
            .unwrap()
            .contains(&json!("x"))
    );
}

#[test]
fn test_apply_rejects_revision_and_target_mismatch() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    close_all_steps(&d, &task_id);
    let resp = d.process_intent(&json!({"intent": "complete", "task": task_id, "status": "ACTIVE"}));
    assert!(resp.success);
    let revision = revision_of(&d, &task_id);

    let resp = d.process_intent(&json!({
        "intent": "close_task",
        "task": task_id,
        "apply": true,
        "expected_revision": revision + 1,
    }));
    assert!(!resp.success);
    assert_eq!(resp.error_code.as_deref(), Some("REVISION_MISMATCH"));

    let resp = d.process_intent(&json!({
        "intent": "close_task",
        "task": task_id,
        "apply": true,
        "strict_targeting": true,
        "expected_target_id": "TASK-999",
        "expected_kind": "task",
    }));
    assert!(!resp.success);
    assert_eq!(resp.error_code.as_deref(), Some("EXPECTED_TARGET_MISMATCH"));

    let resume = d.process_intent(&json!({"intent": "resume", "task": task_id}));
    assert_ne!(resume.result["task"]["status"], json!("DONE"));
}

#[test]
fn test_dry_run_records_audit_not_ops() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    let before_ops = d
        .process_intent(&json!({"intent": "history", "limit": 100}))
        .result["operations"]
        .as_array()
        .unwrap()
        .len();

    let resp = d.process_intent(&json!({"intent": "close_task", "task": task_id}));
    assert!(resp.success);
    assert!(resp.meta.get("audit_operation_id").is_some());
    assert!(resp.meta.get("operation_id").is_none());

    let after_ops = d
        .process_intent(&json!({"intent": "history", "limit": 100}))
        .result["operations"]
        .as_array()
        .unwrap()
        .len();
    assert_eq!(before_ops, after_ops);

    let audit = d.process_intent(&json!({"intent": "delta", "stream": "audit"}));
    assert!(audit.success);
    let ops = audit.result["operations"].as_array().unwrap();
    assert!(ops.iter().any(|op| op["intent"] == json!("close_task")));
    assert!(ops.iter().all(|op| op["stream"] == json!("audit")));
}
