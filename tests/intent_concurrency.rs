//! Optimistic concurrency and safe-write guards.

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
        "steps": [{"title": "Step title long enough", "success_criteria": ["c"], "tests": ["t"]}],
    }));
    resp.result["task_id"].as_str().unwrap().to_string()
}

fn current_revision(d: &Dispatcher, task_id: &str) -> u64 {
    let resp = d.process_intent(&json!({"intent": "resume", "task": task_id}));
    resp.result["task"]["revision"].as_u64().unwrap()
}

#[test]
fn test_revision_mismatch_rejected_without_write() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    let revision = current_revision(&d, &task_id);

    let resp = d.process_intent(&json!({
        "intent": "patch",
        "task": task_id,
        "expected_revision": revision + 1,
        "ops": [{"op": "set", "field": "description", "value": "x"}],
    }));
    assert!(!resp.success);
    assert_eq!(resp.error_code.as_deref(), Some("REVISION_MISMATCH"));
    assert_eq!(resp.result["expected_revision"], json!(revision + 1));
    assert_eq!(resp.result["current_revision"], json!(revision));
    assert!(resp.suggestions.iter().any(|s| s.action == "resume"));

    // No write happened: revision and description unchanged.
    assert_eq!(current_revision(&d, &task_id), revision);
    let resume = d.process_intent(&json!({"intent": "resume", "task": task_id}));
    assert!(resume.result["task"].get("description").is_none());
}

#[test]
fn test_matching_expected_revision_allows_write() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    let revision = current_revision(&d, &task_id);

    let resp = d.process_intent(&json!({
        "intent": "patch",
        "task": task_id,
        "expected_revision": revision,
        "ops": [{"op": "set", "field": "description", "value": "x"}],
    }));
    assert!(resp.success, "{:?}", resp.error_message);
    assert_eq!(current_revision(&d, &task_id), revision + 1);
}

#[test]
fn test_expected_revision_must_be_integer() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    for bad in [json!(true), json!("three"), json!(-1)] {
        let resp = d.process_intent(&json!({
            "intent": "patch",
            "task": task_id,
            "expected_revision": bad,
            "ops": [{"op": "set", "field": "description", "value": "x"}],
        }));
        assert!(!resp.success);
        assert_eq!(resp.error_code.as_deref(), Some("INVALID_EXPECTED_REVISION"));
    }
}

#[test]
fn test_expected_version_alias() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    let revision = current_revision(&d, &task_id);
    let resp = d.process_intent(&json!({
        "intent": "patch",
        "task": task_id,
        "expected_version": revision + 5,
        "ops": [{"op": "set", "field": "description", "value": "x"}],
    }));
    assert_eq!(resp.error_code.as_deref(), Some("REVISION_MISMATCH"));
}

#[test]
fn test_expected_target_mismatch_fails_fast() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    let resp = d.process_intent(&json!({
        "intent": "patch",
        "task": task_id,
        "expected_target_id": "TASK-999",
        "ops": [{"op": "set", "field": "description", "value": "x"}],
    }));
    assert!(!resp.success);
    assert_eq!(resp.error_code.as_deref(), Some("EXPECTED_TARGET_MISMATCH"));
    assert_eq!(resp.result["resolved_target_id"], json!(task_id));
}

#[test]
fn test_expected_kind_mismatch_fails_fast() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    let resp = d.process_intent(&json!({
        "intent": "patch",
        "task": task_id,
        "expected_kind": "plan",
        "ops": [{"op": "set", "field": "description", "value": "x"}],
    }));
    assert!(!resp.success);
    assert_eq!(resp.error_code.as_deref(), Some("EXPECTED_TARGET_MISMATCH"));
}

#[test]
fn test_expected_target_alias_equality_rule() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);

    // Alias alone fills expected_target_id.
    let resp = d.process_intent(&json!({
        "intent": "patch",
        "task": task_id,
        "expected_target": task_id,
        "ops": [{"op": "set", "field": "description", "value": "x"}],
    }));
    assert!(resp.success, "{:?}", resp.error_message);

    // Conflicting alias and id fail before anything else.
    let resp = d.process_intent(&json!({
        "intent": "patch",
        "task": task_id,
        "expected_target": "TASK-111",
        "expected_target_id": "TASK-222",
        "ops": [{"op": "set", "field": "description", "value": "x"}],
    }));
    assert!(!resp.success);
    assert_eq!(resp.error_code.as_deref(), Some("EXPECTED_TARGET_MISMATCH"));
}

#[test]
fn test_strict_targeting_with_focus_requires_expected_target_id() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    let resp = d.process_intent(&json!({"intent": "focus_set", "task": task_id}));
    assert!(resp.success);

    let resp = d.process_intent(&json!({
        "intent": "note",
        "path": "s:0",
        "note": "x",
        "strict_targeting": true,
    }));
    assert!(!resp.success);
    assert_eq!(
        resp.error_code.as_deref(),
        Some("STRICT_TARGETING_REQUIRES_EXPECTED_TARGET_ID")
    );

    // With the expected id it goes through.
    let resp = d.process_intent(&json!({
        "intent": "note",
        "path": "s:0",
        "note": "x",
        "strict_targeting": true,
        "expected_target_id": task_id,
    }));
    assert!(resp.success, "{:?}", resp.error_message);
}

#[test]
fn test_auto_strict_writes_on_multiple_active_items() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    // A second ACTIVE task plus the first marked ACTIVE: ambient targeting
    // becomes dangerous, so the dispatcher hardens focus writes.
    let resp = d.process_intent(&json!({"intent": "create", "kind": "task", "title": "T2", "parent": "PLAN-001"}));
    let other_id = resp.result["task_id"].as_str().unwrap().to_string();
    for id in [&task_id, &other_id] {
        let resp = d.process_intent(&json!({"intent": "complete", "task": id, "status": "ACTIVE"}));
        assert!(resp.success, "{:?}", resp.error_message);
    }
    let resp = d.process_intent(&json!({"intent": "focus_set", "task": task_id}));
    assert!(resp.success);

    let resp = d.process_intent(&json!({"intent": "note", "path": "s:0", "note": "x"}));
    assert!(!resp.success);
    assert_eq!(
        resp.error_code.as_deref(),
        Some("STRICT_TARGETING_REQUIRES_EXPECTED_TARGET_ID")
    );
    assert_eq!(resp.meta.get("strict_writes_auto"), Some(&json!(true)));
}

#[test]
fn test_explicit_target_skips_strict_requirement() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    let resp = d.process_intent(&json!({
        "intent": "note",
        "task": task_id,
        "path": "s:0",
        "note": "x",
        "strict_targeting": true,
    }));
    assert!(resp.success, "{:?}", resp.error_message);
}
