//! Focus fallback: ambient targeting with compatibility rules.

use serde_json::json;
use taskplane::Dispatcher;
use tempfile::{TempDir, tempdir};

fn engine() -> (TempDir, Dispatcher) {
    let tmp = tempdir().unwrap();
    let dispatcher = Dispatcher::with_project_root(tmp.path(), tmp.path()).unwrap();
    (tmp, dispatcher)
}

fn seed(d: &Dispatcher) -> (String, String) {
    let resp = d.process_intent(&json!({"intent": "create", "kind": "plan", "title": "P"}));
    let plan_id = resp.result["plan_id"].as_str().unwrap().to_string();
    let resp = d.process_intent(&json!({
        "intent": "create", "kind": "task", "title": "T", "parent": plan_id,
        "steps": [{"title": "Step title long enough", "success_criteria": ["c"], "tests": ["t"]}],
    }));
    let task_id = resp.result["task_id"].as_str().unwrap().to_string();
    (plan_id, task_id)
}

#[test]
fn test_missing_target_without_focus() {
    let (_tmp, d) = engine();
    seed(&d);
    let resp = d.process_intent(&json!({"intent": "note", "path": "s:0", "note": "x"}));
    assert!(!resp.success);
    assert_eq!(resp.error_code.as_deref(), Some("MISSING_TARGET"));
    // Standard unblock suggestions: context + focus_get + focus_set candidates.
    let actions: Vec<&str> = resp.suggestions.iter().map(|s| s.action.as_str()).collect();
    assert!(actions.contains(&"context"));
    assert!(actions.contains(&"focus_get"));
    assert!(actions.contains(&"focus_set"));
    assert_eq!(
        resp.context["target_resolution"]["source"],
        json!("missing")
    );
}

#[test]
fn test_focus_set_get_clear_roundtrip() {
    let (_tmp, d) = engine();
    let (_, task_id) = seed(&d);
    let resp = d.process_intent(&json!({"intent": "focus_set", "task": task_id}));
    assert!(resp.success);
    let resp = d.process_intent(&json!({"intent": "focus_get"}));
    assert_eq!(resp.result["task"], json!(task_id));
    let resp = d.process_intent(&json!({"intent": "focus_clear"}));
    assert_eq!(resp.result["cleared"], json!(true));
    let resp = d.process_intent(&json!({"intent": "focus_get"}));
    assert!(resp.result["task"].is_null());
}

#[test]
fn test_focus_set_validates_existence() {
    let (_tmp, d) = engine();
    seed(&d);
    let resp = d.process_intent(&json!({"intent": "focus_set", "task": "TASK-404"}));
    assert!(!resp.success);
    assert_eq!(resp.error_code.as_deref(), Some("NOT_FOUND"));
}

#[test]
fn test_task_intents_fill_target_from_task_focus() {
    let (_tmp, d) = engine();
    let (_, task_id) = seed(&d);
    assert!(d.process_intent(&json!({"intent": "focus_set", "task": task_id})).success);

    let resp = d.process_intent(&json!({"intent": "note", "path": "s:0", "note": "via focus"}));
    assert!(resp.success, "{:?}", resp.error_message);
    assert_eq!(resp.result["task_id"], json!(task_id));
    assert_eq!(resp.context["target_resolution"]["source"], json!("focus"));
}

#[test]
fn test_plan_intents_reject_task_focus_without_plan_parent() {
    let (_tmp, d) = engine();
    // A bare plan-less task cannot anchor plan intents.
    let resp = d.process_intent(&json!({"intent": "create", "kind": "plan", "title": "P"}));
    let plan_id = resp.result["plan_id"].as_str().unwrap().to_string();
    assert!(d.process_intent(&json!({"intent": "focus_set", "task": plan_id})).success);

    // Plan focus works directly for contract.
    let resp = d.process_intent(&json!({"intent": "contract", "current": "the deal"}));
    assert!(resp.success, "{:?}", resp.error_message);
    assert_eq!(resp.context["target_resolution"]["source"], json!("focus"));
}

#[test]
fn test_plan_intents_derive_parent_from_task_focus() {
    let (_tmp, d) = engine();
    let (plan_id, task_id) = seed(&d);
    assert!(d.process_intent(&json!({"intent": "focus_set", "task": task_id})).success);

    let resp = d.process_intent(&json!({"intent": "contract", "current": "inherited"}));
    assert!(resp.success, "{:?}", resp.error_message);
    assert_eq!(
        resp.context["target_resolution"]["source"],
        json!("focus_task_parent")
    );
    assert_eq!(resp.context["target_resolution"]["plan"], json!(plan_id));
    let resume = d.process_intent(&json!({"intent": "resume", "plan": plan_id}));
    assert_eq!(resume.result["plan"]["contract"], json!("inherited"));
}

#[test]
fn test_task_only_intents_reject_plan_focus() {
    let (_tmp, d) = engine();
    let (plan_id, _) = seed(&d);
    assert!(d.process_intent(&json!({"intent": "focus_set", "task": plan_id})).success);

    let resp = d.process_intent(&json!({"intent": "note", "path": "s:0", "note": "x"}));
    assert!(!resp.success);
    assert_eq!(resp.error_code.as_deref(), Some("FOCUS_INCOMPATIBLE"));
    assert_eq!(
        resp.context["target_resolution"]["source"],
        json!("focus_incompatible")
    );
}

#[test]
fn test_item_level_intents_accept_any_focus() {
    let (_tmp, d) = engine();
    let (plan_id, _) = seed(&d);
    assert!(d.process_intent(&json!({"intent": "focus_set", "task": plan_id})).success);
    let resp = d.process_intent(&json!({
        "intent": "edit",
        "description": "edited through focus",
    }));
    assert!(resp.success, "{:?}", resp.error_message);
    let resume = d.process_intent(&json!({"intent": "resume", "plan": plan_id}));
    assert_eq!(resume.result["plan"]["description"], json!("edited through focus"));
}

#[test]
fn test_explicit_target_beats_focus() {
    let (_tmp, d) = engine();
    let (_, task_id) = seed(&d);
    let resp = d.process_intent(&json!({"intent": "create", "kind": "task", "title": "T2", "parent": "PLAN-001"}));
    let other_id = resp.result["task_id"].as_str().unwrap().to_string();
    assert!(d.process_intent(&json!({"intent": "focus_set", "task": task_id})).success);

    let resp = d.process_intent(&json!({"intent": "edit", "task": other_id, "description": "explicit"}));
    assert!(resp.success);
    assert_eq!(resp.context["target_resolution"]["source"], json!("explicit"));
    let resume = d.process_intent(&json!({"intent": "resume", "task": other_id}));
    assert_eq!(resume.result["task"]["description"], json!("explicit"));
    let resume = d.process_intent(&json!({"intent": "resume", "task": task_id}));
    assert!(resume.result["task"].get("description").is_none());
}

#[test]
fn test_reads_follow_focus_too() {
    let (_tmp, d) = engine();
    let (_, task_id) = seed(&d);
    assert!(d.process_intent(&json!({"intent": "focus_set", "task": task_id})).success);
    let resp = d.process_intent(&json!({"intent": "radar"}));
    assert!(resp.success, "{:?}", resp.error_message);
    assert_eq!(resp.result["focus"]["id"], json!(task_id));
    let resp = d.process_intent(&json!({"intent": "mirror"}));
    assert!(resp.success);
    assert_eq!(resp.result["scope"]["task_id"], json!(task_id));
}
