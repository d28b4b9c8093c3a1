//! Repository behavior through the public intent surface plus direct
//! repository checks: domains, moves, path safety, signatures.

use serde_json::json;
use taskplane::Dispatcher;
use taskplane::core::item::{Item, ItemKind};
use taskplane::core::repo::Repository;
use tempfile::{TempDir, tempdir};

fn engine() -> (TempDir, Dispatcher) {
    let tmp = tempdir().unwrap();
    let dispatcher = Dispatcher::with_project_root(tmp.path(), tmp.path()).unwrap();
    (tmp, dispatcher)
}

#[test]
fn test_ids_are_sequential_per_prefix() {
    let (_tmp, d) = engine();
    let a = d.process_intent(&json!({"intent": "create", "kind": "plan", "title": "P1"}));
    let b = d.process_intent(&json!({"intent": "create", "kind": "plan", "title": "P2"}));
    assert_eq!(a.result["plan_id"], json!("PLAN-001"));
    assert_eq!(b.result["plan_id"], json!("PLAN-002"));
    let t = d.process_intent(&json!({"intent": "create", "kind": "task", "title": "T", "parent": "PLAN-001"}));
    assert_eq!(t.result["task_id"], json!("TASK-001"));
}

#[test]
fn test_new_domain_moves_the_file() {
    let (tmp, d) = engine();
    let resp = d.process_intent(&json!({"intent": "create", "kind": "plan", "title": "P"}));
    let plan_id = resp.result["plan_id"].as_str().unwrap().to_string();
    let resp = d.process_intent(&json!({"intent": "create", "kind": "task", "title": "T", "parent": plan_id}));
    let task_id = resp.result["task_id"].as_str().unwrap().to_string();

    let resp = d.process_intent(&json!({"intent": "edit", "task": task_id, "new_domain": "backend/api"}));
    assert!(resp.success, "{:?}", resp.error_message);

    assert!(!tmp.path().join(format!("{}.task", task_id)).exists());
    assert!(
        tmp.path()
            .join("backend/api")
            .join(format!("{}.task", task_id))
            .exists()
    );

    // The item is still reachable without naming the domain.
    let resume = d.process_intent(&json!({"intent": "resume", "task": task_id}));
    assert!(resume.success);
    assert_eq!(resume.result["task"]["domain"], json!("backend/api"));
}

#[test]
fn test_edit_depends_on_records_added_and_resolved_events() {
    let (_tmp, d) = engine();
    let resp = d.process_intent(&json!({"intent": "create", "kind": "plan", "title": "P"}));
    let plan_id = resp.result["plan_id"].as_str().unwrap().to_string();
    let resp = d.process_intent(&json!({"intent": "create", "kind": "task", "title": "A", "parent": plan_id}));
    let task_a = resp.result["task_id"].as_str().unwrap().to_string();
    let resp = d.process_intent(&json!({"intent": "create", "kind": "task", "title": "B", "parent": plan_id}));
    let task_b = resp.result["task_id"].as_str().unwrap().to_string();

    let resp = d.process_intent(&json!({"intent": "edit", "task": task_a, "depends_on": [task_b]}));
    assert!(resp.success, "{:?}", resp.error_message);
    let resp = d.process_intent(&json!({"intent": "edit", "task": task_a, "depends_on": []}));
    assert!(resp.success, "{:?}", resp.error_message);

    let resume = d.process_intent(&json!({"intent": "resume", "task": task_a}));
    let timeline = resume.result["timeline"].as_array().unwrap();
    let added: Vec<_> = timeline
        .iter()
        .filter(|e| e["event_type"] == json!("dependency_added"))
        .collect();
    let resolved: Vec<_> = timeline
        .iter()
        .filter(|e| e["event_type"] == json!("dependency_resolved"))
        .collect();
    assert_eq!(added.len(), 1);
    assert_eq!(added[0]["data"]["depends_on"], json!(task_b));
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0]["data"]["depends_on"], json!(task_b));
    assert_eq!(resolved[0]["actor"], json!("system"));

    // The same discipline applies to patch edits of depends_on.
    let resp = d.process_intent(&json!({
        "intent": "patch", "task": task_a,
        "ops": [{"op": "append", "field": "depends_on", "value": task_b}],
    }));
    assert!(resp.success, "{:?}", resp.error_message);
    let resp = d.process_intent(&json!({
        "intent": "patch", "task": task_a,
        "ops": [{"op": "remove", "field": "depends_on", "value": task_b}],
    }));
    assert!(resp.success, "{:?}", resp.error_message);
    let resume = d.process_intent(&json!({"intent": "resume", "task": task_a}));
    let timeline = resume.result["timeline"].as_array().unwrap();
    assert_eq!(
        timeline
            .iter()
            .filter(|e| e["event_type"] == json!("dependency_resolved"))
            .count(),
        2
    );
}

#[test]
fn test_path_traversal_rejected_at_the_api() {
    let (_tmp, d) = engine();
    for bad in ["../evil", "a/b", "a\\b", ".."] {
        let resp = d.process_intent(&json!({"intent": "resume", "task": bad}));
        assert!(!resp.success, "{} accepted", bad);
        assert_eq!(resp.error_code.as_deref(), Some("INVALID_ID"), "{}", bad);
    }
    let resp = d.process_intent(&json!({"intent": "create", "kind": "plan", "title": "P"}));
    let plan_id = resp.result["plan_id"].as_str().unwrap().to_string();
    let resp = d.process_intent(&json!({"intent": "create", "kind": "task", "title": "T", "parent": plan_id}));
    let task_id = resp.result["task_id"].as_str().unwrap().to_string();
    for bad_domain in ["../up", "/abs", "a\\b"] {
        let resp = d.process_intent(&json!({"intent": "edit", "task": task_id, "new_domain": bad_domain}));
        assert!(!resp.success, "{} accepted", bad_domain);
    }
}

#[test]
fn test_engine_never_writes_outside_root() {
    let (tmp, d) = engine();
    let outside = tmp.path().parent().unwrap();
    let before: Vec<_> = std::fs::read_dir(outside).unwrap().flatten().map(|e| e.path()).collect();
    let resp = d.process_intent(&json!({"intent": "resume", "task": "../../etc/passwd"}));
    assert!(!resp.success);
    let after: Vec<_> = std::fs::read_dir(outside).unwrap().flatten().map(|e| e.path()).collect();
    assert_eq!(before.len(), after.len());
}

#[test]
fn test_signature_changes_after_mutation() {
    let (tmp, d) = engine();
    let resp = d.process_intent(&json!({"intent": "create", "kind": "plan", "title": "P"}));
    assert!(resp.success);
    let repo = Repository::new(tmp.path()).unwrap();
    let sig_before = repo.compute_signature();
    let resp = d.process_intent(&json!({"intent": "create", "kind": "task", "title": "T", "parent": "PLAN-001"}));
    assert!(resp.success);
    let sig_after = repo.compute_signature();
    assert_ne!(sig_before, sig_after);
}

#[test]
fn test_move_and_delete_glob() {
    let tmp = tempdir().unwrap();
    let repo = Repository::new(tmp.path()).unwrap();
    for idx in 1..=3 {
        let mut item = Item::new(&format!("TASK-{:03}", idx), ItemKind::Task, "t");
        repo.save(&mut item).unwrap();
    }
    let moved = repo.move_glob("TASK-*.task", "archive").unwrap();
    assert_eq!(moved, 3);
    assert!(tmp.path().join("archive/TASK-001.task").exists());

    let removed = repo.delete_glob("archive/TASK-00?.task").unwrap();
    assert_eq!(removed, 3);
    assert!(repo.list("").unwrap().is_empty());
}

#[test]
fn test_clean_filtered_by_tag_and_status() {
    let tmp = tempdir().unwrap();
    let repo = Repository::new(tmp.path()).unwrap();
    let mut tagged = Item::new("TASK-001", ItemKind::Task, "t");
    tagged.tags = vec!["wip".into()];
    repo.save(&mut tagged).unwrap();
    let mut other = Item::new("TASK-002", ItemKind::Task, "t");
    repo.save(&mut other).unwrap();

    let (matched, removed) = repo.clean_filtered("wip", "").unwrap();
    assert_eq!(matched, vec!["TASK-001".to_string()]);
    assert_eq!(removed, 1);
    assert_eq!(repo.list("").unwrap().len(), 1);
}

#[test]
fn test_delete_intent_removes_item_and_step() {
    let (_tmp, d) = engine();
    let resp = d.process_intent(&json!({"intent": "create", "kind": "plan", "title": "P"}));
    let plan_id = resp.result["plan_id"].as_str().unwrap().to_string();
    let resp = d.process_intent(&json!({
        "intent": "create", "kind": "task", "title": "T", "parent": plan_id,
        "steps": [
            {"title": "First step title long enough", "success_criteria": ["c"]},
            {"title": "Second step title long enough", "success_criteria": ["c"]},
        ],
    }));
    let task_id = resp.result["task_id"].as_str().unwrap().to_string();

    // Delete one step by path.
    let resp = d.process_intent(&json!({"intent": "delete", "task": task_id, "path": "s:0"}));
    assert!(resp.success, "{:?}", resp.error_message);
    assert_eq!(
        resp.result["deleted_step"]["title"],
        json!("First step title long enough")
    );
    let resume = d.process_intent(&json!({"intent": "resume", "task": task_id}));
    assert_eq!(resume.result["task"]["steps"].as_array().unwrap().len(), 1);

    // Delete the whole item.
    let resp = d.process_intent(&json!({"intent": "delete", "task": task_id}));
    assert!(resp.success);
    assert_eq!(resp.result["deleted"], json!(true));
    let resume = d.process_intent(&json!({"intent": "resume", "task": task_id}));
    assert!(!resume.success);
}

#[test]
fn test_context_counts_filters_and_pagination() {
    let (_tmp, d) = engine();
    let resp = d.process_intent(&json!({"intent": "create", "kind": "plan", "title": "P"}));
    let plan_id = resp.result["plan_id"].as_str().unwrap().to_string();
    for i in 0..5 {
        let resp = d.process_intent(&json!({
            "intent": "create", "kind": "task", "title": format!("T{}", i), "parent": plan_id,
        }));
        assert!(resp.success);
    }
    let resp = d.process_intent(&json!({"intent": "complete", "task": "TASK-001", "status": "ACTIVE"}));
    assert!(resp.success);

    let ctx = d.process_intent(&json!({"intent": "context"}));
    assert_eq!(ctx.result["counts"]["tasks"], json!(5));
    assert_eq!(ctx.result["by_status"]["ACTIVE"], json!(1));
    assert!(ctx.result.get("tasks").is_none());

    let ctx = d.process_intent(&json!({
        "intent": "context",
        "include_all": true,
        "tasks_status": "ACTIVE",
    }));
    assert_eq!(ctx.result["filtered_counts"]["tasks"], json!(1));
    assert_eq!(ctx.result["tasks"].as_array().unwrap().len(), 1);

    let ctx = d.process_intent(&json!({
        "intent": "context",
        "include_all": true,
        "tasks_limit": 2,
        "tasks_cursor": 2,
    }));
    let page = ctx.result["tasks"].as_array().unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(ctx.result["tasks_pagination"]["next_cursor"], json!("4"));
    assert_eq!(ctx.result["tasks_pagination"]["total"], json!(5));
}
