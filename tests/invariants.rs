//! Property-style universal invariants: revision monotonicity, redaction,
//! artifact dedup, readiness equivalence, undo/redo roundtrip.

use proptest::prelude::*;
use serde_json::json;
use taskplane::Dispatcher;
use taskplane::core::artifacts::write_artifact;
use taskplane::core::evidence::{canonical_json, redact_value};
use tempfile::tempdir;

fn seed(d: &Dispatcher) -> String {
    let resp = d.process_intent(&json!({"intent": "create", "kind": "plan", "title": "P"}));
    let plan_id = resp.result["plan_id"].as_str().unwrap().to_string();
    let resp = d.process_intent(&json!({
        "intent": "create", "kind": "task", "title": "T", "parent": plan_id,
        "steps": [{"title": "Step title long enough", "success_criteria": ["c"], "tests": ["t"]}],
    }));
    resp.result["task_id"].as_str().unwrap().to_string()
}

fn revision_of(d: &Dispatcher, task_id: &str) -> u64 {
    d.process_intent(&json!({"intent": "resume", "task": task_id})).result["task"]["revision"]
        .as_u64()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Every successful persisted mutation bumps revision by exactly one.
    #[test]
    fn prop_revision_monotonic(values in proptest::collection::vec("[a-z]{1,12}", 1..8)) {
        let tmp = tempdir().unwrap();
        let d = Dispatcher::with_project_root(tmp.path(), tmp.path()).unwrap();
        let task_id = seed(&d);
        let mut last = revision_of(&d, &task_id);
        for value in values {
            let resp = d.process_intent(&json!({
                "intent": "patch", "task": task_id,
                "ops": [{"op": "set", "field": "description", "value": value}],
            }));
            prop_assert!(resp.success);
            let now = revision_of(&d, &task_id);
            prop_assert_eq!(now, last + 1);
            last = now;
        }
    }

    /// Redacted evidence payloads never contain secret-shaped substrings.
    #[test]
    fn prop_redaction_removes_patterns(token in "[A-Za-z0-9]{24,40}", extra in "[a-z ]{0,30}") {
        let payload = json!({
            "stdout": format!("{} token={} tail", extra, format_args!("ghp_{}", token)),
            "header": format!("Authorization: Bearer sk-{}", token),
            "api_key": token,
        });
        let redacted = canonical_json(&redact_value(&payload));
        let api_key_field = format!("\"api_key\":\"{}\"", token);
        prop_assert!(!redacted.contains("ghp_"));
        prop_assert!(!redacted.contains("sk-"));
        prop_assert!(!redacted.contains(&api_key_field));
        prop_assert!(redacted.contains("<redacted>"));
    }

    /// Content addressing: the same bytes always land at the same uri, once.
    #[test]
    fn prop_artifact_dedup(content in proptest::collection::vec(any::<u8>(), 0..512)) {
        let tmp = tempdir().unwrap();
        let (uri_a, size_a, sha_a) = write_artifact(tmp.path(), &content, "bin").unwrap();
        let (uri_b, size_b, sha_b) = write_artifact(tmp.path(), &content, "bin").unwrap();
        prop_assert_eq!(uri_a, uri_b);
        prop_assert_eq!(size_a, content.len());
        prop_assert_eq!(size_b, content.len());
        prop_assert_eq!(sha_a, sha_b);
        let count = std::fs::read_dir(tmp.path().join(".artifacts")).unwrap().count();
        prop_assert_eq!(count, 1);
    }

    /// Step readiness is exactly "not blocked, required checkpoints satisfied,
    /// embedded tasks done".
    #[test]
    fn prop_readiness_equivalence(
        blocked in any::<bool>(),
        criteria in any::<bool>(),
        tests_confirmed in any::<bool>(),
        tests_empty in any::<bool>(),
    ) {
        use taskplane::core::step::Step;
        let tests: Vec<String> = if tests_empty { vec![] } else { vec!["t".to_string()] };
        let mut step = Step::new("prop step", &["c".to_string()], &tests, &[]).unwrap();
        step.blocked = blocked;
        step.checkpoints.criteria.confirmed = criteria;
        step.checkpoints.tests.confirmed = tests_confirmed;

        let tests_ok = tests_confirmed || tests_empty;
        let expected = !blocked && criteria && tests_ok;
        prop_assert_eq!(step.ready_for_completion(), expected);
    }
}

/// Undo then redo is identity on the observable `.task` file.
#[test]
fn test_undo_redo_identity_on_task_file() {
    let tmp = tempdir().unwrap();
    let d = Dispatcher::with_project_root(tmp.path(), tmp.path()).unwrap();
    let task_id = seed(&d);
    let resp = d.process_intent(&json!({
        "intent": "patch", "task": task_id,
        "ops": [{"op": "set", "field": "description", "value": "payload"}],
    }));
    assert!(resp.success);

    let file = tmp.path().join(format!("{}.task", task_id));
    let before = std::fs::read_to_string(&file).unwrap();
    assert!(d.process_intent(&json!({"intent": "undo"})).success);
    assert!(d.process_intent(&json!({"intent": "redo"})).success);
    let after = std::fs::read_to_string(&file).unwrap();
    assert_eq!(before, after);
}

/// The ops stream stays bounded and snapshots stay bijective with it.
#[test]
fn test_history_bound_and_snapshot_bijection() {
    let tmp = tempdir().unwrap();
    let d = Dispatcher::with_project_root(tmp.path(), tmp.path()).unwrap();
    let task_id = seed(&d);
    for i in 0..110 {
        let resp = d.process_intent(&json!({
            "intent": "patch", "task": task_id,
            "ops": [{"op": "set", "field": "description", "value": format!("v{}", i)}],
        }));
        assert!(resp.success);
    }
    let history = d.process_intent(&json!({"intent": "history", "limit": 200}));
    let ops = history.result["operations"].as_array().unwrap();
    assert_eq!(ops.len(), 100);

    let referenced: std::collections::HashSet<String> = ops
        .iter()
        .flat_map(|op| {
            ["snapshot_id", "after_snapshot_id"]
                .iter()
                .filter_map(|k| op[*k].as_str().map(String::from))
                .collect::<Vec<_>>()
        })
        .collect();
    let mut on_disk = std::collections::HashSet::new();
    for entry in std::fs::read_dir(tmp.path().join(".snapshots")).unwrap().flatten() {
        on_disk.insert(
            entry
                .path()
                .file_stem()
                .unwrap()
                .to_string_lossy()
                .to_string(),
        );
    }
    // Bijection both ways: retained ops reference existing snapshots, and no
    // orphan snapshot files survive garbage collection.
    for snapshot in &referenced {
        assert!(on_disk.contains(snapshot), "missing snapshot {}", snapshot);
    }
    for snapshot in &on_disk {
        assert!(referenced.contains(snapshot), "orphan snapshot {}", snapshot);
    }
}
