//! Evidence capture: redaction, content-addressed artifacts, digest dedup,
//! and checkpoint evidence refs.

use serde_json::json;
use std::fs;
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

fn artifact_files(root: &std::path::Path) -> Vec<std::path::PathBuf> {
    let dir = root.join(".artifacts");
    if !dir.exists() {
        return Vec::new();
    }
    let mut files: Vec<_> = fs::read_dir(dir).unwrap().flatten().map(|e| e.path()).collect();
    files.sort();
    files
}

#[test]
fn test_cmd_output_redaction_and_dedup() {
    let (tmp, d) = engine();
    let task_id = seed_task(&d);
    let secret = "ghp_AAAABBBBCCCCDDDDEEEEFFFF0000";

    let capture = json!({
        "intent": "evidence_capture",
        "task": task_id,
        "path": "s:0",
        "artifacts": [{
            "kind": "cmd_output",
            "command": format!("curl -H 'Authorization: Bearer {}'", secret),
            "stdout": format!("token={}", secret),
            "exit_code": 0,
        }],
    });
    let resp = d.process_intent(&capture);
    assert!(resp.success, "{:?}", resp.error_message);
    let written = resp.result["captured"]["artifacts_written"].as_array().unwrap();
    assert_eq!(written.len(), 1);
    let sha = written[0]["sha256"].as_str().unwrap().to_string();

    // The stored blob is redacted: no raw secret anywhere.
    let files = artifact_files(tmp.path());
    assert_eq!(files.len(), 1);
    let content = fs::read_to_string(&files[0]).unwrap();
    assert!(!content.contains("ghp_"), "secret leaked into artifact");
    assert!(content.contains("<redacted>"));

    // Repeating the call is idempotent: same digest, one file, no new attachment.
    let resp = d.process_intent(&capture);
    assert!(resp.success);
    let written_again = resp.result["captured"]["artifacts_written"].as_array().unwrap();
    assert_eq!(written_again[0]["sha256"].as_str().unwrap(), sha);
    assert!(resp.result["captured"]["attachments_added"].as_array().unwrap().is_empty());
    assert_eq!(artifact_files(tmp.path()).len(), 1);

    let resume = d.process_intent(&json!({"intent": "resume", "task": task_id}));
    let attachments = resume.result["task"]["steps"][0]["attachments"].as_array().unwrap();
    assert_eq!(attachments.len(), 1);
}

#[test]
fn test_diff_artifact_stored_as_patch_blob() {
    let (tmp, d) = engine();
    let task_id = seed_task(&d);
    let resp = d.process_intent(&json!({
        "intent": "evidence_capture",
        "task": task_id,
        "path": "s:0",
        "artifacts": [{"kind": "diff", "diff": "--- a/x\n+++ b/x\n-old password=supersecret\n+new"}],
    }));
    assert!(resp.success, "{:?}", resp.error_message);
    let written = resp.result["captured"]["artifacts_written"].as_array().unwrap();
    assert!(written[0]["uri"].as_str().unwrap().ends_with(".patch"));
    let files = artifact_files(tmp.path());
    let content = fs::read_to_string(&files[0]).unwrap();
    assert!(content.contains("password=<redacted>"));
}

#[test]
fn test_url_artifact_has_no_blob() {
    let (tmp, d) = engine();
    let task_id = seed_task(&d);
    let resp = d.process_intent(&json!({
        "intent": "evidence_capture",
        "task": task_id,
        "path": "s:0",
        "artifacts": [{"kind": "url", "url": "https://ci.example/run/1?token=abcsecret"}],
    }));
    assert!(resp.success, "{:?}", resp.error_message);
    assert!(resp.result["captured"]["artifacts_written"].as_array().unwrap().is_empty());
    assert!(artifact_files(tmp.path()).is_empty());
    let att = &resp.result["captured"]["attachments_added"][0];
    assert!(att["external_uri"].as_str().unwrap().contains("token=<redacted>"));
}

#[test]
fn test_unknown_artifact_kind_rejected() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    let resp = d.process_intent(&json!({
        "intent": "evidence_capture",
        "task": task_id,
        "path": "s:0",
        "artifacts": [{"kind": "screenshot"}],
    }));
    assert!(!resp.success);
    assert_eq!(resp.error_code.as_deref(), Some("INVALID_ARTIFACT_KIND"));
}

#[test]
fn test_evidence_capture_requires_some_evidence() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    let resp = d.process_intent(&json!({
        "intent": "evidence_capture",
        "task": task_id,
        "path": "s:0",
    }));
    assert!(!resp.success);
    assert_eq!(resp.error_code.as_deref(), Some("MISSING_EVIDENCE"));
}

#[test]
fn test_too_many_artifacts_rejected() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    let artifacts: Vec<_> = (0..21)
        .map(|i| json!({"kind": "url", "url": format!("https://x.test/{}", i)}))
        .collect();
    let resp = d.process_intent(&json!({
        "intent": "evidence_capture",
        "task": task_id,
        "path": "s:0",
        "artifacts": artifacts,
    }));
    assert!(!resp.success);
    assert_eq!(resp.error_code.as_deref(), Some("TOO_MANY_ARTIFACTS"));
}

#[test]
fn test_checks_deduplicate_by_digest() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    let check = json!({"kind": "command", "spec": "cargo test", "outcome": "pass"});
    for _ in 0..2 {
        let resp = d.process_intent(&json!({
            "intent": "evidence_capture",
            "task": task_id,
            "path": "s:0",
            "checks": [check.clone()],
        }));
        assert!(resp.success, "{:?}", resp.error_message);
    }
    let resume = d.process_intent(&json!({"intent": "resume", "task": task_id}));
    let checks = resume.result["task"]["steps"][0]["verification_checks"].as_array().unwrap();
    assert_eq!(checks.len(), 1, "digest dedup failed");
}

#[test]
fn test_verify_ties_evidence_refs_to_confirmed_checkpoints() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    // Capture first, confirm second: the digests ride onto the checkpoints.
    let resp = d.process_intent(&json!({
        "intent": "evidence_capture",
        "task": task_id,
        "path": "s:0",
        "checks": [{"kind": "command", "spec": "cargo test", "outcome": "pass"}],
        "verification_outcome": "all green",
    }));
    assert!(resp.success, "{:?}", resp.error_message);

    let resp = d.process_intent(&json!({
        "intent": "verify",
        "task": task_id,
        "path": "s:0",
        "checkpoints": {"criteria": {"confirmed": true}, "tests": {"confirmed": true}},
    }));
    assert!(resp.success, "{:?}", resp.error_message);
    assert!(
        resp.result["checkpoints_after"]["criteria"]["evidence_refs_count"]
            .as_u64()
            .unwrap()
            >= 1
    );
    assert!(
        resp.result["checkpoints_after"]["tests"]["evidence_refs_count"]
            .as_u64()
            .unwrap()
            >= 1
    );

    let resume = d.process_intent(&json!({"intent": "resume", "task": task_id}));
    let step = &resume.result["task"]["steps"][0];
    let refs = step["checkpoints"]["criteria"]["evidence_refs"].as_array().unwrap();
    let digest = step["verification_checks"][0]["digest"].as_str().unwrap();
    assert!(refs.iter().any(|r| r == digest));
    assert_eq!(step["verification_outcome"], json!("all green"));
}

#[test]
fn test_capture_never_confirms_checkpoints() {
    let (_tmp, d) = engine();
    let task_id = seed_task(&d);
    let resp = d.process_intent(&json!({
        "intent": "evidence_capture",
        "task": task_id,
        "path": "s:0",
        "checks": ["cargo test"],
    }));
    assert!(resp.success);
    let resume = d.process_intent(&json!({"intent": "resume", "task": task_id}));
    let step = &resume.result["task"]["steps"][0];
    assert_eq!(step["checkpoints"]["criteria"]["confirmed"], json!(false));
    assert_eq!(step["checkpoints"]["tests"]["confirmed"], json!(false));
}
