//! Verification and step completion: `verify`, `evidence_capture`,
//! `progress`, `done`, `close_step`.
//!
//! `verify` is confirmation-only: every checkpoint entry must carry
//! `confirmed: true`, otherwise the call fails without mutating anything.
//! Evidence (checks/attachments) is deduplicated by digest and tied to the
//! checkpoints confirmed by the call. `close_step` (and `done` with
//! `auto_verify`) is the atomic verify-then-complete path; bare completion is
//! gated on step readiness.

use crate::core::artifacts::{MAX_ARTIFACT_BYTES, truncate_utf8, write_artifact};
use crate::core::collectors::collect_auto_verification_checks;
use crate::core::event::{Actor, TaskEvent};
use crate::core::evidence::{Attachment, VerificationCheck, canonical_json, redact_text, redact_value};
use crate::core::ident::StepPath;
use crate::core::item::Item;
use crate::core::step::{Checkpoint, Checkpoints, Step, node_at_mut, step_at, step_at_mut};
use crate::core::time::now_iso;
use crate::intents::Dispatcher;
use crate::intents::response::{AIResponse, codes, error_response};
use crate::intents::validate::{
    self, MAX_EVIDENCE_ITEMS, Payload, parse_attachments, parse_checks, resolve_step_path,
};
use crate::intents::view::{item_key, item_view, step_view};
use serde_json::{Map, Value, json};

const CONFIRMABLE: [&str; 5] = ["criteria", "tests", "security", "perf", "docs"];

/// Which checkpoint surface a verify call addresses.
enum VerifyTarget {
    ItemRoot,
    Step(StepPath),
    PlanNode(StepPath),
    TaskNode(StepPath),
}

fn checkpoints_of<'a>(item: &'a mut Item, target: &VerifyTarget) -> Option<&'a mut Checkpoints> {
    match target {
        VerifyTarget::ItemRoot => Some(&mut item.checkpoints),
        VerifyTarget::Step(path) => step_at_mut(&mut item.steps, path).map(|s| &mut s.checkpoints),
        VerifyTarget::PlanNode(path) => step_at_mut(&mut item.steps, path)
            .and_then(|s| s.plan.as_mut())
            .map(|p| &mut p.checkpoints),
        VerifyTarget::TaskNode(path) => node_at_mut(&mut item.steps, path).map(|n| &mut n.checkpoints),
    }
}

fn checkpoints_snapshot(item: &Item, target: &VerifyTarget) -> Option<Value> {
    match target {
        VerifyTarget::ItemRoot => Some(item.checkpoints.snapshot()),
        VerifyTarget::Step(path) => step_at(&item.steps, path).map(|s| s.checkpoints.snapshot()),
        VerifyTarget::PlanNode(path) => step_at(&item.steps, path)
            .and_then(|s| s.plan.as_ref())
            .map(|p| p.checkpoints.snapshot()),
        VerifyTarget::TaskNode(path) => {
            crate::core::step::node_at(&item.steps, path).map(|n| n.checkpoints.snapshot())
        }
    }
}

fn extend_unique_checks(existing: &mut Vec<VerificationCheck>, incoming: Vec<VerificationCheck>) -> Vec<String> {
    let mut seen: rustc_hash::FxHashSet<String> = existing
        .iter()
        .map(|c| c.digest.clone())
        .filter(|d| !d.is_empty())
        .collect();
    let mut added_digests = Vec::new();
    for check in incoming {
        let digest = check.digest.clone();
        if !digest.is_empty() && seen.contains(&digest) {
            continue;
        }
        if !digest.is_empty() {
            seen.insert(digest.clone());
            added_digests.push(digest);
        }
        existing.push(check);
    }
    added_digests
}

fn extend_unique_attachments(existing: &mut Vec<Attachment>, incoming: Vec<Attachment>) -> Vec<String> {
    let mut seen: rustc_hash::FxHashSet<String> = existing
        .iter()
        .map(|a| a.digest.clone())
        .filter(|d| !d.is_empty())
        .collect();
    let mut added_digests = Vec::new();
    for att in incoming {
        let digest = att.digest.clone();
        if !digest.is_empty() && seen.contains(&digest) {
            continue;
        }
        if !digest.is_empty() {
            seen.insert(digest.clone());
            added_digests.push(digest);
        }
        existing.push(att);
    }
    added_digests
}

fn extend_unique_refs(refs: &mut Vec<String>, digests: &[String]) -> usize {
    let mut seen: rustc_hash::FxHashSet<String> = refs.iter().cloned().collect();
    let mut added = 0;
    for digest in digests {
        let digest = digest.trim();
        if digest.is_empty() || seen.contains(digest) {
            continue;
        }
        seen.insert(digest.to_string());
        refs.push(digest.to_string());
        added += 1;
    }
    added
}

pub fn handle_verify(d: &Dispatcher, data: &Payload) -> AIResponse {
    let (task_id, mut item) = match d.require_item("verify", data, &["TASK-", "PLAN-"]) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };

    let Some(checkpoints_raw) = data.get("checkpoints").and_then(Value::as_object) else {
        return error_response(
            "verify",
            codes::INVALID_CHECKPOINTS,
            "checkpoints must be an object",
        );
    };
    if checkpoints_raw.is_empty()
        || !checkpoints_raw.keys().all(|k| CONFIRMABLE.contains(&k.as_str()))
    {
        return error_response(
            "verify",
            codes::INVALID_CHECKPOINTS,
            "allowed: checkpoints.criteria / tests / security / perf / docs",
        );
    }

    let mut kind = validate::get_trimmed(data, "kind").to_lowercase();
    let is_plan_item = item.is_plan();
    if kind.is_empty() || kind == "auto" {
        kind = if is_plan_item { "plan".into() } else { "step".into() };
    }
    if !matches!(kind.as_str(), "step" | "task" | "plan" | "task_detail") {
        return error_response(
            "verify",
            codes::INVALID_KIND,
            "kind must be: step|task|plan|task_detail|auto",
        );
    }
    if matches!(kind.as_str(), "step" | "task") && !item.is_task() {
        return error_response(
            "verify",
            codes::NOT_A_TASK,
            "verify kind=step|task applies to tasks (TASK-###)",
        );
    }

    // Resolve the checkpoint surface. kind=plan on a root PLAN targets the
    // item itself; on a TASK it targets the plan node embedded in a step.
    let target = match kind.as_str() {
        "task_detail" => VerifyTarget::ItemRoot,
        "plan" if is_plan_item => VerifyTarget::ItemRoot,
        "plan" => match resolve_step_path(&item, data, "path") {
            Ok(path) => VerifyTarget::PlanNode(path),
            Err((code, msg)) => {
                return error_response("verify", &code, &msg)
                    .with_recovery("Grab a valid path/step_id via radar/mirror.")
                    .with_suggestions(d.path_help_suggestions(&task_id));
            }
        },
        "task" => match validate::resolve_node_path(&item, data, "path") {
            Ok(path) => VerifyTarget::TaskNode(path),
            Err((code, msg)) => {
                return error_response("verify", &code, &msg)
                    .with_recovery("Grab a valid task path/task_node_id via mirror/radar.")
                    .with_suggestions(d.path_help_suggestions(&task_id));
            }
        },
        _ => match resolve_step_path(&item, data, "path") {
            Ok(path) => VerifyTarget::Step(path),
            Err((code, msg)) => {
                return error_response("verify", &code, &msg)
                    .with_recovery("Grab a valid path/step_id via radar/mirror.")
                    .with_suggestions(d.path_help_suggestions(&task_id));
            }
        },
    };
    let path_string = match &target {
        VerifyTarget::Step(path) | VerifyTarget::PlanNode(path) | VerifyTarget::TaskNode(path) => {
            Some(path.to_string())
        }
        VerifyTarget::ItemRoot => None,
    };

    let checks_raw = data.get("checks").or_else(|| data.get("verification_checks"));
    let attachments_raw = data.get("attachments");
    let outcome_raw = data.get("verification_outcome");
    if (checks_raw.is_some() || outcome_raw.is_some()) && kind != "step" {
        return error_response(
            "verify",
            codes::INVALID_TARGET,
            "checks/verification_outcome are only available for steps",
        );
    }

    // Strict: verify is confirmation-only. Any entry without confirmed=true
    // is a no-op call and must not mutate state.
    let mut names: Vec<String> = checkpoints_raw.keys().cloned().collect();
    names.sort();
    for name in &names {
        let Some(entry) = checkpoints_raw.get(name).and_then(Value::as_object) else {
            return error_response(
                "verify",
                codes::INVALID_CHECKPOINTS,
                &format!("checkpoints.{} must be an object", name),
            );
        };
        if entry.get("confirmed") != Some(&json!(true)) {
            return error_response(
                "verify",
                codes::VERIFY_NOOP,
                &format!("checkpoints.{}.confirmed must be true", name),
            )
            .with_recovery(
                "verify does not support resets or no-op confirmation. Pass confirmed:true to confirm.",
            )
            .with_result(json!({"task": task_id, "checkpoint": name}));
        }
    }

    // Parse evidence payloads before mutating anything.
    let parsed_checks = match checks_raw {
        Some(raw) => match parse_checks(raw) {
            Ok(checks) => Some(checks),
            Err(msg) => return error_response("verify", codes::INVALID_CHECKS, &msg),
        },
        None => None,
    };
    let parsed_attachments = match attachments_raw {
        Some(raw) => match parse_attachments(raw) {
            Ok(attachments) => Some(attachments),
            Err(msg) => return error_response("verify", codes::INVALID_ATTACHMENTS, &msg),
        },
        None => None,
    };

    let checkpoints_before = checkpoints_snapshot(&item, &target);
    {
        let Some(checkpoints) = checkpoints_of(&mut item, &target) else {
            return error_response(
                "verify",
                codes::PATH_NOT_FOUND,
                &format!(
                    "target not found: {}",
                    path_string.as_deref().unwrap_or("task_detail")
                ),
            )
            .with_suggestions(d.path_help_suggestions(&task_id));
        };
        for name in &names {
            let checkpoint = Checkpoint::parse(name).expect("names pre-validated");
            let state = checkpoints.state_mut(checkpoint);
            state.confirmed = true;
            let note = checkpoints_raw
                .get(name)
                .and_then(|e| e.get("note"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string();
            if !note.is_empty() {
                state.notes.push(note);
            }
        }
    }
    let event_target = path_string
        .as_ref()
        .map(|p| format!("step:{}", p))
        .unwrap_or_default();
    for name in &names {
        let note = checkpoints_raw
            .get(name)
            .and_then(|e| e.get("note"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        item.events
            .push(TaskEvent::checkpoint(name, &event_target, note, Actor::Ai));
    }

    // Step targets absorb evidence and tie digests to the confirmed gates.
    let mut ready: Option<bool> = None;
    let mut needs: Option<Vec<String>> = None;
    if let VerifyTarget::Step(path) = &target {
        let project_root = d.project_root().to_path_buf();
        let auto_checks = collect_auto_verification_checks(&project_root);
        if let Some(step) = step_at_mut(&mut item.steps, path) {
            let mut evidence_digests: Vec<String> = Vec::new();
            if let Some(checks) = parsed_checks {
                let digests: Vec<String> =
                    checks.iter().map(|c| c.digest.clone()).filter(|d| !d.is_empty()).collect();
                extend_unique_checks(&mut step.verification_checks, checks);
                evidence_digests.extend(digests);
            }
            if let Some(attachments) = parsed_attachments.clone() {
                let digests: Vec<String> = attachments
                    .iter()
                    .map(|a| a.digest.clone())
                    .filter(|d| !d.is_empty())
                    .collect();
                extend_unique_attachments(&mut step.attachments, attachments);
                evidence_digests.extend(digests);
            }
            if let Some(outcome) = outcome_raw.and_then(Value::as_str) {
                step.verification_outcome = outcome.trim().to_string();
            }
            // Best-effort ambient evidence (CI + git), never fatal.
            if !auto_checks.is_empty() {
                let digests: Vec<String> = auto_checks
                    .iter()
                    .map(|c| c.digest.clone())
                    .filter(|d| !d.is_empty())
                    .collect();
                extend_unique_checks(&mut step.verification_checks, auto_checks);
                evidence_digests.extend(digests);
            }
            // Link everything already captured on the step to this confirmation.
            evidence_digests.extend(
                step.verification_checks
                    .iter()
                    .map(|c| c.digest.clone())
                    .filter(|d| !d.is_empty()),
            );
            evidence_digests.extend(
                step.attachments
                    .iter()
                    .map(|a| a.digest.clone())
                    .filter(|d| !d.is_empty()),
            );
            if !evidence_digests.is_empty() {
                for name in &names {
                    let checkpoint = Checkpoint::parse(name).expect("names pre-validated");
                    let state = step.checkpoints.state_mut(checkpoint);
                    extend_unique_refs(&mut state.evidence_refs, &evidence_digests);
                }
            }
            ready = Some(step.ready_for_completion());
            if ready == Some(false) {
                needs = Some(step.needs_for_completion());
            }
        }
    } else if let Some(attachments) = parsed_attachments {
        // Non-step targets still accept attachments; refs go to the target.
        let digests: Vec<String> = attachments
            .iter()
            .map(|a| a.digest.clone())
            .filter(|d| !d.is_empty())
            .collect();
        match &target {
            VerifyTarget::ItemRoot => {
                // Item-level attachments live inside the structured contract
                // surface only as evidence refs; nothing else to attach to.
            }
            VerifyTarget::PlanNode(path) => {
                if let Some(plan) = step_at_mut(&mut item.steps, path).and_then(|s| s.plan.as_mut())
                {
                    extend_unique_attachments(&mut plan.attachments, attachments);
                }
            }
            VerifyTarget::TaskNode(path) => {
                if let Some(node) = node_at_mut(&mut item.steps, path) {
                    extend_unique_attachments(&mut node.attachments, attachments);
                }
            }
            VerifyTarget::Step(_) => unreachable!("handled above"),
        }
        if let Some(checkpoints) = checkpoints_of(&mut item, &target) {
            for name in &names {
                let checkpoint = Checkpoint::parse(name).expect("names pre-validated");
                extend_unique_refs(&mut checkpoints.state_mut(checkpoint).evidence_refs, &digests);
            }
        }
    }

    let reloaded = match d.save_and_reload("verify", &mut item) {
        Ok(item) => item,
        Err(resp) => return resp,
    };
    let checkpoints_after = checkpoints_snapshot(&reloaded, &target);
    let step_snapshot = match &target {
        VerifyTarget::Step(path) => {
            step_at(&reloaded.steps, path).map(|st| step_view(st, Some(&path.to_string()), false))
        }
        _ => None,
    };

    AIResponse::ok(
        "verify",
        json!({
            "task_id": task_id,
            "path": path_string,
            "kind": kind,
            "checkpoints_before": checkpoints_before,
            "checkpoints_after": checkpoints_after,
            "ready": ready,
            "needs": needs,
            "step": step_snapshot,
            item_key(&reloaded): item_view(&reloaded, false),
        }),
    )
    .with_context("task_id", json!(task_id))
}

pub fn handle_evidence_capture(d: &Dispatcher, data: &Payload) -> AIResponse {
    let (task_id, mut task) = match d.require_task("evidence_capture", data) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    let path = match resolve_step_path(&task, data, "path") {
        Ok(path) => path,
        Err((code, msg)) => {
            return error_response("evidence_capture", &code, &msg)
                .with_recovery("Grab a valid path/step_id via radar/mirror.")
                .with_suggestions(d.path_help_suggestions(&task_id));
        }
    };
    if step_at(&task.steps, &path).is_none() {
        return error_response(
            "evidence_capture",
            codes::PATH_NOT_FOUND,
            &format!("step path={} not found", path),
        )
        .with_recovery("Grab a valid path/step_id via radar/mirror.")
        .with_suggestions(d.path_help_suggestions(&task_id))
        .with_result(json!({"task_id": task_id, "path": path.to_string()}));
    }

    let artifacts_raw = data.get("artifacts").or_else(|| data.get("items"));
    let attachments_raw = data.get("attachments");
    let checks_raw = data.get("checks").or_else(|| data.get("verification_checks"));
    let outcome_raw = data.get("verification_outcome");

    if artifacts_raw.is_none()
        && attachments_raw.is_none()
        && checks_raw.is_none()
        && outcome_raw.is_none()
    {
        return error_response(
            "evidence_capture",
            codes::MISSING_EVIDENCE,
            "pass at least one of: artifacts|attachments|checks",
        )
        .with_recovery(
            "Pass artifacts (cmd_output/url/diff) or attachments/checks/verification_outcome as in verify (without confirmed).",
        )
        .with_suggestions(d.path_help_suggestions(&task_id))
        .with_result(json!({"task_id": task_id, "path": path.to_string()}));
    }

    let parsed_checks = match checks_raw {
        Some(raw) => match parse_checks(raw) {
            Ok(checks) => checks,
            Err(msg) => return error_response("evidence_capture", codes::INVALID_CHECKS, &msg),
        },
        None => Vec::new(),
    };
    let parsed_attachments = match attachments_raw {
        Some(raw) => match parse_attachments(raw) {
            Ok(attachments) => attachments,
            Err(msg) => return error_response("evidence_capture", codes::INVALID_ATTACHMENTS, &msg),
        },
        None => Vec::new(),
    };

    // Artifacts become redacted, content-addressed blobs plus attachments.
    let mut artifact_attachments: Vec<Attachment> = Vec::new();
    let mut artifacts_written: Vec<Value> = Vec::new();
    if let Some(artifacts) = artifacts_raw {
        let Some(items) = artifacts.as_array() else {
            return error_response(
                "evidence_capture",
                codes::INVALID_ARTIFACTS,
                "artifacts must be an array",
            );
        };
        if items.len() > MAX_EVIDENCE_ITEMS {
            return error_response(
                "evidence_capture",
                codes::TOO_MANY_ARTIFACTS,
                &format!("artifacts too large (max {})", MAX_EVIDENCE_ITEMS),
            );
        }
        for raw in items {
            let Some(artifact) = raw.as_object() else {
                return error_response(
                    "evidence_capture",
                    codes::INVALID_ARTIFACTS,
                    "artifacts must contain objects",
                );
            };
            let kind = validate::get_trimmed(artifact, "kind");
            let meta_value = artifact.get("meta").cloned().unwrap_or(json!({}));
            let mut meta = redact_value(&meta_value)
                .as_object()
                .cloned()
                .unwrap_or_default();

            match kind.as_str() {
                "url" => {
                    let url = validate::get_trimmed(artifact, "url");
                    let url = if url.is_empty() {
                        validate::get_trimmed(artifact, "external_uri")
                    } else {
                        url
                    };
                    if url.is_empty() {
                        return error_response("evidence_capture", codes::MISSING_URL, "url is required")
                            .with_result(json!({"artifact": raw}));
                    }
                    match Attachment::from_value(&json!({
                        "kind": "url",
                        "external_uri": url,
                        "meta": meta,
                    })) {
                        Ok(att) => artifact_attachments.push(att),
                        Err(msg) => {
                            return error_response("evidence_capture", codes::INVALID_ARTIFACTS, &msg);
                        }
                    }
                }
                "diff" => {
                    let diff = validate::get_trimmed(artifact, "diff");
                    let diff = if diff.is_empty() {
                        validate::get_trimmed(artifact, "content")
                    } else {
                        diff
                    };
                    if diff.is_empty() {
                        return error_response("evidence_capture", codes::MISSING_DIFF, "diff is required")
                            .with_result(json!({"artifact": raw}));
                    }
                    let redacted = redact_text(&diff);
                    let (text, truncated, original_size) =
                        truncate_utf8(&redacted, MAX_ARTIFACT_BYTES);
                    let (uri, size, sha) =
                        match write_artifact(d.repo().root(), text.as_bytes(), "patch") {
                            Ok(triple) => triple,
                            Err(err) => {
                                return error_response(
                                    "evidence_capture",
                                    codes::INTERNAL_ERROR,
                                    &err.to_string(),
                                );
                            }
                        };
                    meta.insert("artifact_sha256".into(), json!(sha));
                    meta.insert("truncated".into(), json!(truncated));
                    meta.insert("original_size".into(), json!(original_size));
                    match Attachment::from_value(&json!({
                        "kind": "diff",
                        "uri": uri,
                        "size": size,
                        "meta": meta,
                    })) {
                        Ok(att) => artifact_attachments.push(att),
                        Err(msg) => {
                            return error_response("evidence_capture", codes::INVALID_ARTIFACTS, &msg);
                        }
                    }
                    artifacts_written.push(json!({
                        "kind": "diff",
                        "uri": uri,
                        "size": size,
                        "sha256": sha,
                        "truncated": truncated,
                        "original_size": original_size,
                    }));
                }
                "cmd_output" => {
                    let command = validate::get_trimmed(artifact, "command");
                    let stdout = validate::get_str(artifact, "stdout")
                        .or_else(|| validate::get_str(artifact, "output"))
                        .unwrap_or_default()
                        .to_string();
                    let stderr = validate::get_str(artifact, "stderr").unwrap_or_default().to_string();
                    let exit_code = artifact.get("exit_code").cloned().unwrap_or(Value::Null);
                    if command.is_empty() && stdout.is_empty() && stderr.is_empty() {
                        return error_response(
                            "evidence_capture",
                            codes::MISSING_OUTPUT,
                            "cmd_output requires command and/or stdout/stderr",
                        )
                        .with_result(json!({"artifact": raw}));
                    }
                    let payload = json!({
                        "command": command,
                        "exit_code": exit_code,
                        "stdout": stdout,
                        "stderr": stderr,
                        "meta": Value::Object(meta.clone()),
                    });
                    let safe_payload = redact_value(&payload);
                    let text = canonical_json(&safe_payload);
                    let (text, truncated, original_size) = truncate_utf8(&text, MAX_ARTIFACT_BYTES);
                    let (uri, size, sha) = match write_artifact(d.repo().root(), text.as_bytes(), "json")
                    {
                        Ok(triple) => triple,
                        Err(err) => {
                            return error_response(
                                "evidence_capture",
                                codes::INTERNAL_ERROR,
                                &err.to_string(),
                            );
                        }
                    };
                    meta.insert("artifact_sha256".into(), json!(sha));
                    meta.insert("command".into(), json!(redact_text(&command)));
                    meta.insert("exit_code".into(), exit_code);
                    meta.insert("truncated".into(), json!(truncated));
                    meta.insert("original_size".into(), json!(original_size));
                    match Attachment::from_value(&json!({
                        "kind": "cmd_output",
                        "uri": uri,
                        "size": size,
                        "meta": meta,
                    })) {
                        Ok(att) => artifact_attachments.push(att),
                        Err(msg) => {
                            return error_response("evidence_capture", codes::INVALID_ARTIFACTS, &msg);
                        }
                    }
                    artifacts_written.push(json!({
                        "kind": "cmd_output",
                        "uri": uri,
                        "size": size,
                        "sha256": sha,
                        "truncated": truncated,
                        "original_size": original_size,
                    }));
                }
                other => {
                    return error_response(
                        "evidence_capture",
                        codes::INVALID_ARTIFACT_KIND,
                        &format!("unknown artifact.kind: {}", other),
                    )
                    .with_recovery("kind must be one of: cmd_output|diff|url")
                    .with_result(json!({"artifact": raw}));
                }
            }
        }
    }

    let mut checks_added: Vec<Value> = Vec::new();
    let mut attachments_added: Vec<Value> = Vec::new();
    let mut outcome_updated = false;
    {
        let step = step_at_mut(&mut task.steps, &path).expect("checked above");
        if !parsed_checks.is_empty() {
            let existing: rustc_hash::FxHashSet<String> = step
                .verification_checks
                .iter()
                .map(|c| c.digest.clone())
                .collect();
            for check in &parsed_checks {
                if check.digest.is_empty() || !existing.contains(&check.digest) {
                    checks_added.push(check.to_value());
                }
            }
            extend_unique_checks(&mut step.verification_checks, parsed_checks);
        }
        let mut incoming_attachments = parsed_attachments;
        incoming_attachments.extend(artifact_attachments);
        if !incoming_attachments.is_empty() {
            let existing: rustc_hash::FxHashSet<String> = step
                .attachments
                .iter()
                .map(|a| a.digest.clone())
                .collect();
            for att in &incoming_attachments {
                if att.digest.is_empty() || !existing.contains(&att.digest) {
                    attachments_added.push(att.to_value());
                }
            }
            extend_unique_attachments(&mut step.attachments, incoming_attachments);
        }
        if let Some(outcome) = outcome_raw.and_then(Value::as_str) {
            step.verification_outcome = outcome.trim().to_string();
            outcome_updated = true;
        }
    }

    let changed = !checks_added.is_empty()
        || !attachments_added.is_empty()
        || !artifacts_written.is_empty()
        || outcome_updated;
    let reloaded = if changed {
        match d.save_and_reload("evidence_capture", &mut task) {
            Ok(item) => item,
            Err(resp) => return resp,
        }
    } else {
        task.clone()
    };
    let step_snapshot = step_at(&reloaded.steps, &path)
        .map(|st| step_view(st, Some(&path.to_string()), false));

    AIResponse::ok(
        "evidence_capture",
        json!({
            "task_id": task_id,
            "path": path.to_string(),
            "captured": {
                "artifacts_written": artifacts_written,
                "attachments_added": attachments_added,
                "checks_added": checks_added,
                "verification_outcome": outcome_raw.and_then(Value::as_str).map(|s| s.trim().to_string()),
            },
            "step": step_snapshot,
            "task": item_view(&reloaded, false),
        }),
    )
    .with_context("task_id", json!(task_id))
}

fn gating_failed_response(
    d: &Dispatcher,
    intent: &str,
    task_id: &str,
    path: &StepPath,
    step: &Step,
    checkpoints_before: &Value,
) -> AIResponse {
    let needs = step.needs_for_completion();
    let missing: Vec<String> = needs
        .iter()
        .filter(|n| CONFIRMABLE.contains(&n.as_str()))
        .cloned()
        .collect();
    let summary = if needs.is_empty() {
        "readiness".to_string()
    } else {
        needs.join(", ")
    };
    error_response(
        intent,
        codes::GATING_FAILED,
        &format!("cannot complete step path={}: needs {}", path, summary),
    )
    .with_recovery(
        "Confirm the missing checkpoints via verify, or finish the embedded plan tasks, then retry.",
    )
    .with_suggestions(d.path_help_suggestions(task_id))
    .with_result(json!({
        "task_id": task_id,
        "path": path.to_string(),
        "ready": false,
        "needs": needs,
        "missing_checkpoints": missing,
        "checkpoints_before": checkpoints_before,
        "checkpoints_after": checkpoints_before,
        "step": step_view(step, Some(&path.to_string()), false),
    }))
}

fn parse_force(intent: &str, data: &Payload) -> Result<(bool, String), AIResponse> {
    let force = validate::get_bool(data, "force", false);
    let override_reason = validate::get_trimmed(data, "override_reason");
    if force && override_reason.is_empty() {
        return Err(error_response(
            intent,
            codes::MISSING_OVERRIDE_REASON,
            "override_reason is required with force=true",
        ));
    }
    Ok((force, override_reason))
}

/// Shared completion path for `progress(completed=true)`, `done`, `close_step`.
fn complete_step(
    d: &Dispatcher,
    intent: &str,
    task_id: &str,
    task: &mut Item,
    path: &StepPath,
    completed: bool,
    note: &str,
    force: bool,
    override_reason: &str,
) -> AIResponse {
    let Some(step) = step_at(&task.steps, path) else {
        return error_response(
            intent,
            codes::PATH_NOT_FOUND,
            &format!("step path={} not found", path),
        )
        .with_recovery("Grab a valid path/step_id via radar/mirror.")
        .with_suggestions(d.path_help_suggestions(task_id))
        .with_result(json!({"task_id": task_id, "path": path.to_string()}));
    };
    let checkpoints_before = step.checkpoints.snapshot();
    if completed && !force && !step.ready_for_completion() {
        return gating_failed_response(d, intent, task_id, path, step, &checkpoints_before);
    }

    {
        let step = step_at_mut(&mut task.steps, path).expect("checked above");
        if !note.is_empty() {
            step.progress_notes.push(note.to_string());
        }
        step.completed = completed;
        if completed {
            step.completed_at = Some(now_iso());
            if step.started_at.is_none() {
                step.started_at = Some(now_iso());
            }
        } else {
            step.completed_at = None;
        }
    }
    if completed {
        task.events.push(TaskEvent::now(
            crate::core::event::EVENT_SUBTASK_DONE,
            Actor::Ai,
            &format!("step:{}", path),
            Map::new(),
        ));
    }
    if force && !override_reason.is_empty() {
        task.events.push(TaskEvent::override_event(
            intent,
            override_reason,
            &format!("step:{}", path),
        ));
    }
    task.update_status_from_progress();

    let reloaded = match d.save_and_reload(intent, task) {
        Ok(item) => item,
        Err(resp) => return resp,
    };
    let step_after = step_at(&reloaded.steps, path);
    let checkpoints_after = step_after
        .map(|st| st.checkpoints.snapshot())
        .unwrap_or_else(|| checkpoints_before.clone());
    let ready = step_after.map(|st| st.ready_for_completion());
    let needs = match (ready, step_after) {
        (Some(false), Some(st)) => Some(st.needs_for_completion()),
        (Some(true), _) => Some(Vec::new()),
        _ => None,
    };

    AIResponse::ok(
        intent,
        json!({
            "task_id": task_id,
            "path": path.to_string(),
            "completed": completed,
            "checkpoints_before": checkpoints_before,
            "checkpoints_after": checkpoints_after,
            "ready": ready,
            "needs": needs,
            "step": step_after.map(|st| step_view(st, Some(&path.to_string()), false)),
            "task": item_view(&reloaded, false),
        }),
    )
    .with_context("task_id", json!(task_id))
}

pub fn handle_progress(d: &Dispatcher, data: &Payload) -> AIResponse {
    let (task_id, mut task) = match d.require_task("progress", data) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    let completed = validate::get_bool(data, "completed", false);
    let (force, override_reason) = match parse_force("progress", data) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    let path = match resolve_step_path(&task, data, "path") {
        Ok(path) => path,
        Err((code, msg)) => {
            return error_response("progress", &code, &msg)
                .with_recovery("Grab a valid path/step_id via radar/mirror.")
                .with_suggestions(d.path_help_suggestions(&task_id));
        }
    };
    complete_step(
        d,
        "progress",
        &task_id,
        &mut task,
        &path,
        completed,
        "",
        force,
        &override_reason,
    )
}

/// Atomic verify(step) then complete, in one call.
fn close_step_like(d: &Dispatcher, intent: &str, data: &Payload) -> AIResponse {
    let (task_id, _) = match d.require_task(intent, data) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    let (force, override_reason) = match parse_force(intent, data) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    let note = validate::get_trimmed(data, "note");

    if data.get("checkpoints").is_none() {
        return error_response(intent, codes::MISSING_CHECKPOINTS, "checkpoints is required")
            .with_recovery("Pass checkpoints.criteria/tests with confirmed:true (as in verify).")
            .with_suggestions(d.path_help_suggestions(&task_id))
            .with_result(json!({"task": task_id}));
    }

    let mut verify_payload = data.clone();
    verify_payload.insert("task".into(), json!(task_id));
    verify_payload.insert("kind".into(), json!("step"));
    let verify_resp = handle_verify(d, &verify_payload);
    if !verify_resp.success {
        let mut resp = verify_resp;
        resp.intent = intent.to_string();
        return resp;
    }

    let path_raw = verify_resp
        .result
        .get("path")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let Ok(path) = StepPath::parse_step(&path_raw) else {
        return error_response(intent, codes::INVALID_PATH, "path is required")
            .with_result(json!({"task": task_id}));
    };

    let Some(mut task) = d.load_item(&task_id) else {
        return crate::intents::context::not_found_response(d, intent, &task_id);
    };
    complete_step(
        d,
        intent,
        &task_id,
        &mut task,
        &path,
        true,
        &note,
        force,
        &override_reason,
    )
}

pub fn handle_close_step(d: &Dispatcher, data: &Payload) -> AIResponse {
    close_step_like(d, "close_step", data)
}

pub fn handle_done(d: &Dispatcher, data: &Payload) -> AIResponse {
    if validate::get_bool(data, "auto_verify", false) {
        return close_step_like(d, "done", data);
    }
    let (task_id, mut task) = match d.require_task("done", data) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    let (force, override_reason) = match parse_force("done", data) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    let note = validate::get_trimmed(data, "note");
    let path = match resolve_step_path(&task, data, "path") {
        Ok(path) => path,
        Err((code, msg)) => {
            return error_response("done", &code, &msg)
                .with_recovery("Grab a valid path/step_id via radar/mirror.")
                .with_suggestions(d.path_help_suggestions(&task_id));
        }
    };
    complete_step(
        d, "done", &task_id, &mut task, &path, true, &note, force, &override_reason,
    )
}
