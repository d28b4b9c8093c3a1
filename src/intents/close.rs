//! The close-task runway: `close_task`.
//!
//! A compound derivation over lint + progress validation that answers "is it
//! safe to mark this Task DONE?". A closed runway produces an executable
//! recipe (patches or a close_step batch); `apply=true` lands the derived
//! patches plus `complete(DONE)` as one atomic batch, or refuses with
//! `RUNWAY_CLOSED` and a single validated retry suggestion.

use crate::core::item::{Item, Status};
use crate::core::lint::{LintReport, lint_item};
use crate::core::step::{flatten_steps, step_at};
use crate::intents::response::{AIResponse, Suggestion, codes, error_response};
use crate::intents::validate::{self, Payload};
use crate::intents::view::item_view;
use crate::intents::{Dispatcher, batch, context};
use serde_json::{Map, Value, json};

/// Lint error codes the recipe can fix with placeholder patches.
const PATCH_FIXABLE_CODES: [&str; 2] = ["TASK_SUCCESS_CRITERIA_MISSING", "STEP_SUCCESS_CRITERIA_MISSING"];

fn all_nodes_done(item: &Item) -> bool {
    for (_, step) in flatten_steps(&item.steps) {
        if !step.task_nodes().iter().all(|n| n.is_done()) {
            return false;
        }
    }
    true
}

pub(crate) struct Runway {
    open: bool,
    validation: Value,
    recipe: Option<Value>,
    /// Patches (without the wrapping intent) the apply package will land.
    patches: Vec<Value>,
    /// Whether applying the patches can open the runway.
    applyable: bool,
}

impl Runway {
    /// The `runway` shape shared by close_task previews and radar.
    pub(crate) fn to_payload(&self) -> Value {
        let mut payload = Map::new();
        payload.insert("open".into(), json!(self.open));
        payload.insert("validation".into(), self.validation.clone());
        if let Some(recipe) = &self.recipe {
            payload.insert("recipe".into(), recipe.clone());
        }
        Value::Object(payload)
    }
}

/// Runway snapshot for the read surfaces (radar/handoff/context_pack).
/// Plans have no runway; they report null.
pub(crate) fn runway_view(d: &Dispatcher, item: &Item) -> Value {
    if !item.is_task() {
        return Value::Null;
    }
    let all_items = d.list_all();
    let report = lint_item(item, &all_items);
    derive_runway(item, &report).to_payload()
}

fn safe_write_fields(task_id: &str, revision: u64) -> Vec<(String, Value)> {
    vec![
        ("strict_targeting".to_string(), json!(true)),
        ("expected_target_id".to_string(), json!(task_id)),
        ("expected_kind".to_string(), json!("task")),
        ("expected_revision".to_string(), json!(revision)),
    ]
}

fn with_safe_writes(mut patch: Map<String, Value>, task_id: &str, revision: u64) -> Value {
    for (key, value) in safe_write_fields(task_id, revision) {
        patch.entry(key).or_insert(value);
    }
    Value::Object(patch)
}

/// Derive the runway state and recipe for a task.
pub(crate) fn derive_runway(item: &Item, report: &LintReport) -> Runway {
    let progress = item.progress();
    let validation_ok = progress == 100 && !item.blocked && all_nodes_done(item);
    let can_transition = item.status != Status::Done;
    let errors = report.errors();
    let open = errors.is_empty() && validation_ok && can_transition;

    let validation = json!({
        "progress": progress,
        "blocked": item.blocked,
        "nodes_done": all_nodes_done(item),
        "status": item.status.name(),
        "can_transition": can_transition,
        "lint_errors": errors.len(),
    });

    if open {
        return Runway {
            open: true,
            validation,
            recipe: None,
            patches: Vec::new(),
            applyable: true,
        };
    }

    let revision = item.revision;
    let mut patches: Vec<Value> = Vec::new();
    let mut recipe: Option<Value> = None;
    let mut fixable = true;

    // 1) Missing definition of done: autofill from the contract.
    if item.success_criteria.is_empty() {
        let value = item
            .contract_data
            .done
            .first()
            .cloned()
            .unwrap_or_else(|| "<definition of done>".to_string());
        let mut patch = Map::new();
        patch.insert("kind".into(), json!("task_detail"));
        patch.insert(
            "ops".into(),
            json!([{"op": "append", "field": "success_criteria", "value": value}]),
        );
        let patch = with_safe_writes(patch, &item.id, revision);
        patches.push(patch.clone());
        if recipe.is_none() {
            let mut entry = patch.as_object().cloned().unwrap_or_default();
            entry.insert("intent".into(), json!("patch"));
            recipe = Some(Value::Object(entry));
        }
    }

    // 2) Remaining actionable lint errors become placeholder patches.
    for issue in &errors {
        if issue.code == "TASK_SUCCESS_CRITERIA_MISSING" {
            continue; // covered above
        }
        if issue.code == "STEP_SUCCESS_CRITERIA_MISSING" {
            if let Some(path) = issue.target.get("path").and_then(Value::as_str) {
                let mut patch = Map::new();
                patch.insert("kind".into(), json!("step"));
                patch.insert("path".into(), json!(path));
                patch.insert(
                    "ops".into(),
                    json!([{"op": "append", "field": "success_criteria", "value": "<define measurable outcome>"}]),
                );
                let patch = with_safe_writes(patch, &item.id, revision);
                patches.push(patch.clone());
                if recipe.is_none() {
                    let mut entry = patch.as_object().cloned().unwrap_or_default();
                    entry.insert("intent".into(), json!("patch"));
                    recipe = Some(Value::Object(entry));
                }
                continue;
            }
        }
        if PATCH_FIXABLE_CODES.contains(&issue.code.as_str()) {
            continue;
        }
        fixable = false;
    }

    // 3) Incomplete step tree: the recipe is a close_step batch for the
    //    current step. Never auto-applied (checkpoints need real evidence).
    if !validation_ok {
        fixable = false;
        if recipe.is_none() {
            let mut mirror_items = context::mirror_items_from_steps(&item.steps, None);
            context::normalize_mirror_progress(&mut mirror_items);
            let now = mirror_items
                .iter()
                .find(|i| i["status"] == json!("in_progress"))
                .or_else(|| mirror_items.iter().find(|i| i["status"] == json!("pending")));
            if let Some(now) = now {
                let path_raw = now.get("path").and_then(Value::as_str).unwrap_or_default();
                if let Ok(path) = crate::core::ident::StepPath::parse_step(path_raw) {
                    if let Some(step) = step_at(&item.steps, &path) {
                        let needs = step.needs_for_completion();
                        let confirmable = ["criteria", "tests", "security", "perf", "docs"];
                        let mut checkpoints = Map::new();
                        for need in needs.iter().filter(|n| confirmable.contains(&n.as_str())) {
                            checkpoints.insert(need.clone(), json!({"confirmed": true}));
                        }
                        if checkpoints.is_empty() {
                            checkpoints.insert("criteria".into(), json!({"confirmed": true}));
                        }
                        recipe = Some(json!({
                            "intent": "batch",
                            "atomic": true,
                            "task": item.id,
                            "strict_targeting": true,
                            "expected_target_id": item.id,
                            "expected_kind": "task",
                            "expected_revision": revision,
                            "operations": [{
                                "intent": "close_step",
                                "path": path_raw,
                                "checkpoints": Value::Object(checkpoints),
                            }],
                        }));
                    }
                }
            }
        }
    }

    // 4) A plan cursor out of range is patchable directly.
    if !item.plan_steps.is_empty() && item.plan_current > item.plan_steps.len() {
        let mut patch = Map::new();
        patch.insert("kind".into(), json!("task_detail"));
        patch.insert(
            "ops".into(),
            json!([{"op": "set", "field": "plan_current", "value": item.plan_steps.len()}]),
        );
        patches.push(with_safe_writes(patch, &item.id, revision));
    }

    if !can_transition {
        fixable = false;
    }

    Runway {
        open: false,
        validation,
        recipe,
        patches,
        applyable: fixable,
    }
}

/// Build the atomic apply package: patches followed by complete(DONE).
fn build_apply_package(task_id: &str, revision: u64, patches: &[Value]) -> Value {
    let mut operations: Vec<Value> = Vec::new();
    for patch in patches {
        let mut op = patch.as_object().cloned().unwrap_or_default();
        op.insert("intent".into(), json!("patch"));
        // Per-op revision guards would trip on their own bumps inside the
        // batch; the batch-level preflight covers the race instead.
        op.remove("expected_revision");
        operations.push(Value::Object(op));
    }
    operations.push(json!({"intent": "complete", "status": "DONE"}));
    json!({
        "intent": "batch",
        "atomic": true,
        "task": task_id,
        "strict_targeting": true,
        "expected_target_id": task_id,
        "expected_kind": "task",
        "expected_revision": revision,
        "operations": operations,
    })
}

pub fn handle_close_task(d: &Dispatcher, data: &Payload) -> AIResponse {
    let (task_id, item) = match d.require_task("close_task", data) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    let apply = validate::get_bool(data, "apply", false);

    // User-supplied patches ride along before the derived recipe patches.
    let mut user_patches: Vec<Value> = Vec::new();
    if let Some(raw) = data.get("patches") {
        let Some(items) = raw.as_array() else {
            return error_response("close_task", codes::INVALID_OPS, "patches must be an array");
        };
        for patch in items {
            let Some(map) = patch.as_object() else {
                return error_response(
                    "close_task",
                    codes::INVALID_OPS,
                    "patches must contain objects",
                );
            };
            user_patches.push(with_safe_writes(map.clone(), &task_id, item.revision));
        }
    }

    let all_items = d.list_all();
    let report = lint_item(&item, &all_items);
    let runway = derive_runway(&item, &report);

    let mut all_patches = user_patches;
    all_patches.extend(runway.patches.iter().cloned());
    let apply_package = build_apply_package(&task_id, item.revision, &all_patches);

    if !apply {
        let runway_payload = runway.to_payload();
        let computed = json!({
            "would_complete": runway.open || runway.applyable,
            "status_after": if runway.open || runway.applyable { "DONE" } else { item.status.name() },
            "patches_required": all_patches.len(),
        });
        return AIResponse::ok(
            "close_task",
            json!({
                "dry_run": true,
                "lint": report.to_value(),
                "runway": runway_payload,
                "diff": {
                    "patches": all_patches,
                    "patch_results": [],
                    "apply": apply_package,
                },
                "current": item_view(&item, false),
                "computed": computed,
            }),
        )
        .with_context("task_id", json!(task_id));
    }

    // apply=true: only land when the derived patches can open the runway.
    if !(runway.open || runway.applyable) {
        let suggestion = Suggestion::new(
            "close_task",
            &task_id,
            "Retry closing once the runway is open (checkpoints confirmed, steps closed).",
            "high",
        )
        .with_params(json!({
            "task": task_id,
            "apply": true,
            "strict_targeting": true,
            "expected_target_id": task_id,
            "expected_kind": "task",
            "expected_revision": item.revision,
        }))
        .validated(true);
        return error_response(
            "close_task",
            codes::RUNWAY_CLOSED,
            "the runway is closed: the task cannot be completed safely",
        )
        .with_recovery(
            "Close the remaining steps (close_step) and confirm checkpoints via verify, then retry close_task(apply=true).",
        )
        .with_suggestions(vec![suggestion])
        .with_context("task_id", json!(task_id));
    }

    let batch_payload = apply_package
        .as_object()
        .cloned()
        .expect("apply package is an object");
    let batch_resp = batch::handle_batch(d, &batch_payload);
    if !batch_resp.success {
        let mut resp = batch_resp;
        resp.intent = "close_task".to_string();
        return resp;
    }

    let reloaded = d.load_item(&task_id);
    let mut result = Map::new();
    result.insert("applied".into(), json!(true));
    result.insert("batch".into(), batch_resp.result.clone());
    if let Some(reloaded) = reloaded {
        result.insert("task".into(), item_view(&reloaded, false));
    }
    let mut resp = AIResponse::ok("close_task", Value::Object(result));
    resp.context.insert("task_id".into(), json!(task_id));
    resp.meta = batch_resp.meta.clone();
    resp
}
