//! The one-screen views: `radar`, `handoff`, `context_pack`.
//!
//! Radar answers "what now, why, how do I verify, what next" for one item,
//! under a hard byte budget with a deterministic shrink order. Handoff adds
//! done/remaining snapshots and risks; context_pack bundles radar with a
//! delta slice under a single combined budget.

use crate::core::item::{Item, Status};
use crate::core::step::step_at;
use crate::intents::response::{AIResponse, Suggestion, codes, error_response};
use crate::intents::validate::{self, Payload, dedupe_strs, preview_text};
use crate::intents::{Dispatcher, close, context, history};
use serde_json::{Map, Value, json};

pub const DEFAULT_MAX_CHARS: usize = 12_000;
pub const MIN_MAX_CHARS: usize = 1_000;
pub const MAX_MAX_CHARS: usize = 50_000;

fn json_bytes(value: &Value) -> usize {
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(0)
}

fn result_bytes(result: &Map<String, Value>) -> usize {
    json_bytes(&Value::Object(result.clone()))
}

/// Compact contract summary for the "why" pane.
fn contract_summary(item: &Item) -> Value {
    let data = &item.contract_data;
    let mut out = Map::new();
    if !data.goal.trim().is_empty() {
        out.insert("goal".into(), json!(preview_text(&data.goal, 180)));
    }
    for (key, list, cap) in [
        ("checks", &data.checks, 5usize),
        ("done", &data.done, 5),
        ("constraints", &data.constraints, 3),
        ("risks", &data.risks, 3),
    ] {
        let items = dedupe_strs(list.clone());
        if !items.is_empty() {
            out.insert(key.into(), json!(items.into_iter().take(cap).collect::<Vec<_>>()));
        }
    }
    Value::Object(out)
}

/// Default checkpoint payload for the golden-path close_step suggestion.
fn default_checkpoints_payload(step: &crate::core::step::Step, missing: &[String]) -> Value {
    let mut payload = Map::new();
    if missing.is_empty() {
        let mut defaults: Vec<&str> = Vec::new();
        if !step.success_criteria.is_empty() {
            defaults.push("criteria");
        }
        if !step.tests.is_empty() || step.checkpoints.tests.auto_confirmed {
            defaults.push("tests");
        }
        if defaults.is_empty() {
            defaults.push("criteria");
        }
        for name in defaults {
            payload.insert(name.to_string(), json!({"confirmed": true}));
        }
    } else {
        for name in missing {
            payload.insert(name.clone(), json!({"confirmed": true}));
        }
    }
    if payload.is_empty() {
        payload.insert("criteria".into(), json!({"confirmed": true}));
    }
    Value::Object(payload)
}

/// Executable next-step suggestions for an (optional) focus item.
pub fn generate_suggestions(d: &Dispatcher, focus_id: Option<&str>) -> Vec<Suggestion> {
    let items = d.list_all();
    let plans: Vec<&Item> = items.iter().filter(|i| i.is_plan()).collect();
    let tasks: Vec<&Item> = items.iter().filter(|i| i.is_task()).collect();

    if plans.is_empty() {
        return vec![
            Suggestion::new(
                "create",
                "PLAN",
                "No plans yet: create a plan (kind=plan) and pin the contract.",
                "high",
            )
            .with_params(json!({"kind": "plan"})),
        ];
    }

    let Some(focus_id) = focus_id else {
        return Vec::new();
    };
    let Some(focus) = d.load_item(focus_id) else {
        return Vec::new();
    };

    if focus.is_plan() {
        let has_tasks = tasks.iter().any(|t| t.parent.as_deref() == Some(focus_id));
        if !has_tasks {
            return vec![
                Suggestion::new(
                    "create",
                    "TASK",
                    "The plan has no tasks: add the first task under it.",
                    "high",
                )
                .with_params(json!({"kind": "task", "parent": focus_id})),
            ];
        }
        return Vec::new();
    }

    if focus.steps.is_empty() {
        return Vec::new();
    }
    let mut mirror_items = context::mirror_items_from_steps(&focus.steps, None);
    context::normalize_mirror_progress(&mut mirror_items);
    let now = mirror_items
        .iter()
        .find(|i| i["status"] == json!("in_progress"))
        .or_else(|| mirror_items.iter().find(|i| i["status"] == json!("pending")))
        .or_else(|| mirror_items.first());
    let Some(now) = now else {
        return Vec::new();
    };
    let path_raw = now.get("path").and_then(Value::as_str).unwrap_or_default();
    let Ok(path) = crate::core::ident::StepPath::parse_step(path_raw) else {
        return Vec::new();
    };
    let Some(step) = step_at(&focus.steps, &path) else {
        return Vec::new();
    };
    if step.completed {
        return Vec::new();
    }
    let needs = if step.ready_for_completion() {
        Vec::new()
    } else {
        step.needs_for_completion()
    };
    let confirmable = ["criteria", "tests", "security", "perf", "docs"];
    let missing: Vec<String> = needs
        .iter()
        .filter(|n| confirmable.contains(&n.as_str()))
        .cloned()
        .collect();
    let non_confirmable: Vec<&String> = needs
        .iter()
        .filter(|n| !confirmable.contains(&n.as_str()))
        .collect();
    if !non_confirmable.is_empty() {
        return Vec::new();
    }

    let step_id = now.get("id").and_then(Value::as_str).unwrap_or_default();
    vec![
        Suggestion::new(
            "batch",
            path_raw,
            "Golden path: confirm the checkpoints and close the step in one atomic batch.",
            "high",
        )
        .with_params(json!({
            "atomic": true,
            "task": focus_id,
            "expected_target_id": focus_id,
            "expected_kind": "task",
            "strict_targeting": true,
            "operations": [{
                "intent": "close_step",
                "path": path_raw,
                "step_id": step_id,
                "note": "",
                "checkpoints": default_checkpoints_payload(step, &missing),
            }],
        })),
    ]
}

fn unresolved_depends_on(d: &Dispatcher, deps: &[String]) -> Vec<String> {
    deps.iter()
        .filter(|dep| {
            d.load_item(dep)
                .map(|item| item.status != Status::Done)
                .unwrap_or(true)
        })
        .cloned()
        .collect()
}

/// Build the radar payload for one item. Shared by radar/handoff/context_pack.
pub(crate) fn build_radar_payload(
    d: &Dispatcher,
    item: &Item,
    focus_id: &str,
    focus_domain: &str,
    limit: usize,
    max_chars: usize,
) -> (Map<String, Value>, Vec<Suggestion>) {
    let focus_payload = json!({
        "id": focus_id,
        "kind": item.kind.name(),
        "revision": item.revision,
        "domain": if item.domain.is_empty() { focus_domain } else { &item.domain },
        "title": item.title,
    });

    let next_suggestions: Vec<Suggestion> = generate_suggestions(d, Some(focus_id))
        .into_iter()
        .take(limit)
        .collect();

    let focus_key = if item.is_plan() { "plan" } else { "task" };
    let mut result = Map::new();
    result.insert("focus".into(), focus_payload);
    result.insert("now".into(), json!({}));
    result.insert("why".into(), json!({}));
    result.insert(
        "verify".into(),
        json!({"commands": [], "ready": null, "needs": null}),
    );
    result.insert(
        "next".into(),
        Value::Array(next_suggestions.iter().map(|s| s.to_value()).collect()),
    );
    result.insert(
        "blockers".into(),
        json!({"blocked": false, "blockers": [], "depends_on": [], "unresolved_depends_on": []}),
    );
    result.insert("open_checkpoints".into(), json!([]));
    // Is it safe to land this item? Plans carry no runway and report null.
    result.insert("runway".into(), close::runway_view(d, item));
    result.insert(
        "links".into(),
        json!({
            "resume": {"intent": "resume", focus_key: focus_id},
            "mirror": {"intent": "mirror", focus_key: focus_id, "limit": 10},
            "context": {"intent": "context", "include_all": true, "compact": true},
            "focus_get": {"intent": "focus_get"},
            "history": {"intent": "history", "limit": 20},
            "handoff": {"intent": "handoff", focus_key: focus_id, "limit": limit, "max_chars": max_chars},
        }),
    );

    if item.is_plan() {
        let summary = contract_summary(item);
        let steps = &item.plan_steps;
        let current = item.plan_current.min(steps.len());
        let title = steps.get(current).cloned().unwrap_or_default();
        let status = if !steps.is_empty() && current >= steps.len() {
            "completed"
        } else if !steps.is_empty() {
            "in_progress"
        } else {
            "pending"
        };
        result.insert(
            "now".into(),
            json!({
                "kind": "plan_step",
                "index": current,
                "title": title,
                "total": steps.len(),
                "status": status,
                "queue": {"remaining": steps.len().saturating_sub(current), "total": steps.len()},
            }),
        );
        let mut why = Map::new();
        why.insert("plan_id".into(), json!(focus_id));
        why.insert(
            "contract_preview".into(),
            json!(preview_text(&item.contract, 280)),
        );
        if summary.as_object().is_some_and(|m| !m.is_empty()) {
            why.insert("contract".into(), summary.clone());
        }
        result.insert("why".into(), Value::Object(why));

        let mut open_checkpoints: Vec<&str> = Vec::new();
        if !item.success_criteria.is_empty() && !item.checkpoints.criteria.confirmed {
            open_checkpoints.push("criteria");
        }
        if !item.tests.is_empty()
            && !(item.checkpoints.tests.confirmed || item.checkpoints.tests.auto_confirmed)
        {
            open_checkpoints.push("tests");
        }
        let mut commands: Vec<String> = summary
            .get("checks")
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        commands.extend(item.tests.clone());
        let commands: Vec<String> = dedupe_strs(commands).into_iter().take(10).collect();
        result.insert(
            "verify".into(),
            json!({
                "commands": commands.clone(),
                "open_checkpoints": open_checkpoints.clone(),
                "criteria_confirmed": item.checkpoints.criteria.confirmed,
                "tests_confirmed": item.checkpoints.tests.confirmed,
                "ready": null,
                "needs": null,
            }),
        );
        result.insert("open_checkpoints".into(), json!(open_checkpoints.clone()));
        result.insert(
            "how_to_verify".into(),
            json!({"commands": commands, "open_checkpoints": open_checkpoints}),
        );
        let deps = item.depends_on.clone();
        let unresolved = unresolved_depends_on(d, &deps);
        result.insert(
            "blockers".into(),
            json!({
                "blocked": item.blocked,
                "blockers": item.blockers,
                "depends_on": deps,
                "unresolved_depends_on": unresolved,
            }),
        );
        return (result, next_suggestions);
    }

    // Task: locate the active step and its verification surface.
    let mut mirror_items = context::mirror_items_from_steps(&item.steps, None);
    context::normalize_mirror_progress(&mut mirror_items);
    let now = mirror_items
        .iter()
        .find(|i| i["status"] == json!("in_progress"))
        .or_else(|| mirror_items.iter().find(|i| i["status"] == json!("pending")))
        .or_else(|| mirror_items.first())
        .cloned();

    let queue = context::compute_checkpoint_status(item);
    let queue_summary = json!({
        "pending": queue["pending"].as_array().map(|a| a.len()).unwrap_or(0),
        "ready": queue["ready"].as_array().map(|a| a.len()).unwrap_or(0),
        "next_pending": queue["pending"].as_array().and_then(|a| a.first()).cloned(),
        "next_ready": queue["ready"].as_array().and_then(|a| a.first()).cloned(),
    });
    let now_payload = match now {
        Some(Value::Object(mut map)) => {
            map.entry("queue".to_string()).or_insert(queue_summary);
            Value::Object(map)
        }
        _ => json!({"kind": "step", "status": "missing", "queue": queue_summary}),
    };
    result.insert("now".into(), now_payload.clone());

    let plan_id = item.parent.clone().unwrap_or_default();
    let plan = if plan_id.is_empty() { None } else { d.load_item(&plan_id) };
    let plan_summary = plan.as_ref().map(contract_summary).unwrap_or(json!({}));
    let mut why = Map::new();
    why.insert(
        "plan_id".into(),
        if plan_id.is_empty() { Value::Null } else { json!(plan_id) },
    );
    why.insert(
        "contract_preview".into(),
        json!(
            plan.as_ref()
                .map(|p| preview_text(&p.contract, 280))
                .unwrap_or_default()
        ),
    );
    if plan_summary.as_object().is_some_and(|m| !m.is_empty()) {
        why.insert("contract".into(), plan_summary.clone());
    }
    result.insert("why".into(), Value::Object(why));

    let plan_checks: Vec<String> = plan_summary
        .get("checks")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();
    result.insert(
        "how_to_verify".into(),
        json!({"commands": plan_checks.clone()}),
    );

    let mut verify_payload = json!({
        "commands": dedupe_strs(plan_checks.clone()).into_iter().take(10).collect::<Vec<_>>(),
        "open_checkpoints": [],
    });
    let mut open_checkpoints: Vec<String> = Vec::new();
    if let Some(path_raw) = now_payload.get("path").and_then(Value::as_str) {
        if let Ok(path) = crate::core::ident::StepPath::parse_step(path_raw) {
            if let Some(step) = step_at(&item.steps, &path) {
                let ready = step.ready_for_completion();
                let needs = if ready { Vec::new() } else { step.needs_for_completion() };
                let mut missing: Vec<Value> = Vec::new();
                for need in &needs {
                    let checkpoint = if need == "blocked" { "unblocked" } else { need.as_str() };
                    missing.push(json!({"checkpoint": checkpoint, "path": path_raw}));
                    open_checkpoints.push(checkpoint.to_string());
                }
                let checks = &step.verification_checks;
                let attachments = &step.attachments;
                let mut commands = plan_checks.clone();
                commands.extend(step.tests.clone());
                let commands: Vec<String> =
                    dedupe_strs(commands).into_iter().take(10).collect();
                let count_kinds = |kinds: Vec<&str>| -> Value {
                    let mut map = Map::new();
                    for kind in kinds {
                        let key = if kind.is_empty() { "unknown" } else { kind };
                        let entry = map.entry(key.to_string()).or_insert(json!(0));
                        *entry = json!(entry.as_u64().unwrap_or(0) + 1);
                    }
                    Value::Object(map)
                };
                let latest = |observed: Vec<&str>| -> String {
                    observed.into_iter().max().unwrap_or_default().to_string()
                };
                verify_payload = json!({
                    "path": path_raw,
                    "step_id": step.id,
                    "commands": commands.clone(),
                    "open_checkpoints": open_checkpoints.clone(),
                    "missing_checkpoints": open_checkpoints.clone(),
                    "tests": step.tests.iter().take(10).collect::<Vec<_>>(),
                    "ready": ready,
                    "needs": needs,
                    "missing": missing,
                    "evidence": {
                        "verification_outcome": step.verification_outcome,
                        "checks": {
                            "count": checks.len(),
                            "kinds": count_kinds(checks.iter().map(|c| c.kind.as_str()).collect()),
                            "last_observed_at": latest(checks.iter().map(|c| c.observed_at.as_str()).collect()),
                        },
                        "attachments": {
                            "count": attachments.len(),
                            "kinds": count_kinds(attachments.iter().map(|a| a.kind.as_str()).collect()),
                            "last_observed_at": latest(attachments.iter().map(|a| a.observed_at.as_str()).collect()),
                        },
                    },
                });
                result.insert(
                    "how_to_verify".into(),
                    json!({
                        "path": path_raw,
                        "step_id": step.id,
                        "commands": commands,
                        "missing_checkpoints": open_checkpoints.clone(),
                    }),
                );
            }
        }
    }
    result.insert("verify".into(), verify_payload);
    result.insert("open_checkpoints".into(), json!(open_checkpoints));

    let deps = item.depends_on.clone();
    let unresolved = unresolved_depends_on(d, &deps);
    result.insert(
        "blockers".into(),
        json!({
            "blocked": item.blocked,
            "blockers": item.blockers,
            "depends_on": deps,
            "unresolved_depends_on": unresolved,
        }),
    );

    (result, next_suggestions)
}

/// Minimal stable skeleton used when shrinking cannot reach the budget.
fn minimal_skeleton(result: &Map<String, Value>) -> Map<String, Value> {
    let focus = result.get("focus").cloned().unwrap_or(json!({}));
    let mut minimal = Map::new();
    minimal.insert(
        "focus".into(),
        json!({
            "id": focus.get("id").cloned().unwrap_or(json!("")),
            "kind": focus.get("kind").cloned().unwrap_or(json!("")),
            "revision": focus.get("revision").cloned().unwrap_or(json!(0)),
            "domain": focus.get("domain").cloned().unwrap_or(json!("")),
            "title": json!(preview_text(
                focus.get("title").and_then(Value::as_str).unwrap_or_default(),
                80
            )),
        }),
    );
    minimal.insert("now".into(), json!({}));
    minimal.insert("why".into(), json!({}));
    minimal.insert(
        "verify".into(),
        json!({"commands": [], "open_checkpoints": [], "ready": null, "needs": null}),
    );
    minimal.insert("next".into(), json!([]));
    minimal.insert(
        "blockers".into(),
        json!({"blocked": false, "blockers": [], "depends_on": [], "unresolved_depends_on": []}),
    );
    minimal.insert("open_checkpoints".into(), json!([]));
    minimal.insert("runway".into(), Value::Null);
    minimal
}

/// Enforce the radar output budget (UTF-8 bytes of the compact JSON).
/// Shrinks in a stable order and never drops the main radar keys.
pub(crate) fn apply_radar_budget(result: &mut Map<String, Value>, max_chars: usize) {
    if max_chars == 0 {
        return;
    }
    let original = result_bytes(result);
    let mut truncated = false;
    if original > max_chars {
        truncated = true;

        // 1) Keep next suggestions short.
        if let Some(next) = result.get_mut("next").and_then(Value::as_array_mut) {
            next.truncate(1);
        }
        // 2) Drop auxiliary navigation links first.
        if result_bytes(result) > max_chars {
            result.remove("links");
        }
        // 3) Cap verify commands.
        if let Some(verify) = result.get_mut("verify").and_then(Value::as_object_mut) {
            if let Some(commands) = verify.get_mut("commands").and_then(Value::as_array_mut) {
                commands.truncate(5);
                for cmd in commands.iter_mut() {
                    let text = cmd.as_str().unwrap_or_default().to_string();
                    *cmd = json!(preview_text(&text, 180));
                }
            }
        }
        // 4) Cap the contract preview (why).
        if let Some(why) = result.get_mut("why").and_then(Value::as_object_mut) {
            if let Some(preview) = why.get("contract_preview").and_then(Value::as_str) {
                let capped = preview_text(preview, 140);
                why.insert("contract_preview".into(), json!(capped));
            }
        }
        // 5) Drop the contract summary (still reachable via resume/context).
        if result_bytes(result) > max_chars {
            if let Some(why) = result.get_mut("why").and_then(Value::as_object_mut) {
                why.remove("contract");
            }
        }
        // 6) Drop heavy evidence details.
        if result_bytes(result) > max_chars {
            if let Some(verify) = result.get_mut("verify").and_then(Value::as_object_mut) {
                verify.remove("evidence");
                verify.remove("missing");
            }
        }
        // 7) Reduce the runway to its open flag (recipe stays in close_task).
        if result_bytes(result) > max_chars {
            if let Some(runway) = result.get_mut("runway").and_then(Value::as_object_mut) {
                runway.remove("recipe");
                runway.remove("validation");
            }
        }
        // 8) Shrink the focus title.
        if result_bytes(result) > max_chars {
            if let Some(focus) = result.get_mut("focus").and_then(Value::as_object_mut) {
                let title = focus
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                focus.insert("title".into(), json!(preview_text(&title, 80)));
            }
        }
        // 9) Shrink the now title and drop next entirely.
        if result_bytes(result) > max_chars {
            if let Some(now) = result.get_mut("now").and_then(Value::as_object_mut) {
                if let Some(title) = now.get("title").and_then(Value::as_str) {
                    let capped = preview_text(title, 80);
                    now.insert("title".into(), json!(capped));
                }
            }
        }
        if result_bytes(result) > max_chars {
            if let Some(next) = result.get_mut("next").and_then(Value::as_array_mut) {
                next.clear();
            }
        }
        // 10) Hard clamp: a minimal stable skeleton.
        if result_bytes(result) > max_chars {
            let minimal = minimal_skeleton(result);
            *result = minimal;
        }
    }

    let used = result_bytes(result);
    result.insert(
        "budget".into(),
        json!({
            "max_chars": max_chars,
            "used_chars": used,
            "truncated": truncated || used > max_chars,
        }),
    );
}

/// Enforce the combined context_pack budget (radar + delta).
pub(crate) fn apply_context_pack_budget(result: &mut Map<String, Value>, max_chars: usize) {
    if max_chars == 0 {
        return;
    }
    let mut truncated = false;
    if result_bytes(result) > max_chars {
        truncated = true;
        if let Some(delta) = result.get_mut("delta").and_then(Value::as_object_mut) {
            if let Some(ops) = delta.get_mut("operations").and_then(Value::as_array_mut) {
                for op in ops.iter_mut() {
                    if let Some(map) = op.as_object_mut() {
                        map.remove("snapshot");
                    }
                }
                delta.insert("include_snapshot".into(), json!(false));
            }
        }
        if result_bytes(result) > max_chars {
            if let Some(delta) = result.get_mut("delta").and_then(Value::as_object_mut) {
                if let Some(ops) = delta.get_mut("operations").and_then(Value::as_array_mut) {
                    ops.truncate(3);
                }
            }
        }
        if result_bytes(result) > max_chars {
            if let Some(delta) = result.get_mut("delta").and_then(Value::as_object_mut) {
                if let Some(ops) = delta.get_mut("operations").and_then(Value::as_array_mut) {
                    for op in ops.iter_mut() {
                        if let Some(map) = op.as_object() {
                            let mut compact = Map::new();
                            for key in ["id", "timestamp", "intent", "task_id", "undone", "has_result"] {
                                if let Some(v) = map.get(key) {
                                    compact.insert(key.to_string(), v.clone());
                                }
                            }
                            *op = Value::Object(compact);
                        }
                    }
                    delta.insert("include_details".into(), json!(false));
                }
            }
        }
        if result_bytes(result) > max_chars {
            result.insert("delta".into(), json!({"operations": [], "truncated": true}));
        }
        if result_bytes(result) > max_chars {
            result.remove("radar_budget");
            result.remove("budget");
            apply_radar_budget(result, max_chars);
        }
    }

    result.remove("budget");
    let mut used = result_bytes(result);
    if used > max_chars {
        let mut minimal = minimal_skeleton(result);
        minimal.insert("delta".into(), json!({"operations": [], "truncated": true}));
        *result = minimal;
        used = result_bytes(result);
    }
    result.insert(
        "budget".into(),
        json!({
            "max_chars": max_chars,
            "used_chars": used,
            "truncated": truncated || used > max_chars,
        }),
    );
}

fn parse_limit_field(data: &Payload, intent: &str) -> Result<usize, AIResponse> {
    match data.get("limit") {
        None => Ok(3),
        Some(value) => {
            let Some(limit) = value.as_i64() else {
                return Err(error_response(intent, codes::INVALID_LIMIT, "limit must be a number"));
            };
            Ok(limit.clamp(0, 10) as usize)
        }
    }
}

fn parse_max_chars(data: &Payload, intent: &str) -> Result<usize, AIResponse> {
    match data.get("max_chars") {
        None => Ok(DEFAULT_MAX_CHARS),
        Some(value) => {
            let Some(max_chars) = value.as_i64() else {
                return Err(error_response(
                    intent,
                    codes::INVALID_MAX_CHARS,
                    "max_chars must be a number",
                ));
            };
            Ok((max_chars.max(0) as usize).clamp(MIN_MAX_CHARS, MAX_MAX_CHARS))
        }
    }
}

fn load_focus_target(
    d: &Dispatcher,
    intent: &str,
    data: &Payload,
) -> Result<(Item, String, String), AIResponse> {
    let mut focus_domain = String::new();
    let explicit = data.get("task").or_else(|| data.get("plan"));
    let raw = match explicit {
        Some(value) => Some(value.clone()),
        None => d.focus().get().map(|p| {
            focus_domain = p.domain.clone();
            json!(p.task)
        }),
    };
    let Some(raw) = raw else {
        return Err(
            error_response(intent, codes::MISSING_ID, "No task/plan given and no focus set")
                .with_recovery("Pass task=TASK-###|plan=PLAN-### or set focus via focus_set.")
                .with_suggestions(d.missing_target_suggestions(&["TASK-", "PLAN-"])),
        );
    };
    let focus_id = crate::intents::validate::validate_task_id(Some(&raw)).map_err(|msg| {
        error_response(intent, codes::INVALID_ID, &msg)
            .with_recovery("Check ids via context(include_all=true) or set focus via focus_set.")
            .with_suggestions(d.missing_target_suggestions(&["TASK-", "PLAN-"]))
    })?;
    let Some(item) = d.load_item(&focus_id) else {
        return Err(context::not_found_response(d, intent, &focus_id));
    };
    Ok((item, focus_id, focus_domain))
}

pub fn handle_radar(d: &Dispatcher, data: &Payload) -> AIResponse {
    let (item, focus_id, focus_domain) = match load_focus_target(d, "radar", data) {
        Ok(triple) => triple,
        Err(resp) => return resp,
    };
    let limit = match parse_limit_field(data, "radar") {
        Ok(limit) => limit,
        Err(resp) => return resp,
    };
    let max_chars = match parse_max_chars(data, "radar") {
        Ok(value) => value,
        Err(resp) => return resp,
    };

    let (mut result, next_suggestions) =
        build_radar_payload(d, &item, &focus_id, &focus_domain, limit, max_chars);
    apply_radar_budget(&mut result, max_chars);

    let mut resp = AIResponse::ok("radar", Value::Object(result));
    resp.context.insert("task_id".into(), json!(focus_id));
    resp.suggestions = next_suggestions;
    resp
}

fn handoff_progress_snapshot(item: &Item) -> (Value, Value) {
    const MAX_ITEMS: usize = 5;
    let (done_items, remaining_items): (Vec<String>, Vec<String>) = if item.is_plan() {
        let current = item.plan_current.min(item.plan_steps.len());
        (
            item.plan_steps[..current].to_vec(),
            item.plan_steps[current..].to_vec(),
        )
    } else {
        (
            item.steps
                .iter()
                .filter(|s| s.completed)
                .map(|s| s.title.clone())
                .collect(),
            item.steps
                .iter()
                .filter(|s| !s.completed)
                .map(|s| s.title.clone())
                .collect(),
        )
    };
    let total = done_items.len() + remaining_items.len();
    (
        json!({
            "count": done_items.len(),
            "total": total,
            "items": done_items.into_iter().take(MAX_ITEMS).collect::<Vec<_>>(),
        }),
        json!({
            "count": remaining_items.len(),
            "total": total,
            "items": remaining_items.into_iter().take(MAX_ITEMS).collect::<Vec<_>>(),
        }),
    )
}

pub fn handle_handoff(d: &Dispatcher, data: &Payload) -> AIResponse {
    let (item, focus_id, focus_domain) = match load_focus_target(d, "handoff", data) {
        Ok(triple) => triple,
        Err(resp) => return resp,
    };
    let limit = match parse_limit_field(data, "handoff") {
        Ok(limit) => limit,
        Err(resp) => return resp,
    };
    let max_chars = match parse_max_chars(data, "handoff") {
        Ok(value) => value,
        Err(resp) => return resp,
    };

    let (mut result, next_suggestions) =
        build_radar_payload(d, &item, &focus_id, &focus_domain, limit, max_chars);

    let (done_payload, remaining_payload) = handoff_progress_snapshot(&item);
    result.insert("done".into(), done_payload);
    result.insert("remaining".into(), remaining_payload);
    let mut risks = item.risks.clone();
    if risks.is_empty() {
        risks = result
            .get("why")
            .and_then(|w| w.get("contract"))
            .and_then(|c| c.get("risks"))
            .and_then(Value::as_array)
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
    }
    result.insert("risks".into(), json!(risks));

    apply_radar_budget(&mut result, max_chars);

    let mut resp = AIResponse::ok("handoff", Value::Object(result));
    resp.context.insert("task_id".into(), json!(focus_id));
    resp.suggestions = next_suggestions;
    resp
}

pub fn handle_context_pack(d: &Dispatcher, data: &Payload) -> AIResponse {
    let (item, focus_id, focus_domain) = match load_focus_target(d, "context_pack", data) {
        Ok(triple) => triple,
        Err(resp) => return resp,
    };
    let limit = match parse_limit_field(data, "context_pack") {
        Ok(limit) => limit,
        Err(resp) => return resp,
    };
    let max_chars = match parse_max_chars(data, "context_pack") {
        Ok(value) => value,
        Err(resp) => return resp,
    };
    let delta_limit = match data.get("delta_limit") {
        None => 20usize,
        Some(value) => match value.as_i64() {
            Some(n) => n.clamp(0, 500) as usize,
            None => {
                return error_response(
                    "context_pack",
                    codes::INVALID_LIMIT,
                    "delta_limit must be a number",
                );
            }
        },
    };

    let since = validate::get_trimmed(data, "since");
    let since = if since.is_empty() {
        validate::get_trimmed(data, "since_operation_id")
    } else {
        since
    };
    let since = if since.is_empty() { validate::get_trimmed(data, "since_id") } else { since };

    let (mut radar_payload, next_suggestions) =
        build_radar_payload(d, &item, &focus_id, &focus_domain, limit, max_chars);
    apply_radar_budget(&mut radar_payload, max_chars);
    let radar_budget = radar_payload.remove("budget");

    let mut delta_request = Map::new();
    if !since.is_empty() {
        delta_request.insert("since".into(), json!(since));
    }
    delta_request.insert("task".into(), json!(focus_id));
    delta_request.insert("limit".into(), json!(delta_limit));
    delta_request.insert(
        "include_details".into(),
        json!(validate::get_bool(data, "include_details", false)),
    );
    delta_request.insert(
        "include_snapshot".into(),
        json!(validate::get_bool(data, "include_snapshot", false)),
    );
    delta_request.insert(
        "include_undone".into(),
        json!(validate::get_bool(data, "include_undone", true)),
    );
    let delta_resp = history::handle_delta(d, &delta_request);
    if !delta_resp.success {
        let mut resp = error_response(
            "context_pack",
            delta_resp.error_code.as_deref().unwrap_or(codes::DELTA_FAILED),
            delta_resp.error_message.as_deref().unwrap_or("delta failed"),
        )
        .with_result(json!({"radar": Value::Object(radar_payload), "radar_budget": radar_budget}));
        resp.error_recovery = delta_resp.error_recovery.clone();
        resp.context.insert("task_id".into(), json!(focus_id));
        resp.suggestions = next_suggestions;
        resp.warnings = delta_resp.warnings.clone();
        return resp;
    }

    let mut payload = radar_payload;
    payload.insert("delta".into(), delta_resp.result.clone());
    if let Some(radar_budget) = radar_budget {
        payload.insert("radar_budget".into(), radar_budget);
    }
    apply_context_pack_budget(&mut payload, max_chars);

    let mut resp = AIResponse::ok("context_pack", Value::Object(payload));
    resp.context.insert("task_id".into(), json!(focus_id));
    resp.suggestions = next_suggestions;
    resp
}
