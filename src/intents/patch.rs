//! Diff-oriented updates: the `patch` intent.
//!
//! `patch` applies a list of `{op, field, value}` operations against one of
//! three surfaces (`task_detail`, `step`, `task` node) with per-kind allowed
//! field tables and typed scalars. List fields support set/unset/append
//! (deduplicating)/remove; scalars support set/unset only. Checkpoint and
//! completion side effects mirror the direct editing intents, and
//! `dry_run=true` returns a before/after diff without persisting.

use crate::core::event::{Actor, TaskEvent};
use crate::core::item::{Item, Priority, Status};
use crate::core::step::{Step, TaskNode, node_at, node_at_mut, step_at, step_at_mut};
use crate::intents::Dispatcher;
use crate::intents::response::{AIResponse, codes, error_response};
use crate::intents::validate::{self, Payload, dedupe_strs, validate_array};
use crate::intents::view::{item_key, item_view, step_view, task_node_view};
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, Copy, PartialEq)]
enum FieldType {
    Str,
    StrList,
    Bool,
    Int,
    Priority,
    Status,
}

const CONTRACT_DATA_FIELDS: &[(&str, FieldType)] = &[
    ("goal", FieldType::Str),
    ("constraints", FieldType::StrList),
    ("assumptions", FieldType::StrList),
    ("non_goals", FieldType::StrList),
    ("done", FieldType::StrList),
    ("risks", FieldType::StrList),
    ("checks", FieldType::StrList),
];

const TASK_DETAIL_FIELDS: &[(&str, FieldType)] = &[
    ("title", FieldType::Str),
    ("description", FieldType::Str),
    ("context", FieldType::Str),
    ("priority", FieldType::Priority),
    ("tags", FieldType::StrList),
    ("blocked", FieldType::Bool),
    ("blockers", FieldType::StrList),
    ("success_criteria", FieldType::StrList),
    ("tests", FieldType::StrList),
    ("next_steps", FieldType::StrList),
    ("problems", FieldType::StrList),
    ("risks", FieldType::StrList),
    ("depends_on", FieldType::StrList),
    ("contract", FieldType::Str),
    // Plan-only fields, guarded by kind at runtime.
    ("plan_doc", FieldType::Str),
    ("plan_steps", FieldType::StrList),
    ("plan_current", FieldType::Int),
];

const STEP_FIELDS: &[(&str, FieldType)] = &[
    ("title", FieldType::Str),
    ("success_criteria", FieldType::StrList),
    ("tests", FieldType::StrList),
    ("blockers", FieldType::StrList),
    ("required_checkpoints", FieldType::StrList),
];

const TASK_NODE_FIELDS: &[(&str, FieldType)] = &[
    ("title", FieldType::Str),
    ("status", FieldType::Status),
    ("priority", FieldType::Priority),
    ("status_manual", FieldType::Bool),
    ("description", FieldType::Str),
    ("context", FieldType::Str),
    ("success_criteria", FieldType::StrList),
    ("tests", FieldType::StrList),
    ("dependencies", FieldType::StrList),
    ("next_steps", FieldType::StrList),
    ("problems", FieldType::StrList),
    ("risks", FieldType::StrList),
    ("blocked", FieldType::Bool),
    ("blockers", FieldType::StrList),
];

const PLAN_ONLY_FIELDS: [&str; 3] = ["plan_doc", "plan_steps", "plan_current"];

fn lookup(table: &[(&str, FieldType)], field: &str) -> Option<FieldType> {
    table.iter().find(|(name, _)| *name == field).map(|(_, ty)| *ty)
}

/// Infer the patch kind from addressing hints (explicit, no hidden state).
fn infer_kind(data: &Payload) -> String {
    let raw = validate::get_trimmed(data, "kind").to_lowercase();
    if !raw.is_empty() {
        return raw;
    }
    if data.contains_key("task_node_id") {
        return "task".to_string();
    }
    let path = validate::get_trimmed(data, "path");
    if !path.is_empty() && path.rsplit('.').next().unwrap_or("").starts_with("t:") {
        return "task".to_string();
    }
    if data.contains_key("step_id") || !path.is_empty() {
        return "step".to_string();
    }
    "task_detail".to_string()
}

struct PatchOp {
    op: String,
    field: String,
    value: Option<Value>,
}

fn parse_ops(data: &Payload) -> Result<Vec<PatchOp>, AIResponse> {
    let raw = data.get("ops").or_else(|| data.get("operations"));
    let Some(raw) = raw else {
        return Err(error_response("patch", codes::MISSING_OPS, "ops is required"));
    };
    let items =
        validate_array(raw, "ops").map_err(|msg| error_response("patch", codes::INVALID_OPS, &msg))?;
    let mut ops = Vec::new();
    for (idx, item) in items.iter().enumerate() {
        let Some(map) = item.as_object() else {
            return Err(error_response(
                "patch",
                codes::INVALID_OPS,
                &format!("ops[{}] must be an object", idx),
            ));
        };
        let op = validate::get_trimmed(map, "op").to_lowercase();
        if !matches!(op.as_str(), "set" | "unset" | "append" | "remove") {
            return Err(error_response(
                "patch",
                codes::INVALID_OP,
                &format!("ops[{}].op must be: set|unset|append|remove", idx),
            )
            .with_result(json!({"op": item})));
        }
        let field = validate::get_trimmed(map, "field");
        if field.is_empty() {
            return Err(error_response(
                "patch",
                codes::MISSING_FIELD,
                &format!("ops[{}].field is required", idx),
            )
            .with_result(json!({"op": item})));
        }
        let value = map.get("value").cloned();
        if op != "unset" && value.is_none() {
            return Err(error_response(
                "patch",
                codes::MISSING_VALUE,
                &format!("ops[{}].value is required for op={}", idx, op),
            )
            .with_result(json!({"op": item})));
        }
        ops.push(PatchOp { op, field, value });
    }
    Ok(ops)
}

fn apply_list_op(
    current: &mut Vec<String>,
    op: &str,
    value: Option<&Value>,
    field: &str,
) -> Result<(), AIResponse> {
    match op {
        "unset" => {
            current.clear();
            Ok(())
        }
        "set" => {
            let Some(value) = value else {
                return Err(error_response(
                    "patch",
                    codes::MISSING_VALUE,
                    &format!("{} requires a value for op=set", field),
                ));
            };
            if !value.is_array() {
                return Err(error_response(
                    "patch",
                    codes::INVALID_VALUE,
                    &format!("{} must be an array of strings for op=set", field),
                )
                .with_result(json!({"field": field, "op": op})));
            }
            let list = validate::normalize_str_list(value).map_err(|_| {
                error_response(
                    "patch",
                    codes::INVALID_VALUE,
                    &format!("{} must be an array of strings", field),
                )
                .with_result(json!({"field": field, "op": op}))
            })?;
            *current = list;
            Ok(())
        }
        "append" | "remove" => {
            let items: Vec<String> = match value {
                Some(Value::String(s)) => {
                    let trimmed = s.trim();
                    if trimmed.is_empty() {
                        Vec::new()
                    } else {
                        vec![trimmed.to_string()]
                    }
                }
                Some(other) => validate::normalize_str_list(other).map_err(|_| {
                    error_response(
                        "patch",
                        codes::INVALID_VALUE,
                        &format!("{} must be a string or an array of strings", field),
                    )
                    .with_result(json!({"field": field, "op": op}))
                })?,
                None => Vec::new(),
            };
            if op == "append" {
                let mut merged = current.clone();
                merged.extend(items);
                *current = dedupe_strs(merged);
            } else {
                let remove: rustc_hash::FxHashSet<String> = items.into_iter().collect();
                current.retain(|v| !remove.contains(v));
            }
            Ok(())
        }
        _ => Err(error_response(
            "patch",
            codes::INVALID_OP,
            &format!("unknown list op: {}", op),
        )),
    }
}

fn scalar_from(
    value_type: FieldType,
    op: &str,
    value: Option<&Value>,
    field: &str,
) -> Result<Value, AIResponse> {
    let invalid = |msg: String| {
        error_response("patch", codes::INVALID_VALUE, &msg)
            .with_result(json!({"field": field, "op": op}))
    };
    match value_type {
        FieldType::Str => {
            if op == "unset" {
                return Ok(json!(""));
            }
            match value.and_then(Value::as_str) {
                Some(s) => Ok(json!(s)),
                None => Err(invalid(format!("{} must be a string", field))),
            }
        }
        FieldType::Bool => {
            if op == "unset" {
                return Ok(json!(false));
            }
            match value.and_then(Value::as_bool) {
                Some(b) => Ok(json!(b)),
                None => Err(invalid(format!("{} must be a boolean", field))),
            }
        }
        FieldType::Int => {
            if op == "unset" {
                return Ok(json!(0));
            }
            match value {
                Some(Value::Bool(_)) | None => Err(invalid(format!("{} must be a number", field))),
                Some(v) => match v.as_i64() {
                    Some(n) if n >= 0 => Ok(json!(n)),
                    _ => Err(invalid(format!("{} must be a non-negative number", field))),
                },
            }
        }
        FieldType::Priority => {
            if op == "unset" {
                return Ok(json!("MEDIUM"));
            }
            let raw = value.and_then(Value::as_str).unwrap_or_default();
            match Priority::parse(raw) {
                Some(p) => Ok(json!(p.name())),
                None => Err(invalid(format!("{} must be LOW|MEDIUM|HIGH", field))),
            }
        }
        FieldType::Status => {
            if op == "unset" {
                return Ok(json!("TODO"));
            }
            let raw = value.and_then(Value::as_str).unwrap_or_default();
            match Status::parse(raw) {
                Some(s) => Ok(json!(s.name())),
                None => Err(invalid(format!("{} must be TODO|ACTIVE|DONE", field))),
            }
        }
        FieldType::StrList => unreachable!("list fields handled separately"),
    }
}

/// Field access on the three patchable surfaces, by name.
enum Target<'a> {
    Detail(&'a mut Item),
    Step(&'a mut Step),
    Node(&'a mut TaskNode),
}

impl<'a> Target<'a> {
    fn list_mut(&mut self, field: &str) -> Option<&mut Vec<String>> {
        match self {
            Target::Detail(item) => match field {
                "tags" => Some(&mut item.tags),
                "blockers" => Some(&mut item.blockers),
                "success_criteria" => Some(&mut item.success_criteria),
                "tests" => Some(&mut item.tests),
                "next_steps" => Some(&mut item.next_steps),
                "problems" => Some(&mut item.problems),
                "risks" => Some(&mut item.risks),
                "depends_on" => Some(&mut item.depends_on),
                "plan_steps" => Some(&mut item.plan_steps),
                _ => None,
            },
            Target::Step(step) => match field {
                "success_criteria" => Some(&mut step.success_criteria),
                "tests" => Some(&mut step.tests),
                "blockers" => Some(&mut step.blockers),
                "required_checkpoints" => Some(&mut step.required_checkpoints),
                _ => None,
            },
            Target::Node(node) => match field {
                "success_criteria" => Some(&mut node.success_criteria),
                "tests" => Some(&mut node.tests),
                "dependencies" => Some(&mut node.dependencies),
                "next_steps" => Some(&mut node.next_steps),
                "problems" => Some(&mut node.problems),
                "risks" => Some(&mut node.risks),
                "blockers" => Some(&mut node.blockers),
                _ => None,
            },
        }
    }

    fn set_scalar(&mut self, field: &str, value: &Value) -> bool {
        match self {
            Target::Detail(item) => match field {
                "title" => {
                    item.title = value.as_str().unwrap_or_default().to_string();
                    true
                }
                "description" => {
                    item.description = value.as_str().unwrap_or_default().to_string();
                    true
                }
                "context" => {
                    item.context = value.as_str().unwrap_or_default().to_string();
                    true
                }
                "contract" => {
                    item.contract = value.as_str().unwrap_or_default().to_string();
                    true
                }
                "plan_doc" => {
                    item.plan_doc = value.as_str().unwrap_or_default().to_string();
                    true
                }
                "priority" => {
                    item.priority =
                        Priority::parse(value.as_str().unwrap_or_default()).unwrap_or_default();
                    true
                }
                "blocked" => {
                    item.blocked = value.as_bool().unwrap_or(false);
                    true
                }
                "plan_current" => {
                    item.plan_current = value.as_u64().unwrap_or(0) as usize;
                    true
                }
                _ => false,
            },
            Target::Step(step) => match field {
                "title" => {
                    step.title = value.as_str().unwrap_or_default().to_string();
                    true
                }
                _ => false,
            },
            Target::Node(node) => match field {
                "title" => {
                    node.title = value.as_str().unwrap_or_default().to_string();
                    true
                }
                "status" => {
                    node.status = value.as_str().unwrap_or("TODO").to_string();
                    true
                }
                "priority" => {
                    node.priority = value.as_str().unwrap_or("MEDIUM").to_string();
                    true
                }
                "status_manual" => {
                    node.status_manual = value.as_bool().unwrap_or(false);
                    true
                }
                "description" => {
                    node.description = value.as_str().unwrap_or_default().to_string();
                    true
                }
                "context" => {
                    node.context = value.as_str().unwrap_or_default().to_string();
                    true
                }
                "blocked" => {
                    node.blocked = value.as_bool().unwrap_or(false);
                    true
                }
                _ => false,
            },
        }
    }
}

/// Apply all ops to one target. Returns updated field names (dotted for
/// contract_data) or an error response.
fn apply_ops(
    target: &mut Target<'_>,
    table: &[(&str, FieldType)],
    ops: &[PatchOp],
) -> Result<Vec<String>, AIResponse> {
    let mut updated: Vec<String> = Vec::new();
    for op in ops {
        if let Some(key) = op.field.strip_prefix("contract_data.") {
            let Target::Detail(item) = &mut *target else {
                return Err(error_response(
                    "patch",
                    codes::INVALID_FIELD,
                    &format!("{} is only valid for kind=task_detail", op.field),
                ));
            };
            if key.is_empty() || key.contains('.') {
                return Err(error_response(
                    "patch",
                    codes::INVALID_FIELD,
                    &format!("invalid field: {} (expected contract_data.<key>)", op.field),
                ));
            }
            let Some(value_type) = lookup(CONTRACT_DATA_FIELDS, key) else {
                return Err(error_response(
                    "patch",
                    codes::FORBIDDEN_FIELD,
                    &format!("contract_data.{} is not supported", key),
                )
                .with_result(json!({"field": op.field})));
            };
            match value_type {
                FieldType::StrList => {
                    let current = match key {
                        "constraints" => &mut item.contract_data.constraints,
                        "assumptions" => &mut item.contract_data.assumptions,
                        "non_goals" => &mut item.contract_data.non_goals,
                        "done" => &mut item.contract_data.done,
                        "risks" => &mut item.contract_data.risks,
                        "checks" => &mut item.contract_data.checks,
                        _ => unreachable!(),
                    };
                    apply_list_op(current, &op.op, op.value.as_ref(), &op.field)?;
                }
                FieldType::Str => {
                    if matches!(op.op.as_str(), "append" | "remove") {
                        return Err(error_response(
                            "patch",
                            codes::INVALID_OP,
                            &format!("{} does not support op={}", op.field, op.op),
                        ));
                    }
                    let value = scalar_from(FieldType::Str, &op.op, op.value.as_ref(), &op.field)?;
                    item.contract_data.goal = value.as_str().unwrap_or_default().to_string();
                }
                _ => unreachable!("contract_data fields are str or str_list"),
            }
            updated.push(op.field.clone());
            continue;
        }

        if op.field.contains('.') {
            return Err(error_response(
                "patch",
                codes::INVALID_FIELD,
                &format!(
                    "invalid field: {} (only contract_data.<key> and top-level fields)",
                    op.field
                ),
            ));
        }
        let Some(value_type) = lookup(table, &op.field) else {
            return Err(error_response(
                "patch",
                codes::FORBIDDEN_FIELD,
                &format!("field is not supported: {}", op.field),
            )
            .with_result(json!({"field": op.field})));
        };

        if value_type == FieldType::StrList {
            let current = target
                .list_mut(&op.field)
                .expect("list fields in tables have list storage");
            apply_list_op(current, &op.op, op.value.as_ref(), &op.field)?;
            updated.push(op.field.clone());
            continue;
        }

        if matches!(op.op.as_str(), "append" | "remove") {
            return Err(error_response(
                "patch",
                codes::INVALID_OP,
                &format!("{} does not support op={}", op.field, op.op),
            ));
        }
        let value = scalar_from(value_type, &op.op, op.value.as_ref(), &op.field)?;
        if !target.set_scalar(&op.field, &value) {
            return Err(error_response(
                "patch",
                codes::FORBIDDEN_FIELD,
                &format!("field is not supported: {}", op.field),
            ));
        }
        updated.push(op.field.clone());
    }
    Ok(updated)
}

/// Read one (possibly dotted) field off a serialized view, for diff output.
fn field_value(view: &Value, field: &str) -> Value {
    if let Some(key) = field.strip_prefix("contract_data.") {
        return view
            .get("contract_data")
            .and_then(|cd| cd.get(key))
            .cloned()
            .unwrap_or(Value::Null);
    }
    view.get(field).cloned().unwrap_or(Value::Null)
}

fn diff_payload(before: &Value, after: &Value, fields: &[String]) -> Value {
    let mut state = Map::new();
    let mut entries = Vec::new();
    let mut seen = rustc_hash::FxHashSet::default();
    for field in fields {
        if !seen.insert(field.clone()) {
            continue;
        }
        let from = field_value(before, field);
        let to = field_value(after, field);
        state.insert(field.clone(), json!({"from": from.clone(), "to": to.clone()}));
        entries.push(json!({"field": field, "before": from, "after": to}));
    }
    json!({"state": state, "fields": entries})
}

pub fn handle_patch(d: &Dispatcher, data: &Payload) -> AIResponse {
    let (task_id, base) = match d.require_item("patch", data, &["TASK-", "PLAN-"]) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    let ops = match parse_ops(data) {
        Ok(ops) => ops,
        Err(resp) => return resp,
    };
    let kind = infer_kind(data);
    if !matches!(kind.as_str(), "task_detail" | "step" | "task") {
        return error_response("patch", codes::INVALID_KIND, "kind must be: task_detail|step|task");
    }
    if kind != "task_detail" && !base.is_task() {
        return error_response(
            "patch",
            codes::NOT_A_TASK,
            "patch(kind=step|task) applies to tasks (TASK-###)",
        );
    }
    let dry_run = validate::get_bool(data, "dry_run", false);
    let mut item = base.clone();

    if kind == "task_detail" {
        if !item.is_plan() {
            let touches_plan_fields = ops
                .iter()
                .any(|op| PLAN_ONLY_FIELDS.contains(&op.field.as_str()));
            if touches_plan_fields {
                return error_response(
                    "patch",
                    codes::NOT_A_PLAN,
                    "plan_* fields apply to plans (PLAN-###)",
                );
            }
        }
        let before_view = item_view(&item, false);
        let updated = {
            let mut target = Target::Detail(&mut item);
            match apply_ops(&mut target, TASK_DETAIL_FIELDS, &ops) {
                Ok(updated) => updated,
                Err(resp) => return resp,
            }
        };

        // Checkpoint semantics for the root criteria/tests lists.
        if updated.iter().any(|f| f == "success_criteria") {
            item.checkpoints.criteria.confirmed = false;
            item.checkpoints.criteria.auto_confirmed = false;
        }
        if updated.iter().any(|f| f == "tests") {
            item.checkpoints.tests.confirmed = false;
            item.checkpoints.tests.auto_confirmed = item.tests.is_empty();
        }
        let contract_touched = updated
            .iter()
            .any(|f| f == "contract" || f.starts_with("contract_data."));
        item.update_status_from_progress();

        let after_view = item_view(&item, false);
        let mut sorted = updated.clone();
        sorted.sort();
        sorted.dedup();
        if dry_run {
            return AIResponse::ok(
                "patch",
                json!({
                    "dry_run": true,
                    "would_execute": true,
                    "task_id": task_id,
                    "kind": "task_detail",
                    "updated_fields": sorted,
                    "current": before_view.clone(),
                    "computed": after_view.clone(),
                    "diff": diff_payload(&before_view, &after_view, &updated),
                    item_key(&item): after_view,
                }),
            )
            .with_context("task_id", json!(task_id));
        }
        if contract_touched {
            item.append_contract_version_if_changed(Actor::Ai, "patch");
        }
        // Timeline both ways for dependency edits, as in `edit`.
        if updated.iter().any(|f| f == "depends_on") {
            for dep in &item.depends_on {
                if !base.depends_on.contains(dep) {
                    item.events.push(TaskEvent::dependency_added(dep, Actor::Ai));
                }
            }
            for dep in &base.depends_on {
                if !item.depends_on.contains(dep) {
                    item.events.push(TaskEvent::dependency_resolved(dep, Actor::System));
                }
            }
        }
        let reloaded = match d.save_and_reload("patch", &mut item) {
            Ok(item) => item,
            Err(resp) => return resp,
        };
        return AIResponse::ok(
            "patch",
            json!({
                "task_id": task_id,
                "kind": "task_detail",
                "updated_fields": sorted,
                item_key(&reloaded): item_view(&reloaded, false),
            }),
        )
        .with_context("task_id", json!(task_id));
    }

    if kind == "step" {
        let path = match validate::resolve_step_path(&item, data, "path") {
            Ok(path) => path,
            Err((code, msg)) => {
                return error_response("patch", &code, &msg)
                    .with_recovery("Grab a valid path/step_id via radar/mirror.")
                    .with_suggestions(d.path_help_suggestions(&task_id));
            }
        };
        let Some(step) = step_at_mut(&mut item.steps, &path) else {
            return error_response(
                "patch",
                codes::PATH_NOT_FOUND,
                &format!("step path={} not found", path),
            )
            .with_recovery("Grab a valid path/step_id via radar/mirror.")
            .with_suggestions(d.path_help_suggestions(&task_id));
        };
        let before_view = step_view(step, Some(&path.to_string()), false);
        let updated = {
            let mut target = Target::Step(&mut *step);
            match apply_ops(&mut target, STEP_FIELDS, &ops) {
                Ok(updated) => updated,
                Err(resp) => return resp,
            }
        };
        // Any step redefinition reopens it and resets the touched gates.
        if !updated.is_empty() {
            step.completed = false;
            step.completed_at = None;
        }
        if updated.iter().any(|f| f == "success_criteria") {
            step.checkpoints.criteria.confirmed = false;
            step.checkpoints.criteria.auto_confirmed = false;
        }
        if updated.iter().any(|f| f == "tests") {
            step.checkpoints.tests.confirmed = false;
            step.checkpoints.tests.auto_confirmed = step.tests.is_empty();
        }
        let after_view = step_view(step, Some(&path.to_string()), false);
        item.update_status_from_progress();

        let mut sorted = updated.clone();
        sorted.sort();
        sorted.dedup();
        if dry_run {
            return AIResponse::ok(
                "patch",
                json!({
                    "dry_run": true,
                    "would_execute": true,
                    "task_id": task_id,
                    "kind": "step",
                    "path": path.to_string(),
                    "updated_fields": sorted,
                    "current": before_view.clone(),
                    "computed": after_view.clone(),
                    "diff": diff_payload(&before_view, &after_view, &updated),
                    "step": after_view,
                    "task": item_view(&item, false),
                }),
            )
            .with_context("task_id", json!(task_id));
        }
        let reloaded = match d.save_and_reload("patch", &mut item) {
            Ok(item) => item,
            Err(resp) => return resp,
        };
        let step_snapshot = step_at(&reloaded.steps, &path)
            .map(|st| step_view(st, Some(&path.to_string()), false));
        return AIResponse::ok(
            "patch",
            json!({
                "task_id": task_id,
                "kind": "step",
                "path": path.to_string(),
                "updated_fields": sorted,
                "step": step_snapshot,
                "task": item_view(&reloaded, false),
            }),
        )
        .with_context("task_id", json!(task_id));
    }

    // kind == "task": a TaskNode inside a step's embedded plan.
    let path = match validate::resolve_node_path(&item, data, "path") {
        Ok(path) => path,
        Err((code, msg)) => {
            return error_response("patch", &code, &msg)
                .with_recovery("Grab a valid task path/task_node_id via mirror/radar.")
                .with_suggestions(d.path_help_suggestions(&task_id));
        }
    };
    let Some(node) = node_at_mut(&mut item.steps, &path) else {
        return error_response(
            "patch",
            codes::PATH_NOT_FOUND,
            &format!("task node path={} not found", path),
        )
        .with_recovery("Grab a valid task path/task_node_id via mirror/radar.")
        .with_suggestions(d.path_help_suggestions(&task_id));
    };
    let before_view = task_node_view(node, Some(&path.to_string()), false);
    let updated = {
        let mut target = Target::Node(&mut *node);
        match apply_ops(&mut target, TASK_NODE_FIELDS, &ops) {
            Ok(updated) => updated,
            Err(resp) => return resp,
        }
    };
    if updated.iter().any(|f| f == "success_criteria") {
        node.checkpoints.criteria.confirmed = false;
        node.checkpoints.criteria.auto_confirmed = false;
    }
    if updated.iter().any(|f| f == "tests") {
        node.checkpoints.tests.confirmed = false;
        node.checkpoints.tests.auto_confirmed = node.tests.is_empty();
    }
    // An explicit status without an explicit pin becomes a manual status.
    if updated.iter().any(|f| f == "status") && !updated.iter().any(|f| f == "status_manual") {
        node.status_manual = true;
    }
    let after_view = task_node_view(node, Some(&path.to_string()), false);
    item.update_status_from_progress();

    let mut sorted = updated.clone();
    sorted.sort();
    sorted.dedup();
    if dry_run {
        return AIResponse::ok(
            "patch",
            json!({
                "dry_run": true,
                "would_execute": true,
                "task_id": task_id,
                "kind": "task",
                "path": path.to_string(),
                "updated_fields": sorted,
                "current": before_view.clone(),
                "computed": after_view.clone(),
                "diff": diff_payload(&before_view, &after_view, &updated),
                "task_node": after_view,
                "task": item_view(&item, false),
            }),
        )
        .with_context("task_id", json!(task_id));
    }
    let reloaded = match d.save_and_reload("patch", &mut item) {
        Ok(item) => item,
        Err(resp) => return resp,
    };
    let node_snapshot = node_at(&reloaded.steps, &path)
        .map(|n| task_node_view(n, Some(&path.to_string()), false));
    AIResponse::ok(
        "patch",
        json!({
            "task_id": task_id,
            "kind": "task",
            "path": path.to_string(),
            "updated_fields": sorted,
            "task_node": node_snapshot,
            "task": item_view(&reloaded, false),
        }),
    )
    .with_context("task_id", json!(task_id))
}
