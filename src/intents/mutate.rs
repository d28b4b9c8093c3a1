//! Item- and step-level mutations: `edit`, `define`, `note`, `block`,
//! `contract`, `plan`, `complete`, `delete`.

use crate::core::deps::{build_dependency_graph, validate_dependencies};
use crate::core::event::{Actor, TaskEvent};
use crate::core::item::Status;
use crate::core::lint::lint_item;
use crate::core::step::{step_at, step_at_mut};
use crate::core::time::now_iso;
use crate::intents::Dispatcher;
use crate::intents::response::{AIResponse, codes, error_response};
use crate::intents::validate::{self, Payload, normalize_str_list, resolve_step_path};
use crate::intents::view::{item_key, item_view, step_view};
use rustc_hash::FxHashSet;
use serde_json::{Value, json};

pub fn handle_edit(d: &Dispatcher, data: &Payload) -> AIResponse {
    let (task_id, mut item) = match d.require_item("edit", data, &["TASK-", "PLAN-"]) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };

    let mut updated_fields: Vec<String> = Vec::new();
    let old_domain = item.domain.clone();

    if let Some(description) = validate::get_str(data, "description") {
        item.description = description.to_string();
        updated_fields.push("description".into());
    }
    if let Some(context) = validate::get_str(data, "context") {
        item.context = context.to_string();
        updated_fields.push("context".into());
    }
    if let Some(priority) = validate::get_str(data, "priority") {
        match crate::core::item::Priority::parse(priority) {
            Some(parsed) => {
                item.priority = parsed;
                updated_fields.push("priority".into());
            }
            None => {
                return error_response("edit", codes::INVALID_PRIORITY, "priority must be LOW|MEDIUM|HIGH");
            }
        }
    }
    if let Some(tags) = data.get("tags") {
        match normalize_str_list(tags) {
            Ok(list) => {
                item.tags = list;
                updated_fields.push("tags".into());
            }
            Err(_) => {
                return error_response("edit", codes::INVALID_TAGS, "tags must be an array of strings");
            }
        }
    }
    if let Some(depends_on) = data.get("depends_on") {
        let raw = match normalize_str_list(depends_on) {
            Ok(list) => list,
            Err(_) => {
                return error_response(
                    "edit",
                    codes::INVALID_DEPENDS_ON,
                    "depends_on must be an array of strings",
                );
            }
        };
        let normalized: Vec<String> = raw.iter().map(|s| s.trim().to_uppercase()).collect();
        for dep in &normalized {
            if crate::core::ident::id_error(dep).is_some() {
                return error_response(
                    "edit",
                    codes::INVALID_DEPENDENCIES,
                    &format!("depends_on contains an invalid id: {}", dep),
                );
            }
        }
        let all_items = d.list_all();
        let tasks: Vec<&crate::core::item::Item> =
            all_items.iter().filter(|i| i.is_task()).collect();
        let existing: FxHashSet<String> = tasks.iter().map(|t| t.id.clone()).collect();
        let graph = build_dependency_graph(
            &tasks
                .iter()
                .map(|t| (t.id.clone(), t.depends_on.clone()))
                .collect::<Vec<_>>(),
        );
        let (errors, cycle) = validate_dependencies(&item.id, &normalized, &existing, &graph);
        if !errors.is_empty() {
            let rendered: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            return error_response("edit", codes::INVALID_DEPENDENCIES, &rendered.join("; "));
        }
        if let Some(cycle) = cycle {
            return error_response("edit", codes::CIRCULAR_DEPENDENCY, &cycle.join(" -> "));
        }
        // Timeline both ways: new ids are added, dropped ids are resolved.
        let old_deps = item.depends_on.clone();
        for dep in &normalized {
            if !old_deps.contains(dep) {
                item.events.push(TaskEvent::dependency_added(dep, Actor::Ai));
            }
        }
        for dep in &old_deps {
            if !normalized.contains(dep) {
                item.events.push(TaskEvent::dependency_resolved(dep, Actor::System));
            }
        }
        item.depends_on = normalized;
        updated_fields.push("depends_on".into());
    }

    let new_domain = validate::get_str(data, "new_domain").map(|s| s.trim().to_string());
    if let Some(domain) = &new_domain {
        match crate::core::repo::Repository::sanitize_domain(domain) {
            Ok(sanitized) => {
                item.domain = sanitized;
                updated_fields.push("domain".into());
            }
            Err(err) => {
                return error_response("edit", codes::INVALID_FIELDS, &err.to_string());
            }
        }
    }

    if updated_fields.is_empty() {
        return error_response("edit", codes::NO_FIELDS, "nothing to update");
    }

    // Persist; a domain change is a move (save at the new path, drop the old file).
    let moved = updated_fields.contains(&"domain".to_string()) && item.domain != old_domain;
    let reloaded = match d.save_and_reload("edit", &mut item) {
        Ok(item) => item,
        Err(resp) => return resp,
    };
    if moved {
        let _ = d.repo().delete(&reloaded.id, &old_domain);
    }

    updated_fields.sort();
    updated_fields.dedup();
    AIResponse::ok(
        "edit",
        json!({
            item_key(&reloaded): item_view(&reloaded, false),
            "updated_fields": updated_fields,
        }),
    )
    .with_context("task_id", json!(task_id))
}

pub fn handle_define(d: &Dispatcher, data: &Payload) -> AIResponse {
    let (task_id, mut task) = match d.require_task("define", data) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    let path = match resolve_step_path(&task, data, "path") {
        Ok(path) => path,
        Err((code, msg)) => {
            return error_response("define", &code, &msg)
                .with_recovery("Grab a valid path/step_id via radar/mirror.")
                .with_suggestions(d.path_help_suggestions(&task_id));
        }
    };
    let Some(step) = step_at_mut(&mut task.steps, &path) else {
        return error_response(
            "define",
            codes::PATH_NOT_FOUND,
            &format!("step path={} not found", path),
        )
        .with_suggestions(d.path_help_suggestions(&task_id));
    };

    let mut updated_fields: Vec<String> = Vec::new();
    if let Some(title) = data.get("title").and_then(Value::as_str) {
        let trimmed = title.trim();
        if trimmed.is_empty() {
            return error_response("define", codes::MISSING_TITLE, "title must not be empty");
        }
        step.title = trimmed.to_string();
        updated_fields.push("title".into());
    }
    if let Some(value) = data.get("success_criteria") {
        match normalize_str_list(value) {
            Ok(list) => {
                step.success_criteria = list;
                step.checkpoints.criteria.confirmed = false;
                step.checkpoints.criteria.auto_confirmed = false;
                updated_fields.push("success_criteria".into());
            }
            Err(msg) => {
                return error_response(
                    "define",
                    codes::INVALID_FIELDS,
                    &format!("success_criteria {}", msg),
                );
            }
        }
    }
    if let Some(value) = data.get("tests") {
        match normalize_str_list(value) {
            Ok(list) => {
                step.checkpoints.tests.confirmed = false;
                step.checkpoints.tests.auto_confirmed = list.is_empty();
                step.tests = list;
                updated_fields.push("tests".into());
            }
            Err(msg) => {
                return error_response("define", codes::INVALID_FIELDS, &format!("tests {}", msg));
            }
        }
    }
    if let Some(value) = data.get("blockers") {
        match normalize_str_list(value) {
            Ok(list) => {
                step.blockers = list;
                updated_fields.push("blockers".into());
            }
            Err(msg) => {
                return error_response("define", codes::INVALID_FIELDS, &format!("blockers {}", msg));
            }
        }
    }
    if updated_fields.is_empty() {
        return error_response("define", codes::NO_FIELDS, "nothing to update");
    }
    // Redefining a step reopens it.
    step.completed = false;
    step.completed_at = None;
    task.update_status_from_progress();

    let reloaded = match d.save_and_reload("define", &mut task) {
        Ok(item) => item,
        Err(resp) => return resp,
    };
    let step_snapshot = step_at(&reloaded.steps, &path)
        .map(|st| step_view(st, Some(&path.to_string()), false));
    AIResponse::ok(
        "define",
        json!({
            "task_id": task_id,
            "path": path.to_string(),
            "updated_fields": updated_fields,
            "step": step_snapshot,
            "task": item_view(&reloaded, false),
        }),
    )
    .with_context("task_id", json!(task_id))
}

pub fn handle_note(d: &Dispatcher, data: &Payload) -> AIResponse {
    let (task_id, mut task) = match d.require_task("note", data) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    let note = validate::get_trimmed(data, "note");
    if note.is_empty() {
        return error_response("note", codes::MISSING_NOTE, "note is required");
    }
    let path = match resolve_step_path(&task, data, "path") {
        Ok(path) => path,
        Err((code, msg)) => {
            return error_response("note", &code, &msg)
                .with_recovery("Grab a valid path/step_id via radar/mirror.")
                .with_suggestions(d.path_help_suggestions(&task_id));
        }
    };
    let Some(step) = step_at_mut(&mut task.steps, &path) else {
        return error_response(
            "note",
            codes::PATH_NOT_FOUND,
            &format!("step path={} not found", path),
        )
        .with_suggestions(d.path_help_suggestions(&task_id));
    };
    step.progress_notes.push(note.clone());
    if step.started_at.is_none() {
        step.started_at = Some(now_iso());
    }
    let total_notes = step.progress_notes.len();
    let computed_status = step.computed_status().to_string();

    if let Err(resp) = d.save_and_reload("note", &mut task) {
        return resp;
    }
    AIResponse::ok(
        "note",
        json!({
            "task_id": task_id,
            "path": path.to_string(),
            "note": note,
            "total_notes": total_notes,
            "computed_status": computed_status,
        }),
    )
    .with_context("task_id", json!(task_id))
}

pub fn handle_block(d: &Dispatcher, data: &Payload) -> AIResponse {
    let (task_id, mut task) = match d.require_task("block", data) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    let blocked = validate::get_bool(data, "blocked", true);
    let reason = validate::get_trimmed(data, "reason");
    let path = match resolve_step_path(&task, data, "path") {
        Ok(path) => path,
        Err((code, msg)) => {
            return error_response("block", &code, &msg)
                .with_recovery("Grab a valid path/step_id via radar/mirror.")
                .with_suggestions(d.path_help_suggestions(&task_id));
        }
    };
    let Some(step) = step_at_mut(&mut task.steps, &path) else {
        return error_response(
            "block",
            codes::PATH_NOT_FOUND,
            &format!("step path={} not found", path),
        )
        .with_suggestions(d.path_help_suggestions(&task_id));
    };
    step.blocked = blocked;
    step.block_reason = if blocked { reason.clone() } else { String::new() };
    let target = format!("step:{}", path);
    if blocked {
        task.events.push(TaskEvent::blocked(&reason, &target, Actor::Ai));
    } else {
        task.events.push(TaskEvent::unblocked(&target, Actor::Ai));
    }

    let reloaded = match d.save_and_reload("block", &mut task) {
        Ok(item) => item,
        Err(resp) => return resp,
    };
    let step_snapshot = step_at(&reloaded.steps, &path)
        .map(|st| step_view(st, Some(&path.to_string()), false));
    AIResponse::ok(
        "block",
        json!({
            "task_id": task_id,
            "path": path.to_string(),
            "blocked": blocked,
            "block_reason": if blocked { reason } else { String::new() },
            "step": step_snapshot,
        }),
    )
    .with_context("task_id", json!(task_id))
}

pub fn handle_contract(d: &Dispatcher, data: &Payload) -> AIResponse {
    let (plan_id, mut plan) = match d.require_plan("contract", data) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };

    if validate::get_bool(data, "clear", false) {
        plan.contract = String::new();
    }
    if let Some(current) = validate::get_str(data, "current") {
        plan.contract = current.to_string();
    }
    if let Some(contract_data) = data.get("contract_data") {
        match crate::core::item::ContractData::from_value(contract_data) {
            Ok(parsed) => plan.contract_data = parsed,
            Err(msg) => {
                return error_response("contract", codes::INVALID_CONTRACT_DATA, &msg);
            }
        }
    }
    plan.append_contract_version_if_changed(Actor::Ai, "contract");

    let reloaded = match d.save_and_reload("contract", &mut plan) {
        Ok(item) => item,
        Err(resp) => return resp,
    };
    AIResponse::ok("contract", json!({"plan": item_view(&reloaded, false)}))
        .with_context("task_id", json!(plan_id))
}

pub fn handle_plan(d: &Dispatcher, data: &Payload) -> AIResponse {
    let (plan_id, mut plan) = match d.require_plan("plan", data) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };

    if let Some(doc) = validate::get_str(data, "doc") {
        plan.plan_doc = doc.to_string();
    }
    if let Some(steps) = data.get("steps") {
        match normalize_str_list(steps) {
            Ok(list) => plan.plan_steps = list,
            Err(_) => {
                return error_response(
                    "plan",
                    codes::INVALID_STEPS,
                    "plan.steps must be an array of strings",
                );
            }
        }
    }
    if let Some(current) = data.get("current") {
        match current.as_u64() {
            Some(value) => plan.plan_current = value as usize,
            None => {
                return error_response("plan", codes::INVALID_CURRENT, "plan.current must be a number");
            }
        }
    }
    if validate::get_bool(data, "advance", false) {
        plan.plan_current += 1;
    }
    plan.clamp_plan_current();
    plan.events.push(TaskEvent::plan_updated(
        plan.contract_versions.len() as u64,
        Actor::Ai,
    ));

    let reloaded = match d.save_and_reload("plan", &mut plan) {
        Ok(item) => item,
        Err(resp) => return resp,
    };
    AIResponse::ok("plan", json!({"plan": item_view(&reloaded, false)}))
        .with_context("task_id", json!(plan_id))
}

pub fn handle_complete(d: &Dispatcher, data: &Payload) -> AIResponse {
    let (task_id, mut item) = match d.require_item("complete", data, &["TASK-", "PLAN-"]) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };

    let status_raw = validate::get_trimmed(data, "status");
    let status = if status_raw.is_empty() {
        Status::Done
    } else {
        match Status::parse(&status_raw) {
            Some(status) => status,
            None => {
                return error_response("complete", codes::INVALID_STATUS, "status must be TODO|ACTIVE|DONE");
            }
        }
    };
    let force = validate::get_bool(data, "force", false);
    let override_reason = validate::get_trimmed(data, "override_reason");
    if force && override_reason.is_empty() {
        return error_response(
            "complete",
            codes::MISSING_OVERRIDE_REASON,
            "override_reason is required with force=true",
        );
    }

    // Completing to DONE is blocked by lint errors unless explicitly forced.
    if status == Status::Done && !force {
        let all_items = d.list_all();
        let report = lint_item(&item, &all_items);
        let errors: Vec<Value> = report.errors().iter().map(|i| i.to_value()).collect();
        if !errors.is_empty() {
            return error_response("complete", codes::LINT_ERRORS_BLOCKING, "cannot complete: lint errors exist")
                .with_recovery("Fix the lint errors or use force=true with override_reason.")
                .with_result(json!({
                    "task": task_id,
                    "lint": report.to_value(),
                    "blocking_errors": errors,
                }));
        }
        if item.is_task() && item.has_subtasks() && item.progress() < 100 {
            return error_response(
                "complete",
                codes::GATING_FAILED,
                "cannot complete: step tree is not at 100%",
            )
            .with_recovery("Close the remaining steps (close_step) or use force=true with override_reason.")
            .with_result(json!({"task": task_id, "progress": item.progress()}));
        }
    }

    let old_status = item.status;
    item.status = status;
    // An explicit completion pins the status against progress-derived flips.
    item.status_manual = true;
    item.events.push(TaskEvent::status_changed(
        old_status.name(),
        status.name(),
        Actor::Ai,
    ));
    if force && !override_reason.is_empty() {
        item.events.push(TaskEvent::override_event(
            &format!("complete:{}", status.name()),
            &override_reason,
            &format!("task:{}", task_id),
        ));
    }

    let reloaded = match d.save_and_reload("complete", &mut item) {
        Ok(item) => item,
        Err(resp) => return resp,
    };
    AIResponse::ok(
        "complete",
        json!({item_key(&reloaded): item_view(&reloaded, false)}),
    )
    .with_context("task_id", json!(task_id))
}

pub fn handle_delete(d: &Dispatcher, data: &Payload) -> AIResponse {
    let target = data.get("task").or_else(|| data.get("plan"));
    let task_id = match validate::validate_task_id(target) {
        Ok(id) => id,
        Err(msg) => {
            return error_response("delete", codes::INVALID_TASK, &msg)
                .with_recovery("Check ids via context(include_all=true).")
                .with_suggestions(d.missing_target_suggestions(&["TASK-", "PLAN-"]));
        }
    };

    // Whole-item delete when no step addressing is present.
    if !data.contains_key("path") && !data.contains_key("step_id") {
        let domain = validate::get_trimmed(data, "domain");
        let deleted = d.repo().delete(&task_id, &domain).unwrap_or(false);
        return AIResponse::ok("delete", json!({"task_id": task_id, "deleted": deleted}));
    }

    let Some(mut task) = d.load_item(&task_id) else {
        return crate::intents::context::not_found_response(d, "delete", &task_id);
    };
    if !task.is_task() {
        return error_response(
            "delete",
            codes::NOT_A_TASK,
            "delete with a path applies to tasks (TASK-###)",
        );
    }
    let path = match resolve_step_path(&task, data, "path") {
        Ok(path) => path,
        Err((code, msg)) => {
            return error_response("delete", &code, &msg)
                .with_recovery("Grab a valid path/step_id via radar/mirror.")
                .with_suggestions(d.path_help_suggestions(&task_id));
        }
    };

    // Remove the step from its parent list.
    let segs = path.segments();
    let Some(crate::core::ident::Seg::Step(step_idx)) = segs.last().copied() else {
        return error_response("delete", codes::INVALID_PATH, "path must address a step");
    };
    let removed = if segs.len() == 1 {
        if step_idx >= task.steps.len() {
            None
        } else {
            Some(task.steps.remove(step_idx))
        }
    } else {
        let parent_raw: Vec<String> = segs[..segs.len() - 1]
            .iter()
            .map(|seg| match seg {
                crate::core::ident::Seg::Step(n) => format!("s:{}", n),
                crate::core::ident::Seg::Node(n) => format!("t:{}", n),
            })
            .collect();
        let parent_path = crate::core::ident::StepPath::parse(&parent_raw.join("."))
            .expect("parent of a step path is a node path");
        match crate::core::step::node_at_mut(&mut task.steps, &parent_path) {
            Some(node) if step_idx < node.steps.len() => Some(node.steps.remove(step_idx)),
            _ => None,
        }
    };
    let Some(removed) = removed else {
        return error_response(
            "delete",
            codes::PATH_NOT_FOUND,
            &format!("step path={} not found", path),
        )
        .with_suggestions(d.path_help_suggestions(&task_id));
    };
    task.update_status_from_progress();

    if let Err(resp) = d.save_and_reload("delete", &mut task) {
        return resp;
    }
    AIResponse::ok(
        "delete",
        json!({
            "task_id": task_id,
            "path": path.to_string(),
            "deleted_step": step_view(&removed, Some(&path.to_string()), false),
        }),
    )
    .with_context("task_id", json!(task_id))
}
