//! Read-only and navigational intents: `context`, `focus_*`, `resume`,
//! `mirror`, `lint`, `templates_list`, `storage`.

use crate::core::ident::StepPath;
use crate::core::item::{Item, Status};
use crate::core::lint::lint_item;
use crate::core::namespace::{global_storage_dir, project_namespace};
use crate::core::step::{Step, TaskNode, count_step_tree, flatten_steps, node_at, step_at};
use crate::core::templates::list_templates;
use crate::intents::response::{AIResponse, Suggestion, codes, error_response};
use crate::intents::validate::{
    self, Payload, normalize_filter_list, normalize_status_filter, parse_cursor, parse_limit,
    validate_task_id,
};
use crate::intents::view::{item_view, plan_node_view, step_view, task_node_view};
use crate::intents::{Dispatcher, radar};
use serde_json::{Map, Value, json};

/// Resolve a read-target id from explicit `task`/`plan` keys or focus.
pub(crate) fn read_target(d: &Dispatcher, intent: &str, data: &Payload) -> Result<String, AIResponse> {
    let explicit = data.get("task").or_else(|| data.get("plan"));
    let raw = match explicit {
        Some(value) => Some(value.clone()),
        None => d.focus().get().map(|p| json!(p.task)),
    };
    let Some(raw) = raw else {
        return Err(error_response(intent, codes::MISSING_ID, "No task/plan given and no focus set")
            .with_recovery("Pass task=TASK-###|plan=PLAN-### or set focus via focus_set.")
            .with_suggestions(d.missing_target_suggestions(&["TASK-", "PLAN-"])));
    };
    validate_task_id(Some(&raw)).map_err(|msg| {
        error_response(intent, codes::INVALID_ID, &msg)
            .with_recovery("Check ids via context(include_all=true) or set focus via focus_set.")
            .with_suggestions(d.missing_target_suggestions(&["TASK-", "PLAN-"]))
    })
}

pub(crate) fn not_found_response(d: &Dispatcher, intent: &str, id: &str) -> AIResponse {
    let want: &[&str] = if id.starts_with("PLAN-") { &["PLAN-"] } else { &["TASK-"] };
    error_response(intent, codes::NOT_FOUND, &format!("Not found: {}", id))
        .with_recovery("Check ids via context(include_all=true) or reset focus.")
        .with_suggestions(d.missing_target_suggestions(want))
        .with_result(json!({"task": id}))
}

struct Filters {
    statuses: Vec<String>,
    tags: Vec<String>,
    domain: String,
    parent: String,
}

fn apply_filters<'a>(items: &'a [Item], filters: &Filters) -> Vec<&'a Item> {
    items
        .iter()
        .filter(|item| {
            if !filters.statuses.is_empty() && !filters.statuses.contains(&item.status.name().to_string())
            {
                return false;
            }
            if !filters.tags.is_empty() {
                let tags: Vec<String> = item.tags.iter().map(|t| t.trim().to_lowercase()).collect();
                if !filters.tags.iter().any(|t| tags.contains(&t.to_lowercase())) {
                    return false;
                }
            }
            if !filters.domain.is_empty() && item.domain != filters.domain {
                return false;
            }
            if !filters.parent.is_empty()
                && item.parent.as_deref().unwrap_or_default() != filters.parent
            {
                return false;
            }
            true
        })
        .collect()
}

fn paginate<'a>(
    items: Vec<&'a Item>,
    cursor: Option<usize>,
    limit: Option<usize>,
) -> (Vec<&'a Item>, Value) {
    let total = items.len();
    let offset = cursor.unwrap_or(0).min(total);
    let limit = limit.unwrap_or(total - offset).min(total - offset);
    let page: Vec<&Item> = items.into_iter().skip(offset).take(limit).collect();
    let next_cursor = if offset + limit < total {
        Some((offset + limit).to_string())
    } else {
        None
    };
    let meta = json!({
        "cursor": cursor.map(|c| c.to_string()),
        "next_cursor": next_cursor,
        "total": total,
        "count": page.len(),
        "limit": limit,
    });
    (page, meta)
}

fn build_subtree(item: &Item, subtree: &Payload) -> Result<Option<Value>, AIResponse> {
    let compact = validate::get_bool(subtree, "compact", true);
    let kind = validate::get_trimmed(subtree, "kind").to_lowercase();
    let kind = if kind.is_empty() { "step".to_string() } else { kind };
    match kind.as_str() {
        "task" => {
            let path = validate::resolve_node_path(item, subtree, "path").map_err(|(code, msg)| {
                error_response("context", &code, &msg)
            })?;
            let Some(node) = node_at(&item.steps, &path) else {
                return Err(error_response(
                    "context",
                    codes::PATH_NOT_FOUND,
                    &format!("task node not found: {}", path),
                ));
            };
            Ok(Some(json!({
                "kind": "task",
                "path": path.to_string(),
                "node": task_node_view(node, Some(&path.to_string()), compact),
            })))
        }
        "plan" => {
            let path = validate::resolve_step_path(item, subtree, "path").map_err(|(code, msg)| {
                error_response("context", &code, &msg)
            })?;
            let Some(step) = step_at(&item.steps, &path) else {
                return Err(error_response(
                    "context",
                    codes::PATH_NOT_FOUND,
                    &format!("step not found: {}", path),
                ));
            };
            let Some(plan) = &step.plan else {
                return Err(error_response(
                    "context",
                    codes::PATH_NOT_FOUND,
                    &format!("step has no embedded plan: {}", path),
                ));
            };
            Ok(Some(json!({
                "kind": "plan",
                "path": path.to_string(),
                "node": plan_node_view(plan, Some(&path.to_string()), compact),
            })))
        }
        "step" => {
            let path = validate::resolve_step_path(item, subtree, "path").map_err(|(code, msg)| {
                error_response("context", &code, &msg)
            })?;
            let Some(step) = step_at(&item.steps, &path) else {
                return Err(error_response(
                    "context",
                    codes::PATH_NOT_FOUND,
                    &format!("step not found: {}", path),
                ));
            };
            Ok(Some(json!({
                "kind": "step",
                "path": path.to_string(),
                "node": step_view(step, Some(&path.to_string()), compact),
            })))
        }
        other => Err(error_response(
            "context",
            codes::INVALID_KIND,
            &format!("subtree.kind must be step|plan|task, got: {}", other),
        )),
    }
}

pub fn handle_context(d: &Dispatcher, data: &Payload) -> AIResponse {
    let focus = data.get("task").or_else(|| data.get("plan"));
    let focus_id = match focus {
        Some(value) => match validate_task_id(Some(value)) {
            Ok(id) => Some(id),
            Err(msg) => return error_response("context", codes::INVALID_ID, &msg),
        },
        None => None,
    };
    let include_all = validate::get_bool(data, "include_all", false);
    let compact = validate::get_bool(data, "compact", true);

    let items = d.list_all();
    let plans: Vec<&Item> = items.iter().filter(|i| i.is_plan()).collect();
    let tasks: Vec<&Item> = items.iter().filter(|i| i.is_task()).collect();

    let mut by_status = json!({"DONE": 0, "ACTIVE": 0, "TODO": 0});
    for task in &tasks {
        let key = task.status.name();
        by_status[key] = json!(by_status[key].as_u64().unwrap_or(0) + 1);
    }

    let mut result = Map::new();
    result.insert(
        "counts".into(),
        json!({"plans": plans.len(), "tasks": tasks.len()}),
    );
    result.insert("by_status".into(), by_status);

    if include_all {
        let parse_filters = |status_key: &str,
                             parent_key: Option<&str>|
         -> Result<Filters, AIResponse> {
            let statuses = match data.get(status_key) {
                Some(value) => normalize_status_filter(value)
                    .map_err(|msg| error_response("context", codes::INVALID_FILTER, &msg))?,
                None => Vec::new(),
            };
            let tags = match data.get("tags") {
                Some(value) => normalize_filter_list(value)
                    .map_err(|msg| error_response("context", codes::INVALID_FILTER, &msg))?,
                None => Vec::new(),
            };
            Ok(Filters {
                statuses,
                tags,
                domain: validate::get_trimmed(data, "domain"),
                parent: parent_key
                    .map(|k| validate::get_trimmed(data, k))
                    .unwrap_or_default(),
            })
        };
        let plans_filter = match parse_filters("plans_status", None) {
            Ok(f) => f,
            Err(resp) => return resp,
        };
        let tasks_filter = match parse_filters("tasks_status", Some("tasks_parent")) {
            Ok(f) => f,
            Err(resp) => return resp,
        };
        let has_filters = !plans_filter.statuses.is_empty()
            || !tasks_filter.statuses.is_empty()
            || !tasks_filter.tags.is_empty()
            || !tasks_filter.domain.is_empty()
            || !tasks_filter.parent.is_empty();

        let plans_vec: Vec<Item> = plans.iter().map(|p| (*p).clone()).collect();
        let tasks_vec: Vec<Item> = tasks.iter().map(|t| (*t).clone()).collect();
        let filtered_plans = apply_filters(&plans_vec, &plans_filter);
        let filtered_tasks = apply_filters(&tasks_vec, &tasks_filter);
        let filtered_counts = (filtered_plans.len(), filtered_tasks.len());

        let pagination = |cursor_key: &str, limit_key: &str| -> Result<(Option<usize>, Option<usize>), AIResponse> {
            let cursor = parse_cursor(data.get(cursor_key), cursor_key)
                .map_err(|msg| error_response("context", codes::INVALID_PAGINATION, &msg))?;
            let limit = parse_limit(data.get(limit_key), limit_key)
                .map_err(|msg| error_response("context", codes::INVALID_PAGINATION, &msg))?;
            Ok((cursor, limit))
        };
        let (plans_cursor, plans_limit) = match pagination("plans_cursor", "plans_limit") {
            Ok(pair) => pair,
            Err(resp) => return resp,
        };
        let (tasks_cursor, tasks_limit) = match pagination("tasks_cursor", "tasks_limit") {
            Ok(pair) => pair,
            Err(resp) => return resp,
        };

        let (plans_page, plans_meta) = paginate(filtered_plans, plans_cursor, plans_limit);
        let (tasks_page, tasks_meta) = paginate(filtered_tasks, tasks_cursor, tasks_limit);

        result.insert(
            "plans".into(),
            Value::Array(plans_page.iter().map(|p| item_view(p, compact)).collect()),
        );
        result.insert(
            "tasks".into(),
            Value::Array(tasks_page.iter().map(|t| item_view(t, compact)).collect()),
        );
        result.insert("plans_pagination".into(), plans_meta);
        result.insert("tasks_pagination".into(), tasks_meta);
        if has_filters {
            result.insert(
                "filtered_counts".into(),
                json!({"plans": filtered_counts.0, "tasks": filtered_counts.1}),
            );
        }
    }

    let mut context = Map::new();
    if let Some(focus_id) = &focus_id {
        if let Some(item) = d.load_item(focus_id) {
            let key = if item.is_plan() { "current_plan" } else { "current_task" };
            result.insert(key.into(), item_view(&item, false));
        }
        context.insert("task_id".into(), json!(focus_id));
    }

    // A subtree view may target the focus item or name its own task.
    if let Some(subtree_req) = data.get("subtree").and_then(Value::as_object) {
        let subtree_target = match subtree_req.get("task") {
            Some(value) => match validate_task_id(Some(value)) {
                Ok(id) => Some(id),
                Err(msg) => return error_response("context", codes::INVALID_ID, &msg),
            },
            None => focus_id.clone(),
        };
        let Some(subtree_target) = subtree_target else {
            return error_response(
                "context",
                codes::MISSING_TASK,
                "subtree requires a task (subtree.task or an explicit focus)",
            );
        };
        let Some(subtree_item) = d.load_item(&subtree_target) else {
            return not_found_response(d, "context", &subtree_target);
        };
        if !subtree_item.is_task() {
            return error_response(
                "context",
                codes::NOT_A_TASK,
                "subtree applies to tasks (TASK-###)",
            );
        }
        match build_subtree(&subtree_item, subtree_req) {
            Ok(Some(subtree)) => {
                result.insert("subtree".into(), subtree);
            }
            Ok(None) => {}
            Err(resp) => return resp,
        }
    }

    let suggestions = radar::generate_suggestions(d, focus_id.as_deref());
    let mut resp = AIResponse::ok("context", Value::Object(result));
    resp.context = context;
    resp.suggestions = suggestions;
    resp
}

pub fn handle_focus_get(d: &Dispatcher, _data: &Payload) -> AIResponse {
    match d.focus().get() {
        Some(pointer) => AIResponse::ok(
            "focus_get",
            json!({"task": pointer.task, "domain": pointer.domain}),
        ),
        None => AIResponse::ok("focus_get", json!({"task": null, "domain": ""})),
    }
}

pub fn handle_focus_set(d: &Dispatcher, data: &Payload) -> AIResponse {
    let target = data.get("task").or_else(|| data.get("plan"));
    let id = match validate_task_id(target) {
        Ok(id) => id,
        Err(msg) => {
            return error_response("focus_set", codes::INVALID_ID, &msg)
                .with_recovery("Pass task=TASK-###|PLAN-###; pick an id via context(include_all=true).");
        }
    };
    let Some(item) = d.load_item(&id) else {
        return not_found_response(d, "focus_set", &id);
    };
    if let Err(err) = d.focus().set(&item.id, &item.domain) {
        return error_response("focus_set", codes::INTERNAL_ERROR, &err.to_string());
    }
    AIResponse::ok(
        "focus_set",
        json!({"task": item.id, "domain": item.domain, "kind": item.kind.name()}),
    )
    .with_context("task_id", json!(item.id))
}

pub fn handle_focus_clear(d: &Dispatcher, _data: &Payload) -> AIResponse {
    match d.focus().clear() {
        Ok(cleared) => AIResponse::ok("focus_clear", json!({"cleared": cleared})),
        Err(err) => error_response("focus_clear", codes::INTERNAL_ERROR, &err.to_string()),
    }
}

/// Pending/ready completion queue over the full recursive step tree.
pub(crate) fn compute_checkpoint_status(item: &Item) -> Value {
    let mut pending = Vec::new();
    let mut ready = Vec::new();
    let mut pending_ids = Vec::new();
    let mut ready_ids = Vec::new();
    for (path, step) in flatten_steps(&item.steps) {
        if step.completed {
            continue;
        }
        if step.ready_for_completion() {
            ready.push(path.to_string());
            ready_ids.push(step.id.clone());
        } else {
            pending.push(path.to_string());
            pending_ids.push(step.id.clone());
        }
    }
    json!({
        "pending": pending,
        "ready": ready,
        "pending_ids": pending_ids,
        "ready_ids": ready_ids,
    })
}

pub fn handle_resume(d: &Dispatcher, data: &Payload) -> AIResponse {
    let focus_id = match read_target(d, "resume", data) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let Some(item) = d.load_item(&focus_id) else {
        return not_found_response(d, "resume", &focus_id);
    };

    let compact = validate::get_bool(data, "compact", false);
    let include_steps = validate::get_bool(data, "include_steps", true);
    let mut result = Map::new();
    if item.is_plan() {
        result.insert("plan".into(), item_view(&item, compact));
    } else {
        let mut view = item_view(&item, compact);
        if !include_steps {
            if let Some(map) = view.as_object_mut() {
                map.remove("steps");
            }
        }
        result.insert("task".into(), view);
        result.insert("checkpoint_status".into(), compute_checkpoint_status(&item));
    }

    if !item.events.is_empty() {
        let mut events = item.events.clone();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let limit = data
            .get("events_limit")
            .and_then(Value::as_u64)
            .unwrap_or(20) as usize;
        let timeline: Vec<Value> = events.iter().take(limit).map(|e| e.to_value()).collect();
        result.insert("timeline".into(), json!(timeline));
    }

    let mut resp = AIResponse::ok("resume", Value::Object(result));
    resp.context.insert("task_id".into(), json!(focus_id));
    resp.suggestions = radar::generate_suggestions(d, Some(&focus_id));
    resp
}

pub fn handle_lint(d: &Dispatcher, data: &Payload) -> AIResponse {
    let focus_id = match read_target(d, "lint", data) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let Some(item) = d.load_item(&focus_id) else {
        return not_found_response(d, "lint", &focus_id);
    };

    let all_items = d.list_all();
    let report = lint_item(&item, &all_items);

    // Actionable fixes (top 3, deterministic order over the sorted report).
    let mut suggestions: Vec<Suggestion> = Vec::new();
    for issue in &report.issues {
        if suggestions.len() >= 3 {
            break;
        }
        let path = issue
            .target
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match issue.code.as_str() {
            "STEP_SUCCESS_CRITERIA_MISSING" | "STEP_TESTS_MISSING" | "STEP_BLOCKERS_MISSING"
                if !path.is_empty() =>
            {
                let op = match issue.code.as_str() {
                    "STEP_SUCCESS_CRITERIA_MISSING" => {
                        json!({"op": "append", "field": "success_criteria", "value": "<define measurable outcome>"})
                    }
                    "STEP_TESTS_MISSING" => {
                        json!({"op": "append", "field": "tests", "value": "<how to verify (cmd/test)>"})
                    }
                    _ => json!({"op": "append", "field": "blockers", "value": "<dependency/assumption>"}),
                };
                let priority = if issue.code == "STEP_SUCCESS_CRITERIA_MISSING" {
                    "high"
                } else {
                    "normal"
                };
                suggestions.push(
                    Suggestion::new("patch", "tasks_patch", "Fill the step fields via patch (diff-oriented).", priority)
                        .with_params(json!({"task": focus_id, "kind": "step", "path": path, "ops": [op]})),
                );
            }
            "TASK_SUCCESS_CRITERIA_MISSING" => {
                suggestions.push(
                    Suggestion::new(
                        "patch",
                        "tasks_patch",
                        "Add root success_criteria (otherwise completion stays blocked).",
                        "high",
                    )
                    .with_params(json!({
                        "task": focus_id,
                        "kind": "task_detail",
                        "ops": [{"op": "append", "field": "success_criteria", "value": "<definition of done>"}],
                    })),
                );
            }
            "INVALID_DEPENDENCIES" | "CIRCULAR_DEPENDENCY" | "INVALID_DEPENDENCY_ID" => {
                suggestions.push(
                    Suggestion::new(
                        "context",
                        "tasks_context",
                        "Check existing task ids and dependency statuses before editing depends_on.",
                        "high",
                    )
                    .with_params(json!({"include_all": true, "compact": true})),
                );
            }
            _ => {}
        }
    }

    let mut result = report.to_value();
    if let Some(map) = result.as_object_mut() {
        map.insert(
            "links".into(),
            json!({
                "radar": {"intent": "radar", "task": focus_id, "limit": 3},
                "resume": {"intent": "resume", "task": focus_id},
                "mirror": {"intent": "mirror", "task": focus_id, "limit": 10},
            }),
        );
    }
    let mut resp = AIResponse::ok("lint", result);
    resp.context.insert("task_id".into(), json!(focus_id));
    resp.suggestions = suggestions;
    resp
}

pub fn handle_templates_list(_d: &Dispatcher, _data: &Payload) -> AIResponse {
    let templates: Vec<Value> = list_templates().iter().map(|t| t.to_value()).collect();
    AIResponse::ok("templates_list", json!({"templates": templates}))
}

/// Normalize progress markers so exactly one item reads as in_progress.
pub(crate) fn normalize_mirror_progress(items: &mut [Value]) {
    let mut first_active: Option<usize> = None;
    for (idx, item) in items.iter_mut().enumerate() {
        if item.get("status").and_then(Value::as_str) == Some("in_progress") {
            if first_active.is_none() {
                first_active = Some(idx);
            } else {
                item["status"] = json!("pending");
            }
        }
    }
    if first_active.is_none() {
        for item in items.iter_mut() {
            if item.get("status").and_then(Value::as_str) == Some("pending") {
                item["status"] = json!("in_progress");
                break;
            }
        }
    }
}

pub(crate) fn mirror_items_from_steps(steps: &[Step], prefix: Option<&StepPath>) -> Vec<Value> {
    let mut items = Vec::new();
    for (idx, step) in steps.iter().enumerate() {
        let path = match prefix {
            Some(p) => p.child_step(idx),
            None => StepPath::root_step(idx),
        };
        let tasks = step.task_nodes();
        let children_total = tasks.len();
        let children_done = tasks.iter().filter(|t| t.is_done()).count();
        let (status, progress) = if step.completed {
            ("completed", 100)
        } else if step.ready_for_completion() {
            (
                "in_progress",
                if children_total == 0 {
                    100
                } else {
                    ((children_done as f64 / children_total as f64) * 100.0) as u32
                },
            )
        } else {
            (
                "pending",
                if children_total == 0 {
                    0
                } else {
                    ((children_done as f64 / children_total as f64) * 100.0) as u32
                },
            )
        };
        items.push(json!({
            "kind": "step",
            "path": path.to_string(),
            "id": step.id,
            "title": step.title,
            "status": status,
            "progress": progress,
            "children_done": children_done,
            "children_total": children_total,
            "criteria_confirmed": step.checkpoints.criteria.confirmed,
            "tests_confirmed": step.checkpoints.tests.confirmed,
            "criteria_auto_confirmed": step.checkpoints.criteria.auto_confirmed,
            "tests_auto_confirmed": step.checkpoints.tests.auto_confirmed,
            "blocked": step.blocked,
        }));
    }
    items
}

pub(crate) fn mirror_items_from_task_nodes(nodes: &[TaskNode], prefix: &StepPath) -> Vec<Value> {
    let mut items = Vec::new();
    for (idx, node) in nodes.iter().enumerate() {
        let path = prefix.child_node(idx);
        let (total, done) = count_step_tree(&node.steps);
        let progress = if total > 0 {
            ((done as f64 / total as f64) * 100.0) as u32
        } else {
            0
        };
        let status_raw = node.status.trim().to_uppercase();
        let status = if node.is_done() || (status_raw == "DONE" && !node.blocked) {
            "completed"
        } else if status_raw == "ACTIVE" {
            "in_progress"
        } else {
            "pending"
        };
        items.push(json!({
            "kind": "task",
            "path": path.to_string(),
            "id": node.id,
            "title": node.title,
            "status": status,
            "progress": progress,
            "children_done": done,
            "children_total": total,
            "criteria_confirmed": node.checkpoints.criteria.confirmed,
            "tests_confirmed": node.checkpoints.tests.confirmed,
            "criteria_auto_confirmed": node.checkpoints.criteria.auto_confirmed,
            "tests_auto_confirmed": node.checkpoints.tests.auto_confirmed,
            "blocked": node.blocked,
        }));
    }
    items
}

fn mirror_items_from_items(tasks: &[&Item]) -> Vec<Value> {
    let mut items = Vec::new();
    for task in tasks {
        let (total, done) = count_step_tree(&task.steps);
        let progress = if total > 0 {
            ((done as f64 / total as f64) * 100.0) as u32
        } else {
            task.progress()
        };
        let status = if progress >= 100 && !task.blocked {
            "completed"
        } else {
            match task.status {
                Status::Active => "in_progress",
                Status::Done => "completed",
                Status::Todo => "pending",
            }
        };
        items.push(json!({
            "kind": "task",
            "task_id": task.id,
            "title": task.title,
            "status": status,
            "progress": progress,
            "children_done": done,
            "children_total": total,
            "blocked": task.blocked,
        }));
    }
    items
}

pub fn handle_mirror(d: &Dispatcher, data: &Payload) -> AIResponse {
    let focus_id = match read_target(d, "mirror", data) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let Some(item) = d.load_item(&focus_id) else {
        return not_found_response(d, "mirror", &focus_id);
    };

    let limit = match parse_limit(data.get("limit"), "limit") {
        Ok(limit) => limit,
        Err(msg) => return error_response("mirror", codes::INVALID_LIMIT, &msg),
    };

    let kind = validate::get_trimmed(data, "kind").to_lowercase();
    let path_given = data.contains_key("path");
    let node_addressed = data.contains_key("task_node_id")
        || kind == "task"
        || data
            .get("path")
            .and_then(Value::as_str)
            .map(|p| p.trim().rsplit('.').next().unwrap_or("").starts_with("t:"))
            .unwrap_or(false);

    let mut scope = json!({"task_id": focus_id, "kind": item.kind.name()});
    let mut items: Vec<Value>;

    if item.is_plan() {
        let all = d.list_all();
        let plan_tasks: Vec<&Item> = all
            .iter()
            .filter(|t| t.is_task() && t.parent.as_deref() == Some(focus_id.as_str()))
            .collect();
        items = mirror_items_from_items(&plan_tasks);
    } else if node_addressed {
        let path = match validate::resolve_node_path(&item, data, "path") {
            Ok(path) => path,
            Err((code, msg)) => {
                return error_response("mirror", &code, &msg)
                    .with_recovery(
                        "Call mirror without path/kind to see the root tree, or radar to grab the active path.",
                    )
                    .with_suggestions(d.path_help_suggestions(&focus_id));
            }
        };
        let Some(node) = node_at(&item.steps, &path) else {
            return error_response(
                "mirror",
                codes::TASK_NODE_ID_NOT_FOUND,
                &format!("task node not found: {}", path),
            )
            .with_suggestions(d.path_help_suggestions(&focus_id));
        };
        scope = json!({"task_id": focus_id, "kind": "task", "path": path.to_string()});
        items = mirror_items_from_steps(&node.steps, Some(&path));
    } else if path_given || data.contains_key("step_id") || kind == "step" {
        let path = match validate::resolve_step_path(&item, data, "path") {
            Ok(path) => path,
            Err((code, msg)) => {
                return error_response("mirror", &code, &msg)
                    .with_recovery(
                        "Call mirror without path/kind to see the root tree, or radar to grab the active path.",
                    )
                    .with_suggestions(d.path_help_suggestions(&focus_id));
            }
        };
        let Some(step) = step_at(&item.steps, &path) else {
            return error_response(
                "mirror",
                codes::STEP_ID_NOT_FOUND,
                &format!("step not found: {}", path),
            )
            .with_suggestions(d.path_help_suggestions(&focus_id));
        };
        scope = json!({"task_id": focus_id, "kind": "step", "path": path.to_string()});
        items = mirror_items_from_task_nodes(step.task_nodes(), &path);
    } else {
        items = mirror_items_from_steps(&item.steps, None);
    }

    if let Some(limit) = limit {
        items.truncate(limit);
    }
    normalize_mirror_progress(&mut items);
    let summary = json!({
        "total": items.len(),
        "completed": items.iter().filter(|i| i["status"] == json!("completed")).count(),
        "in_progress": items.iter().filter(|i| i["status"] == json!("in_progress")).count(),
        "pending": items.iter().filter(|i| i["status"] == json!("pending")).count(),
    });

    let mut resp = AIResponse::ok(
        "mirror",
        json!({"scope": scope, "items": items, "summary": summary}),
    );
    resp.context.insert("task_id".into(), json!(focus_id));
    resp
}

pub fn handle_storage(d: &Dispatcher, _data: &Payload) -> AIResponse {
    fn count_task_files(root: &std::path::Path) -> usize {
        let mut total = 0;
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_default();
                if path.is_dir() {
                    if !name.starts_with('.') {
                        stack.push(path);
                    }
                } else if name.ends_with(".task") {
                    total += 1;
                }
            }
        }
        total
    }

    let project_root = d.project_root().to_path_buf();
    let namespace = project_namespace(&project_root);
    let global_root = global_storage_dir();
    let local_dir = project_root.join(".tasks");

    let mut namespaces = Vec::new();
    if let Ok(entries) = std::fs::read_dir(&global_root) {
        let mut dirs: Vec<_> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.is_dir()
                    && !p
                        .file_name()
                        .map(|n| n.to_string_lossy().starts_with('.'))
                        .unwrap_or(true)
            })
            .collect();
        dirs.sort();
        for dir in dirs {
            namespaces.push(json!({
                "namespace": dir.file_name().map(|n| n.to_string_lossy().to_string()),
                "path": dir.to_string_lossy(),
                "task_count": count_task_files(&dir),
            }));
        }
    }

    AIResponse::ok(
        "storage",
        json!({
            "global_storage": global_root.to_string_lossy(),
            "global_exists": global_root.exists(),
            "local_storage": local_dir.to_string_lossy(),
            "local_exists": local_dir.exists(),
            "current_storage": d.repo().root().to_string_lossy(),
            "current_namespace": namespace,
            "namespaces": namespaces,
        }),
    )
}
