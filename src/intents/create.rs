//! Creation intents: `create`, `scaffold`, `decompose`, and TaskNode
//! management (`task_add`, `task_define`, `task_delete`).

use crate::core::event::Actor;
use crate::core::item::{Item, ItemKind, Priority};
use crate::core::step::{Step, TaskNode, find_node_path_by_id, node_at_mut, step_at_mut};
use crate::core::templates::{
    apply_preview_ids, build_plan_from_template, build_task_from_template, get_template,
};
use crate::intents::Dispatcher;
use crate::intents::response::{AIResponse, Suggestion, codes, error_response};
use crate::intents::validate::{
    self, Payload, normalize_str_list, parse_step_node, resolve_node_path, validate_steps_data,
    validate_string, validate_task_id,
};
use crate::intents::view::{item_view, task_node_view};
use serde_json::{Value, json};

fn parse_priority(data: &Payload) -> Result<Priority, AIResponse> {
    match data.get("priority") {
        None => Ok(Priority::Medium),
        Some(value) => {
            let raw = value.as_str().unwrap_or_default();
            if raw.trim().is_empty() {
                return Ok(Priority::Medium);
            }
            Priority::parse(raw).ok_or_else(|| {
                error_response(
                    "create",
                    codes::INVALID_PRIORITY,
                    "priority must be LOW|MEDIUM|HIGH",
                )
            })
        }
    }
}

/// Apply shared contract/criteria/tests/blockers fields to a new item.
fn apply_creation_fields(intent: &str, item: &mut Item, data: &Payload) -> Option<AIResponse> {
    item.description = validate::get_str(data, "description").unwrap_or_default().to_string();
    item.context = validate::get_str(data, "context").unwrap_or_default().to_string();
    item.contract = validate::get_str(data, "contract").unwrap_or_default().to_string();
    if let Some(contract_data) = data.get("contract_data") {
        match crate::core::item::ContractData::from_value(contract_data) {
            Ok(parsed) => item.contract_data = parsed,
            Err(msg) => {
                return Some(error_response(intent, codes::INVALID_CONTRACT_DATA, &msg));
            }
        }
    }
    let parse_list = |field: &str, value: &Value| -> Result<Vec<String>, AIResponse> {
        normalize_str_list(value).map_err(|msg| {
            error_response(intent, codes::INVALID_FIELDS, &format!("{} {}", field, msg))
                .with_result(json!({field: value}))
        })
    };
    if let Some(value) = data.get("success_criteria") {
        match parse_list("success_criteria", value) {
            Ok(list) => {
                item.success_criteria = list;
                item.checkpoints.criteria.confirmed = false;
                item.checkpoints.criteria.auto_confirmed = false;
            }
            Err(resp) => return Some(resp),
        }
    }
    if let Some(value) = data.get("tests") {
        match parse_list("tests", value) {
            Ok(list) => {
                item.checkpoints.tests.confirmed = false;
                item.checkpoints.tests.auto_confirmed = list.is_empty();
                item.tests = list;
            }
            Err(resp) => return Some(resp),
        }
    }
    if let Some(value) = data.get("blockers") {
        match parse_list("blockers", value) {
            Ok(list) => item.blockers = list,
            Err(resp) => return Some(resp),
        }
    }
    None
}

pub fn handle_create(d: &Dispatcher, data: &Payload) -> AIResponse {
    let title = validate::get_trimmed(data, "title");
    if title.is_empty() {
        return error_response("create", codes::MISSING_TITLE, "title is required");
    }
    if let Err(msg) = validate_string(&json!(title), "title") {
        return error_response("create", codes::INVALID_TITLE, &msg);
    }

    let parent = match data.get("parent") {
        Some(value) => match validate_task_id(Some(value)) {
            Ok(id) => Some(id),
            Err(msg) => return error_response("create", codes::INVALID_PARENT, &msg),
        },
        None => None,
    };
    let kind_raw = validate::get_trimmed(data, "kind").to_lowercase();
    let kind = match kind_raw.as_str() {
        "" => {
            if parent.is_some() {
                ItemKind::Task
            } else {
                ItemKind::Plan
            }
        }
        "plan" => ItemKind::Plan,
        "task" => ItemKind::Task,
        _ => {
            return error_response("create", codes::INVALID_KIND, "kind must be 'plan' or 'task'");
        }
    };
    let priority = match parse_priority(data) {
        Ok(priority) => priority,
        Err(resp) => return resp,
    };
    let dry_run = validate::get_bool(data, "dry_run", false);

    if kind == ItemKind::Plan {
        let id = d.repo().next_id("PLAN");
        let mut plan = Item::new(&id, ItemKind::Plan, &title);
        plan.priority = priority;
        if let Some(resp) = apply_creation_fields("create", &mut plan, data) {
            return resp;
        }
        if dry_run {
            return AIResponse::ok(
                "create",
                json!({"dry_run": true, "would_execute": true, "plan": item_view(&plan, false)}),
            );
        }
        if plan.has_contract_material() {
            plan.append_contract_version_if_changed(Actor::Ai, "create");
        }
        let reloaded = match d.save_and_reload("create", &mut plan) {
            Ok(item) => item,
            Err(resp) => return resp,
        };
        return AIResponse::ok(
            "create",
            json!({"plan_id": reloaded.id, "plan": item_view(&reloaded, false)}),
        )
        .with_context("task_id", json!(reloaded.id));
    }

    // kind == task
    let Some(parent) = parent else {
        return error_response("create", codes::MISSING_PARENT, "a task needs parent=PLAN-###");
    };
    let Some(parent_item) = d.load_item(&parent) else {
        return error_response(
            "create",
            codes::PARENT_NOT_FOUND,
            &format!("parent not found: {}", parent),
        )
        .with_result(json!({"parent": parent}));
    };
    if !parent_item.is_plan() {
        return error_response("create", codes::INVALID_PARENT, "parent must be a PLAN")
            .with_result(json!({"parent": parent}));
    }

    let id = d.repo().next_id("TASK");
    let mut task = Item::new(&id, ItemKind::Task, &title);
    task.priority = priority;
    task.parent = Some(parent.clone());
    if let Some(resp) = apply_creation_fields("create", &mut task, data) {
        return resp;
    }
    if let Some(steps_payload) = data.get("steps") {
        if let Err(msg) = validate_steps_data(steps_payload) {
            return error_response("create", codes::INVALID_STEPS, &msg);
        }
        let mut steps = Vec::new();
        for node in steps_payload.as_array().into_iter().flatten() {
            match parse_step_node(node, 0) {
                Ok(step) => steps.push(step),
                Err(msg) => return error_response("create", codes::INVALID_STEPS, &msg),
            }
        }
        task.steps = steps;
    }
    if dry_run {
        return AIResponse::ok(
            "create",
            json!({"dry_run": true, "would_execute": true, "task": item_view(&task, false)}),
        );
    }
    if task.has_contract_material() {
        task.append_contract_version_if_changed(Actor::Ai, "create");
    }
    let reloaded = match d.save_and_reload("create", &mut task) {
        Ok(item) => item,
        Err(resp) => return resp,
    };
    AIResponse::ok(
        "create",
        json!({"task_id": reloaded.id, "task": item_view(&reloaded, false)}),
    )
    .with_context("task_id", json!(reloaded.id))
}

pub fn handle_scaffold(d: &Dispatcher, data: &Payload) -> AIResponse {
    let template_id = validate::get_trimmed(data, "template").to_lowercase();
    if template_id.is_empty() {
        return error_response("scaffold", codes::MISSING_TEMPLATE, "template is required")
            .with_recovery("Call templates_list first and pick a template id.")
            .with_suggestions(vec![Suggestion::new(
                "templates_list",
                "tasks_templates_list",
                "Show the available templates.",
                "high",
            )]);
    }
    let Some(template) = get_template(&template_id) else {
        return error_response(
            "scaffold",
            codes::UNKNOWN_TEMPLATE,
            &format!("Unknown template: {}", template_id),
        )
        .with_recovery("Call templates_list and pick a valid template id.")
        .with_suggestions(vec![Suggestion::new(
            "templates_list",
            "tasks_templates_list",
            "Show the available templates.",
            "high",
        )]);
    };

    let kind = validate::get_trimmed(data, "kind").to_lowercase();
    if !matches!(kind.as_str(), "plan" | "task") {
        return error_response("scaffold", codes::INVALID_KIND, "kind must be 'plan' or 'task'")
            .with_recovery("Pass kind=plan|task explicitly (no guessing).")
            .with_result(json!({"kind": kind, "template": template.to_value()}));
    }

    let title = validate::get_trimmed(data, "title");
    if title.is_empty() {
        return error_response("scaffold", codes::MISSING_TITLE, "title is required");
    }
    if let Err(msg) = validate_string(&json!(title), "title") {
        return error_response("scaffold", codes::INVALID_TITLE, &msg);
    }
    let dry_run = validate::get_bool(data, "dry_run", true);
    let priority = match parse_priority(data) {
        Ok(priority) => priority,
        Err(resp) => return resp,
    };

    if kind == "task" {
        // Parent: explicit, else derived from focus (plan or task-with-plan-parent).
        let mut parent: Option<String> = None;
        let mut parent_source = "explicit";
        let mut used_focus_parent = false;
        if let Some(value) = data.get("parent") {
            match validate_task_id(Some(value)) {
                Ok(id) => parent = Some(id),
                Err(msg) => {
                    return error_response("scaffold", codes::INVALID_PARENT, &msg)
                        .with_result(json!({"parent": value}));
                }
            }
        } else if let Some(pointer) = d.focus().get() {
            if let Some(focus_item) = d.load_item(&pointer.task) {
                if focus_item.is_plan() {
                    parent = Some(focus_item.id.clone());
                    parent_source = "focus_plan";
                    used_focus_parent = true;
                } else if let Some(inferred) = &focus_item.parent {
                    if d.load_item(inferred).map(|p| p.is_plan()).unwrap_or(false) {
                        parent = Some(inferred.clone());
                        parent_source = "focus_task_parent";
                        used_focus_parent = true;
                    }
                }
            }
        }
        let Some(parent) = parent else {
            return error_response(
                "scaffold",
                codes::MISSING_PARENT,
                "kind=task needs parent=PLAN-### (or focus on a PLAN / a TASK with a plan parent).",
            )
            .with_recovery("Pass parent=PLAN-### explicitly or set focus via focus_set.")
            .with_suggestions(d.missing_target_suggestions(&["PLAN-"]));
        };
        let Some(parent_item) = d.load_item(&parent) else {
            return error_response(
                "scaffold",
                codes::PARENT_NOT_FOUND,
                &format!("parent not found: {}", parent),
            )
            .with_recovery("Check the parent via context(include_all=true) or focus a plan.")
            .with_suggestions(d.missing_target_suggestions(&["PLAN-"]))
            .with_result(json!({"parent": parent}));
        };
        if !parent_item.is_plan() {
            return error_response("scaffold", codes::INVALID_PARENT, "parent must be a PLAN")
                .with_result(json!({"parent": parent}));
        }

        let id = d.repo().next_id("TASK");
        let Some(mut task) = build_task_from_template(&template, &id, &title, &parent, priority)
        else {
            return error_response(
                "scaffold",
                codes::UNSUPPORTED_KIND,
                &format!("template does not support kind=task: {}", template.id),
            )
            .with_result(json!({"template": template.to_value()}));
        };

        if dry_run {
            apply_preview_ids(&mut task);
            let mut resp = AIResponse::ok(
                "scaffold",
                json!({
                    "dry_run": true,
                    "would_execute": true,
                    "kind": "task",
                    "template": template.to_value(),
                    "parent": parent,
                    "parent_source": parent_source,
                    "task_id": task.id,
                    "task": item_view(&task, false),
                }),
            );
            if used_focus_parent {
                resp.context.insert("used_focus_parent".into(), json!(true));
            }
            resp.suggestions = vec![
                Suggestion::new("scaffold", "tasks_scaffold", "Create the task from the template (dry_run=false).", "high")
                    .with_params(json!({
                        "template": template.id,
                        "kind": "task",
                        "title": title,
                        "parent": parent,
                        "priority": priority.name(),
                        "dry_run": false,
                    })),
            ];
            return resp;
        }

        if task.has_contract_material() {
            task.append_contract_version_if_changed(Actor::Ai, "scaffold");
        }
        let reloaded = match d.save_and_reload("scaffold", &mut task) {
            Ok(item) => item,
            Err(resp) => return resp,
        };
        let mut resp = AIResponse::ok(
            "scaffold",
            json!({
                "dry_run": false,
                "kind": "task",
                "template": template.to_value(),
                "parent": parent,
                "parent_source": parent_source,
                "task_id": reloaded.id,
                "task": item_view(&reloaded, false),
            }),
        );
        resp.context.insert("task_id".into(), json!(reloaded.id));
        if used_focus_parent {
            resp.context.insert("used_focus_parent".into(), json!(true));
        }
        resp.suggestions = vec![
            Suggestion::new("focus_set", &reloaded.id, "Set focus on the created task.", "high")
                .with_params(json!({"task": reloaded.id, "domain": reloaded.domain})),
            Suggestion::new("radar", "tasks_radar", "Open the radar view for the new task.", "high")
                .with_params(json!({"task": reloaded.id, "limit": 3})),
            Suggestion::new(
                "lint",
                "tasks_lint",
                "Preflight discipline check (criteria/tests/atomicity/deps).",
                "normal",
            )
            .with_params(json!({"task": reloaded.id})),
        ];
        return resp;
    }

    // kind == plan
    let id = d.repo().next_id("PLAN");
    let Some(mut plan) = build_plan_from_template(&template, &id, &title, priority) else {
        return error_response(
            "scaffold",
            codes::UNSUPPORTED_KIND,
            &format!("template does not support kind=plan: {}", template.id),
        )
        .with_result(json!({"template": template.to_value()}));
    };

    if dry_run {
        return AIResponse::ok(
            "scaffold",
            json!({
                "dry_run": true,
                "would_execute": true,
                "kind": "plan",
                "template": template.to_value(),
                "plan_id": plan.id,
                "plan": item_view(&plan, false),
            }),
        )
        .with_suggestions(vec![
            Suggestion::new("scaffold", "tasks_scaffold", "Create the plan from the template (dry_run=false).", "high")
                .with_params(json!({
                    "template": template.id,
                    "kind": "plan",
                    "title": title,
                    "priority": priority.name(),
                    "dry_run": false,
                })),
        ]);
    }

    if plan.has_contract_material() {
        plan.append_contract_version_if_changed(Actor::Ai, "scaffold");
    }
    let reloaded = match d.save_and_reload("scaffold", &mut plan) {
        Ok(item) => item,
        Err(resp) => return resp,
    };
    let mut resp = AIResponse::ok(
        "scaffold",
        json!({
            "dry_run": false,
            "kind": "plan",
            "template": template.to_value(),
            "plan_id": reloaded.id,
            "plan": item_view(&reloaded, false),
        }),
    );
    resp.context.insert("task_id".into(), json!(reloaded.id));
    resp.suggestions = vec![
        Suggestion::new("focus_set", &reloaded.id, "Set focus on the created plan.", "high")
            .with_params(json!({"task": reloaded.id, "domain": reloaded.domain})),
        Suggestion::new("radar", "tasks_radar", "Open the radar view for the plan (Now/Why/Verify/Next).", "high")
            .with_params(json!({"plan": reloaded.id, "limit": 3})),
        Suggestion::new("scaffold", "tasks_scaffold", "Scaffold the first task under the plan.", "normal")
            .with_params(json!({
                "template": template.id,
                "kind": "task",
                "title": "<first task>",
                "parent": reloaded.id,
                "dry_run": true,
            })),
    ];
    resp
}

pub fn handle_decompose(d: &Dispatcher, data: &Payload) -> AIResponse {
    let (task_id, mut task) = match d.require_task("decompose", data) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    let Some(steps_payload) = data.get("steps") else {
        return error_response("decompose", codes::MISSING_STEPS, "steps is required");
    };
    if let Err(msg) = validate_steps_data(steps_payload) {
        return error_response("decompose", codes::INVALID_STEPS, &msg);
    }

    // Optional parent: a node path or a node id; new steps land inside it.
    let parent_path = if data.contains_key("parent_task_node_id") {
        if data.contains_key("parent") {
            return error_response(
                "decompose",
                codes::INVALID_PATH,
                "pass only one of parent or parent_task_node_id",
            );
        }
        let id = match crate::intents::validate::validate_node_id(
            data.get("parent_task_node_id"),
            "parent_task_node_id",
        ) {
            Ok(id) => id,
            Err(msg) => {
                return error_response("decompose", codes::INVALID_TASK_NODE_ID, &msg)
                    .with_recovery("Find the parent_task_node_id via mirror(kind=step|task) or radar.")
                    .with_suggestions(d.path_help_suggestions(&task_id));
            }
        };
        match find_node_path_by_id(&task.steps, &id) {
            Some(path) => Some(path),
            None => {
                return error_response(
                    "decompose",
                    codes::TASK_NODE_ID_NOT_FOUND,
                    &format!("task node parent_task_node_id={} not found", id),
                )
                .with_recovery("Grab a valid task_node_id via mirror (it shows task_node_id and path).")
                .with_suggestions(d.path_help_suggestions(&task_id));
            }
        }
    } else if let Some(raw) = data.get("parent").and_then(Value::as_str) {
        match crate::core::ident::StepPath::parse_node(raw) {
            Ok(path) => Some(path),
            Err(msg) => {
                return error_response("decompose", codes::INVALID_PATH, &msg)
                    .with_recovery("Grab a valid parent path via mirror/radar.")
                    .with_suggestions(d.path_help_suggestions(&task_id));
            }
        }
    } else {
        None
    };

    let mut new_steps: Vec<Step> = Vec::new();
    for node in steps_payload.as_array().into_iter().flatten() {
        match parse_step_node(node, 0) {
            Ok(step) => new_steps.push(step),
            Err(msg) => return error_response("decompose", codes::INVALID_STEPS, &msg),
        }
    }
    let created = new_steps.len();

    match &parent_path {
        Some(path) => {
            let Some(node) = node_at_mut(&mut task.steps, path) else {
                return error_response(
                    "decompose",
                    codes::PATH_NOT_FOUND,
                    &format!("task node path={} not found", path),
                )
                .with_recovery("Grab a valid parent path via mirror/radar.")
                .with_suggestions(d.path_help_suggestions(&task_id))
                .with_result(json!({"parent": path.to_string()}));
            };
            node.steps.extend(new_steps);
        }
        None => task.steps.extend(new_steps),
    }
    task.update_status_from_progress();

    let reloaded = match d.save_and_reload("decompose", &mut task) {
        Ok(item) => item,
        Err(resp) => return resp,
    };
    AIResponse::ok(
        "decompose",
        json!({
            "task_id": task_id,
            "total_created": created,
            "task": item_view(&reloaded, false),
        }),
    )
    .with_context("task_id", json!(task_id))
}

pub fn handle_task_add(d: &Dispatcher, data: &Payload) -> AIResponse {
    let (task_id, mut task) = match d.require_task("task_add", data) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };

    // Parent step addressing: parent_step path or parent_step_id/step_id.
    let mut addressing = data.clone();
    if let Some(parent_step) = data
        .get("parent_step")
        .or_else(|| data.get("step"))
        .or_else(|| data.get("step_path"))
    {
        addressing.insert("path".into(), parent_step.clone());
        addressing.remove("step_id");
    } else if let Some(parent_step_id) = data.get("parent_step_id").or_else(|| data.get("step_id")) {
        addressing.insert("step_id".into(), parent_step_id.clone());
        addressing.remove("path");
    } else {
        return error_response("task_add", codes::MISSING_PARENT_STEP, "parent_step is required")
            .with_recovery("Pass parent_step=s:<n> or parent_step_id=STEP-... (find them via mirror/radar).")
            .with_suggestions(d.path_help_suggestions(&task_id));
    }

    let title = validate::get_trimmed(data, "title");
    if title.is_empty() {
        return error_response("task_add", codes::MISSING_TITLE, "title is required");
    }

    let path = match validate::resolve_step_path(&task, &addressing, "path") {
        Ok(path) => path,
        Err((code, msg)) => {
            return error_response("task_add", &code, &msg)
                .with_recovery("Grab a valid parent_step via radar/mirror.")
                .with_suggestions(d.path_help_suggestions(&task_id));
        }
    };

    let mut node = TaskNode::new(&title);
    if let Some(status) = data.get("status").and_then(Value::as_str) {
        let upper = status.trim().to_uppercase();
        if !matches!(upper.as_str(), "TODO" | "ACTIVE" | "DONE") {
            return error_response("task_add", codes::INVALID_STATUS, "status must be TODO/ACTIVE/DONE");
        }
        node.status = upper;
    }
    if let Some(priority) = data.get("priority").and_then(Value::as_str) {
        let upper = priority.trim().to_uppercase();
        if !matches!(upper.as_str(), "LOW" | "MEDIUM" | "HIGH") {
            return error_response(
                "task_add",
                codes::INVALID_PRIORITY,
                "priority must be LOW/MEDIUM/HIGH",
            );
        }
        node.priority = upper;
    }
    node.description = validate::get_str(data, "description").unwrap_or_default().to_string();
    node.context = validate::get_str(data, "context").unwrap_or_default().to_string();
    {
        let parse = |key: &str| -> Result<Option<Vec<String>>, AIResponse> {
            match data.get(key) {
                Some(value) => normalize_str_list(value).map(Some).map_err(|msg| {
                    error_response("task_add", codes::INVALID_FIELDS, &format!("{} {}", key, msg))
                }),
                None => Ok(None),
            }
        };
        macro_rules! set_list {
            ($key:literal, $slot:expr) => {
                match parse($key) {
                    Ok(Some(list)) => $slot = list,
                    Ok(None) => {}
                    Err(resp) => return resp,
                }
            };
        }
        set_list!("success_criteria", node.success_criteria);
        set_list!("tests", node.tests);
        set_list!("dependencies", node.dependencies);
        set_list!("next_steps", node.next_steps);
        set_list!("problems", node.problems);
        set_list!("risks", node.risks);
        set_list!("blockers", node.blockers);
    }
    if let Some(blocked) = data.get("blocked").and_then(Value::as_bool) {
        node.blocked = blocked;
    }
    if let Some(status_manual) = data.get("status_manual").and_then(Value::as_bool) {
        node.status_manual = status_manual;
    }
    node.checkpoints.tests.auto_confirmed = node.tests.is_empty();

    let Some(step) = step_at_mut(&mut task.steps, &path) else {
        return error_response(
            "task_add",
            codes::PATH_NOT_FOUND,
            &format!("step path={} not found", path),
        )
        .with_result(json!({"task": task_id, "parent_step": path.to_string()}));
    };
    let plan = step.plan_mut();
    plan.tasks.push(node);
    let node_path = path.child_node(plan.tasks.len() - 1);
    task.update_status_from_progress();

    let reloaded = match d.save_and_reload("task_add", &mut task) {
        Ok(item) => item,
        Err(resp) => return resp,
    };
    let node_view = crate::core::step::node_at(&reloaded.steps, &node_path)
        .map(|n| task_node_view(n, Some(&node_path.to_string()), false));
    AIResponse::ok(
        "task_add",
        json!({
            "task_id": task_id,
            "task_path": node_path.to_string(),
            "task_node": node_view,
            "task": item_view(&reloaded, false),
        }),
    )
    .with_context("task_id", json!(task_id))
}

pub fn handle_task_define(d: &Dispatcher, data: &Payload) -> AIResponse {
    let (task_id, mut task) = match d.require_task("task_define", data) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    let path = match resolve_node_path(&task, data, "path") {
        Ok(path) => path,
        Err((code, msg)) => {
            return error_response("task_define", &code, &msg)
                .with_recovery("Grab a valid task path/task_node_id via mirror/radar.")
                .with_suggestions(d.path_help_suggestions(&task_id));
        }
    };
    let Some(node) = node_at_mut(&mut task.steps, &path) else {
        return error_response(
            "task_define",
            codes::PATH_NOT_FOUND,
            &format!("task node path={} not found", path),
        )
        .with_suggestions(d.path_help_suggestions(&task_id));
    };

    let mut updated_fields: Vec<String> = Vec::new();
    if let Some(title) = data.get("title").and_then(Value::as_str) {
        let trimmed = title.trim();
        if trimmed.is_empty() {
            return error_response("task_define", codes::MISSING_TITLE, "title must not be empty");
        }
        node.title = trimmed.to_string();
        updated_fields.push("title".into());
    }
    if let Some(value) = data.get("success_criteria") {
        match normalize_str_list(value) {
            Ok(list) => {
                node.success_criteria = list;
                node.checkpoints.criteria.confirmed = false;
                node.checkpoints.criteria.auto_confirmed = false;
                updated_fields.push("success_criteria".into());
            }
            Err(msg) => {
                return error_response(
                    "task_define",
                    codes::INVALID_FIELDS,
                    &format!("success_criteria {}", msg),
                );
            }
        }
    }
    if let Some(value) = data.get("tests") {
        match normalize_str_list(value) {
            Ok(list) => {
                node.checkpoints.tests.confirmed = false;
                node.checkpoints.tests.auto_confirmed = list.is_empty();
                node.tests = list;
                updated_fields.push("tests".into());
            }
            Err(msg) => {
                return error_response(
                    "task_define",
                    codes::INVALID_FIELDS,
                    &format!("tests {}", msg),
                );
            }
        }
    }
    if let Some(value) = data.get("blockers") {
        match normalize_str_list(value) {
            Ok(list) => {
                node.blockers = list;
                updated_fields.push("blockers".into());
            }
            Err(msg) => {
                return error_response(
                    "task_define",
                    codes::INVALID_FIELDS,
                    &format!("blockers {}", msg),
                );
            }
        }
    }
    if updated_fields.is_empty() {
        return error_response("task_define", codes::NO_FIELDS, "nothing to update");
    }
    task.update_status_from_progress();

    let reloaded = match d.save_and_reload("task_define", &mut task) {
        Ok(item) => item,
        Err(resp) => return resp,
    };
    let node_view = crate::core::step::node_at(&reloaded.steps, &path)
        .map(|n| task_node_view(n, Some(&path.to_string()), false));
    AIResponse::ok(
        "task_define",
        json!({
            "task_id": task_id,
            "path": path.to_string(),
            "updated_fields": updated_fields,
            "task_node": node_view,
            "task": item_view(&reloaded, false),
        }),
    )
    .with_context("task_id", json!(task_id))
}

pub fn handle_task_delete(d: &Dispatcher, data: &Payload) -> AIResponse {
    let (task_id, mut task) = match d.require_task("task_delete", data) {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };
    let path = match resolve_node_path(&task, data, "path") {
        Ok(path) => path,
        Err((code, msg)) => {
            return error_response("task_delete", &code, &msg)
                .with_recovery("Grab a valid task path/task_node_id via mirror/radar.")
                .with_suggestions(d.path_help_suggestions(&task_id));
        }
    };

    // Split the node path into its parent step path plus the node index.
    let segs = path.segments();
    let Some(crate::core::ident::Seg::Node(node_idx)) = segs.last().copied() else {
        return error_response("task_delete", codes::INVALID_PATH, "path must address a task node");
    };
    let parent_segs = &segs[..segs.len() - 1];
    let parent_path = {
        let raw: Vec<String> = parent_segs
            .iter()
            .map(|seg| match seg {
                crate::core::ident::Seg::Step(n) => format!("s:{}", n),
                crate::core::ident::Seg::Node(n) => format!("t:{}", n),
            })
            .collect();
        crate::core::ident::StepPath::parse(&raw.join(".")).expect("parent of node path is a step path")
    };

    let Some(step) = step_at_mut(&mut task.steps, &parent_path) else {
        return error_response(
            "task_delete",
            codes::PATH_NOT_FOUND,
            &format!("task node path={} not found", path),
        )
        .with_suggestions(d.path_help_suggestions(&task_id));
    };
    let Some(plan) = &mut step.plan else {
        return error_response(
            "task_delete",
            codes::PATH_NOT_FOUND,
            &format!("task node path={} not found", path),
        );
    };
    if node_idx >= plan.tasks.len() {
        return error_response(
            "task_delete",
            codes::PATH_NOT_FOUND,
            &format!("task node path={} not found", path),
        );
    }
    let removed = plan.tasks.remove(node_idx);
    task.update_status_from_progress();

    let reloaded = match d.save_and_reload("task_delete", &mut task) {
        Ok(item) => item,
        Err(resp) => return resp,
    };
    AIResponse::ok(
        "task_delete",
        json!({
            "task_id": task_id,
            "path": path.to_string(),
            "deleted_task_node": task_node_view(&removed, Some(&path.to_string()), false),
            "task": item_view(&reloaded, false),
        }),
    )
    .with_context("task_id", json!(task_id))
}
