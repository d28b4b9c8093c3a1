//! Payload extraction and validation helpers for intent handlers.
//!
//! Handlers receive the raw request object; these helpers enforce the closed
//! grammars and limits before anything touches the repository: ids within
//! `^[A-Za-z0-9_-]{1,64}$`, step paths within the `s:`/`t:` grammar, strings
//! up to 500 chars, arrays up to 200 items, step payloads nested at most 24
//! levels.

use crate::core::evidence::{Attachment, VerificationCheck};
use crate::core::ident::{self, MAX_NESTING_DEPTH, StepPath};
use crate::core::item::Item;
use crate::core::step::{PlanNode, Step, TaskNode, find_node_path_by_id, find_step_path_by_id};
use serde_json::{Map, Value, json};

pub const MAX_STRING_LENGTH: usize = 500;
pub const MAX_ARRAY_LENGTH: usize = 200;
pub const MAX_EVIDENCE_ITEMS: usize = 20;

pub type Payload = Map<String, Value>;

pub fn get_str<'a>(data: &'a Payload, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str)
}

pub fn get_trimmed(data: &Payload, key: &str) -> String {
    get_str(data, key).unwrap_or_default().trim().to_string()
}

pub fn get_bool(data: &Payload, key: &str, default: bool) -> bool {
    data.get(key).and_then(Value::as_bool).unwrap_or(default)
}

/// Validate a target id value. Returns the id or a problem description.
pub fn validate_task_id(value: Option<&Value>) -> Result<String, String> {
    let Some(value) = value else {
        return Err("id is missing".to_string());
    };
    let Some(raw) = value.as_str() else {
        return Err("id must be a string".to_string());
    };
    if let Some(problem) = ident::id_error(raw) {
        return Err(problem);
    }
    Ok(raw.trim().to_string())
}

pub fn validate_node_id(value: Option<&Value>, field: &str) -> Result<String, String> {
    validate_task_id(value).map_err(|problem| format!("{}: {}", field, problem))
}

pub fn validate_string(value: &Value, field: &str) -> Result<String, String> {
    let Some(raw) = value.as_str() else {
        return Err(format!("{} must be a string", field));
    };
    if raw.len() > MAX_STRING_LENGTH {
        return Err(format!("{} too long (max {})", field, MAX_STRING_LENGTH));
    }
    Ok(raw.to_string())
}

pub fn validate_array<'a>(value: &'a Value, field: &str) -> Result<&'a Vec<Value>, String> {
    let Some(items) = value.as_array() else {
        return Err(format!("{} must be an array", field));
    };
    if items.len() > MAX_ARRAY_LENGTH {
        return Err(format!("{} too long (max {})", field, MAX_ARRAY_LENGTH));
    }
    Ok(items)
}

/// Normalize an array of strings: trim, drop empties. Non-strings reject.
pub fn normalize_str_list(value: &Value) -> Result<Vec<String>, String> {
    let items = value.as_array().ok_or("must be an array of strings")?;
    let mut out = Vec::new();
    for item in items {
        let Some(raw) = item.as_str() else {
            return Err("must be an array of strings".to_string());
        };
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            out.push(trimmed.to_string());
        }
    }
    Ok(out)
}

/// Filters accept a string or an array of strings.
pub fn normalize_filter_list(value: &Value) -> Result<Vec<String>, String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            Ok(if trimmed.is_empty() {
                Vec::new()
            } else {
                vec![trimmed.to_string()]
            })
        }
        Value::Array(_) => normalize_str_list(value),
        _ => Err("must be a string or an array of strings".to_string()),
    }
}

pub fn normalize_status_filter(value: &Value) -> Result<Vec<String>, String> {
    let values = normalize_filter_list(value)?;
    let mut out = Vec::new();
    for raw in values {
        let upper = raw.trim().to_uppercase();
        if !matches!(upper.as_str(), "TODO" | "ACTIVE" | "DONE") {
            return Err(format!("unknown status: {}", raw));
        }
        out.push(upper);
    }
    Ok(out)
}

pub fn parse_limit(value: Option<&Value>, field: &str) -> Result<Option<usize>, String> {
    let Some(value) = value else {
        return Ok(None);
    };
    let Some(limit) = value.as_i64() else {
        return Err(format!("{} must be a number", field));
    };
    if limit < 0 {
        return Err(format!("{} must be >= 0", field));
    }
    if limit as usize > MAX_ARRAY_LENGTH {
        return Err(format!("{} too large (max {})", field, MAX_ARRAY_LENGTH));
    }
    Ok(Some(limit as usize))
}

pub fn parse_cursor(value: Option<&Value>, field: &str) -> Result<Option<usize>, String> {
    let Some(value) = value else {
        return Ok(None);
    };
    let cursor = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    let Some(cursor) = cursor else {
        return Err(format!("{} must be a number", field));
    };
    if cursor < 0 {
        return Err(format!("{} must be >= 0", field));
    }
    Ok(Some(cursor as usize))
}

pub fn dedupe_strs(items: Vec<String>) -> Vec<String> {
    let mut seen = rustc_hash::FxHashSet::default();
    let mut out = Vec::new();
    for raw in items {
        let trimmed = raw.trim().to_string();
        if trimmed.is_empty() || seen.contains(&trimmed) {
            continue;
        }
        seen.insert(trimmed.clone());
        out.push(trimmed);
    }
    out
}

pub fn preview_text(value: &str, max_len: usize) -> String {
    let text = value.trim();
    if text.chars().count() <= max_len {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_len.saturating_sub(1)).collect();
    format!("{}\u{2026}", cut)
}

/// Resolve a step path from `step_id` (preferred) or `path`.
/// Returns `(path, None)` on success, or `(_, Some((code, message)))`.
pub fn resolve_step_path(
    item: &Item,
    data: &Payload,
    path_field: &str,
) -> Result<StepPath, (String, String)> {
    if let Some(step_id) = data.get("step_id") {
        let id = validate_node_id(Some(step_id), "step_id")
            .map_err(|msg| ("INVALID_STEP_ID".to_string(), msg))?;
        return find_step_path_by_id(&item.steps, &id).ok_or((
            "STEP_ID_NOT_FOUND".to_string(),
            format!("step step_id={} not found", id),
        ));
    }
    let raw = data
        .get(path_field)
        .and_then(Value::as_str)
        .unwrap_or_default();
    StepPath::parse_step(raw).map_err(|msg| ("INVALID_PATH".to_string(), msg))
}

/// Resolve a task-node path from `task_node_id` (preferred) or `path`.
pub fn resolve_node_path(
    item: &Item,
    data: &Payload,
    path_field: &str,
) -> Result<StepPath, (String, String)> {
    if let Some(node_id) = data.get("task_node_id") {
        let id = validate_node_id(Some(node_id), "task_node_id")
            .map_err(|msg| ("INVALID_TASK_NODE_ID".to_string(), msg))?;
        return find_node_path_by_id(&item.steps, &id).ok_or((
            "TASK_NODE_ID_NOT_FOUND".to_string(),
            format!("task node task_node_id={} not found", id),
        ));
    }
    let raw = data
        .get(path_field)
        .and_then(Value::as_str)
        .unwrap_or_default();
    StepPath::parse_node(raw).map_err(|msg| ("INVALID_PATH".to_string(), msg))
}

/// Checks accept strings (command spec sugar) or full objects.
pub fn normalize_checks_payload(raw: &Value) -> Result<Vec<Value>, String> {
    let items = raw.as_array().ok_or("checks must be an array")?;
    let mut out = Vec::new();
    for (idx, item) in items.iter().enumerate() {
        match item {
            Value::String(s) => {
                let spec = s.trim();
                if spec.is_empty() {
                    return Err(format!("checks[{}] is an empty string", idx));
                }
                out.push(json!({"kind": "command", "spec": spec, "outcome": "info"}));
            }
            Value::Object(_) => out.push(item.clone()),
            _ => return Err(format!("checks[{}] must be an object or a string", idx)),
        }
    }
    Ok(out)
}

/// Attachments accept strings (file path sugar) or full objects; `file_path`
/// aliases `path`.
pub fn normalize_attachments_payload(raw: &Value) -> Result<Vec<Value>, String> {
    let items = raw.as_array().ok_or("attachments must be an array")?;
    let mut out = Vec::new();
    for (idx, item) in items.iter().enumerate() {
        match item {
            Value::String(s) => {
                let path = s.trim();
                if path.is_empty() {
                    return Err(format!("attachments[{}] is an empty string", idx));
                }
                out.push(json!({"kind": "file", "path": path}));
            }
            Value::Object(map) => {
                let mut payload = map.clone();
                let has_path = payload
                    .get("path")
                    .and_then(Value::as_str)
                    .is_some_and(|p| !p.trim().is_empty());
                if !has_path {
                    if let Some(file_path) = payload.get("file_path").and_then(Value::as_str) {
                        if !file_path.trim().is_empty() {
                            payload.insert("path".into(), json!(file_path.trim()));
                        }
                    }
                }
                out.push(Value::Object(payload));
            }
            _ => return Err(format!("attachments[{}] must be an object or a string", idx)),
        }
    }
    Ok(out)
}

pub fn parse_checks(raw: &Value) -> Result<Vec<VerificationCheck>, String> {
    let normalized = normalize_checks_payload(raw)?;
    normalized
        .iter()
        .map(|c| VerificationCheck::from_value(c))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| "checks contain invalid entries".to_string())
}

pub fn parse_attachments(raw: &Value) -> Result<Vec<Attachment>, String> {
    let normalized = normalize_attachments_payload(raw)?;
    normalized
        .iter()
        .map(|a| Attachment::from_value(a))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| "attachments contain invalid entries".to_string())
}

/// Parse an inline step payload (used by `create` and `decompose`).
pub fn parse_step_node(node: &Value, depth: usize) -> Result<Step, String> {
    if depth > MAX_NESTING_DEPTH {
        return Err("steps nesting too deep".to_string());
    }
    let map = node.as_object().ok_or("step must be an object")?;
    let title = map
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    if title.is_empty() {
        return Err("step.title is required".to_string());
    }
    if title.len() > MAX_STRING_LENGTH {
        return Err("step.title too long".to_string());
    }
    let criteria = match map.get("success_criteria") {
        Some(value) => normalize_str_list(value).map_err(|e| format!("step.success_criteria {}", e))?,
        None => Vec::new(),
    };
    let tests = match map.get("tests") {
        Some(value) => normalize_str_list(value).map_err(|e| format!("step.tests {}", e))?,
        None => Vec::new(),
    };
    let blockers = match map.get("blockers") {
        Some(value) => normalize_str_list(value).map_err(|e| format!("step.blockers {}", e))?,
        None => Vec::new(),
    };
    let mut step =
        Step::new(&title, &criteria, &tests, &blockers).ok_or("step.success_criteria is required")?;
    if let Some(id) = map.get("id").and_then(Value::as_str) {
        if !id.trim().is_empty() {
            step.id = id.trim().to_string();
        }
    }
    if let Some(checks) = map.get("verification_checks") {
        step.verification_checks = parse_checks(checks).unwrap_or_default();
    }
    step.verification_outcome = map
        .get("verification_outcome")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    if let Some(attachments) = map.get("attachments") {
        step.attachments = parse_attachments(attachments).unwrap_or_default();
    }
    if let Some(plan_raw) = map.get("plan") {
        if !plan_raw.is_object() {
            return Err("step.plan must be an object".to_string());
        }
        step.plan = Some(parse_plan_node(plan_raw, depth + 1)?);
    } else if map.contains_key("steps") {
        return Err("step.steps is not supported; use step.plan.tasks[].steps".to_string());
    }
    Ok(step)
}

pub fn parse_plan_node(node: &Value, depth: usize) -> Result<PlanNode, String> {
    if depth > MAX_NESTING_DEPTH {
        return Err("plan nesting too deep".to_string());
    }
    let map = node.as_object().ok_or("plan must be an object")?;
    let tasks_raw = map.get("tasks").cloned().unwrap_or(json!([]));
    let tasks_items = tasks_raw.as_array().ok_or("plan.tasks must be an array")?;
    let mut tasks = Vec::new();
    for task in tasks_items {
        if task.is_object() {
            tasks.push(parse_task_node(task, depth + 1)?);
        }
    }
    let mut plan = PlanNode {
        title: get_trimmed(map, "title"),
        doc: map
            .get("doc")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        steps: map
            .get("steps")
            .map(normalize_str_list)
            .transpose()
            .map_err(|e| format!("plan.steps {}", e))?
            .unwrap_or_default(),
        current: map.get("current").and_then(Value::as_u64).unwrap_or(0) as usize,
        tasks,
        ..PlanNode::default()
    };
    if let Some(attachments) = map.get("attachments") {
        plan.attachments = parse_attachments(attachments).unwrap_or_default();
    }
    Ok(plan)
}

pub fn parse_task_node(node: &Value, depth: usize) -> Result<TaskNode, String> {
    if depth > MAX_NESTING_DEPTH {
        return Err("task nesting too deep".to_string());
    }
    let map = node.as_object().ok_or("task must be an object")?;
    let title = get_trimmed(map, "title");
    if title.is_empty() {
        return Err("task.title is required".to_string());
    }
    if title.len() > MAX_STRING_LENGTH {
        return Err("task.title too long".to_string());
    }
    let steps_raw = map.get("steps").cloned().unwrap_or(json!([]));
    let steps_items = steps_raw.as_array().ok_or("task.steps must be an array")?;
    let mut steps = Vec::new();
    for child in steps_items {
        if child.is_object() {
            steps.push(parse_step_node(child, depth + 1)?);
        }
    }

    let list = |key: &str| -> Result<Vec<String>, String> {
        map.get(key)
            .map(normalize_str_list)
            .transpose()
            .map_err(|e| format!("task.{} {}", key, e))
            .map(|v| v.unwrap_or_default())
    };

    let mut task = TaskNode::new(&title);
    task.status = get_str(map, "status").unwrap_or("TODO").trim().to_string();
    if task.status.is_empty() {
        task.status = "TODO".to_string();
    }
    task.priority = get_str(map, "priority").unwrap_or("MEDIUM").trim().to_string();
    if task.priority.is_empty() {
        task.priority = "MEDIUM".to_string();
    }
    task.description = get_str(map, "description").unwrap_or_default().to_string();
    task.context = get_str(map, "context").unwrap_or_default().to_string();
    task.success_criteria = list("success_criteria")?;
    task.tests = list("tests")?;
    task.checkpoints.criteria.confirmed = get_bool(map, "criteria_confirmed", false);
    task.checkpoints.tests.confirmed = get_bool(map, "tests_confirmed", false);
    task.checkpoints.criteria.auto_confirmed = get_bool(map, "criteria_auto_confirmed", false);
    task.checkpoints.tests.auto_confirmed =
        get_bool(map, "tests_auto_confirmed", task.tests.is_empty());
    task.dependencies = list("dependencies")?;
    task.next_steps = list("next_steps")?;
    task.problems = list("problems")?;
    task.risks = list("risks")?;
    task.blocked = get_bool(map, "blocked", false);
    task.blockers = list("blockers")?;
    task.status_manual = get_bool(map, "status_manual", false);
    task.steps = steps;
    if let Some(attachments) = map.get("attachments") {
        task.attachments = parse_attachments(attachments).unwrap_or_default();
    }
    if let Some(id) = map.get("id").and_then(Value::as_str) {
        if !id.trim().is_empty() {
            task.id = id.trim().to_string();
        }
    }
    Ok(task)
}

/// Validate a `steps` payload without building the tree (shape + limits).
pub fn validate_steps_data(value: &Value) -> Result<(), String> {
    let items = validate_array(value, "steps")?;
    for (idx, node) in items.iter().enumerate() {
        if !node.is_object() {
            return Err(format!("steps[{}] must be an object", idx + 1));
        }
        parse_step_node(node, 0).map_err(|e| format!("steps[{}]: {}", idx + 1, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_task_id() {
        assert_eq!(validate_task_id(Some(&json!("TASK-001"))).unwrap(), "TASK-001");
        assert!(validate_task_id(Some(&json!("a/b"))).is_err());
        assert!(validate_task_id(Some(&json!(42))).is_err());
        assert!(validate_task_id(None).is_err());
    }

    #[test]
    fn test_normalize_lists() {
        assert_eq!(
            normalize_str_list(&json!([" a ", "", "b"])).unwrap(),
            vec!["a", "b"]
        );
        assert!(normalize_str_list(&json!([1])).is_err());
        assert_eq!(
            normalize_filter_list(&json!("active")).unwrap(),
            vec!["active"]
        );
        assert_eq!(
            normalize_status_filter(&json!(["todo", "DONE"])).unwrap(),
            vec!["TODO", "DONE"]
        );
        assert!(normalize_status_filter(&json!("bogus")).is_err());
    }

    #[test]
    fn test_limits() {
        assert_eq!(parse_limit(Some(&json!(5)), "limit").unwrap(), Some(5));
        assert!(parse_limit(Some(&json!(-1)), "limit").is_err());
        assert!(parse_limit(Some(&json!(10_000)), "limit").is_err());
        assert_eq!(parse_cursor(Some(&json!("3")), "cursor").unwrap(), Some(3));
    }

    #[test]
    fn test_checks_and_attachments_sugar() {
        let checks = normalize_checks_payload(&json!(["cargo test"])).unwrap();
        assert_eq!(checks[0]["kind"], json!("command"));
        assert_eq!(checks[0]["spec"], json!("cargo test"));
        assert!(normalize_checks_payload(&json!([""])).is_err());

        let atts = normalize_attachments_payload(&json!(["/tmp/log.txt"])).unwrap();
        assert_eq!(atts[0]["kind"], json!("file"));
        let aliased =
            normalize_attachments_payload(&json!([{"kind": "file", "file_path": "x.log"}])).unwrap();
        assert_eq!(aliased[0]["path"], json!("x.log"));
    }

    #[test]
    fn test_parse_step_node_requires_criteria() {
        assert!(parse_step_node(&json!({"title": "no criteria"}), 0).is_err());
        let step = parse_step_node(
            &json!({"title": "ok step", "success_criteria": ["c"], "tests": ["t"]}),
            0,
        )
        .unwrap();
        assert_eq!(step.tests, vec!["t"]);
        assert!(!step.checkpoints.tests.auto_confirmed);
    }

    #[test]
    fn test_parse_step_node_rejects_direct_children() {
        let err = parse_step_node(
            &json!({"title": "bad", "success_criteria": ["c"], "steps": []}),
            0,
        )
        .unwrap_err();
        assert!(err.contains("plan.tasks"));
    }

    #[test]
    fn test_parse_nested_plan_tasks() {
        let step = parse_step_node(
            &json!({
                "title": "root",
                "success_criteria": ["c"],
                "plan": {"tasks": [{"title": "child", "steps": [
                    {"title": "inner", "success_criteria": ["ic"]}
                ]}]}
            }),
            0,
        )
        .unwrap();
        let plan = step.plan.as_ref().unwrap();
        assert_eq!(plan.tasks.len(), 1);
        assert_eq!(plan.tasks[0].steps[0].title, "inner");
    }

    #[test]
    fn test_preview_text_truncation() {
        assert_eq!(preview_text("short", 10), "short");
        let long = "x".repeat(300);
        let out = preview_text(&long, 280);
        assert!(out.chars().count() <= 280);
        assert!(out.ends_with('\u{2026}'));
    }
}
