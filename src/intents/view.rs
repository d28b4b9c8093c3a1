//! JSON views of domain objects for responses.
//!
//! Full views are the serialized object plus derived fields (progress,
//! computed status, readiness); compact views keep the handful of fields an
//! agent needs to pick targets without paying for whole trees.

use crate::core::item::Item;
use crate::core::step::{PlanNode, Step, TaskNode};
use serde_json::{Map, Value, json};

pub fn step_view(step: &Step, path: Option<&str>, compact: bool) -> Value {
    if compact {
        return json!({
            "id": step.id,
            "path": path,
            "title": step.title,
            "completed": step.completed,
            "status": step.computed_status(),
            "blocked": step.blocked,
            "children_total": step.task_nodes().len(),
        });
    }
    let mut value = serde_json::to_value(step).unwrap_or(Value::Null);
    if let Some(map) = value.as_object_mut() {
        if let Some(path) = path {
            map.insert("path".into(), json!(path));
        }
        map.insert("computed_status".into(), json!(step.computed_status()));
        let ready = step.ready_for_completion();
        map.insert("ready".into(), json!(ready));
        if !ready {
            map.insert("needs".into(), json!(step.needs_for_completion()));
        }
    }
    value
}

pub fn task_node_view(node: &TaskNode, path: Option<&str>, compact: bool) -> Value {
    if compact {
        return json!({
            "id": node.id,
            "path": path,
            "title": node.title,
            "status": node.status,
            "progress": node.progress(),
            "blocked": node.blocked,
            "steps_total": node.steps.len(),
        });
    }
    let mut value = serde_json::to_value(node).unwrap_or(Value::Null);
    if let Some(map) = value.as_object_mut() {
        if let Some(path) = path {
            map.insert("path".into(), json!(path));
        }
        map.insert("progress".into(), json!(node.progress()));
        map.insert("is_done".into(), json!(node.is_done()));
    }
    value
}

pub fn plan_node_view(plan: &PlanNode, base_path: Option<&str>, compact: bool) -> Value {
    if compact {
        return json!({
            "path": base_path,
            "title": plan.title,
            "doc": crate::intents::validate::preview_text(&plan.doc, 140),
            "steps": plan.steps,
            "current": plan.current,
            "tasks_total": plan.tasks.len(),
        });
    }
    let mut value = serde_json::to_value(plan).unwrap_or(Value::Null);
    if let Some(map) = value.as_object_mut() {
        if let Some(path) = base_path {
            map.insert("path".into(), json!(path));
        }
    }
    value
}

pub fn item_view(item: &Item, compact: bool) -> Value {
    if compact {
        let mut map = Map::new();
        map.insert("id".into(), json!(item.id));
        map.insert("kind".into(), json!(item.kind.name()));
        map.insert("title".into(), json!(item.title));
        map.insert("status".into(), json!(item.status.name()));
        map.insert("priority".into(), json!(item.priority.name()));
        if !item.domain.is_empty() {
            map.insert("domain".into(), json!(item.domain));
        }
        if let Some(parent) = &item.parent {
            map.insert("parent".into(), json!(parent));
        }
        map.insert("revision".into(), json!(item.revision));
        map.insert("progress".into(), json!(item.progress()));
        if !item.tags.is_empty() {
            map.insert("tags".into(), json!(item.tags));
        }
        if item.blocked {
            map.insert("blocked".into(), json!(true));
        }
        if item.is_task() {
            map.insert("steps_total".into(), json!(item.steps.len()));
        }
        return Value::Object(map);
    }
    let mut value = serde_json::to_value(item).unwrap_or(Value::Null);
    if let Some(map) = value.as_object_mut() {
        map.insert("progress".into(), json!(item.progress()));
    }
    value
}

/// The result key an item's snapshot sits under: `plan` or `task`.
pub fn item_key(item: &Item) -> &'static str {
    if item.is_plan() { "plan" } else { "task" }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::item::ItemKind;

    #[test]
    fn test_item_view_compact_and_full() {
        let mut item = Item::new("TASK-001", ItemKind::Task, "t");
        item.steps
            .push(Step::new("s", &["c".to_string()], &[], &[]).unwrap());
        let compact = item_view(&item, true);
        assert_eq!(compact["id"], json!("TASK-001"));
        assert_eq!(compact["progress"], json!(0));
        assert!(compact.get("steps").is_none());

        let full = item_view(&item, false);
        assert!(full["steps"].is_array());
        assert_eq!(full["progress"], json!(0));
    }

    #[test]
    fn test_step_view_reports_needs() {
        let step = Step::new("s", &["c".to_string()], &["t".to_string()], &[]).unwrap();
        let view = step_view(&step, Some("s:0"), false);
        assert_eq!(view["ready"], json!(false));
        assert_eq!(view["needs"], json!(["criteria", "tests"]));
        assert_eq!(view["path"], json!("s:0"));
    }
}
