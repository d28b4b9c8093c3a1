//! History intents: `history`, `delta`, `undo`, `redo`.
//!
//! `delta` is the agent's incremental feed: operations since a cursor id,
//! filtered by task/intent/path/stream, as compact summaries by default with
//! opt-in details and snapshot content.

use crate::intents::Dispatcher;
use crate::intents::response::{AIResponse, codes, error_response};
use crate::intents::validate::{self, Payload, normalize_filter_list, validate_task_id};
use serde_json::{Value, json};

pub fn handle_history(d: &Dispatcher, data: &Payload) -> AIResponse {
    let history = match d.history() {
        Ok(history) => history,
        Err(err) => return error_response("history", codes::INTERNAL_ERROR, &err.to_string()),
    };
    let limit = data.get("limit").and_then(Value::as_u64).unwrap_or(20) as usize;
    let stream = validate::get_trimmed(data, "stream").to_lowercase();
    let source = if stream == "audit" {
        &history.audit_operations
    } else {
        &history.operations
    };
    let start = source.len().saturating_sub(limit);
    let operations: Vec<Value> = source[start..].iter().map(|op| op.to_value()).collect();
    AIResponse::ok(
        "history",
        json!({
            "operations": operations,
            "can_undo": history.can_undo(),
            "can_redo": history.can_redo(),
        }),
    )
}

pub fn handle_delta(d: &Dispatcher, data: &Payload) -> AIResponse {
    let history = match d.history() {
        Ok(history) => history,
        Err(err) => return error_response("delta", codes::DELTA_FAILED, &err.to_string()),
    };

    let since = {
        let mut value = validate::get_trimmed(data, "since");
        if value.is_empty() {
            value = validate::get_trimmed(data, "since_operation_id");
        }
        if value.is_empty() {
            value = validate::get_trimmed(data, "since_id");
        }
        value
    };
    let task_filter = match data
        .get("task")
        .or_else(|| data.get("task_id"))
        .or_else(|| data.get("filter_task"))
    {
        Some(value) => match validate_task_id(Some(value)) {
            Ok(id) => Some(id),
            Err(msg) => return error_response("delta", codes::INVALID_TASK, &msg),
        },
        None => None,
    };
    let limit = match data.get("limit") {
        None => 50usize,
        Some(value) => match value.as_i64() {
            Some(n) => n.clamp(0, 500) as usize,
            None => return error_response("delta", codes::INVALID_LIMIT, "limit must be a number"),
        },
    };
    let include_undone = validate::get_bool(data, "include_undone", true);
    let include_details = validate::get_bool(data, "include_details", false);
    let include_snapshot = validate::get_bool(data, "include_snapshot", false);
    let stream = {
        let raw = validate::get_trimmed(data, "stream").to_lowercase();
        if raw.is_empty() { "ops".to_string() } else { raw }
    };
    if !matches!(stream.as_str(), "ops" | "audit") {
        return error_response("delta", codes::INVALID_FILTER, "stream must be ops|audit");
    }
    let intents_filter = match data.get("intents") {
        Some(value) => match normalize_filter_list(value) {
            Ok(list) => list,
            Err(msg) => return error_response("delta", codes::INVALID_FILTER, &msg),
        },
        None => Vec::new(),
    };
    let paths_filter = match data.get("paths") {
        Some(value) => match normalize_filter_list(value) {
            Ok(list) => list,
            Err(msg) => return error_response("delta", codes::INVALID_FILTER, &msg),
        },
        None => Vec::new(),
    };

    let source = if stream == "audit" {
        &history.audit_operations
    } else {
        &history.operations
    };

    let mut start_idx = 0usize;
    if !since.is_empty() {
        let Some(found) = source.iter().position(|op| op.id == since) else {
            return error_response("delta", codes::SINCE_NOT_FOUND, &format!("since={} not found", since))
                .with_recovery("Call history to fetch current operation ids.")
                .with_result(json!({"since": since}));
        };
        start_idx = found + 1;
    }

    let mut sliced: Vec<&crate::core::history::Operation> = source[start_idx..].iter().collect();
    if let Some(task_filter) = &task_filter {
        sliced.retain(|op| op.task_id.as_deref() == Some(task_filter.as_str()));
    }
    if !include_undone {
        sliced.retain(|op| !op.undone);
    }
    if !intents_filter.is_empty() {
        sliced.retain(|op| intents_filter.iter().any(|i| i == &op.intent));
    }
    if !paths_filter.is_empty() {
        sliced.retain(|op| {
            op.data
                .get("path")
                .and_then(Value::as_str)
                .map(|p| paths_filter.iter().any(|f| f == p))
                .unwrap_or(false)
        });
    }

    let has_more = limit > 0 && sliced.len() > limit;
    let sliced: Vec<&crate::core::history::Operation> = if limit > 0 {
        sliced.into_iter().take(limit).collect()
    } else {
        Vec::new()
    };

    let latest_id = source.last().map(|op| op.id.clone());
    let mut operations: Vec<Value> = Vec::new();
    for op in &sliced {
        let mut payload = if include_details {
            op.to_value()
        } else {
            op.to_summary_value()
        };
        if include_snapshot {
            if let Some(map) = payload.as_object_mut() {
                map.insert(
                    "snapshot".into(),
                    json!({
                        "before_id": op.snapshot_id,
                        "after_id": op.after_snapshot_id,
                        "before": op.snapshot_id.as_deref().and_then(|id| history.load_snapshot_content(id)),
                        "after": op.after_snapshot_id.as_deref().and_then(|id| history.load_snapshot_content(id)),
                    }),
                );
            }
        }
        operations.push(payload);
    }

    AIResponse::ok(
        "delta",
        json!({
            "since": if since.is_empty() { Value::Null } else { json!(since) },
            "task": task_filter,
            "stream": stream,
            "latest_id": latest_id,
            "include_details": include_details,
            "include_snapshot": include_snapshot,
            "operations": operations,
            "has_more": has_more,
            "can_undo": history.can_undo(),
            "can_redo": history.can_redo(),
        }),
    )
}

pub fn handle_undo(d: &Dispatcher, _data: &Payload) -> AIResponse {
    let mut history = match d.history() {
        Ok(history) => history,
        Err(err) => return error_response("undo", codes::INTERNAL_ERROR, &err.to_string()),
    };
    if !history.can_undo() {
        return error_response("undo", codes::NOTHING_TO_UNDO, "no operations to undo");
    }
    match history.undo() {
        Ok(op) => AIResponse::ok(
            "undo",
            json!({
                "undone_operation": op.to_value(),
                "can_undo": history.can_undo(),
                "can_redo": history.can_redo(),
            }),
        ),
        Err(err) => error_response("undo", codes::UNDO_FAILED, &err.to_string()),
    }
}

pub fn handle_redo(d: &Dispatcher, _data: &Payload) -> AIResponse {
    let mut history = match d.history() {
        Ok(history) => history,
        Err(err) => return error_response("redo", codes::INTERNAL_ERROR, &err.to_string()),
    };
    if !history.can_redo() {
        return error_response("redo", codes::NOTHING_TO_REDO, "no operations to redo");
    }
    match history.redo() {
        Ok(op) => AIResponse::ok(
            "redo",
            json!({
                "redone_operation": op.to_value(),
                "can_undo": history.can_undo(),
                "can_redo": history.can_redo(),
            }),
        ),
        Err(err) => error_response("redo", codes::REDO_FAILED, &err.to_string()),
    }
}
