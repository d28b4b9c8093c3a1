//! Structured item events for timeline tracking and audit.
//!
//! Events give every Plan/Task a chronological log of significant changes:
//! checkpoint confirmations, status flips, blocks, contract updates, forced
//! overrides. Agents read them back through `resume` as a timeline.

use crate::core::time::now_iso;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const EVENT_CREATED: &str = "created";
pub const EVENT_CHECKPOINT: &str = "checkpoint";
pub const EVENT_STATUS: &str = "status";
pub const EVENT_BLOCKED: &str = "blocked";
pub const EVENT_UNBLOCKED: &str = "unblocked";
pub const EVENT_SUBTASK_DONE: &str = "subtask_done";
pub const EVENT_COMMENT: &str = "comment";
pub const EVENT_DEPENDENCY_ADDED: &str = "dependency_added";
pub const EVENT_DEPENDENCY_RESOLVED: &str = "dependency_resolved";
pub const EVENT_CONTRACT_UPDATED: &str = "contract_updated";
pub const EVENT_PLAN_UPDATED: &str = "plan_updated";
pub const EVENT_OVERRIDE: &str = "override";

/// Who caused an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    #[default]
    Ai,
    Human,
    System,
}

/// A single event in an item's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// ISO-8601 UTC timestamp when the event occurred.
    pub timestamp: String,
    pub event_type: String,
    #[serde(default)]
    pub actor: Actor,
    /// What was affected: "" for item level, "step:s:0" / "task:TASK-001" for scoped events.
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl TaskEvent {
    pub fn now(event_type: &str, actor: Actor, target: &str, data: Map<String, Value>) -> Self {
        TaskEvent {
            timestamp: now_iso(),
            event_type: event_type.to_string(),
            actor,
            target: target.to_string(),
            data,
        }
    }

    pub fn created(actor: Actor) -> Self {
        Self::now(EVENT_CREATED, actor, "", Map::new())
    }

    pub fn checkpoint(checkpoint: &str, target: &str, note: &str, actor: Actor) -> Self {
        let mut data = Map::new();
        data.insert("checkpoint".into(), Value::String(checkpoint.to_string()));
        if !note.is_empty() {
            data.insert("note".into(), Value::String(note.to_string()));
        }
        Self::now(EVENT_CHECKPOINT, actor, target, data)
    }

    pub fn status_changed(old: &str, new: &str, actor: Actor) -> Self {
        let mut data = Map::new();
        data.insert("old".into(), Value::String(old.to_string()));
        data.insert("new".into(), Value::String(new.to_string()));
        Self::now(EVENT_STATUS, actor, "", data)
    }

    pub fn blocked(reason: &str, target: &str, actor: Actor) -> Self {
        let mut data = Map::new();
        data.insert("reason".into(), Value::String(reason.to_string()));
        Self::now(EVENT_BLOCKED, actor, target, data)
    }

    pub fn unblocked(target: &str, actor: Actor) -> Self {
        Self::now(EVENT_UNBLOCKED, actor, target, Map::new())
    }

    pub fn comment(text: &str, target: &str, actor: Actor) -> Self {
        let mut data = Map::new();
        data.insert("text".into(), Value::String(text.to_string()));
        Self::now(EVENT_COMMENT, actor, target, data)
    }

    pub fn dependency_added(depends_on: &str, actor: Actor) -> Self {
        let mut data = Map::new();
        data.insert("depends_on".into(), Value::String(depends_on.to_string()));
        Self::now(EVENT_DEPENDENCY_ADDED, actor, "", data)
    }

    pub fn dependency_resolved(depends_on: &str, actor: Actor) -> Self {
        let mut data = Map::new();
        data.insert("depends_on".into(), Value::String(depends_on.to_string()));
        Self::now(EVENT_DEPENDENCY_RESOLVED, actor, "", data)
    }

    pub fn contract_updated(version: u64, note: &str, actor: Actor) -> Self {
        let mut data = Map::new();
        data.insert("version".into(), Value::Number(version.into()));
        if !note.is_empty() {
            data.insert("note".into(), Value::String(note.to_string()));
        }
        Self::now(EVENT_CONTRACT_UPDATED, actor, "", data)
    }

    pub fn plan_updated(contract_version: u64, actor: Actor) -> Self {
        let mut data = Map::new();
        data.insert(
            "contract_version".into(),
            Value::Number(contract_version.into()),
        );
        Self::now(EVENT_PLAN_UPDATED, actor, "", data)
    }

    /// Forced gate bypass; `operation` names the intent that was forced.
    pub fn override_event(operation: &str, reason: &str, target: &str) -> Self {
        let mut data = Map::new();
        data.insert("operation".into(), Value::String(operation.to_string()));
        data.insert("reason".into(), Value::String(reason.to_string()));
        Self::now(EVENT_OVERRIDE, Actor::Ai, target, data)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_event_payload() {
        let ev = TaskEvent::checkpoint("criteria", "step:s:0", "looks good", Actor::Ai);
        assert_eq!(ev.event_type, EVENT_CHECKPOINT);
        assert_eq!(ev.target, "step:s:0");
        assert_eq!(ev.data.get("checkpoint").unwrap(), "criteria");
        assert_eq!(ev.data.get("note").unwrap(), "looks good");
    }

    #[test]
    fn test_actor_serializes_lowercase() {
        let ev = TaskEvent::created(Actor::System);
        let value = ev.to_value();
        assert_eq!(value.get("actor").unwrap(), "system");
    }

    #[test]
    fn test_override_event_records_operation() {
        let ev = TaskEvent::override_event("complete:DONE", "hotfix window", "task:TASK-001");
        assert_eq!(ev.event_type, EVENT_OVERRIDE);
        assert_eq!(ev.data.get("operation").unwrap(), "complete:DONE");
        assert_eq!(ev.data.get("reason").unwrap(), "hotfix window");
    }

    #[test]
    fn test_dependency_events_carry_the_id() {
        let added = TaskEvent::dependency_added("TASK-002", Actor::Ai);
        assert_eq!(added.event_type, EVENT_DEPENDENCY_ADDED);
        assert_eq!(added.data.get("depends_on").unwrap(), "TASK-002");

        let resolved = TaskEvent::dependency_resolved("TASK-002", Actor::System);
        assert_eq!(resolved.event_type, EVENT_DEPENDENCY_RESOLVED);
        assert_eq!(resolved.data.get("depends_on").unwrap(), "TASK-002");
        assert_eq!(resolved.actor, Actor::System);
    }
}
