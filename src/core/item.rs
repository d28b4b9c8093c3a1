//! File-backed items: Plans and Tasks.
//!
//! An [`Item`] is the unit persisted to a `.task` file. A Plan carries the
//! strategic contract (text + structured [`ContractData`] + a versioned
//! history) and a lightweight checklist (`plan_doc` / `plan_steps` /
//! `plan_current`); a Task carries the executable step tree. Both share the
//! item-level surface: status, priority, tags, dependencies, checkpoints,
//! events, and the monotonic `revision` that optimistic concurrency rides on.

use crate::core::event::{Actor, TaskEvent};
use crate::core::step::{Checkpoints, Step, count_step_tree};
use crate::core::time::now_iso;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Plan,
    #[default]
    Task,
}

impl ItemKind {
    pub fn name(self) -> &'static str {
        match self {
            ItemKind::Plan => "plan",
            ItemKind::Task => "task",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    #[default]
    Todo,
    Active,
    Done,
}

impl Status {
    pub fn name(self) -> &'static str {
        match self {
            Status::Todo => "TODO",
            Status::Active => "ACTIVE",
            Status::Done => "DONE",
        }
    }

    pub fn parse(raw: &str) -> Option<Status> {
        match raw.trim().to_uppercase().as_str() {
            "TODO" => Some(Status::Todo),
            "ACTIVE" => Some(Status::Active),
            "DONE" => Some(Status::Done),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn name(self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Medium => "MEDIUM",
            Priority::High => "HIGH",
        }
    }

    pub fn parse(raw: &str) -> Option<Priority> {
        match raw.trim().to_uppercase().as_str() {
            "LOW" => Some(Priority::Low),
            "MEDIUM" => Some(Priority::Medium),
            "HIGH" => Some(Priority::High),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Structured contract: the machine-readable half of an item's contract.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContractData {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub goal: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assumptions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub non_goals: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub done: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub risks: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<String>,
}

impl ContractData {
    pub fn is_empty(&self) -> bool {
        self.goal.is_empty()
            && self.constraints.is_empty()
            && self.assumptions.is_empty()
            && self.non_goals.is_empty()
            && self.done.is_empty()
            && self.risks.is_empty()
            && self.checks.is_empty()
    }

    pub fn from_value(raw: &Value) -> Result<ContractData, String> {
        if !raw.is_object() {
            return Err("contract_data must be an object".to_string());
        }
        serde_json::from_value(raw.clone()).map_err(|e| format!("invalid contract_data: {}", e))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// One snapshot in the contract's version history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractVersion {
    pub version: u64,
    pub timestamp: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub done_criteria: Vec<String>,
    #[serde(default)]
    pub data: ContractData,
}

/// The file-backed root unit: a Plan or a Task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    #[serde(default)]
    pub kind: ItemKind,
    pub title: String,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub context: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub contract: String,
    #[serde(default, skip_serializing_if = "ContractData::is_empty")]
    pub contract_data: ContractData,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contract_versions: Vec<ContractVersion>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub success_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blockers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub problems: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub risks: Vec<String>,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default)]
    pub checkpoints: Checkpoints,
    /// Monotonic revision: bumped by exactly 1 on every persisted save.
    #[serde(default)]
    pub revision: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub updated: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<TaskEvent>,
    #[serde(default)]
    pub status_manual: bool,
    // Plan-specific checklist.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub plan_doc: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plan_steps: Vec<String>,
    #[serde(default)]
    pub plan_current: usize,
    // Task-specific step tree.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
}

impl Item {
    pub fn new(id: &str, kind: ItemKind, title: &str) -> Item {
        let now = now_iso();
        let mut item = Item {
            id: id.to_string(),
            kind,
            title: title.trim().to_string(),
            status: Status::Todo,
            priority: Priority::Medium,
            domain: String::new(),
            parent: None,
            description: String::new(),
            context: String::new(),
            contract: String::new(),
            contract_data: ContractData::default(),
            contract_versions: Vec::new(),
            success_criteria: Vec::new(),
            tests: Vec::new(),
            blockers: Vec::new(),
            tags: Vec::new(),
            depends_on: Vec::new(),
            next_steps: Vec::new(),
            problems: Vec::new(),
            risks: Vec::new(),
            blocked: false,
            checkpoints: Checkpoints::default(),
            revision: 0,
            created: now.clone(),
            updated: now,
            events: vec![TaskEvent::created(Actor::Ai)],
            status_manual: false,
            plan_doc: String::new(),
            plan_steps: Vec::new(),
            plan_current: 0,
            steps: Vec::new(),
        };
        item.checkpoints.tests.auto_confirmed = true;
        item
    }

    pub fn is_plan(&self) -> bool {
        self.kind == ItemKind::Plan
    }

    pub fn is_task(&self) -> bool {
        self.kind == ItemKind::Task
    }

    /// Percentage of completed steps across the full recursive step tree.
    /// Plans derive progress from the checklist cursor instead.
    pub fn progress(&self) -> u32 {
        if self.is_plan() {
            if self.plan_steps.is_empty() {
                return 0;
            }
            let current = self.plan_current.min(self.plan_steps.len());
            return ((current as f64 / self.plan_steps.len() as f64) * 100.0) as u32;
        }
        let (total, done) = count_step_tree(&self.steps);
        if total == 0 {
            return 0;
        }
        ((done as f64 / total as f64) * 100.0) as u32
    }

    pub fn has_subtasks(&self) -> bool {
        !self.steps.is_empty()
    }

    /// Clamp the plan cursor into `[0, len(plan_steps)]`.
    pub fn clamp_plan_current(&mut self) {
        if self.plan_steps.is_empty() {
            self.plan_current = 0;
        } else {
            self.plan_current = self.plan_current.min(self.plan_steps.len());
        }
    }

    /// Keep the aggregate status consistent with derived progress: full
    /// progress on an unblocked item with steps promotes to DONE unless the
    /// status was pinned manually.
    pub fn update_status_from_progress(&mut self) {
        self.clamp_plan_current();
        if self.status_manual || self.blocked {
            return;
        }
        if self.is_task() && self.has_subtasks() && self.progress() == 100 {
            self.status = Status::Done;
        }
    }

    /// Append a contract version snapshot when the contract text, done
    /// criteria, or structured data changed vs the last snapshot. Returns
    /// true when a new version was appended.
    pub fn append_contract_version_if_changed(&mut self, actor: Actor, note: &str) -> bool {
        let mut latest_version = 0u64;
        let mut latest: Option<&ContractVersion> = None;
        for entry in &self.contract_versions {
            if entry.version >= latest_version {
                latest_version = entry.version;
                latest = Some(entry);
            }
        }
        if let Some(last) = latest {
            if last.text == self.contract
                && last.done_criteria == self.success_criteria
                && last.data == self.contract_data
            {
                return false;
            }
        }
        let version = latest_version + 1;
        self.contract_versions.push(ContractVersion {
            version,
            timestamp: now_iso(),
            text: self.contract.clone(),
            done_criteria: self.success_criteria.clone(),
            data: self.contract_data.clone(),
        });
        self.events
            .push(TaskEvent::contract_updated(version, note, actor));
        true
    }

    /// Whether any contract material exists worth versioning.
    pub fn has_contract_material(&self) -> bool {
        !self.contract.trim().is_empty()
            || !self.contract_data.is_empty()
            || !self.success_criteria.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::step::Step;

    fn task_with_steps(n: usize) -> Item {
        let mut item = Item::new("TASK-001", ItemKind::Task, "t");
        for i in 0..n {
            item.steps
                .push(Step::new(&format!("step {}", i), &["c".to_string()], &[], &[]).unwrap());
        }
        item
    }

    #[test]
    fn test_progress_over_step_tree() {
        let mut item = task_with_steps(4);
        assert_eq!(item.progress(), 0);
        item.steps[0].completed = true;
        item.steps[1].completed = true;
        assert_eq!(item.progress(), 50);
        for st in &mut item.steps {
            st.completed = true;
        }
        assert_eq!(item.progress(), 100);
    }

    #[test]
    fn test_status_promotion_and_manual_pin() {
        let mut item = task_with_steps(1);
        item.steps[0].completed = true;
        item.update_status_from_progress();
        assert_eq!(item.status, Status::Done);

        let mut pinned = task_with_steps(1);
        pinned.steps[0].completed = true;
        pinned.status_manual = true;
        pinned.status = Status::Active;
        pinned.update_status_from_progress();
        assert_eq!(pinned.status, Status::Active);
    }

    #[test]
    fn test_no_promotion_without_steps_or_when_blocked() {
        let mut empty = Item::new("TASK-002", ItemKind::Task, "t");
        empty.update_status_from_progress();
        assert_eq!(empty.status, Status::Todo);

        let mut blocked = task_with_steps(1);
        blocked.steps[0].completed = true;
        blocked.blocked = true;
        blocked.update_status_from_progress();
        assert_eq!(blocked.status, Status::Todo);
    }

    #[test]
    fn test_plan_current_clamp() {
        let mut plan = Item::new("PLAN-001", ItemKind::Plan, "p");
        plan.plan_steps = vec!["a".into(), "b".into()];
        plan.plan_current = 9;
        plan.clamp_plan_current();
        assert_eq!(plan.plan_current, 2);
        plan.plan_steps.clear();
        plan.clamp_plan_current();
        assert_eq!(plan.plan_current, 0);
    }

    #[test]
    fn test_contract_versioning_idempotent() {
        let mut plan = Item::new("PLAN-001", ItemKind::Plan, "p");
        plan.contract = "v1".into();
        assert!(plan.append_contract_version_if_changed(Actor::Ai, "create"));
        assert!(!plan.append_contract_version_if_changed(Actor::Ai, "noop"));
        plan.contract_data.goal = "ship".into();
        assert!(plan.append_contract_version_if_changed(Actor::Ai, "edit"));
        assert_eq!(plan.contract_versions.len(), 2);
        assert_eq!(plan.contract_versions[1].version, 2);
    }

    #[test]
    fn test_status_enum_parsing() {
        assert_eq!(Status::parse(" done "), Some(Status::Done));
        assert_eq!(Status::parse("bogus"), None);
        assert_eq!(Priority::parse("high"), Some(Priority::High));
        assert_eq!(Priority::parse(""), None);
    }
}
