//! The step tree: Steps, embedded PlanNodes, and TaskNodes.
//!
//! A Task owns an ordered list of [`Step`]s. Each step may embed a
//! [`PlanNode`] whose [`TaskNode`]s own their own step lists, giving the
//! plan → tasks → steps recursion. All tree walks are iterative (explicit
//! stack) so deeply nested trees stay cheap; path resolution follows parsed
//! [`StepPath`] segments instead of re-walking strings.
//!
//! Completion is gated by checkpoints. `criteria` is always explicit;
//! `tests` is the only checkpoint that can be auto-confirmed (when the tests
//! list was empty at creation); `security`/`perf`/`docs` are opt-in via
//! `required_checkpoints`.

use crate::core::evidence::{Attachment, VerificationCheck};
use crate::core::ident::{Seg, StepPath};
use crate::core::time::now_iso;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use ulid::Ulid;

/// A completion gate on a step, task node, or item root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Checkpoint {
    Criteria,
    Tests,
    Security,
    Perf,
    Docs,
}

impl Checkpoint {
    pub const ALL: [Checkpoint; 5] = [
        Checkpoint::Criteria,
        Checkpoint::Tests,
        Checkpoint::Security,
        Checkpoint::Perf,
        Checkpoint::Docs,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Checkpoint::Criteria => "criteria",
            Checkpoint::Tests => "tests",
            Checkpoint::Security => "security",
            Checkpoint::Perf => "perf",
            Checkpoint::Docs => "docs",
        }
    }

    pub fn parse(raw: &str) -> Option<Checkpoint> {
        match raw.trim().to_lowercase().as_str() {
            "criteria" => Some(Checkpoint::Criteria),
            "tests" => Some(Checkpoint::Tests),
            "security" => Some(Checkpoint::Security),
            "perf" => Some(Checkpoint::Perf),
            "docs" => Some(Checkpoint::Docs),
            _ => None,
        }
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Confirmed/auto state plus notes and evidence digests for one checkpoint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CheckpointState {
    #[serde(default)]
    pub confirmed: bool,
    #[serde(default)]
    pub auto_confirmed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence_refs: Vec<String>,
}

impl CheckpointState {
    fn snapshot(&self) -> Value {
        json!({
            "confirmed": self.confirmed,
            "auto_confirmed": self.auto_confirmed,
            "notes_count": self.notes.len(),
            "evidence_refs_count": self.evidence_refs.len(),
        })
    }
}

/// The five checkpoint slots carried by every gated node.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Checkpoints {
    #[serde(default)]
    pub criteria: CheckpointState,
    #[serde(default)]
    pub tests: CheckpointState,
    #[serde(default)]
    pub security: CheckpointState,
    #[serde(default)]
    pub perf: CheckpointState,
    #[serde(default)]
    pub docs: CheckpointState,
}

impl Checkpoints {
    pub fn state(&self, kind: Checkpoint) -> &CheckpointState {
        match kind {
            Checkpoint::Criteria => &self.criteria,
            Checkpoint::Tests => &self.tests,
            Checkpoint::Security => &self.security,
            Checkpoint::Perf => &self.perf,
            Checkpoint::Docs => &self.docs,
        }
    }

    pub fn state_mut(&mut self, kind: Checkpoint) -> &mut CheckpointState {
        match kind {
            Checkpoint::Criteria => &mut self.criteria,
            Checkpoint::Tests => &mut self.tests,
            Checkpoint::Security => &mut self.security,
            Checkpoint::Perf => &mut self.perf,
            Checkpoint::Docs => &mut self.docs,
        }
    }

    /// A checkpoint is satisfied when explicitly confirmed, or (tests only)
    /// auto-confirmed because the tests list was empty at creation.
    pub fn satisfied(&self, kind: Checkpoint) -> bool {
        let state = self.state(kind);
        match kind {
            Checkpoint::Tests => state.confirmed || state.auto_confirmed,
            _ => state.confirmed,
        }
    }

    pub fn any_confirmed(&self) -> bool {
        Checkpoint::ALL.iter().any(|c| self.state(*c).confirmed)
    }

    pub fn any_notes(&self) -> bool {
        Checkpoint::ALL.iter().any(|c| !self.state(*c).notes.is_empty())
    }

    /// Compact before/after snapshot used in mutation responses.
    pub fn snapshot(&self) -> Value {
        json!({
            "criteria": self.criteria.snapshot(),
            "tests": self.tests.snapshot(),
            "security": self.security.snapshot(),
            "perf": self.perf.snapshot(),
            "docs": self.docs.snapshot(),
        })
    }
}

fn new_node_id(prefix: &str) -> String {
    let tail: String = Ulid::new().to_string().chars().rev().take(8).collect();
    format!("{}-{}", prefix, tail.to_uppercase())
}

pub fn new_step_id() -> String {
    new_node_id("STEP")
}

pub fn new_task_node_id() -> String {
    new_node_id("NODE")
}

/// An ordered element of a Task's step tree.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Step {
    #[serde(default)]
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub success_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blockers: Vec<String>,
    #[serde(default)]
    pub checkpoints: Checkpoints,
    /// Per-step gating policy; empty means the default `[criteria, tests]`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_checkpoints: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub verification_checks: Vec<VerificationCheck>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub verification_outcome: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub progress_notes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub block_reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanNode>,
}

impl Step {
    /// Create a step. Criteria are required; tests are optional and
    /// auto-confirm the tests checkpoint when empty. Returns `None` when no
    /// criteria survive normalization.
    pub fn new(
        title: &str,
        criteria: &[String],
        tests: &[String],
        blockers: &[String],
    ) -> Option<Step> {
        let criteria = normalize_list(criteria);
        if criteria.is_empty() {
            return None;
        }
        let tests = normalize_list(tests);
        let blockers = normalize_list(blockers);
        let mut checkpoints = Checkpoints::default();
        checkpoints.tests.auto_confirmed = tests.is_empty();
        Some(Step {
            id: new_step_id(),
            title: title.trim().to_string(),
            completed: false,
            success_criteria: criteria,
            tests,
            blockers,
            checkpoints,
            created_at: Some(now_iso()),
            ..Step::default()
        })
    }

    /// Effective gating policy: the per-step list deduplicated, or the
    /// default `[criteria, tests]` when empty. Unknown names are kept out.
    pub fn effective_required_checkpoints(&self) -> Vec<Checkpoint> {
        let mut out = Vec::new();
        for raw in &self.required_checkpoints {
            if let Some(ck) = Checkpoint::parse(raw) {
                if !out.contains(&ck) {
                    out.push(ck);
                }
            }
        }
        if out.is_empty() {
            out = vec![Checkpoint::Criteria, Checkpoint::Tests];
        }
        out
    }

    /// Ready iff not blocked, all required checkpoints are satisfied, and
    /// every embedded task node is done.
    pub fn ready_for_completion(&self) -> bool {
        if self.blocked {
            return false;
        }
        for ck in self.effective_required_checkpoints() {
            if !self.checkpoints.satisfied(ck) {
                return false;
            }
        }
        if let Some(plan) = &self.plan {
            if !plan.tasks.is_empty() && !plan.tasks.iter().all(TaskNode::is_done) {
                return false;
            }
        }
        true
    }

    /// Stable gating-reason tokens for completion failures.
    pub fn needs_for_completion(&self) -> Vec<String> {
        let mut needs = Vec::new();
        if self.blocked {
            needs.push("blocked".to_string());
        }
        for ck in self.effective_required_checkpoints() {
            if !self.checkpoints.satisfied(ck) {
                needs.push(ck.name().to_string());
            }
        }
        if let Some(plan) = &self.plan {
            if !plan.tasks.is_empty() && !plan.tasks.iter().all(TaskNode::is_done) {
                needs.push("plan_tasks".to_string());
            }
        }
        needs
    }

    /// Derived display status: completed > blocked > in_progress > pending.
    pub fn computed_status(&self) -> &'static str {
        if self.completed {
            return "completed";
        }
        if self.blocked {
            return "blocked";
        }
        if !self.progress_notes.is_empty()
            || self.started_at.is_some()
            || self.checkpoints.any_confirmed()
            || self.checkpoints.any_notes()
        {
            return "in_progress";
        }
        "pending"
    }

    /// Embedded plan, created on demand.
    pub fn plan_mut(&mut self) -> &mut PlanNode {
        self.plan.get_or_insert_with(PlanNode::default)
    }

    pub fn task_nodes(&self) -> &[TaskNode] {
        self.plan.as_ref().map(|p| p.tasks.as_slice()).unwrap_or(&[])
    }
}

/// An embedded plan inside a Step: a checklist plus nested task nodes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanNode {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub doc: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<String>,
    #[serde(default)]
    pub current: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tasks: Vec<TaskNode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub success_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blockers: Vec<String>,
    #[serde(default)]
    pub checkpoints: Checkpoints,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

/// A task embedded in a step's plan: same gating surface as an Item task,
/// minus persistence fields.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskNode {
    #[serde(default)]
    pub id: String,
    pub title: String,
    #[serde(default = "default_node_status")]
    pub status: String,
    #[serde(default = "default_node_priority")]
    pub priority: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub context: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub success_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<String>,
    #[serde(default)]
    pub checkpoints: Checkpoints,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next_steps: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub problems: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub risks: Vec<String>,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blockers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub status_manual: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

fn default_node_status() -> String {
    "TODO".to_string()
}

fn default_node_priority() -> String {
    "MEDIUM".to_string()
}

impl TaskNode {
    pub fn new(title: &str) -> TaskNode {
        let mut node = TaskNode {
            id: new_task_node_id(),
            title: title.trim().to_string(),
            status: default_node_status(),
            priority: default_node_priority(),
            ..TaskNode::default()
        };
        node.checkpoints.tests.auto_confirmed = true;
        node
    }

    /// Percentage of completed steps across this node's recursive step tree.
    pub fn progress(&self) -> u32 {
        let (total, done) = count_step_tree(&self.steps);
        if total == 0 {
            return 0;
        }
        ((done as f64 / total as f64) * 100.0) as u32
    }

    /// Done iff not blocked and either manually DONE or at 100% progress.
    pub fn is_done(&self) -> bool {
        if self.blocked {
            return false;
        }
        if self.status_manual {
            return self.status.trim().eq_ignore_ascii_case("DONE");
        }
        self.progress() == 100
    }
}

fn normalize_list(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

/// Count (total, completed) over the recursive step tree. Iterative pre-order.
pub fn count_step_tree(steps: &[Step]) -> (usize, usize) {
    let mut total = 0;
    let mut done = 0;
    let mut stack: Vec<&[Step]> = vec![steps];
    let mut cursor: Vec<usize> = vec![0];
    while let Some(&slice) = stack.last() {
        let idx = *cursor.last().unwrap();
        if idx >= slice.len() {
            stack.pop();
            cursor.pop();
            continue;
        }
        *cursor.last_mut().unwrap() += 1;
        let step = &slice[idx];
        total += 1;
        if step.completed {
            done += 1;
        }
        if let Some(plan) = &step.plan {
            for node in plan.tasks.iter().rev() {
                if !node.steps.is_empty() {
                    stack.push(&node.steps);
                    cursor.push(0);
                }
            }
        }
    }
    (total, done)
}

/// Flatten the full recursive tree into `(path, step)` pairs, pre-order.
pub fn flatten_steps(steps: &[Step]) -> Vec<(StepPath, &Step)> {
    struct Frame<'a> {
        steps: &'a [Step],
        idx: usize,
        prefix: Option<StepPath>,
    }
    let mut out = Vec::new();
    let mut stack = vec![Frame {
        steps,
        idx: 0,
        prefix: None,
    }];
    while !stack.is_empty() {
        let (slice, i, prefix) = {
            let frame = stack.last_mut().unwrap();
            if frame.idx >= frame.steps.len() {
                stack.pop();
                continue;
            }
            let i = frame.idx;
            frame.idx += 1;
            (frame.steps, i, frame.prefix.clone())
        };
        let step = &slice[i];
        let path = match &prefix {
            Some(prefix) => prefix.child_step(i),
            None => StepPath::root_step(i),
        };
        out.push((path.clone(), step));
        if let Some(plan) = &step.plan {
            // Reverse so the first task node's subtree pops first.
            for (t_idx, node) in plan.tasks.iter().enumerate().rev() {
                if !node.steps.is_empty() {
                    stack.push(Frame {
                        steps: &node.steps,
                        idx: 0,
                        prefix: Some(path.child_node(t_idx)),
                    });
                }
            }
        }
    }
    out
}

/// Resolve a step path to a shared step reference.
pub fn step_at<'a>(steps: &'a [Step], path: &StepPath) -> Option<&'a Step> {
    if !path.is_step_path() {
        return None;
    }
    let segs = path.segments();
    let mut current: &'a [Step] = steps;
    let mut i = 0;
    loop {
        let Seg::Step(s_idx) = segs[i] else {
            return None;
        };
        let step = current.get(s_idx)?;
        if i + 1 >= segs.len() {
            return Some(step);
        }
        let Seg::Node(t_idx) = segs[i + 1] else {
            return None;
        };
        let node = step.plan.as_ref()?.tasks.get(t_idx)?;
        current = &node.steps;
        i += 2;
    }
}

/// Resolve a step path to a mutable step reference.
pub fn step_at_mut<'a>(steps: &'a mut Vec<Step>, path: &StepPath) -> Option<&'a mut Step> {
    if !path.is_step_path() {
        return None;
    }
    let segs = path.segments().to_vec();
    let mut current: &'a mut Vec<Step> = steps;
    let mut i = 0;
    loop {
        let Seg::Step(s_idx) = segs[i] else {
            return None;
        };
        // Move the borrow down the tree instead of reborrowing.
        let owned: &'a mut Vec<Step> = current;
        let step = owned.get_mut(s_idx)?;
        if i + 1 >= segs.len() {
            return Some(step);
        }
        let Seg::Node(t_idx) = segs[i + 1] else {
            return None;
        };
        let node = step.plan.as_mut()?.tasks.get_mut(t_idx)?;
        current = &mut node.steps;
        i += 2;
    }
}

/// Resolve a node path to a shared task-node reference.
pub fn node_at<'a>(steps: &'a [Step], path: &StepPath) -> Option<&'a TaskNode> {
    if !path.is_node_path() {
        return None;
    }
    let segs = path.segments();
    let mut current: &'a [Step] = steps;
    let mut i = 0;
    loop {
        let Seg::Step(s_idx) = segs[i] else {
            return None;
        };
        let step = current.get(s_idx)?;
        let Seg::Node(t_idx) = segs[i + 1] else {
            return None;
        };
        let node = step.plan.as_ref()?.tasks.get(t_idx)?;
        if i + 2 >= segs.len() {
            return Some(node);
        }
        current = &node.steps;
        i += 2;
    }
}

/// Resolve a node path to a mutable task-node reference.
pub fn node_at_mut<'a>(steps: &'a mut Vec<Step>, path: &StepPath) -> Option<&'a mut TaskNode> {
    if !path.is_node_path() {
        return None;
    }
    let segs = path.segments().to_vec();
    let mut current: &'a mut Vec<Step> = steps;
    let mut i = 0;
    loop {
        let Seg::Step(s_idx) = segs[i] else {
            return None;
        };
        // Move the borrow down the tree instead of reborrowing.
        let owned: &'a mut Vec<Step> = current;
        let step = owned.get_mut(s_idx)?;
        let Seg::Node(t_idx) = segs[i + 1] else {
            return None;
        };
        let node = step.plan.as_mut()?.tasks.get_mut(t_idx)?;
        if i + 2 >= segs.len() {
            return Some(node);
        }
        current = &mut node.steps;
        i += 2;
    }
}

/// Find the path of a step by its stable id.
pub fn find_step_path_by_id(steps: &[Step], step_id: &str) -> Option<StepPath> {
    flatten_steps(steps)
        .into_iter()
        .find(|(_, st)| st.id == step_id)
        .map(|(path, _)| path)
}

/// Find the path of a task node by its stable id.
pub fn find_node_path_by_id(steps: &[Step], node_id: &str) -> Option<StepPath> {
    for (path, step) in flatten_steps(steps) {
        if let Some(plan) = &step.plan {
            for (t_idx, node) in plan.tasks.iter().enumerate() {
                if node.id == node_id {
                    return Some(path.child_node(t_idx));
                }
            }
        }
    }
    None
}

/// Ensure every step and task node across the tree carries a unique stable id.
/// Missing and duplicate ids are reassigned. Returns true when anything changed.
pub fn ensure_tree_ids(steps: &mut [Step]) -> bool {
    use rustc_hash::FxHashSet;
    let mut seen_steps: FxHashSet<String> = FxHashSet::default();
    let mut seen_nodes: FxHashSet<String> = FxHashSet::default();
    let mut changed = false;

    fn visit_step(
        step: &mut Step,
        seen_steps: &mut rustc_hash::FxHashSet<String>,
        seen_nodes: &mut rustc_hash::FxHashSet<String>,
        changed: &mut bool,
    ) {
        let id = step.id.trim().to_string();
        if id.is_empty() || seen_steps.contains(&id) {
            step.id = new_step_id();
            *changed = true;
        } else {
            step.id = id;
        }
        seen_steps.insert(step.id.clone());
        if let Some(plan) = &mut step.plan {
            for node in &mut plan.tasks {
                visit_node(node, seen_steps, seen_nodes, changed);
            }
        }
    }

    fn visit_node(
        node: &mut TaskNode,
        seen_steps: &mut rustc_hash::FxHashSet<String>,
        seen_nodes: &mut rustc_hash::FxHashSet<String>,
        changed: &mut bool,
    ) {
        let id = node.id.trim().to_string();
        if id.is_empty() || seen_nodes.contains(&id) {
            node.id = new_task_node_id();
            *changed = true;
        } else {
            node.id = id;
        }
        seen_nodes.insert(node.id.clone());
        for step in &mut node.steps {
            visit_step(step, seen_steps, seen_nodes, changed);
        }
    }

    for step in steps {
        visit_step(step, &mut seen_steps, &mut seen_nodes, &mut changed);
    }
    changed
}

/// Re-derive tests auto-confirmation after load: an empty tests list that was
/// never explicitly confirmed counts as auto-confirmed.
pub fn normalize_tree_checkpoints(steps: &mut [Step]) {
    let mut stack: Vec<&mut Step> = steps.iter_mut().collect();
    while let Some(step) = stack.pop() {
        // Split the borrow so nested step lists can outlive this frame.
        let Step {
            tests,
            checkpoints,
            plan,
            ..
        } = step;
        if tests.is_empty() && !checkpoints.tests.confirmed {
            checkpoints.tests.auto_confirmed = true;
        }
        if let Some(plan) = plan {
            if plan.tests.is_empty() && !plan.checkpoints.tests.confirmed {
                plan.checkpoints.tests.auto_confirmed = true;
            }
            for node in &mut plan.tasks {
                let TaskNode {
                    tests,
                    checkpoints,
                    steps,
                    ..
                } = node;
                if tests.is_empty() && !checkpoints.tests.confirmed {
                    checkpoints.tests.auto_confirmed = true;
                }
                stack.extend(steps.iter_mut());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(title: &str) -> Step {
        Step::new(title, &["crit".to_string()], &[], &[]).unwrap()
    }

    fn step_with_tests(title: &str) -> Step {
        Step::new(title, &["crit".to_string()], &["cargo test".to_string()], &[]).unwrap()
    }

    #[test]
    fn test_new_step_requires_criteria() {
        assert!(Step::new("t", &[], &[], &[]).is_none());
        assert!(Step::new("t", &["  ".to_string()], &[], &[]).is_none());
        assert!(Step::new("t", &["c".to_string()], &[], &[]).is_some());
    }

    #[test]
    fn test_tests_auto_confirmed_when_empty() {
        let st = step("no tests");
        assert!(st.checkpoints.tests.auto_confirmed);
        let st = step_with_tests("with tests");
        assert!(!st.checkpoints.tests.auto_confirmed);
    }

    #[test]
    fn test_readiness_default_gates() {
        let mut st = step_with_tests("s");
        assert!(!st.ready_for_completion());
        assert_eq!(st.needs_for_completion(), vec!["criteria", "tests"]);
        st.checkpoints.criteria.confirmed = true;
        st.checkpoints.tests.confirmed = true;
        assert!(st.ready_for_completion());
        st.blocked = true;
        assert!(!st.ready_for_completion());
        assert_eq!(st.needs_for_completion(), vec!["blocked"]);
    }

    #[test]
    fn test_readiness_extended_checkpoints() {
        let mut st = step("s");
        st.checkpoints.criteria.confirmed = true;
        st.required_checkpoints = vec!["criteria".into(), "security".into(), "SECURITY".into()];
        assert!(!st.ready_for_completion());
        assert_eq!(st.needs_for_completion(), vec!["security"]);
        st.checkpoints.security.confirmed = true;
        assert!(st.ready_for_completion());
    }

    #[test]
    fn test_readiness_gates_on_embedded_tasks() {
        let mut st = step("s");
        st.checkpoints.criteria.confirmed = true;
        let mut node = TaskNode::new("child");
        node.steps.push(step("inner"));
        st.plan_mut().tasks.push(node);
        assert!(!st.ready_for_completion());
        assert!(st.needs_for_completion().contains(&"plan_tasks".to_string()));
        st.plan.as_mut().unwrap().tasks[0].steps[0].completed = true;
        assert!(st.ready_for_completion());
    }

    #[test]
    fn test_task_node_done_manual_vs_progress() {
        let mut node = TaskNode::new("n");
        node.steps.push(step("a"));
        assert!(!node.is_done());
        node.steps[0].completed = true;
        assert!(node.is_done());
        node.status_manual = true;
        node.status = "ACTIVE".into();
        assert!(!node.is_done());
        node.status = "DONE".into();
        assert!(node.is_done());
        node.blocked = true;
        assert!(!node.is_done());
    }

    #[test]
    fn test_flatten_and_count_recursive() {
        let mut root = step("root");
        let mut node = TaskNode::new("n");
        node.steps.push(step("inner-0"));
        node.steps.push(step("inner-1"));
        root.plan_mut().tasks.push(node);
        let steps = vec![root, step("second")];
        let flat = flatten_steps(&steps);
        let paths: Vec<String> = flat.iter().map(|(p, _)| p.to_string()).collect();
        assert_eq!(paths, vec!["s:0", "s:0.t:0.s:0", "s:0.t:0.s:1", "s:1"]);
        assert_eq!(count_step_tree(&steps), (4, 0));
    }

    #[test]
    fn test_path_resolution_step_and_node() {
        let mut root = step("root");
        let mut node = TaskNode::new("n");
        node.steps.push(step("inner"));
        root.plan_mut().tasks.push(node);
        let mut steps = vec![root];

        let path = StepPath::parse("s:0.t:0.s:0").unwrap();
        assert_eq!(step_at(&steps, &path).unwrap().title, "inner");
        step_at_mut(&mut steps, &path).unwrap().completed = true;
        assert!(steps[0].plan.as_ref().unwrap().tasks[0].steps[0].completed);

        let node_path = StepPath::parse("s:0.t:0").unwrap();
        assert_eq!(node_at(&steps, &node_path).unwrap().title, "n");
        assert!(step_at(&steps, &node_path).is_none());
        assert!(node_at(&steps, &StepPath::parse("s:0.t:5").unwrap()).is_none());
    }

    #[test]
    fn test_find_by_id() {
        let mut root = step("root");
        let mut node = TaskNode::new("n");
        node.steps.push(step("inner"));
        root.plan_mut().tasks.push(node);
        let steps = vec![root];
        let inner_id = steps[0].plan.as_ref().unwrap().tasks[0].steps[0].id.clone();
        let node_id = steps[0].plan.as_ref().unwrap().tasks[0].id.clone();
        assert_eq!(
            find_step_path_by_id(&steps, &inner_id).unwrap().to_string(),
            "s:0.t:0.s:0"
        );
        assert_eq!(
            find_node_path_by_id(&steps, &node_id).unwrap().to_string(),
            "s:0.t:0"
        );
        assert!(find_step_path_by_id(&steps, "STEP-NOPE").is_none());
    }

    #[test]
    fn test_ensure_tree_ids_fixes_missing_and_duplicates() {
        let mut a = step("a");
        let mut b = step("b");
        a.id = String::new();
        b.id = "STEP-DUP".into();
        let mut c = step("c");
        c.id = "STEP-DUP".into();
        let mut steps = vec![a, b, c];
        assert!(ensure_tree_ids(&mut steps));
        assert!(!steps[0].id.is_empty());
        assert_ne!(steps[1].id, steps[2].id);
        // Second pass is a no-op.
        assert!(!ensure_tree_ids(&mut steps));
    }
}
