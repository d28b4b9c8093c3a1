//! Read-only lint for Plans and Tasks.
//!
//! Lint is the preflight discipline check: it reports errors that block
//! completion (missing root success criteria, broken dependencies) and
//! warnings that erode the contract/checkpoint/evidence loop. It never
//! mutates storage; `complete` and `close_task` consume its report.

use crate::core::deps::{build_dependency_graph, validate_dependencies};
use crate::core::ident::id_error;
use crate::core::item::{Item, ItemKind, Status};
use crate::core::step::{TaskNode, flatten_steps};
use rustc_hash::FxHashSet;
use serde_json::{Value, json};

pub const SEVERITY_ERROR: &str = "error";
pub const SEVERITY_WARNING: &str = "warning";

/// Phrases that signal a step title bundles several actions.
const ATOMIC_VIOLATORS: [&str; 3] = [" and then ", " then ", ", and "];

const MIN_STEP_TITLE_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq)]
pub struct LintIssue {
    pub code: String,
    pub severity: String,
    pub message: String,
    pub target: Value,
    pub details: Value,
}

impl LintIssue {
    fn new(code: &str, severity: &str, message: &str, target: Value) -> LintIssue {
        LintIssue {
            code: code.to_string(),
            severity: severity.to_string(),
            message: message.to_string(),
            target,
            details: json!({}),
        }
    }

    fn with_details(mut self, details: Value) -> LintIssue {
        self.details = details;
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == SEVERITY_ERROR
    }

    pub fn to_value(&self) -> Value {
        json!({
            "code": self.code,
            "severity": self.severity,
            "message": self.message,
            "target": self.target,
            "details": self.details,
        })
    }
}

#[derive(Debug, Clone)]
pub struct LintReport {
    pub item_id: String,
    pub kind: ItemKind,
    pub revision: u64,
    pub issues: Vec<LintIssue>,
}

impl LintReport {
    pub fn errors(&self) -> Vec<&LintIssue> {
        self.issues.iter().filter(|i| i.is_error()).collect()
    }

    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(|i| i.is_error())
    }

    pub fn to_value(&self) -> Value {
        let errors = self.issues.iter().filter(|i| i.is_error()).count();
        let warnings = self.issues.len() - errors;
        json!({
            "item_id": self.item_id,
            "kind": self.kind.name(),
            "revision": self.revision,
            "summary": {"errors": errors, "warnings": warnings, "total": self.issues.len()},
            "issues": self.issues.iter().map(|i| i.to_value()).collect::<Vec<_>>(),
        })
    }
}

fn item_target() -> Value {
    json!({"kind": "task_detail"})
}

fn looks_like_checklist(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("- [")
        || trimmed.starts_with("* [")
        || trimmed.starts_with("[x]")
        || trimmed.starts_with("[ ]")
}

/// Signals that `plan_doc` mixes artifacts that belong elsewhere.
fn plan_doc_overlap_reasons(doc: &str) -> Vec<String> {
    let mut reasons = Vec::new();
    let checklist_lines = doc.lines().filter(|l| looks_like_checklist(l)).count();
    if checklist_lines >= 3 {
        reasons.push(format!("{} checklist lines in plan_doc", checklist_lines));
    }
    if doc.contains("STEP-") || doc.contains("s:0") {
        reasons.push("plan_doc references step ids/paths".to_string());
    }
    reasons
}

/// Signals that `plan_steps` holds a checklist instead of route phases.
fn plan_steps_overlap_reasons(steps: &[String]) -> Vec<String> {
    let mut reasons = Vec::new();
    if steps.iter().any(|s| looks_like_checklist(s)) {
        reasons.push("plan_steps contains checkbox syntax".to_string());
    }
    if steps.iter().any(|s| s.contains("STEP-") || s.contains("s:")) {
        reasons.push("plan_steps references step ids/paths".to_string());
    }
    reasons
}

fn lint_plan(item: &Item) -> Vec<LintIssue> {
    let mut issues = Vec::new();

    if item.plan_steps.is_empty() {
        issues.push(LintIssue::new(
            "PLAN_STEPS_EMPTY",
            SEVERITY_WARNING,
            "Plan has no checklist steps (plan_steps is empty).",
            item_target(),
        ));
    }
    if !item.plan_steps.is_empty() && item.plan_current > item.plan_steps.len() {
        issues.push(
            LintIssue::new(
                "PLAN_CURRENT_OUT_OF_RANGE",
                SEVERITY_ERROR,
                &format!(
                    "plan_current out of range: current={}, total={}.",
                    item.plan_current,
                    item.plan_steps.len()
                ),
                item_target(),
            )
            .with_details(json!({"current": item.plan_current, "total": item.plan_steps.len()})),
        );
    }

    let doc_reasons = plan_doc_overlap_reasons(&item.plan_doc);
    if !doc_reasons.is_empty() {
        issues.push(
            LintIssue::new(
                "PLAN_DOC_OVERLAP",
                SEVERITY_WARNING,
                "plan_doc looks like a mix of artifacts (contract/steps/checklist).",
                item_target(),
            )
            .with_details(json!({"reasons": doc_reasons})),
        );
    }
    let step_reasons = plan_steps_overlap_reasons(&item.plan_steps);
    if !step_reasons.is_empty() {
        issues.push(
            LintIssue::new(
                "PLAN_STEPS_OVERLAP",
                SEVERITY_WARNING,
                "plan_steps look like a checklist or pasted step ids; keep them as phases.",
                item_target(),
            )
            .with_details(json!({"reasons": step_reasons})),
        );
    }

    if item.contract_data.goal.trim().is_empty() && item.contract.trim().is_empty() {
        issues.push(LintIssue::new(
            "CONTRACT_GOAL_MISSING",
            SEVERITY_WARNING,
            "No goal set (contract_data.goal) and contract is empty.",
            item_target(),
        ));
    }
    if item.contract_data.done.is_empty() {
        issues.push(LintIssue::new(
            "DONE_CRITERIA_MISSING",
            SEVERITY_WARNING,
            "No done criteria set (contract_data.done).",
            item_target(),
        ));
    }
    if item.contract_data.checks.is_empty() {
        issues.push(LintIssue::new(
            "CHECKS_MISSING",
            SEVERITY_WARNING,
            "No checks set (contract_data.checks): how-to-verify will be incomplete.",
            item_target(),
        ));
    }
    issues
}

fn is_done_task(item: &Item) -> bool {
    item.status == Status::Done || (item.progress() == 100 && !item.blocked)
}

/// Validate `depends_on` against the full loaded graph. On success, details
/// carry the unresolved (not-yet-done) dependencies.
pub fn validate_depends_on(
    task_id: &str,
    depends_on: &[String],
    all_items: &[Item],
) -> (Option<String>, Value) {
    let deps: Vec<String> = depends_on
        .iter()
        .map(|d| d.trim().to_uppercase())
        .filter(|d| !d.is_empty())
        .collect();
    if deps.is_empty() {
        return (None, json!({}));
    }
    for dep in &deps {
        if id_error(dep).is_some() {
            return (
                Some("INVALID_DEPENDENCY_ID".to_string()),
                json!({"got": dep}),
            );
        }
    }

    let tasks: Vec<&Item> = all_items.iter().filter(|i| i.is_task()).collect();
    let existing: FxHashSet<String> = tasks.iter().map(|t| t.id.clone()).collect();
    let graph = build_dependency_graph(
        &tasks
            .iter()
            .filter(|t| t.id != task_id)
            .map(|t| (t.id.clone(), t.depends_on.clone()))
            .collect::<Vec<_>>(),
    );
    let (errors, cycle) = validate_dependencies(task_id, &deps, &existing, &graph);
    if !errors.is_empty() {
        let rendered: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return (
            Some("INVALID_DEPENDENCIES".to_string()),
            json!({"errors": rendered}),
        );
    }
    if let Some(cycle) = cycle {
        return (Some("CIRCULAR_DEPENDENCY".to_string()), json!({"cycle": cycle}));
    }

    let mut unresolved = Vec::new();
    let mut statuses = serde_json::Map::new();
    for dep in &deps {
        let item = tasks.iter().find(|t| &t.id == dep);
        match item {
            Some(item) => {
                statuses.insert(dep.clone(), json!(item.status.name()));
                if !is_done_task(item) {
                    unresolved.push(dep.clone());
                }
            }
            None => unresolved.push(dep.clone()),
        }
    }
    let mut details = serde_json::Map::new();
    if !unresolved.is_empty() {
        details.insert("unresolved_depends_on".into(), json!(unresolved));
    }
    details.insert("depends_on_status".into(), Value::Object(statuses));
    (None, Value::Object(details))
}

fn lint_task_node(node: &TaskNode, target: Value, issues: &mut Vec<LintIssue>) {
    if node.title.trim().is_empty() {
        issues.push(LintIssue::new(
            "TASK_NODE_TITLE_MISSING",
            SEVERITY_ERROR,
            "Task node has no title.",
            target.clone(),
        ));
    }
    if node.success_criteria.is_empty() {
        issues.push(LintIssue::new(
            "TASK_NODE_SUCCESS_CRITERIA_MISSING",
            SEVERITY_WARNING,
            "Task node has no success_criteria.",
            target.clone(),
        ));
    }
    if node.tests.is_empty() {
        issues.push(LintIssue::new(
            "TASK_NODE_TESTS_MISSING",
            SEVERITY_WARNING,
            "Task node has no tests.",
            target,
        ));
    }
}

fn lint_task(item: &Item, all_items: &[Item]) -> Vec<LintIssue> {
    let mut issues = Vec::new();

    // The root definition of done blocks `complete` later.
    if item.success_criteria.is_empty() {
        issues.push(LintIssue::new(
            "TASK_SUCCESS_CRITERIA_MISSING",
            SEVERITY_ERROR,
            "Item has no root success_criteria; final completion will be blocked.",
            item_target(),
        ));
    }

    if !item.depends_on.is_empty() {
        let (code, details) = validate_depends_on(&item.id, &item.depends_on, all_items);
        if let Some(code) = code {
            issues.push(
                LintIssue::new(
                    &code,
                    SEVERITY_ERROR,
                    "depends_on is invalid (unknown tasks or a cycle).",
                    item_target(),
                )
                .with_details(details),
            );
        } else if let Some(blocking) = details.get("unresolved_depends_on") {
            issues.push(
                LintIssue::new(
                    "DEPENDS_ON_BLOCKING",
                    SEVERITY_WARNING,
                    "Unfinished dependencies (depends_on): the task is logically blocked.",
                    item_target(),
                )
                .with_details(json!({"unresolved_depends_on": blocking})),
            );
        }
    }

    for (path, step) in flatten_steps(&item.steps) {
        let target = json!({"kind": "step", "path": path.to_string(), "step_id": step.id});

        if step.success_criteria.is_empty() {
            issues.push(LintIssue::new(
                "STEP_SUCCESS_CRITERIA_MISSING",
                SEVERITY_ERROR,
                "Step has no success_criteria (criteria are mandatory).",
                target.clone(),
            ));
        }
        if step.tests.is_empty() && !step.checkpoints.tests.auto_confirmed {
            issues.push(LintIssue::new(
                "STEP_TESTS_INCONSISTENT",
                SEVERITY_WARNING,
                "Step has empty tests without tests auto-confirmation (inconsistent state).",
                target.clone(),
            ));
        }
        if step.tests.is_empty() {
            issues.push(LintIssue::new(
                "STEP_TESTS_MISSING",
                SEVERITY_WARNING,
                "Step has no tests (nothing states how to verify it).",
                target.clone(),
            ));
        }
        if step.blockers.is_empty() {
            issues.push(LintIssue::new(
                "STEP_BLOCKERS_MISSING",
                SEVERITY_WARNING,
                "Step has no blockers (dependencies/risks/waits).",
                target.clone(),
            ));
        }

        let title = step.title.trim();
        if title.len() < MIN_STEP_TITLE_LEN {
            issues.push(
                LintIssue::new(
                    "STEP_TITLE_TOO_SHORT",
                    SEVERITY_WARNING,
                    &format!("Step title is too short (aim for >= {} chars).", MIN_STEP_TITLE_LEN),
                    target.clone(),
                )
                .with_details(json!({"min_len": MIN_STEP_TITLE_LEN, "len": title.len()})),
            );
        }
        let lowered = title.to_lowercase();
        if ATOMIC_VIOLATORS.iter().any(|v| lowered.contains(v)) {
            issues.push(LintIssue::new(
                "STEP_NOT_ATOMIC",
                SEVERITY_WARNING,
                "Step looks non-atomic (sequence markers like 'then' in the title).",
                target.clone(),
            ));
        }

        // Open-checkpoint signals only once the step is in motion.
        if step.computed_status() != "pending" {
            if !step.checkpoints.criteria.confirmed {
                issues.push(LintIssue::new(
                    "CHECKPOINT_CRITERIA_OPEN",
                    SEVERITY_WARNING,
                    "The criteria checkpoint is not confirmed.",
                    target.clone(),
                ));
            }
            if !(step.checkpoints.tests.confirmed || step.checkpoints.tests.auto_confirmed) {
                issues.push(LintIssue::new(
                    "CHECKPOINT_TESTS_OPEN",
                    SEVERITY_WARNING,
                    "The tests checkpoint is not confirmed (and not auto).",
                    target.clone(),
                ));
            }
        }

        // Evidence signal: confirmed checkpoints without any recorded evidence.
        let ready = step.ready_for_completion() || step.completed;
        if ready {
            let has_evidence = !step.verification_outcome.trim().is_empty()
                || !step.verification_checks.is_empty()
                || !step.attachments.is_empty();
            if !has_evidence {
                issues.push(LintIssue::new(
                    "EVIDENCE_MISSING",
                    SEVERITY_WARNING,
                    "Checkpoints confirmed but no evidence recorded (outcome/checks/attachments).",
                    target.clone(),
                ));
            }
        }

        for (t_idx, node) in step.task_nodes().iter().enumerate() {
            let node_path = path.child_node(t_idx);
            let node_target = json!({
                "kind": "task_node",
                "path": node_path.to_string(),
                "task_node_id": node.id,
            });
            lint_task_node(node, node_target, &mut issues);
        }
    }

    issues
}

/// Lint one item against the full set of loaded items (for dependencies).
pub fn lint_item(item: &Item, all_items: &[Item]) -> LintReport {
    let mut issues = if item.is_plan() {
        lint_plan(item)
    } else {
        lint_task(item, all_items)
    };
    // Stable ordering: errors first, then code.
    issues.sort_by(|a, b| {
        let rank = |i: &LintIssue| if i.is_error() { 0 } else { 1 };
        rank(a).cmp(&rank(b)).then(a.code.cmp(&b.code))
    });
    LintReport {
        item_id: item.id.clone(),
        kind: item.kind,
        revision: item.revision,
        issues,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::step::Step;

    fn task(id: &str) -> Item {
        Item::new(id, ItemKind::Task, "Task title")
    }

    #[test]
    fn test_missing_root_criteria_is_error() {
        let item = task("TASK-001");
        let report = lint_item(&item, &[]);
        assert!(report.has_errors());
        assert!(report.issues.iter().any(|i| i.code == "TASK_SUCCESS_CRITERIA_MISSING"));
    }

    #[test]
    fn test_errors_sort_first() {
        let mut item = task("TASK-001");
        item.steps
            .push(Step::new("short", &["c".to_string()], &[], &[]).unwrap());
        let report = lint_item(&item, &[]);
        assert!(report.issues[0].is_error());
    }

    #[test]
    fn test_step_title_and_atomicity_warnings() {
        let mut item = task("TASK-001");
        item.success_criteria = vec!["done".into()];
        item.steps.push(
            Step::new(
                "Do the thing and then do the other thing",
                &["c".to_string()],
                &["t".to_string()],
                &["b".to_string()],
            )
            .unwrap(),
        );
        let report = lint_item(&item, &[]);
        assert!(report.issues.iter().any(|i| i.code == "STEP_NOT_ATOMIC"));
        assert!(!report.issues.iter().any(|i| i.code == "STEP_TITLE_TOO_SHORT"));
    }

    #[test]
    fn test_depends_on_cycle_is_error() {
        let mut a = task("TASK-001");
        a.success_criteria = vec!["done".into()];
        a.depends_on = vec!["TASK-002".into()];
        let mut b = task("TASK-002");
        b.depends_on = vec!["TASK-001".into()];
        let all = vec![a.clone(), b];
        let report = lint_item(&a, &all);
        assert!(report.issues.iter().any(|i| i.code == "CIRCULAR_DEPENDENCY"));
    }

    #[test]
    fn test_unresolved_depends_on_is_warning() {
        let mut a = task("TASK-001");
        a.success_criteria = vec!["done".into()];
        a.depends_on = vec!["TASK-002".into()];
        let b = task("TASK-002");
        let all = vec![a.clone(), b];
        let report = lint_item(&a, &all);
        assert!(!report.has_errors());
        assert!(report.issues.iter().any(|i| i.code == "DEPENDS_ON_BLOCKING"));
    }

    #[test]
    fn test_plan_current_out_of_range_error() {
        let mut plan = Item::new("PLAN-001", ItemKind::Plan, "p");
        plan.plan_steps = vec!["a".into()];
        plan.plan_current = 5;
        let report = lint_item(&plan, &[]);
        assert!(report.issues.iter().any(|i| i.code == "PLAN_CURRENT_OUT_OF_RANGE"));
    }

    #[test]
    fn test_evidence_missing_on_ready_step() {
        let mut item = task("TASK-001");
        item.success_criteria = vec!["done".into()];
        let mut step = Step::new(
            "A long enough step title here",
            &["c".to_string()],
            &[],
            &["b".to_string()],
        )
        .unwrap();
        step.checkpoints.criteria.confirmed = true;
        item.steps.push(step);
        let report = lint_item(&item, &[]);
        assert!(report.issues.iter().any(|i| i.code == "EVIDENCE_MISSING"));
    }
}
