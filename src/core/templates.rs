//! Deterministic scaffolding templates for plans and tasks.
//!
//! Fast, disciplined setup for the common work shapes. No magic: callers pass
//! an explicit template id + kind + title, and scaffold defaults to dry-run.

use crate::core::item::{ContractData, Item, ItemKind, Priority};
use crate::core::step::{Step, flatten_steps};
use serde_json::{Value, json};

#[derive(Debug, Clone)]
pub struct TemplateStep {
    pub title: &'static str,
    pub success_criteria: &'static [&'static str],
    pub tests: &'static [&'static str],
    pub blockers: &'static [&'static str],
}

#[derive(Debug, Clone)]
pub struct TemplateTask {
    pub goal: &'static str,
    pub success_criteria: &'static [&'static str],
    pub tests: &'static [&'static str],
    pub steps: &'static [TemplateStep],
}

#[derive(Debug, Clone)]
pub struct TemplatePlan {
    pub goal: &'static str,
    pub plan_doc: &'static str,
    pub plan_steps: &'static [&'static str],
}

#[derive(Debug, Clone)]
pub struct Template {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub plan: Option<TemplatePlan>,
    pub task: Option<TemplateTask>,
}

impl Template {
    pub fn supports(&self) -> Vec<&'static str> {
        let mut kinds = Vec::new();
        if self.plan.is_some() {
            kinds.push("plan");
        }
        if self.task.is_some() {
            kinds.push("task");
        }
        kinds
    }

    pub fn to_value(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "description": self.description,
            "supports": self.supports(),
        })
    }
}

fn contract_skeleton(goal: &str) -> ContractData {
    ContractData {
        goal: goal.to_string(),
        checks: vec!["cargo test".to_string()],
        ..ContractData::default()
    }
}

fn templates() -> Vec<Template> {
    vec![
        Template {
            id: "feature",
            name: "Feature delivery",
            description: "Vertical slice feature: contract, implement, verify, handoff.",
            plan: Some(TemplatePlan {
                goal: "<feature goal>",
                plan_doc: "Keep this plan as a strategy doc (not a TODO list). Use tasks/steps for execution.",
                plan_steps: &["Contract", "Design", "Implement", "Verify", "Handoff"],
            }),
            task: Some(TemplateTask {
                goal: "<deliver feature safely>",
                success_criteria: &["All acceptance criteria met", "No regressions; CI green"],
                tests: &["cargo test"],
                steps: &[
                    TemplateStep {
                        title: "Clarify contract and acceptance",
                        success_criteria: &["Goal/constraints/non-goals/done/checks are explicit"],
                        tests: &["lint shows no errors"],
                        blockers: &["Missing requirements/questions answered"],
                    },
                    TemplateStep {
                        title: "Implement core behavior",
                        success_criteria: &["Behavior implemented end-to-end for the happy path"],
                        tests: &["cargo test <focus>"],
                        blockers: &["API/DB access", "Dependencies available"],
                    },
                    TemplateStep {
                        title: "Harden edge cases and invariants",
                        success_criteria: &["Edge cases covered; invariants enforced"],
                        tests: &["cargo test"],
                        blockers: &["Unknown edge cases enumerated"],
                    },
                    TemplateStep {
                        title: "Verify and handoff",
                        success_criteria: &["Checks passed; docs/notes updated"],
                        tests: &["cargo test"],
                        blockers: &["Release checklist agreed"],
                    },
                ],
            }),
        },
        Template {
            id: "bugfix",
            name: "Bugfix",
            description: "Bugfix: reproduce, root cause, fix, regression guard.",
            plan: Some(TemplatePlan {
                goal: "<fix bug without regressions>",
                plan_doc: "Record reproduction and evidence in steps. Keep the contract tight and test-driven.",
                plan_steps: &["Reproduce", "Root cause", "Fix", "Guard", "Verify"],
            }),
            task: Some(TemplateTask {
                goal: "<fix bug>",
                success_criteria: &["Bug reproduced and fixed", "Regression test added", "CI green"],
                tests: &["cargo test"],
                steps: &[
                    TemplateStep {
                        title: "Reproduce and narrow the failing case",
                        success_criteria: &["Minimal reproduction exists", "Expected/actual documented"],
                        tests: &["cargo test <failing_test>"],
                        blockers: &["Access to logs/env"],
                    },
                    TemplateStep {
                        title: "Identify the root cause",
                        success_criteria: &["Root cause isolated; fix approach chosen"],
                        tests: &["lint shows no errors"],
                        blockers: &["Missing context/data"],
                    },
                    TemplateStep {
                        title: "Implement fix plus a regression test",
                        success_criteria: &["Fix implemented and covered by a test"],
                        tests: &["cargo test <new_test>"],
                        blockers: &["Flaky repro stabilized"],
                    },
                    TemplateStep {
                        title: "Run the full verification suite",
                        success_criteria: &["Full suite green"],
                        tests: &["cargo test"],
                        blockers: &["CI parity checked"],
                    },
                ],
            }),
        },
        Template {
            id: "refactor",
            name: "Refactor",
            description: "Behavior-preserving refactor: baseline, refactor, harden, verify.",
            plan: Some(TemplatePlan {
                goal: "<simplify architecture safely>",
                plan_doc: "Stage refactors: tests/observability baseline first, then the refactor, then hardening.",
                plan_steps: &["Baseline", "Refactor", "Harden", "Verify", "Handoff"],
            }),
            task: Some(TemplateTask {
                goal: "<refactor safely>",
                success_criteria: &["Behavior preserved", "Complexity reduced", "CI green"],
                tests: &["cargo test"],
                steps: &[
                    TemplateStep {
                        title: "Establish baseline and safety net",
                        success_criteria: &["Relevant tests identified; coverage gap noted"],
                        tests: &["cargo test <area>"],
                        blockers: &["Missing tests"],
                    },
                    TemplateStep {
                        title: "Refactor while preserving behavior",
                        success_criteria: &["Architecture simplified without changing behavior"],
                        tests: &["cargo test <area>"],
                        blockers: &["Implicit coupling identified"],
                    },
                    TemplateStep {
                        title: "Harden edge cases and verify",
                        success_criteria: &["Edge cases and docs updated"],
                        tests: &["cargo test"],
                        blockers: &["Performance/security considerations reviewed"],
                    },
                ],
            }),
        },
        Template {
            id: "migration",
            name: "Migration",
            description: "Migration: inventory, plan, implement, validate, rollout.",
            plan: Some(TemplatePlan {
                goal: "<migrate safely>",
                plan_doc: "Write the migration strategy here: scope, phases, rollback, data safety, verification.",
                plan_steps: &["Inventory", "Plan", "Implement", "Validate", "Rollout"],
            }),
            task: Some(TemplateTask {
                goal: "<perform migration safely>",
                success_criteria: &["Migration completed safely", "Rollback path defined", "CI green"],
                tests: &["cargo test"],
                steps: &[
                    TemplateStep {
                        title: "Inventory and define the migration contract",
                        success_criteria: &["Scope/risks/rollback/checks explicit in contract_data"],
                        tests: &["lint shows no errors"],
                        blockers: &["Access to data/schema/env"],
                    },
                    TemplateStep {
                        title: "Implement the migration with safe guards",
                        success_criteria: &["Migration implemented with idempotency where applicable"],
                        tests: &["cargo test <area>"],
                        blockers: &["Deployment constraints"],
                    },
                    TemplateStep {
                        title: "Validate on realistic data",
                        success_criteria: &["Validation evidence recorded; integrity checked"],
                        tests: &["cargo test"],
                        blockers: &["Test dataset or staging access"],
                    },
                    TemplateStep {
                        title: "Rollout and handoff to operations",
                        success_criteria: &["Rollout steps documented; monitoring checked"],
                        tests: &["cargo test"],
                        blockers: &["Release checklist agreed"],
                    },
                ],
            }),
        },
    ]
}

pub fn list_templates() -> Vec<Template> {
    let mut all = templates();
    all.sort_by(|a, b| a.id.cmp(b.id));
    all
}

pub fn get_template(template_id: &str) -> Option<Template> {
    let tid = template_id.trim().to_lowercase();
    templates().into_iter().find(|t| t.id == tid)
}

fn owned(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Instantiate a plan item from a template.
pub fn build_plan_from_template(
    template: &Template,
    id: &str,
    title: &str,
    priority: Priority,
) -> Option<Item> {
    let plan_tpl = template.plan.as_ref()?;
    let mut plan = Item::new(id, ItemKind::Plan, title);
    plan.priority = priority;
    plan.contract_data = contract_skeleton(plan_tpl.goal);
    plan.plan_doc = plan_tpl.plan_doc.to_string();
    plan.plan_steps = owned(plan_tpl.plan_steps);
    plan.plan_current = 0;
    Some(plan)
}

/// Instantiate a task item (with its step tree) from a template.
pub fn build_task_from_template(
    template: &Template,
    id: &str,
    title: &str,
    parent: &str,
    priority: Priority,
) -> Option<Item> {
    let task_tpl = template.task.as_ref()?;
    let mut task = Item::new(id, ItemKind::Task, title);
    task.priority = priority;
    task.parent = Some(parent.to_string());
    task.contract_data = contract_skeleton(task_tpl.goal);
    task.success_criteria = owned(task_tpl.success_criteria);
    task.tests = owned(task_tpl.tests);
    task.checkpoints.tests.auto_confirmed = task.tests.is_empty();
    for st in task_tpl.steps {
        let step = Step::new(
            st.title,
            &owned(st.success_criteria),
            &owned(st.tests),
            &owned(st.blockers),
        )?;
        task.steps.push(step);
    }
    task.update_status_from_progress();
    Some(task)
}

/// Replace volatile node ids with deterministic preview ids (dry-run only).
pub fn apply_preview_ids(item: &mut Item) {
    if !item.is_task() {
        return;
    }
    let paths: Vec<String> = flatten_steps(&item.steps)
        .iter()
        .map(|(p, _)| p.to_string())
        .collect();
    for (idx, raw) in paths.iter().enumerate() {
        let path = crate::core::ident::StepPath::parse(raw).expect("flatten yields valid paths");
        if let Some(step) = crate::core::step::step_at_mut(&mut item.steps, &path) {
            step.id = format!("STEP-PREVIEW-{}", idx);
            if let Some(plan) = &mut step.plan {
                for (t_idx, node) in plan.tasks.iter_mut().enumerate() {
                    node.id = format!("NODE-PREVIEW-{}-{}", idx, t_idx);
                }
            }
        }
    }
}
