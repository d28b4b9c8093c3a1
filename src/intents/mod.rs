//! The JSON intent dispatcher.
//!
//! `process_intent` is the single entry point: it validates the request
//! shape, applies the focus fallback and safe-write guards, runs the
//! optimistic-concurrency preflight, routes to the handler, and records
//! successful mutations in the ops stream (previews and audited reads go to
//! the audit stream). Handlers return errors as values; the dispatcher is the
//! only place that catches panics, wrapping them as `INTERNAL_ERROR`.

pub mod batch;
pub mod close;
pub mod context;
pub mod create;
pub mod history;
pub mod mutate;
pub mod patch;
pub mod radar;
pub mod response;
pub mod validate;
pub mod verify;
pub mod view;

use crate::core::error::Result;
use crate::core::focus::FocusStore;
use crate::core::history::OperationHistory;
use crate::core::item::{Item, ItemKind, Status};
use crate::core::repo::Repository;
use response::{AIResponse, Suggestion, codes, error_response};
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use validate::Payload;

/// Mutating intents that may fill their target from focus.
const FOCUSABLE_MUTATING_INTENTS: &[&str] = &[
    "edit",
    "patch",
    "complete",
    "delete",
    "close_task",
    "decompose",
    "task_add",
    "task_define",
    "task_delete",
    "define",
    "verify",
    "evidence_capture",
    "done",
    "close_step",
    "progress",
    "note",
    "block",
    "contract",
    "plan",
];

/// Intents that require a Task focus to resolve.
const TASK_ONLY_INTENTS: &[&str] = &[
    "decompose",
    "task_add",
    "task_define",
    "task_delete",
    "define",
    "verify",
    "evidence_capture",
    "done",
    "close_step",
    "close_task",
    "progress",
    "note",
    "block",
];

/// Intents that require a Plan focus (or a Task focus with a Plan parent).
const PLAN_ONLY_INTENTS: &[&str] = &["contract", "plan"];

/// Intents whose success is recorded in the ops stream.
const MUTATING_INTENTS: &[&str] = &[
    "create",
    "scaffold",
    "decompose",
    "task_add",
    "task_define",
    "task_delete",
    "define",
    "verify",
    "evidence_capture",
    "done",
    "close_step",
    "progress",
    "edit",
    "patch",
    "note",
    "block",
    "contract",
    "plan",
    "complete",
    "delete",
];

/// Mutating intents with an explicit target (revision preflight applies).
fn is_targeted_mutating(intent: &str) -> bool {
    (MUTATING_INTENTS.contains(&intent) && intent != "create" && intent != "scaffold")
        || intent == "close_task"
}

/// Create-like intents: no before snapshot; undo deletes the created file.
const CREATE_LIKE_INTENTS: &[&str] = &["create", "scaffold"];

const KNOWN_INTENTS: &[&str] = &[
    "context",
    "focus_get",
    "focus_set",
    "focus_clear",
    "radar",
    "handoff",
    "context_pack",
    "resume",
    "lint",
    "templates_list",
    "scaffold",
    "create",
    "decompose",
    "task_add",
    "task_define",
    "task_delete",
    "define",
    "verify",
    "evidence_capture",
    "done",
    "close_step",
    "close_task",
    "progress",
    "edit",
    "patch",
    "note",
    "block",
    "contract",
    "plan",
    "mirror",
    "complete",
    "delete",
    "batch",
    "undo",
    "redo",
    "history",
    "delta",
    "storage",
];

/// The engine facade handlers operate against: repository + focus + history.
pub struct Dispatcher {
    repo: Repository,
    focus: FocusStore,
    project_root: PathBuf,
}

impl Dispatcher {
    pub fn new(tasks_dir: &Path) -> Result<Dispatcher> {
        Self::with_project_root(tasks_dir, &std::env::current_dir().unwrap_or_default())
    }

    pub fn with_project_root(tasks_dir: &Path, project_root: &Path) -> Result<Dispatcher> {
        Ok(Dispatcher {
            repo: Repository::new(tasks_dir)?,
            focus: FocusStore::new(tasks_dir),
            project_root: project_root.to_path_buf(),
        })
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    pub fn focus(&self) -> &FocusStore {
        &self.focus
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn history(&self) -> Result<OperationHistory> {
        OperationHistory::open(self.repo.root())
    }

    pub fn load_item(&self, id: &str) -> Option<Item> {
        self.repo.load(id, "").ok().flatten()
    }

    pub fn list_all(&self) -> Vec<Item> {
        self.repo.list("").unwrap_or_default()
    }

    /// Suggestions for a missing/unresolvable target: inspect context, check
    /// focus, and up to three concrete focus_set candidates.
    pub fn missing_target_suggestions(&self, want: &[&str]) -> Vec<Suggestion> {
        let mut suggestions = vec![
            Suggestion::new(
                "context",
                "tasks_context",
                "List available plans/tasks and pick an id for explicit addressing.",
                "high",
            )
            .with_params(json!({"include_all": true, "compact": true})),
            Suggestion::new(
                "focus_get",
                "tasks_focus_get",
                "Show the current focus (.last); use it explicitly or update it via focus_set.",
                "normal",
            ),
        ];
        let candidates: Vec<Item> = self
            .list_all()
            .into_iter()
            .filter(|item| want.is_empty() || want.iter().any(|p| item.id.starts_with(p)))
            .take(3)
            .collect();
        for cand in candidates {
            suggestions.push(
                Suggestion::new(
                    "focus_set",
                    &cand.id,
                    "Set focus on an existing item to omit ids in later calls.",
                    "normal",
                )
                .with_params(json!({"task": cand.id, "domain": cand.domain})),
            );
        }
        suggestions
    }

    /// Suggestions for a bad step path: radar shows the active path, mirror
    /// shows the canonical tree.
    pub fn path_help_suggestions(&self, task_id: &str) -> Vec<Suggestion> {
        let tid = task_id.trim();
        if tid.is_empty() {
            return Vec::new();
        }
        vec![
            Suggestion::new(
                "radar",
                "tasks_radar",
                "Show Now/Why/Verify and the active step (to pick the right path/step_id).",
                "high",
            )
            .with_params(json!({"task": tid})),
            Suggestion::new(
                "mirror",
                "tasks_mirror",
                "Show the tree with canonical path/step_id values for precise addressing.",
                "normal",
            )
            .with_params(json!({"task": tid, "limit": 10})),
        ]
    }

    pub fn revision_mismatch_response(
        &self,
        intent: &str,
        task_id: &str,
        expected: u64,
        current: u64,
    ) -> AIResponse {
        let mut resp = error_response(
            intent,
            codes::REVISION_MISMATCH,
            &format!("revision mismatch: expected={}, current={}", expected, current),
        )
        .with_recovery(
            "State changed (optimistic concurrency): the revision does not match.\n\
             1) Fetch the current revision via resume(task=...) or radar(task=...).\n\
             2) Retry with expected_revision=<current_revision>.",
        )
        .with_result(json!({
            "task": task_id,
            "expected_revision": expected,
            "current_revision": current,
        }));
        if !task_id.is_empty() {
            resp.context.insert("task_id".into(), json!(task_id));
            let mut suggestions = vec![
                Suggestion::new(
                    "resume",
                    "tasks_resume",
                    "Fetch the current revision and state before retrying.",
                    "high",
                )
                .with_params(json!({"task": task_id})),
            ];
            suggestions.extend(self.path_help_suggestions(task_id));
            resp.suggestions = suggestions;
        }
        resp
    }

    /// Resolve and load the target item named by `task`/`plan` in the payload.
    /// Shared by most mutating handlers; emits the standard error envelopes.
    pub(crate) fn require_item(
        &self,
        intent: &str,
        data: &Payload,
        want: &[&str],
    ) -> std::result::Result<(String, Item), AIResponse> {
        let target = data.get("task").or_else(|| data.get("plan"));
        if target.is_none() {
            let code = if want.len() == 1 && want[0] == "PLAN-" { codes::MISSING_PLAN } else { codes::MISSING_TASK };
            return Err(error_response(intent, code, "task is required")
                .with_recovery(
                    "Pass task=TASK-###|PLAN-### explicitly, or set focus via focus_set and pass it along.",
                )
                .with_suggestions(self.missing_target_suggestions(want)));
        }
        let id = validate::validate_task_id(target).map_err(|msg| {
            let code = if want.len() == 1 && want[0] == "PLAN-" { codes::INVALID_PLAN } else { codes::INVALID_TASK };
            error_response(intent, code, &msg)
                .with_recovery("Check ids via context(include_all=true).")
                .with_suggestions(self.missing_target_suggestions(want))
        })?;
        let Some(item) = self.load_item(&id) else {
            let fallback: &[&str] = if id.starts_with("PLAN-") { &["PLAN-"] } else { &["TASK-"] };
            return Err(
                error_response(intent, codes::NOT_FOUND, &format!("Not found: {}", id))
                    .with_recovery("Check ids via context(include_all=true).")
                    .with_suggestions(self.missing_target_suggestions(fallback))
                    .with_result(json!({"task": id})),
            );
        };
        Ok((id, item))
    }

    /// Like [`Self::require_item`], but the target must be a Task.
    pub(crate) fn require_task(
        &self,
        intent: &str,
        data: &Payload,
    ) -> std::result::Result<(String, Item), AIResponse> {
        let (id, item) = self.require_item(intent, data, &["TASK-"])?;
        if !item.is_task() {
            return Err(error_response(
                intent,
                codes::NOT_A_TASK,
                &format!("{} applies to tasks (TASK-###)", intent),
            ));
        }
        Ok((id, item))
    }

    /// Like [`Self::require_item`], but the target must be a Plan.
    pub(crate) fn require_plan(
        &self,
        intent: &str,
        data: &Payload,
    ) -> std::result::Result<(String, Item), AIResponse> {
        let (id, item) = self.require_item(intent, data, &["PLAN-"])?;
        if !item.is_plan() {
            return Err(error_response(
                intent,
                codes::NOT_A_PLAN,
                &format!("{} applies to plans (PLAN-###)", intent),
            ));
        }
        Ok((id, item))
    }

    /// Persist an item and hand back the reloaded state.
    pub(crate) fn save_and_reload(
        &self,
        intent: &str,
        item: &mut Item,
    ) -> std::result::Result<Item, AIResponse> {
        self.repo
            .save(item)
            .map_err(|e| error_response(intent, codes::INTERNAL_ERROR, &e.to_string()))?;
        Ok(self
            .repo
            .load(&item.id, &item.domain)
            .ok()
            .flatten()
            .unwrap_or_else(|| item.clone()))
    }

    /// Count ACTIVE items (auto strict-writes trigger).
    fn active_item_count(&self) -> usize {
        self.list_all()
            .iter()
            .filter(|i| i.status == Status::Active)
            .count()
    }

    /// Fill a missing target id from focus, enforcing compatibility.
    /// Returns (payload, context additions, early error).
    fn apply_focus(
        &self,
        intent: &str,
        data: &Payload,
    ) -> (Payload, Map<String, Value>, Option<AIResponse>) {
        let mut payload = data.clone();
        if !FOCUSABLE_MUTATING_INTENTS.contains(&intent) {
            return (payload, Map::new(), None);
        }

        let has_explicit = payload.contains_key("task") || payload.contains_key("plan");
        if has_explicit {
            let mut ctx = Map::new();
            ctx.insert("target_resolution".into(), json!({"source": "explicit"}));
            return (payload, ctx, None);
        }

        let pointer = self.focus.get();
        let Some(pointer) = pointer else {
            let mut ctx = Map::new();
            ctx.insert(
                "target_resolution".into(),
                json!({"source": "missing", "focus": null}),
            );
            let err = error_response(
                intent,
                codes::MISSING_TARGET,
                "No target id given and no focus set",
            )
            .with_recovery(
                "Pass task=TASK-###|PLAN-### (or plan=PLAN-### for plan/contract) or set focus via focus_set.",
            )
            .with_suggestions(self.missing_target_suggestions(&["TASK-", "PLAN-"]));
            return (payload, ctx, Some(err));
        };

        let focus_id = pointer.task.clone();
        let focus_domain = pointer.domain.clone();
        let focus_item = self.load_item(&focus_id);
        let focus_kind = focus_item.as_ref().map(|i| i.kind);

        if PLAN_ONLY_INTENTS.contains(&intent) {
            if focus_kind == Some(ItemKind::Plan) {
                payload.insert("plan".into(), json!(focus_id));
                let mut ctx = Map::new();
                ctx.insert(
                    "target_resolution".into(),
                    json!({"source": "focus", "focus": focus_id, "plan": focus_id, "domain": focus_domain}),
                );
                return (payload, ctx, None);
            }
            if let Some(task) = &focus_item {
                if task.is_task() {
                    let parent = task.parent.clone().unwrap_or_default();
                    if !parent.is_empty()
                        && self
                            .load_item(&parent)
                            .map(|p| p.is_plan())
                            .unwrap_or(false)
                    {
                        payload.insert("plan".into(), json!(parent));
                        let mut ctx = Map::new();
                        ctx.insert(
                            "target_resolution".into(),
                            json!({"source": "focus_task_parent", "focus": focus_id, "plan": parent, "domain": focus_domain}),
                        );
                        return (payload, ctx, None);
                    }
                }
            }
            let mut ctx = Map::new();
            ctx.insert(
                "target_resolution".into(),
                json!({"source": "focus_incompatible", "focus": focus_id, "domain": focus_domain}),
            );
            let err = error_response(
                intent,
                codes::FOCUS_INCOMPATIBLE,
                &format!("focus={} is not usable for intent={} (needs a PLAN)", focus_id, intent),
            )
            .with_recovery("Set focus on a PLAN via focus_set or pass plan=PLAN-### explicitly.")
            .with_suggestions(self.missing_target_suggestions(&["PLAN-"]));
            return (payload, ctx, Some(err));
        }

        if TASK_ONLY_INTENTS.contains(&intent) {
            if focus_kind != Some(ItemKind::Task) {
                let mut ctx = Map::new();
                ctx.insert(
                    "target_resolution".into(),
                    json!({"source": "focus_incompatible", "focus": focus_id, "domain": focus_domain}),
                );
                let err = error_response(
                    intent,
                    codes::FOCUS_INCOMPATIBLE,
                    &format!("focus={} is not usable for intent={} (needs a TASK)", focus_id, intent),
                )
                .with_recovery("Set focus on a TASK via focus_set or pass task=TASK-### explicitly.")
                .with_suggestions(self.missing_target_suggestions(&["TASK-"]));
                return (payload, ctx, Some(err));
            }
            payload.insert("task".into(), json!(focus_id));
            let mut ctx = Map::new();
            ctx.insert(
                "target_resolution".into(),
                json!({"source": "focus", "focus": focus_id, "task": focus_id, "domain": focus_domain}),
            );
            return (payload, ctx, None);
        }

        // Item-level intents accept any focus id.
        payload.insert("task".into(), json!(focus_id));
        let mut ctx = Map::new();
        ctx.insert(
            "target_resolution".into(),
            json!({"source": "focus", "focus": focus_id, "task": focus_id, "domain": focus_domain}),
        );
        (payload, ctx, None)
    }

    fn task_file_for(&self, task_id: &str, domain: &str) -> Option<PathBuf> {
        self.repo.resolve_path(task_id, domain).ok()
    }

    fn route(&self, intent: &str, payload: &Payload) -> AIResponse {
        match intent {
            "context" => context::handle_context(self, payload),
            "focus_get" => context::handle_focus_get(self, payload),
            "focus_set" => context::handle_focus_set(self, payload),
            "focus_clear" => context::handle_focus_clear(self, payload),
            "radar" => radar::handle_radar(self, payload),
            "handoff" => radar::handle_handoff(self, payload),
            "context_pack" => radar::handle_context_pack(self, payload),
            "resume" => context::handle_resume(self, payload),
            "lint" => context::handle_lint(self, payload),
            "templates_list" => context::handle_templates_list(self, payload),
            "scaffold" => create::handle_scaffold(self, payload),
            "create" => create::handle_create(self, payload),
            "decompose" => create::handle_decompose(self, payload),
            "task_add" => create::handle_task_add(self, payload),
            "task_define" => create::handle_task_define(self, payload),
            "task_delete" => create::handle_task_delete(self, payload),
            "define" => mutate::handle_define(self, payload),
            "verify" => verify::handle_verify(self, payload),
            "evidence_capture" => verify::handle_evidence_capture(self, payload),
            "done" => verify::handle_done(self, payload),
            "close_step" => verify::handle_close_step(self, payload),
            "close_task" => close::handle_close_task(self, payload),
            "progress" => verify::handle_progress(self, payload),
            "edit" => mutate::handle_edit(self, payload),
            "patch" => patch::handle_patch(self, payload),
            "note" => mutate::handle_note(self, payload),
            "block" => mutate::handle_block(self, payload),
            "contract" => mutate::handle_contract(self, payload),
            "plan" => mutate::handle_plan(self, payload),
            "mirror" => context::handle_mirror(self, payload),
            "complete" => mutate::handle_complete(self, payload),
            "delete" => mutate::handle_delete(self, payload),
            "batch" => batch::handle_batch(self, payload),
            "undo" => history::handle_undo(self, payload),
            "redo" => history::handle_redo(self, payload),
            "history" => history::handle_history(self, payload),
            "delta" => history::handle_delta(self, payload),
            "storage" => context::handle_storage(self, payload),
            _ => error_response(intent, codes::UNKNOWN_INTENT, &format!("Unknown intent: {}", intent)),
        }
    }

    /// The single entry point: one JSON request in, one envelope out.
    pub fn process_intent(&self, request: &Value) -> AIResponse {
        let Some(data) = request.as_object() else {
            return error_response("unknown", codes::INVALID_REQUEST, "payload must be a JSON object");
        };
        let intent = data
            .get("intent")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_lowercase();
        if intent.is_empty() {
            return error_response("unknown", codes::MISSING_INTENT, "intent is required");
        }
        if !KNOWN_INTENTS.contains(&intent.as_str()) {
            return error_response(
                &intent,
                codes::UNKNOWN_INTENT,
                &format!("Unknown intent: {}", intent),
            );
        }

        let expected_revision = match parse_expected_revision(data) {
            Ok(value) => value,
            Err(msg) => {
                return error_response(&intent, codes::INVALID_EXPECTED_REVISION, &msg)
                    .with_recovery(
                        "Pass expected_revision as an integer (etag-like). Fetch the current revision via radar/resume.",
                    )
                    .with_suggestions(self.missing_target_suggestions(&["TASK-", "PLAN-"]));
            }
        };

        let (mut payload, ctx_add, early_error) = self.apply_focus(&intent, data);
        if let Some(mut err) = early_error {
            for (key, value) in ctx_add {
                err.context.insert(key, value);
            }
            return err;
        }

        let mut meta_add: Map<String, Value> = Map::new();

        // Safe writes: explicit > focus; prevent silent mis-targets.
        if FOCUSABLE_MUTATING_INTENTS.contains(&intent.as_str()) {
            if let Some(err) =
                self.apply_safe_writes(&intent, &mut payload, &ctx_add, &mut meta_add)
            {
                let mut err = err;
                for (key, value) in ctx_add {
                    err.context.insert(key, value);
                }
                for (key, value) in meta_add {
                    err.meta.insert(key, value);
                }
                return err;
            }
        }

        let task_id: Option<String> = payload
            .get("task")
            .or_else(|| payload.get("plan"))
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        // Optimistic concurrency preflight.
        if let (Some(expected), Some(tid)) = (expected_revision, task_id.as_deref()) {
            if is_targeted_mutating(&intent) && crate::core::ident::is_valid_id(tid) {
                if let Some(current) = self.load_item(tid) {
                    if current.revision != expected {
                        return self
                            .revision_mismatch_response(&intent, tid, expected, current.revision);
                    }
                }
            }
        }

        // Before snapshot for mutating intents (undo material).
        let mut task_file: Option<PathBuf> = None;
        let mut before_snapshot: Option<String> = None;
        if MUTATING_INTENTS.contains(&intent.as_str()) {
            if let Some(tid) = task_id.as_deref() {
                if crate::core::ident::is_valid_id(tid) {
                    let domain = payload
                        .get("domain")
                        .and_then(Value::as_str)
                        .map(|s| s.to_string())
                        .filter(|s| !s.is_empty())
                        .or_else(|| self.load_item(tid).map(|i| i.domain))
                        .unwrap_or_default();
                    task_file = self.task_file_for(tid, &domain);
                    if let (Ok(history), Some(file)) = (self.history(), task_file.as_ref()) {
                        before_snapshot = history.snapshot(file);
                    }
                }
            }
        }

        let handler_payload = payload.clone();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.route(&intent, &handler_payload)
        }));
        let mut resp = match outcome {
            Ok(resp) => resp,
            Err(_) => error_response(&intent, codes::INTERNAL_ERROR, "internal error: handler panicked"),
        };

        for (key, value) in ctx_add {
            resp.context.entry(key).or_insert(value);
        }
        for (key, value) in meta_add {
            resp.meta.entry(key).or_insert(value);
        }

        let was_preview = resp
            .result
            .get("dry_run")
            .and_then(Value::as_bool)
            .unwrap_or_else(|| validate::get_bool(&payload, "dry_run", false));

        if MUTATING_INTENTS.contains(&intent.as_str()) && resp.success && !was_preview {
            // History recording must never fail the operation itself.
            let record = (|| -> Result<Option<String>> {
                let mut history = self.history()?;
                let mut history_task_id = task_id.clone();
                let mut history_task_file = task_file.clone();
                let mut history_payload = payload.clone();
                let mut snapshot = before_snapshot.clone();

                if CREATE_LIKE_INTENTS.contains(&intent.as_str()) {
                    let created_id = resp
                        .result
                        .get("task_id")
                        .or_else(|| resp.result.get("plan_id"))
                        .and_then(Value::as_str)
                        .map(|s| s.to_string());
                    if let Some(created_id) = created_id {
                        history_payload.insert("created_id".into(), json!(created_id));
                        let created_domain = self
                            .load_item(&created_id)
                            .map(|i| i.domain)
                            .unwrap_or_default();
                        history_task_file = self.task_file_for(&created_id, &created_domain);
                        history_task_id = Some(created_id);
                        snapshot = None;
                    }
                }

                let op = history.record(
                    &intent,
                    history_task_id.as_deref(),
                    Value::Object(history_payload),
                    history_task_file.as_deref(),
                    Some(resp.to_value()),
                    snapshot,
                )?;
                Ok(Some(op.id))
            })();
            if let Ok(Some(op_id)) = record {
                resp.meta.entry("operation_id".to_string()).or_insert(json!(op_id));
            }
        } else if resp.success
            && (validate::get_bool(&payload, "audit", false)
                || (intent == "close_task" && was_preview))
        {
            // Preview/read trace: never undoable, never snapshotted.
            if let Ok(mut history) = self.history() {
                if let Ok(op) = history.record_audit(
                    &intent,
                    task_id.as_deref(),
                    Value::Object(payload.clone()),
                    Some(resp.to_value()),
                ) {
                    resp.meta
                        .entry("audit_operation_id".to_string())
                        .or_insert(json!(op.id));
                }
            }
        }

        resp
    }

    /// Safe-write guards: alias merging, auto strict targeting, and the
    /// expected-target/kind equality checks.
    fn apply_safe_writes(
        &self,
        intent: &str,
        payload: &mut Payload,
        ctx_add: &Map<String, Value>,
        meta_add: &mut Map<String, Value>,
    ) -> Option<AIResponse> {
        // `expected_target` aliases `expected_target_id`: strict equality or one-only.
        if let Some(alias) = payload.get("expected_target").cloned() {
            match payload.get("expected_target_id") {
                None => {
                    payload.insert("expected_target_id".into(), alias);
                }
                Some(existing) => {
                    let left = existing.as_str().unwrap_or_default().trim().to_string();
                    let right = alias.as_str().unwrap_or_default().trim().to_string();
                    if !left.is_empty() && !right.is_empty() && left != right {
                        return Some(
                            error_response(
                                intent,
                                codes::EXPECTED_TARGET_MISMATCH,
                                &format!("expected_target={} != expected_target_id={}", right, left),
                            )
                            .with_recovery(
                                "Keep only expected_target_id, or make expected_target match it.",
                            ),
                        );
                    }
                }
            }
        }
        // `strict_writes` aliases `strict_targeting`.
        if payload.contains_key("strict_writes") {
            let merged = validate::get_bool(payload, "strict_targeting", false)
                || validate::get_bool(payload, "strict_writes", false);
            payload.insert("strict_targeting".into(), json!(merged));
        }

        let source = ctx_add
            .get("target_resolution")
            .and_then(|v| v.get("source"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let resolved_target_id: Option<String> = payload
            .get("plan")
            .or_else(|| payload.get("task"))
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let resolved_kind: Option<&str> = resolved_target_id.as_deref().and_then(|id| {
            if id.starts_with("PLAN-") {
                Some("plan")
            } else if id.starts_with("TASK-") {
                Some("task")
            } else {
                self.load_item(id).map(|i| {
                    if i.is_plan() { "plan" } else { "task" }
                })
            }
        });

        // Auto strict-writes: focus-resolved target amid multiple ACTIVE items.
        if !source.is_empty()
            && source != "explicit"
            && !payload.contains_key("strict_targeting")
            && !payload.contains_key("strict_writes")
        {
            let active = self.active_item_count();
            if active > 1 {
                payload.insert("strict_targeting".into(), json!(true));
                meta_add.insert("strict_writes_auto".into(), json!(true));
                meta_add.insert("strict_writes_reason".into(), json!("multiple_active_targets"));
                meta_add.insert("strict_writes_active_count".into(), json!(active));
            }
        }

        let expected_target_id = match payload.get("expected_target_id") {
            Some(value) => match validate::validate_node_id(Some(value), "expected_target_id") {
                Ok(id) => Some(id),
                Err(msg) => {
                    return Some(error_response(intent, codes::INVALID_EXPECTED_TARGET_ID, &msg));
                }
            },
            None => None,
        };
        let expected_kind = match payload.get("expected_kind") {
            Some(value) => {
                let Some(raw) = value.as_str() else {
                    return Some(error_response(
                        intent,
                        codes::INVALID_EXPECTED_KIND,
                        "expected_kind must be a string (task|plan)",
                    ));
                };
                let kind = raw.trim().to_lowercase();
                if !matches!(kind.as_str(), "task" | "plan") {
                    return Some(error_response(
                        intent,
                        codes::INVALID_EXPECTED_KIND,
                        "expected_kind must be task|plan",
                    ));
                }
                Some(kind)
            }
            None => None,
        };
        let strict_targeting = validate::get_bool(payload, "strict_targeting", false);

        let guard_result = |expected_target_id: &Option<String>, expected_kind: &Option<String>| {
            json!({
                "expected_target_id": expected_target_id,
                "expected_kind": expected_kind,
                "resolved_target_id": resolved_target_id,
                "resolved_kind": resolved_kind,
                "target_resolution": ctx_add.get("target_resolution").cloned().unwrap_or(Value::Null),
            })
        };

        if strict_targeting
            && !source.is_empty()
            && source != "explicit"
            && expected_target_id.is_none()
        {
            return Some(
                error_response(
                    intent,
                    codes::STRICT_TARGETING_REQUIRES_EXPECTED_TARGET_ID,
                    "expected_target_id is required with strict_targeting=true and a focus-resolved target",
                )
                .with_recovery(
                    "Pass expected_target_id (and optionally expected_kind), or address the operation explicitly via task=/plan=.",
                )
                .with_suggestions(vec![
                    Suggestion::new("focus_get", "focus_get", "Check the current focus before writing.", "high"),
                    Suggestion::new("radar", "tasks_radar", "Confirm focus points at the intended target.", "normal"),
                ])
                .with_result(guard_result(&expected_target_id, &expected_kind)),
            );
        }

        if let (Some(expected), Some(resolved)) =
            (expected_target_id.as_deref(), resolved_target_id.as_deref())
        {
            if expected != resolved {
                return Some(
                    error_response(
                        intent,
                        codes::EXPECTED_TARGET_MISMATCH,
                        &format!("resolved_target_id={} != expected_target_id={}", resolved, expected),
                    )
                    .with_recovery(
                        "Fix the target (task=/plan=) or set the right focus via focus_set, then retry.",
                    )
                    .with_suggestions(self.missing_target_suggestions(&["TASK-", "PLAN-"]))
                    .with_result(guard_result(&expected_target_id, &expected_kind)),
                );
            }
        }

        if let (Some(expected), Some(resolved)) = (expected_kind.as_deref(), resolved_kind) {
            if expected != resolved {
                return Some(
                    error_response(
                        intent,
                        codes::EXPECTED_TARGET_MISMATCH,
                        &format!("resolved_kind={} != expected_kind={}", resolved, expected),
                    )
                    .with_recovery(
                        "Fix the target (task=/plan=) or set the right focus via focus_set, then retry.",
                    )
                    .with_suggestions(self.missing_target_suggestions(&["TASK-", "PLAN-"]))
                    .with_result(guard_result(&expected_target_id, &expected_kind)),
                );
            }
        }

        None
    }
}

/// Parse `expected_revision` (alias `expected_version`): non-negative integer.
fn parse_expected_revision(data: &Payload) -> std::result::Result<Option<u64>, String> {
    let raw = data
        .get("expected_revision")
        .or_else(|| data.get("expected_version"));
    let Some(raw) = raw else {
        return Ok(None);
    };
    if raw.is_boolean() {
        return Err("expected_revision must be an integer".to_string());
    }
    let Some(value) = raw.as_i64() else {
        return Err("expected_revision must be an integer".to_string());
    };
    if value < 0 {
        return Err("expected_revision must be >= 0".to_string());
    }
    Ok(Some(value as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_expected_revision() {
        let mut data = Payload::new();
        assert_eq!(parse_expected_revision(&data).unwrap(), None);
        data.insert("expected_revision".into(), json!(3));
        assert_eq!(parse_expected_revision(&data).unwrap(), Some(3));
        data.insert("expected_revision".into(), json!(-1));
        assert!(parse_expected_revision(&data).is_err());
        data.insert("expected_revision".into(), json!(true));
        assert!(parse_expected_revision(&data).is_err());
        data.remove("expected_revision");
        data.insert("expected_version".into(), json!(7));
        assert_eq!(parse_expected_revision(&data).unwrap(), Some(7));
    }

    #[test]
    fn test_intent_tables_are_consistent() {
        for intent in FOCUSABLE_MUTATING_INTENTS {
            assert!(KNOWN_INTENTS.contains(intent), "{} missing", intent);
        }
        for intent in MUTATING_INTENTS {
            assert!(KNOWN_INTENTS.contains(intent), "{} missing", intent);
        }
        assert!(is_targeted_mutating("patch"));
        assert!(is_targeted_mutating("close_task"));
        assert!(!is_targeted_mutating("create"));
        assert!(!is_targeted_mutating("scaffold"));
        assert!(!is_targeted_mutating("context"));
    }
}
