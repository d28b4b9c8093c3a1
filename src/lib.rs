//! Taskplane: a local-first task control plane for AI agents.
//!
//! **Taskplane is daemonless**: agents invoke it on demand with one JSON
//! intent per call, and every answer is one structured JSON envelope. Humans
//! steer via contracts; agents execute steps under checkpoint and evidence
//! discipline.
//!
//! # Core Principles
//!
//! - **Local-first**: all state is plain files under one tasks root
//! - **Deterministic**: the same request against the same files yields the
//!   same envelope; output budgets shrink in a fixed order
//! - **Evidence-gated**: steps close only when their checkpoints are
//!   confirmed, and evidence is content-addressed and redacted
//! - **Safe writes**: focus fallback never silently mis-targets; optimistic
//!   concurrency rides the per-item `revision`
//!
//! # For AI Agents
//!
//! 1. Orient with `context`, `radar`, or `context_pack`
//! 2. Address explicitly (`task=`/`plan=`) or set focus via `focus_set`
//! 3. Confirm checkpoints with `verify`, capture proof with
//!    `evidence_capture`, close steps with `close_step`
//! 4. Finish through the runway: `close_task` previews, `close_task(apply)`
//!    lands atomically
//! 5. Recover with `undo` / `redo` / `delta`
//!
//! # Crate Structure
//!
//! - [`core`]: domain model and file-backed infrastructure (items, steps,
//!   repository, history, evidence, lint)
//! - [`intents`]: the JSON intent dispatcher and handler catalog

pub mod core;
pub mod intents;

pub use crate::core::error::TaskplaneError;
pub use crate::intents::Dispatcher;
pub use crate::intents::response::AIResponse;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_dispatcher_end_to_end_smoke() {
        let tmp = tempdir().unwrap();
        let dispatcher = Dispatcher::with_project_root(tmp.path(), tmp.path()).unwrap();

        let resp = dispatcher.process_intent(&json!({"intent": "create", "kind": "plan", "title": "P"}));
        assert!(resp.success, "create plan failed: {:?}", resp.error_message);
        let plan_id = resp.result["plan_id"].as_str().unwrap().to_string();

        let resp = dispatcher.process_intent(&json!({
            "intent": "create",
            "kind": "task",
            "title": "T",
            "parent": plan_id,
        }));
        assert!(resp.success);
        assert_eq!(resp.result["task"]["revision"], json!(1));
    }

    #[test]
    fn test_unknown_intent_envelope() {
        let tmp = tempdir().unwrap();
        let dispatcher = Dispatcher::with_project_root(tmp.path(), tmp.path()).unwrap();
        let resp = dispatcher.process_intent(&json!({"intent": "frobnicate"}));
        assert!(!resp.success);
        assert_eq!(resp.error_code.as_deref(), Some("UNKNOWN_INTENT"));
        let value = resp.to_value();
        assert_eq!(value["error"]["code"], json!("UNKNOWN_INTENT"));
    }
}
