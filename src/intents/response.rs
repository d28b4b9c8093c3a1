//! The structured response envelope every intent returns.
//!
//! One shape for every outcome: `success`, the echoed `intent`, a structured
//! `result`, ambient `context`, executable `suggestions`, `warnings`, `meta`
//! (operation ids, safe-write notices), and on failure a stable error code
//! plus a `recovery` string naming the intents that unblock the caller.

use crate::core::time::now_iso;
use serde_json::{Map, Value, json};

/// Stable error codes. Handlers never invent codes outside this catalog.
pub mod codes {
    // Validation
    pub const MISSING_INTENT: &str = "MISSING_INTENT";
    pub const UNKNOWN_INTENT: &str = "UNKNOWN_INTENT";
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const INVALID_ID: &str = "INVALID_ID";
    pub const INVALID_TASK: &str = "INVALID_TASK";
    pub const INVALID_PLAN: &str = "INVALID_PLAN";
    pub const INVALID_PATH: &str = "INVALID_PATH";
    pub const INVALID_STEP_ID: &str = "INVALID_STEP_ID";
    pub const INVALID_TASK_NODE_ID: &str = "INVALID_TASK_NODE_ID";
    pub const INVALID_KIND: &str = "INVALID_KIND";
    pub const INVALID_LIMIT: &str = "INVALID_LIMIT";
    pub const INVALID_MAX_CHARS: &str = "INVALID_MAX_CHARS";
    pub const INVALID_CHECKS: &str = "INVALID_CHECKS";
    pub const INVALID_ATTACHMENTS: &str = "INVALID_ATTACHMENTS";
    pub const INVALID_STEPS: &str = "INVALID_STEPS";
    pub const INVALID_TAGS: &str = "INVALID_TAGS";
    pub const INVALID_DEPENDS_ON: &str = "INVALID_DEPENDS_ON";
    pub const INVALID_EXPECTED_REVISION: &str = "INVALID_EXPECTED_REVISION";
    pub const INVALID_EXPECTED_TARGET_ID: &str = "INVALID_EXPECTED_TARGET_ID";
    pub const INVALID_EXPECTED_KIND: &str = "INVALID_EXPECTED_KIND";
    pub const INVALID_FILTER: &str = "INVALID_FILTER";
    pub const INVALID_PAGINATION: &str = "INVALID_PAGINATION";
    pub const INVALID_CHECKPOINT: &str = "INVALID_CHECKPOINT";
    pub const INVALID_CHECKPOINTS: &str = "INVALID_CHECKPOINTS";
    pub const INVALID_OP: &str = "INVALID_OP";
    pub const INVALID_OPS: &str = "INVALID_OPS";
    pub const INVALID_VALUE: &str = "INVALID_VALUE";
    pub const INVALID_FIELD: &str = "INVALID_FIELD";
    pub const FORBIDDEN_FIELD: &str = "FORBIDDEN_FIELD";
    pub const INVALID_ARTIFACT_KIND: &str = "INVALID_ARTIFACT_KIND";
    pub const INVALID_ARTIFACTS: &str = "INVALID_ARTIFACTS";
    pub const INVALID_DEPENDENCIES: &str = "INVALID_DEPENDENCIES";
    pub const CIRCULAR_DEPENDENCY: &str = "CIRCULAR_DEPENDENCY";
    pub const TOO_MANY_ARTIFACTS: &str = "TOO_MANY_ARTIFACTS";
    pub const INVALID_TITLE: &str = "INVALID_TITLE";
    pub const INVALID_CONTRACT_DATA: &str = "INVALID_CONTRACT_DATA";
    pub const INVALID_FIELDS: &str = "INVALID_FIELDS";
    pub const INVALID_STATUS: &str = "INVALID_STATUS";
    pub const INVALID_PRIORITY: &str = "INVALID_PRIORITY";
    pub const INVALID_OPERATIONS: &str = "INVALID_OPERATIONS";
    pub const INVALID_CURRENT: &str = "INVALID_CURRENT";
    pub const INVALID_TARGET: &str = "INVALID_TARGET";

    // Targeting / concurrency
    pub const MISSING_TARGET: &str = "MISSING_TARGET";
    pub const MISSING_TASK: &str = "MISSING_TASK";
    pub const MISSING_PLAN: &str = "MISSING_PLAN";
    pub const MISSING_PARENT: &str = "MISSING_PARENT";
    pub const MISSING_ID: &str = "MISSING_ID";
    pub const MISSING_NOTE: &str = "MISSING_NOTE";
    pub const MISSING_STEPS: &str = "MISSING_STEPS";
    pub const MISSING_TEMPLATE: &str = "MISSING_TEMPLATE";
    pub const MISSING_CHECKPOINTS: &str = "MISSING_CHECKPOINTS";
    pub const MISSING_EVIDENCE: &str = "MISSING_EVIDENCE";
    pub const MISSING_FIELD: &str = "MISSING_FIELD";
    pub const MISSING_VALUE: &str = "MISSING_VALUE";
    pub const MISSING_OPS: &str = "MISSING_OPS";
    pub const MISSING_OPERATIONS: &str = "MISSING_OPERATIONS";
    pub const MISSING_URL: &str = "MISSING_URL";
    pub const MISSING_DIFF: &str = "MISSING_DIFF";
    pub const MISSING_OUTPUT: &str = "MISSING_OUTPUT";
    pub const MISSING_PARENT_STEP: &str = "MISSING_PARENT_STEP";
    pub const MISSING_TITLE: &str = "MISSING_TITLE";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const PARENT_NOT_FOUND: &str = "PARENT_NOT_FOUND";
    pub const NOT_A_TASK: &str = "NOT_A_TASK";
    pub const NOT_A_PLAN: &str = "NOT_A_PLAN";
    pub const FOCUS_INCOMPATIBLE: &str = "FOCUS_INCOMPATIBLE";
    pub const EXPECTED_TARGET_MISMATCH: &str = "EXPECTED_TARGET_MISMATCH";
    pub const STRICT_TARGETING_REQUIRES_EXPECTED_TARGET_ID: &str =
        "STRICT_TARGETING_REQUIRES_EXPECTED_TARGET_ID";
    pub const REVISION_MISMATCH: &str = "REVISION_MISMATCH";
    pub const PATH_NOT_FOUND: &str = "PATH_NOT_FOUND";
    pub const STEP_ID_NOT_FOUND: &str = "STEP_ID_NOT_FOUND";
    pub const TASK_NODE_ID_NOT_FOUND: &str = "TASK_NODE_ID_NOT_FOUND";
    pub const UNKNOWN_TEMPLATE: &str = "UNKNOWN_TEMPLATE";
    pub const UNSUPPORTED_KIND: &str = "UNSUPPORTED_KIND";
    pub const INVALID_PARENT: &str = "INVALID_PARENT";

    // Semantic gating
    pub const GATING_FAILED: &str = "GATING_FAILED";
    pub const VERIFY_NOOP: &str = "VERIFY_NOOP";
    pub const MISSING_OVERRIDE_REASON: &str = "MISSING_OVERRIDE_REASON";
    pub const LINT_ERRORS_BLOCKING: &str = "LINT_ERRORS_BLOCKING";
    pub const RUNWAY_CLOSED: &str = "RUNWAY_CLOSED";
    pub const NO_FIELDS: &str = "NO_FIELDS";

    // History
    pub const NOTHING_TO_UNDO: &str = "NOTHING_TO_UNDO";
    pub const NOTHING_TO_REDO: &str = "NOTHING_TO_REDO";
    pub const UNDO_FAILED: &str = "UNDO_FAILED";
    pub const REDO_FAILED: &str = "REDO_FAILED";
    pub const SINCE_NOT_FOUND: &str = "SINCE_NOT_FOUND";

    // Internal
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
    pub const BATCH_FAILED: &str = "BATCH_FAILED";
    pub const DELTA_FAILED: &str = "DELTA_FAILED";
}

/// An executable next-action hint with concrete, ready-to-send params.
#[derive(Debug, Clone, PartialEq)]
pub struct Suggestion {
    pub action: String,
    pub target: String,
    pub reason: String,
    pub priority: String,
    pub params: Option<Value>,
    pub validated: Option<bool>,
}

impl Suggestion {
    pub fn new(action: &str, target: &str, reason: &str, priority: &str) -> Suggestion {
        Suggestion {
            action: action.to_string(),
            target: target.to_string(),
            reason: reason.to_string(),
            priority: priority.to_string(),
            params: None,
            validated: None,
        }
    }

    pub fn with_params(mut self, params: Value) -> Suggestion {
        self.params = Some(params);
        self
    }

    pub fn validated(mut self, flag: bool) -> Suggestion {
        self.validated = Some(flag);
        self
    }

    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("action".into(), json!(self.action));
        map.insert("target".into(), json!(self.target));
        map.insert("reason".into(), json!(self.reason));
        map.insert("priority".into(), json!(self.priority));
        if let Some(params) = &self.params {
            map.insert("params".into(), params.clone());
        }
        if let Some(validated) = self.validated {
            map.insert("validated".into(), json!(validated));
        }
        Value::Object(map)
    }
}

/// The single response shape for every intent.
#[derive(Debug, Clone)]
pub struct AIResponse {
    pub success: bool,
    pub intent: String,
    pub result: Value,
    pub summary: Option<String>,
    pub state: Option<Value>,
    pub hints: Option<Vec<Value>>,
    pub warnings: Vec<String>,
    pub context: Map<String, Value>,
    pub suggestions: Vec<Suggestion>,
    pub meta: Map<String, Value>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub error_recovery: Option<String>,
    pub timestamp: String,
}

impl AIResponse {
    pub fn ok(intent: &str, result: Value) -> AIResponse {
        AIResponse {
            success: true,
            intent: intent.to_string(),
            result,
            summary: None,
            state: None,
            hints: None,
            warnings: Vec::new(),
            context: Map::new(),
            suggestions: Vec::new(),
            meta: Map::new(),
            error_code: None,
            error_message: None,
            error_recovery: None,
            timestamp: now_iso(),
        }
    }

    pub fn with_context(mut self, key: &str, value: Value) -> AIResponse {
        self.context.insert(key.to_string(), value);
        self
    }

    pub fn with_suggestions(mut self, suggestions: Vec<Suggestion>) -> AIResponse {
        self.suggestions = suggestions;
        self
    }

    pub fn to_value(&self) -> Value {
        let mut payload = Map::new();
        payload.insert("success".into(), json!(self.success));
        payload.insert("intent".into(), json!(self.intent));
        payload.insert("result".into(), self.result.clone());
        if let Some(summary) = &self.summary {
            payload.insert("summary".into(), json!(summary));
        }
        if let Some(state) = &self.state {
            payload.insert("state".into(), state.clone());
        }
        if let Some(hints) = &self.hints {
            payload.insert("hints".into(), json!(hints));
        }
        payload.insert("warnings".into(), json!(self.warnings));
        payload.insert("context".into(), Value::Object(self.context.clone()));
        payload.insert(
            "suggestions".into(),
            Value::Array(self.suggestions.iter().map(|s| s.to_value()).collect()),
        );
        payload.insert("meta".into(), Value::Object(self.meta.clone()));
        // `error` is always present: null on success, structured on failure.
        let error = if self.success {
            Value::Null
        } else {
            let mut err = Map::new();
            err.insert(
                "code".into(),
                json!(self.error_code.clone().unwrap_or_else(|| "ERROR".to_string())),
            );
            err.insert(
                "message".into(),
                json!(
                    self.error_message
                        .clone()
                        .unwrap_or_else(|| "Unknown error".to_string())
                ),
            );
            if let Some(recovery) = &self.error_recovery {
                err.insert("recovery".into(), json!(recovery));
            }
            Value::Object(err)
        };
        payload.insert("error".into(), error);
        payload.insert("timestamp".into(), json!(self.timestamp));
        Value::Object(payload)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.to_value()).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Failure constructor. `recovery` names the intent(s) that unblock the caller.
pub fn error_response(intent: &str, code: &str, message: &str) -> AIResponse {
    AIResponse {
        success: false,
        intent: intent.to_string(),
        result: json!({}),
        summary: None,
        state: None,
        hints: None,
        warnings: Vec::new(),
        context: Map::new(),
        suggestions: Vec::new(),
        meta: Map::new(),
        error_code: Some(code.to_string()),
        error_message: Some(message.to_string()),
        error_recovery: None,
        timestamp: now_iso(),
    }
}

impl AIResponse {
    pub fn with_recovery(mut self, recovery: &str) -> AIResponse {
        self.error_recovery = Some(recovery.to_string());
        self
    }

    pub fn with_result(mut self, result: Value) -> AIResponse {
        self.result = result;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_envelope_has_null_error() {
        let resp = AIResponse::ok("context", json!({"counts": {}}));
        let value = resp.to_value();
        assert_eq!(value["success"], json!(true));
        assert!(value["error"].is_null());
        assert!(value.get("summary").is_none());
        assert!(value["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_error_envelope_carries_code_and_recovery() {
        let resp = error_response("patch", codes::NOT_FOUND, "No such item")
            .with_recovery("Check ids via context(include_all=true).");
        let value = resp.to_value();
        assert_eq!(value["success"], json!(false));
        assert_eq!(value["error"]["code"], json!("NOT_FOUND"));
        assert_eq!(
            value["error"]["recovery"],
            json!("Check ids via context(include_all=true).")
        );
    }

    #[test]
    fn test_suggestion_serialization() {
        let sug = Suggestion::new("focus_set", "TASK-001", "Set focus.", "high")
            .with_params(json!({"task": "TASK-001"}))
            .validated(true);
        let value = sug.to_value();
        assert_eq!(value["action"], json!("focus_set"));
        assert_eq!(value["validated"], json!(true));
        assert_eq!(value["params"]["task"], json!("TASK-001"));
    }
}
