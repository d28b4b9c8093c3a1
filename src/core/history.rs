//! Operation history: undo/redo over file snapshots, plus a read-only audit
//! stream.
//!
//! Two append-only streams live at the tasks root: `.history.json` (the ops
//! stream, bounded to [`MAX_HISTORY_SIZE`] entries, carrying the undo/redo
//! cursor) and `.audit.json` (previews and audited reads; never undoable).
//! Before/after file content snapshots live under `.snapshots/` with
//! `<stem>-<nanos>` ids; snapshots no longer referenced by any retained
//! operation are garbage-collected so the snapshot directory and the ops
//! stream always describe each other.

use crate::core::error::{Result, TaskplaneError};
use crate::core::evidence::sha256_hex;
use crate::core::repo::write_atomic;
use crate::core::time::{now_iso, now_nanos};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};

pub const MAX_HISTORY_SIZE: usize = 100;
pub const SNAPSHOT_DIR: &str = ".snapshots";
pub const HISTORY_FILE: &str = ".history.json";
pub const AUDIT_FILE: &str = ".audit.json";

/// A single recorded operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    /// Unix epoch seconds.
    pub timestamp: f64,
    pub intent: String,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub data: Value,
    /// "ops" (undoable writes) or "audit" (preview/read trace).
    #[serde(default = "default_stream")]
    pub stream: String,
    /// "write" or "read".
    #[serde(default = "default_effect")]
    pub effect: String,
    /// Item file path relative to the tasks root (supports domain paths).
    #[serde(default)]
    pub task_file: Option<String>,
    /// Before-state snapshot (for undo).
    #[serde(default)]
    pub snapshot_id: Option<String>,
    /// After-state snapshot (for redo).
    #[serde(default)]
    pub after_snapshot_id: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub undone: bool,
}

fn default_stream() -> String {
    "ops".to_string()
}

fn default_effect() -> String {
    "write".to_string()
}

impl Operation {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Compact, agent-friendly summary for delta feeds.
    pub fn to_summary_value(&self) -> Value {
        json!({
            "id": self.id,
            "timestamp": self.timestamp,
            "intent": self.intent,
            "task_id": self.task_id,
            "stream": self.stream,
            "effect": self.effect,
            "task_file": self.task_file,
            "undone": self.undone,
            "has_result": self.result.is_some(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct HistoryDoc {
    #[serde(default)]
    operations: Vec<Operation>,
    #[serde(default = "default_index")]
    current_index: i64,
    #[serde(default)]
    updated_at: String,
}

fn default_index() -> i64 {
    -1
}

#[derive(Debug, Serialize, Deserialize)]
struct AuditDoc {
    #[serde(default)]
    operations: Vec<Operation>,
    #[serde(default)]
    updated_at: String,
}

/// File-backed history manager for one tasks root.
#[derive(Debug)]
pub struct OperationHistory {
    storage_dir: PathBuf,
    pub operations: Vec<Operation>,
    /// Points at the last executed operation; -1 when fully unwound.
    pub current_index: i64,
    pub audit_operations: Vec<Operation>,
}

impl OperationHistory {
    pub fn open(storage_dir: &Path) -> Result<OperationHistory> {
        fs::create_dir_all(storage_dir.join(SNAPSHOT_DIR))?;
        let mut history = OperationHistory {
            storage_dir: storage_dir.to_path_buf(),
            operations: Vec::new(),
            current_index: -1,
            audit_operations: Vec::new(),
        };
        history.load();
        history.load_audit();
        Ok(history)
    }

    fn history_path(&self) -> PathBuf {
        self.storage_dir.join(HISTORY_FILE)
    }

    fn audit_path(&self) -> PathBuf {
        self.storage_dir.join(AUDIT_FILE)
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.storage_dir.join(SNAPSHOT_DIR)
    }

    fn load(&mut self) {
        let Ok(content) = fs::read_to_string(self.history_path()) else {
            return;
        };
        match serde_json::from_str::<HistoryDoc>(&content) {
            Ok(doc) => {
                self.current_index = doc
                    .current_index
                    .min(doc.operations.len() as i64 - 1)
                    .max(-1);
                self.operations = doc.operations;
            }
            Err(_) => {
                self.operations = Vec::new();
                self.current_index = -1;
            }
        }
    }

    fn load_audit(&mut self) {
        let Ok(content) = fs::read_to_string(self.audit_path()) else {
            return;
        };
        self.audit_operations = serde_json::from_str::<AuditDoc>(&content)
            .map(|doc| doc.operations)
            .unwrap_or_default();
    }

    fn save(&self) -> Result<()> {
        let doc = HistoryDoc {
            operations: self.operations.clone(),
            current_index: self.current_index,
            updated_at: now_iso(),
        };
        let content = serde_json::to_string_pretty(&doc)?;
        write_atomic(&self.history_path(), content.as_bytes())
    }

    fn save_audit(&self) -> Result<()> {
        let doc = AuditDoc {
            operations: self.audit_operations.clone(),
            updated_at: now_iso(),
        };
        let content = serde_json::to_string_pretty(&doc)?;
        write_atomic(&self.audit_path(), content.as_bytes())
    }

    fn generate_id(&self, stream: &str, seq: usize) -> String {
        let raw = format!("{}:{}-{}", stream, now_nanos(), seq);
        sha256_hex(raw.as_bytes())[..12].to_string()
    }

    /// Copy an item file into `.snapshots/`; returns the snapshot id, or
    /// `None` when the file does not exist (create-like operations).
    pub fn snapshot(&self, task_file: &Path) -> Option<String> {
        let content = fs::read(task_file).ok()?;
        let stem = task_file.file_stem()?.to_string_lossy().to_string();
        let snapshot_id = format!("{}-{}", stem, now_nanos());
        let snapshot_path = self.snapshots_dir().join(format!("{}.task", snapshot_id));
        write_atomic(&snapshot_path, &content).ok()?;
        Some(snapshot_id)
    }

    fn restore_snapshot(&self, snapshot_id: &str, task_file: &Path) -> bool {
        let snapshot_path = self.snapshots_dir().join(format!("{}.task", snapshot_id));
        let Ok(content) = fs::read(&snapshot_path) else {
            return false;
        };
        write_atomic(task_file, &content).is_ok()
    }

    pub fn load_snapshot_content(&self, snapshot_id: &str) -> Option<String> {
        let path = self.snapshots_dir().join(format!("{}.task", snapshot_id));
        fs::read_to_string(path).ok()
    }

    /// Remove snapshots not referenced by any retained operation.
    fn cleanup_orphan_snapshots(&self) {
        let mut active: FxHashSet<String> = FxHashSet::default();
        for op in &self.operations {
            if let Some(id) = &op.snapshot_id {
                active.insert(id.clone());
            }
            if let Some(id) = &op.after_snapshot_id {
                active.insert(id.clone());
            }
        }
        let Ok(entries) = fs::read_dir(self.snapshots_dir()) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|e| e != "task") {
                continue;
            }
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            if !active.contains(&stem) {
                let _ = fs::remove_file(&path);
            }
        }
    }

    fn rel_task_file(&self, task_file: &Path) -> Option<String> {
        task_file
            .strip_prefix(&self.storage_dir)
            .ok()
            .map(|rel| rel.to_string_lossy().replace('\\', "/"))
    }

    /// Record an audit-stream entry (non-undoable, snapshot-free).
    pub fn record_audit(
        &mut self,
        intent: &str,
        task_id: Option<&str>,
        data: Value,
        result: Option<Value>,
    ) -> Result<Operation> {
        let op = Operation {
            id: self.generate_id("audit", self.audit_operations.len()),
            timestamp: now_nanos() as f64 / 1e9,
            intent: intent.to_string(),
            task_id: task_id.map(|s| s.to_string()),
            data,
            stream: "audit".to_string(),
            effect: "read".to_string(),
            task_file: None,
            snapshot_id: None,
            after_snapshot_id: None,
            result,
            undone: false,
        };
        self.audit_operations.push(op.clone());
        if self.audit_operations.len() > MAX_HISTORY_SIZE {
            let excess = self.audit_operations.len() - MAX_HISTORY_SIZE;
            self.audit_operations.drain(0..excess);
        }
        self.save_audit()?;
        Ok(op)
    }

    /// Record an ops-stream entry. Truncates any redo tail, bounds the
    /// stream, and garbage-collects orphaned snapshots.
    pub fn record(
        &mut self,
        intent: &str,
        task_id: Option<&str>,
        data: Value,
        task_file: Option<&Path>,
        result: Option<Value>,
        before_snapshot_id: Option<String>,
    ) -> Result<Operation> {
        let task_file_rel = task_file.and_then(|p| self.rel_task_file(p));

        // Truncate redo history.
        let keep = (self.current_index + 1).max(0) as usize;
        if keep < self.operations.len() {
            self.operations.truncate(keep);
        }

        let op = Operation {
            id: self.generate_id("ops", self.operations.len()),
            timestamp: now_nanos() as f64 / 1e9,
            intent: intent.to_string(),
            task_id: task_id.map(|s| s.to_string()),
            data,
            stream: "ops".to_string(),
            effect: "write".to_string(),
            task_file: task_file_rel,
            snapshot_id: before_snapshot_id,
            after_snapshot_id: None,
            result,
            undone: false,
        };
        self.operations.push(op.clone());
        if self.operations.len() > MAX_HISTORY_SIZE {
            let excess = self.operations.len() - MAX_HISTORY_SIZE;
            self.operations.drain(0..excess);
        }
        self.current_index = self.operations.len() as i64 - 1;
        self.cleanup_orphan_snapshots();
        self.save()?;
        Ok(op)
    }

    pub fn can_undo(&self) -> bool {
        self.current_index >= 0
            && !self.operations[self.current_index as usize].undone
    }

    pub fn can_redo(&self) -> bool {
        self.current_index < self.operations.len() as i64 - 1
            || (self.current_index >= 0 && self.operations[self.current_index as usize].undone)
    }

    fn resolve_task_file(&self, op: &Operation) -> Option<PathBuf> {
        if let Some(rel) = &op.task_file {
            let candidate = self.storage_dir.join(rel);
            if !candidate.starts_with(&self.storage_dir) || rel.contains("..") {
                return None;
            }
            return Some(candidate);
        }
        let task_id = op.task_id.as_deref()?;
        Some(self.storage_dir.join(format!("{}.task", task_id)))
    }

    /// Undo the operation at the cursor.
    ///
    /// Create-like operations (no before snapshot) undo by deleting the file,
    /// taking an after-snapshot first so redo can restore it. Everything else
    /// restores the before snapshot.
    pub fn undo(&mut self) -> Result<Operation> {
        if !self.can_undo() {
            return Err(TaskplaneError::History("nothing to undo".to_string()));
        }
        let idx = self.current_index as usize;
        let op_snapshot = self.operations[idx].snapshot_id.clone();
        let op_intent = self.operations[idx].intent.clone();
        let has_task = self.operations[idx].task_id.is_some();
        let task_file = self.resolve_task_file(&self.operations[idx]);

        if op_snapshot.is_none() && has_task && matches!(op_intent.as_str(), "create" | "scaffold") {
            let Some(task_file) = task_file else {
                return Err(TaskplaneError::History(
                    "cannot resolve item file for undo".to_string(),
                ));
            };
            if !task_file.exists() {
                return Err(TaskplaneError::History(
                    "item file for undo not found".to_string(),
                ));
            }
            let after_id = self.snapshot(&task_file);
            fs::remove_file(&task_file).map_err(|e| {
                TaskplaneError::History(format!("failed to remove created file: {}", e))
            })?;
            self.operations[idx].after_snapshot_id = after_id;
        } else if let Some(snapshot_id) = &op_snapshot {
            let Some(task_file) = task_file else {
                return Err(TaskplaneError::History(
                    "cannot resolve item file for undo".to_string(),
                ));
            };
            if task_file.exists() {
                self.operations[idx].after_snapshot_id = self.snapshot(&task_file);
            }
            if !self.restore_snapshot(snapshot_id, &task_file) {
                return Err(TaskplaneError::History(format!(
                    "snapshot {} not found",
                    snapshot_id
                )));
            }
        }

        self.operations[idx].undone = true;
        self.current_index -= 1;
        self.save()?;
        Ok(self.operations[idx].clone())
    }

    /// Redo the next undone operation: restore its after snapshot.
    pub fn redo(&mut self) -> Result<Operation> {
        if !self.can_redo() {
            return Err(TaskplaneError::History("nothing to redo".to_string()));
        }
        let next_index = if self.current_index < 0 {
            0
        } else if self.current_index < self.operations.len() as i64 - 1 {
            (self.current_index + 1) as usize
        } else {
            self.current_index as usize
        };
        if !self.operations[next_index].undone {
            return Err(TaskplaneError::History("nothing to redo".to_string()));
        }
        self.current_index = next_index as i64;

        let after_id = self.operations[next_index].after_snapshot_id.clone();
        if let Some(after_id) = after_id {
            if self.operations[next_index].task_id.is_some() {
                let Some(task_file) = self.resolve_task_file(&self.operations[next_index]) else {
                    return Err(TaskplaneError::History(
                        "cannot resolve item file for redo".to_string(),
                    ));
                };
                if !self.restore_snapshot(&after_id, &task_file) {
                    return Err(TaskplaneError::History(format!(
                        "snapshot {} not found",
                        after_id
                    )));
                }
            }
        }

        self.operations[next_index].undone = false;
        self.save()?;
        Ok(self.operations[next_index].clone())
    }

    pub fn latest_id(&self) -> Option<String> {
        self.operations.last().map(|op| op.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_item(dir: &Path, id: &str, body: &str) -> PathBuf {
        let path = dir.join(format!("{}.task", id));
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_record_and_persist_roundtrip() {
        let tmp = tempdir().unwrap();
        let mut history = OperationHistory::open(tmp.path()).unwrap();
        let file = write_item(tmp.path(), "TASK-001", "v1");
        let before = history.snapshot(&file);
        let op = history
            .record("patch", Some("TASK-001"), json!({}), Some(&file), None, before)
            .unwrap();
        assert_eq!(op.id.len(), 12);
        assert_eq!(op.stream, "ops");

        let reopened = OperationHistory::open(tmp.path()).unwrap();
        assert_eq!(reopened.operations.len(), 1);
        assert_eq!(reopened.current_index, 0);
    }

    #[test]
    fn test_undo_redo_roundtrip_restores_content() {
        let tmp = tempdir().unwrap();
        let mut history = OperationHistory::open(tmp.path()).unwrap();
        let file = write_item(tmp.path(), "TASK-001", "v1");
        let before = history.snapshot(&file);
        fs::write(&file, "v2").unwrap();
        history
            .record("patch", Some("TASK-001"), json!({}), Some(&file), None, before)
            .unwrap();

        history.undo().unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "v1");
        history.redo().unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "v2");
    }

    #[test]
    fn test_create_like_undo_deletes_and_redo_restores() {
        let tmp = tempdir().unwrap();
        let mut history = OperationHistory::open(tmp.path()).unwrap();
        let file = write_item(tmp.path(), "TASK-001", "created");
        history
            .record("create", Some("TASK-001"), json!({}), Some(&file), None, None)
            .unwrap();

        history.undo().unwrap();
        assert!(!file.exists());
        history.redo().unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "created");
    }

    #[test]
    fn test_redo_tail_truncated_on_new_record() {
        let tmp = tempdir().unwrap();
        let mut history = OperationHistory::open(tmp.path()).unwrap();
        let file = write_item(tmp.path(), "TASK-001", "v1");
        for body in ["v2", "v3"] {
            let before = history.snapshot(&file);
            fs::write(&file, body).unwrap();
            history
                .record("patch", Some("TASK-001"), json!({}), Some(&file), None, before)
                .unwrap();
        }
        history.undo().unwrap();
        assert_eq!(history.operations.len(), 2);

        let before = history.snapshot(&file);
        fs::write(&file, "v4").unwrap();
        history
            .record("patch", Some("TASK-001"), json!({}), Some(&file), None, before)
            .unwrap();
        // The undone tail op was dropped.
        assert_eq!(history.operations.len(), 2);
        assert!(!history.can_redo());
    }

    #[test]
    fn test_bounds_and_snapshot_gc() {
        let tmp = tempdir().unwrap();
        let mut history = OperationHistory::open(tmp.path()).unwrap();
        let file = write_item(tmp.path(), "TASK-001", "v0");
        for i in 0..(MAX_HISTORY_SIZE + 10) {
            let before = history.snapshot(&file);
            fs::write(&file, format!("v{}", i + 1)).unwrap();
            history
                .record("patch", Some("TASK-001"), json!({}), Some(&file), None, before)
                .unwrap();
        }
        assert_eq!(history.operations.len(), MAX_HISTORY_SIZE);

        // Every snapshot on disk is referenced by a retained op.
        let referenced: std::collections::HashSet<String> = history
            .operations
            .iter()
            .filter_map(|op| op.snapshot_id.clone())
            .collect();
        for entry in fs::read_dir(tmp.path().join(SNAPSHOT_DIR)).unwrap().flatten() {
            let stem = entry
                .path()
                .file_stem()
                .unwrap()
                .to_string_lossy()
                .to_string();
            assert!(referenced.contains(&stem), "orphan snapshot {}", stem);
        }
    }

    #[test]
    fn test_audit_stream_is_separate_and_bounded() {
        let tmp = tempdir().unwrap();
        let mut history = OperationHistory::open(tmp.path()).unwrap();
        for _ in 0..(MAX_HISTORY_SIZE + 5) {
            history
                .record_audit("close_task", Some("TASK-001"), json!({}), None)
                .unwrap();
        }
        assert_eq!(history.audit_operations.len(), MAX_HISTORY_SIZE);
        assert!(history.operations.is_empty());
        assert!(!history.can_undo());
        let reopened = OperationHistory::open(tmp.path()).unwrap();
        assert_eq!(reopened.audit_operations.len(), MAX_HISTORY_SIZE);
    }

    #[test]
    fn test_nothing_to_undo_or_redo() {
        let tmp = tempdir().unwrap();
        let mut history = OperationHistory::open(tmp.path()).unwrap();
        assert!(history.undo().is_err());
        assert!(history.redo().is_err());
    }
}
