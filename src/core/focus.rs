//! The `.last` focus pointer.
//!
//! Focus is convenience, never magic: it only fills in a target id when the
//! caller omits one, and compatibility rules in the dispatcher decide whether
//! the stored id may be used for a given intent.

use crate::core::error::Result;
use crate::core::repo::write_atomic;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const FOCUS_FILE: &str = ".last";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FocusPointer {
    #[serde(default)]
    pub task: String,
    #[serde(default)]
    pub domain: String,
}

/// File-backed focus store rooted at the tasks directory.
#[derive(Debug, Clone)]
pub struct FocusStore {
    path: PathBuf,
}

impl FocusStore {
    pub fn new(tasks_root: &Path) -> FocusStore {
        FocusStore {
            path: tasks_root.join(FOCUS_FILE),
        }
    }

    /// Read the pointer; a missing or unparseable file reads as no focus.
    pub fn get(&self) -> Option<FocusPointer> {
        let content = fs::read_to_string(&self.path).ok()?;
        let pointer: FocusPointer = serde_json::from_str(&content).ok()?;
        if pointer.task.trim().is_empty() {
            return None;
        }
        Some(pointer)
    }

    pub fn set(&self, task: &str, domain: &str) -> Result<()> {
        let pointer = FocusPointer {
            task: task.trim().to_string(),
            domain: domain.trim().to_string(),
        };
        let content = serde_json::to_string(&pointer)?;
        write_atomic(&self.path, content.as_bytes())
    }

    pub fn clear(&self) -> Result<bool> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
            return Ok(true);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_focus_roundtrip() {
        let tmp = tempdir().unwrap();
        let store = FocusStore::new(tmp.path());
        assert!(store.get().is_none());
        store.set("TASK-001", "backend").unwrap();
        let pointer = store.get().unwrap();
        assert_eq!(pointer.task, "TASK-001");
        assert_eq!(pointer.domain, "backend");
        assert!(store.clear().unwrap());
        assert!(store.get().is_none());
        assert!(!store.clear().unwrap());
    }

    #[test]
    fn test_corrupt_focus_reads_as_none() {
        let tmp = tempdir().unwrap();
        std::fs::write(tmp.path().join(FOCUS_FILE), "not json").unwrap();
        let store = FocusStore::new(tmp.path());
        assert!(store.get().is_none());
    }
}
