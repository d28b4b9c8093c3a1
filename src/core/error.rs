//! Error types for Taskplane operations.
//!
//! This module defines the canonical error type used throughout Taskplane.
//! All fallible core paths return `Result<T, TaskplaneError>`; the intent
//! dispatcher converts these into structured error responses and never lets
//! them escape as panics.

use std::io;
use thiserror::Error;

/// Canonical error type for all Taskplane core operations.
///
/// Uses `thiserror` for automatic `Display` and `Error` trait implementations.
/// I/O and JSON errors auto-convert via `#[from]`.
#[derive(Error, Debug)]
pub enum TaskplaneError {
    /// I/O error (auto-converts from `std::io::Error`)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON encode/decode error (auto-converts from `serde_json::Error`)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Path resolution or traversal-safety violation
    #[error("Path error: {0}")]
    Path(String),

    /// Payload or state validation failure
    #[error("Validation error: {0}")]
    Validation(String),

    /// Resource not found (missing file, item, snapshot, etc.)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation history failure (undo/redo, snapshot bookkeeping)
    #[error("History error: {0}")]
    History(String),
}

pub type Result<T> = std::result::Result<T, TaskplaneError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_error_display() {
        let err = TaskplaneError::Path("escapes root".to_string());
        assert_eq!(format!("{}", err), "Path error: escapes root");
    }

    #[test]
    fn test_not_found_display() {
        let err = TaskplaneError::NotFound("TASK-001".to_string());
        assert_eq!(format!("{}", err), "Not found: TASK-001");
    }

    #[test]
    fn test_history_error_display() {
        let err = TaskplaneError::History("snapshot missing".to_string());
        assert_eq!(format!("{}", err), "History error: snapshot missing");
    }
}
