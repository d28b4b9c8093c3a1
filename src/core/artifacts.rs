//! Content-addressed artifact store under `<root>/.artifacts/`.
//!
//! Blobs are named by their SHA-256 digest, so identical content dedups to a
//! single file and re-writing is a no-op. Writes use a temp sibling + fsync +
//! rename; a crash can leave a temp file behind but never a half-written
//! target.

use crate::core::error::{Result, TaskplaneError};
use crate::core::evidence::sha256_hex;
use crate::core::time::now_nanos;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const ARTIFACTS_DIRNAME: &str = ".artifacts";

/// Max artifact payload accepted before UTF-8 truncation (applied by callers).
pub const MAX_ARTIFACT_BYTES: usize = 256_000;

pub fn artifacts_dir(tasks_root: &Path) -> PathBuf {
    tasks_root.join(ARTIFACTS_DIRNAME)
}

/// Write a content-addressed artifact. Returns `(uri, size, sha256)`.
///
/// The uri is root-relative (`.artifacts/<digest>.<ext>`). An existing target
/// short-circuits: content addressing makes the write idempotent.
pub fn write_artifact(tasks_root: &Path, content: &[u8], ext: &str) -> Result<(String, usize, String)> {
    let digest = sha256_hex(content);
    let extension = {
        let cleaned = ext.trim().trim_start_matches('.').to_lowercase();
        if cleaned.is_empty() {
            "bin".to_string()
        } else {
            cleaned
        }
    };
    if extension.contains('/') || extension.contains('\\') || extension.contains("..") {
        return Err(TaskplaneError::Path(format!(
            "invalid artifact extension: {}",
            ext
        )));
    }

    let dir = artifacts_dir(tasks_root);
    fs::create_dir_all(&dir)?;
    let filename = format!("{}.{}", digest, extension);
    let target = dir.join(&filename);

    if !target.exists() {
        let tmp = dir.join(format!(".{}.{}.tmp", digest, now_nanos()));
        let result = (|| -> Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(content)?;
            file.sync_all()?;
            fs::rename(&tmp, &target)?;
            Ok(())
        })();
        if result.is_err() && tmp.exists() {
            let _ = fs::remove_file(&tmp);
        }
        result?;
    }

    let uri = format!("{}/{}", ARTIFACTS_DIRNAME, filename);
    Ok((uri, content.len(), digest))
}

/// Truncate text to a UTF-8-safe byte budget. Returns `(text, truncated, original_len)`.
pub fn truncate_utf8(text: &str, max_bytes: usize) -> (String, bool, usize) {
    let raw = text.as_bytes();
    if raw.len() <= max_bytes {
        return (text.to_string(), false, raw.len());
    }
    let mut cut = max_bytes;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    (text[..cut].to_string(), true, raw.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_artifact_dedups_by_content() {
        let tmp = tempdir().unwrap();
        let (uri_a, size_a, sha_a) = write_artifact(tmp.path(), b"hello", "json").unwrap();
        let (uri_b, size_b, sha_b) = write_artifact(tmp.path(), b"hello", "json").unwrap();
        assert_eq!(uri_a, uri_b);
        assert_eq!(size_a, 5);
        assert_eq!(size_b, 5);
        assert_eq!(sha_a, sha_b);
        let files: Vec<_> = std::fs::read_dir(artifacts_dir(tmp.path()))
            .unwrap()
            .collect();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_write_artifact_defaults_extension() {
        let tmp = tempdir().unwrap();
        let (uri, _, _) = write_artifact(tmp.path(), b"x", "  ").unwrap();
        assert!(uri.ends_with(".bin"));
        assert!(write_artifact(tmp.path(), b"x", "a/b").is_err());
    }

    #[test]
    fn test_truncate_utf8_respects_boundaries() {
        let (out, truncated, original) = truncate_utf8("héllo", 3);
        assert!(truncated);
        assert_eq!(original, 6);
        assert!(out.len() <= 3);
        assert!(std::str::from_utf8(out.as_bytes()).is_ok());

        let (out, truncated, _) = truncate_utf8("abc", 10);
        assert_eq!(out, "abc");
        assert!(!truncated);
    }
}
