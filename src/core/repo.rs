//! File-backed item repository.
//!
//! One `.task` file per item, optionally nested under `domain` sub-folders.
//! Every write goes through a temp file + fsync + atomic rename; every
//! persisted save bumps the item's `revision` by exactly one. Path resolution
//! is a hard security boundary: ids and domains that could escape the root
//! are rejected before any filesystem access.

use crate::core::error::{Result, TaskplaneError};
use crate::core::ident::id_error;
use crate::core::item::{Item, Status};
use crate::core::taskfile;
use crate::core::time::{now_iso, now_nanos};
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

pub const TASK_FILE_EXT: &str = "task";

/// Directories under the root that hold engine state, never items.
pub const RESERVED_DIRS: [&str; 3] = [".snapshots", ".artifacts", ".trash"];

#[derive(Debug, Clone)]
pub struct Repository {
    root: PathBuf,
}

impl Repository {
    pub fn new(root: &Path) -> Result<Repository> {
        fs::create_dir_all(root)?;
        Ok(Repository {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Normalize a domain sub-path. Rejects absolute paths, `..`, and `\`.
    pub fn sanitize_domain(domain: &str) -> Result<String> {
        let trimmed = domain.trim().trim_matches('/');
        if trimmed.is_empty() {
            return Ok(String::new());
        }
        if trimmed.contains('\\') {
            return Err(TaskplaneError::Path(format!(
                "invalid domain: {}",
                domain
            )));
        }
        let candidate = Path::new(trimmed);
        if candidate.is_absolute() {
            return Err(TaskplaneError::Path(format!(
                "invalid domain: {}",
                domain
            )));
        }
        for comp in candidate.components() {
            match comp {
                Component::Normal(part) => {
                    if part.to_string_lossy().starts_with('.') {
                        return Err(TaskplaneError::Path(format!(
                            "invalid domain: {}",
                            domain
                        )));
                    }
                }
                _ => {
                    return Err(TaskplaneError::Path(format!(
                        "invalid domain: {}",
                        domain
                    )));
                }
            }
        }
        Ok(trimmed.replace('\\', "/"))
    }

    /// Resolve an item file path inside the root. The result is always
    /// relative to the root by construction; violations fail loudly.
    pub fn resolve_path(&self, id: &str, domain: &str) -> Result<PathBuf> {
        if let Some(problem) = id_error(id) {
            return Err(TaskplaneError::Path(format!("invalid id: {}", problem)));
        }
        let domain = Self::sanitize_domain(domain)?;
        let base = if domain.is_empty() {
            self.root.clone()
        } else {
            self.root.join(&domain)
        };
        let resolved = base.join(format!("{}.{}", id.trim(), TASK_FILE_EXT));
        if !resolved.starts_with(&self.root) {
            return Err(TaskplaneError::Path(format!(
                "path escapes tasks root: {}",
                resolved.display()
            )));
        }
        Ok(resolved)
    }

    fn is_reserved(path: &Path, root: &Path) -> bool {
        path.strip_prefix(root)
            .map(|rel| {
                rel.components().any(|c| match c {
                    Component::Normal(part) => part.to_string_lossy().starts_with('.'),
                    _ => false,
                })
            })
            .unwrap_or(true)
    }

    /// All item files below the root, skipping engine-state directories.
    fn walk_task_files(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            let mut entries: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
            entries.sort();
            for path in entries {
                if path.is_dir() {
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default();
                    if name.starts_with('.') {
                        continue;
                    }
                    stack.push(path);
                } else if path.extension().is_some_and(|e| e == TASK_FILE_EXT)
                    && !Self::is_reserved(&path, &self.root)
                {
                    out.push(path);
                }
            }
        }
        out.sort();
        out
    }

    fn assign_domain(&self, item: &mut Item, path: &Path) {
        if !item.domain.is_empty() {
            return;
        }
        if let Some(parent) = path.parent() {
            if let Ok(rel) = parent.strip_prefix(&self.root) {
                let rel = rel.to_string_lossy().replace('\\', "/");
                item.domain = rel;
            }
        }
    }

    fn parse_file(&self, path: &Path) -> Option<Item> {
        let content = fs::read_to_string(path).ok()?;
        let mut item = taskfile::parse(&content).ok()?;
        self.assign_domain(&mut item, path);
        Some(item)
    }

    /// Load an item by id. When `domain` is empty or the direct path misses,
    /// falls back to a recursive search. Auto-promotes DONE for unblocked
    /// tasks at 100% progress (persisted, so the promotion is visible to the
    /// next reader too).
    pub fn load(&self, id: &str, domain: &str) -> Result<Option<Item>> {
        let path = self.resolve_path(id, domain)?;
        let mut found: Option<Item> = None;
        if path.exists() {
            found = self.parse_file(&path);
        }
        if found.is_none() {
            let needle = format!("{}.{}", id.trim(), TASK_FILE_EXT);
            for candidate in self.walk_task_files() {
                if candidate.file_name().is_some_and(|n| n == needle.as_str()) {
                    if let Some(item) = self.parse_file(&candidate) {
                        found = Some(item);
                        break;
                    }
                }
            }
        }
        let Some(mut item) = found else {
            return Ok(None);
        };
        if item.is_task()
            && item.has_subtasks()
            && !item.blocked
            && !item.status_manual
            && item.status != Status::Done
            && item.progress() == 100
        {
            item.status = Status::Done;
            self.save(&mut item)?;
        }
        Ok(Some(item))
    }

    /// Persist an item atomically, bumping `revision` by exactly 1.
    pub fn save(&self, item: &mut Item) -> Result<()> {
        item.domain = Self::sanitize_domain(&item.domain)?;
        item.updated = now_iso();
        item.update_status_from_progress();
        item.revision += 1;
        let path = self.resolve_path(&item.id, &item.domain)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = taskfile::serialize(item)?;
        write_atomic(&path, content.as_bytes())?;
        Ok(())
    }

    /// Enumerate items, optionally restricted to a domain sub-tree.
    pub fn list(&self, domain: &str) -> Result<Vec<Item>> {
        let domain = Self::sanitize_domain(domain)?;
        let prefix = if domain.is_empty() {
            self.root.clone()
        } else {
            self.root.join(&domain)
        };
        let mut items: Vec<Item> = self
            .walk_task_files()
            .into_iter()
            .filter(|p| p.starts_with(&prefix))
            .filter_map(|p| self.parse_file(&p))
            .collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(items)
    }

    /// Next free id for a prefix (`TASK` / `PLAN`), scanning numeric suffixes.
    pub fn next_id(&self, prefix: &str) -> String {
        let mut max_num = 0u64;
        for path in self.walk_task_files() {
            let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                continue;
            };
            if let Some(rest) = stem.strip_prefix(&format!("{}-", prefix)) {
                if let Ok(num) = rest.parse::<u64>() {
                    max_num = max_num.max(num);
                }
            }
        }
        format!("{}-{:03}", prefix, max_num + 1)
    }

    /// Delete an item file. Falls back to a recursive search on a miss.
    pub fn delete(&self, id: &str, domain: &str) -> Result<bool> {
        let path = self.resolve_path(id, domain)?;
        let mut candidates = vec![path.clone()];
        if !path.exists() {
            let needle = format!("{}.{}", id.trim(), TASK_FILE_EXT);
            candidates = self
                .walk_task_files()
                .into_iter()
                .filter(|p| p.file_name().is_some_and(|n| n == needle.as_str()))
                .collect();
        }
        let mut deleted = false;
        for candidate in candidates {
            if fs::remove_file(&candidate).is_ok() {
                deleted = true;
            }
        }
        Ok(deleted)
    }

    /// Move an item to a new domain: write at the new path, remove the old.
    pub fn move_item(&self, id: &str, new_domain: &str) -> Result<bool> {
        let new_domain = Self::sanitize_domain(new_domain)?;
        let Some(mut item) = self.load(id, "")? else {
            return Ok(false);
        };
        let old_path = self.resolve_path(&item.id, &item.domain)?;
        item.domain = new_domain;
        self.save(&mut item)?;
        let new_path = self.resolve_path(&item.id, &item.domain)?;
        if old_path.exists() && old_path != new_path {
            let _ = fs::remove_file(&old_path);
        }
        Ok(true)
    }

    /// Move every item whose relative path matches the glob pattern.
    pub fn move_glob(&self, pattern: &str, new_domain: &str) -> Result<usize> {
        let mut moved = 0;
        for path in self.walk_task_files() {
            let rel = path.strip_prefix(&self.root).unwrap_or(&path);
            if glob_match(pattern, &rel.to_string_lossy()) {
                if let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().to_string()) {
                    if self.move_item(&stem, new_domain)? {
                        moved += 1;
                    }
                }
            }
        }
        Ok(moved)
    }

    /// Delete every item whose relative path matches the glob pattern.
    pub fn delete_glob(&self, pattern: &str) -> Result<usize> {
        let mut removed = 0;
        for path in self.walk_task_files() {
            let rel = path.strip_prefix(&self.root).unwrap_or(&path);
            if glob_match(pattern, &rel.to_string_lossy()) && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Delete items matching tag/status filters; returns (matched ids, removed).
    pub fn clean_filtered(&self, tag: &str, status: &str) -> Result<(Vec<String>, usize)> {
        let norm_tag = tag.trim().to_lowercase();
        let norm_status = status.trim().to_uppercase();
        let mut matched = Vec::new();
        let mut removed = 0;
        for path in self.walk_task_files() {
            let Some(item) = self.parse_file(&path) else {
                continue;
            };
            if !norm_tag.is_empty() {
                let tags: Vec<String> = item.tags.iter().map(|t| t.trim().to_lowercase()).collect();
                if !tags.contains(&norm_tag) {
                    continue;
                }
            }
            if !norm_status.is_empty() && item.status.name() != norm_status {
                continue;
            }
            matched.push(item.id.clone());
            if fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        Ok((matched, removed))
    }

    /// XOR of item-file mtime nanoseconds; renderers use it to detect change.
    pub fn compute_signature(&self) -> u128 {
        let mut sig: u128 = 0;
        for path in self.walk_task_files() {
            if let Ok(meta) = fs::metadata(&path) {
                if let Ok(mtime) = meta.modified() {
                    if let Ok(dur) = mtime.duration_since(std::time::UNIX_EPOCH) {
                        sig ^= dur.as_nanos();
                    }
                }
            }
        }
        if sig == 0 { now_nanos() } else { sig }
    }
}

/// Write bytes atomically: temp sibling + fsync + rename.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| TaskplaneError::Path(format!("no parent dir: {}", path.display())))?;
    fs::create_dir_all(parent)?;
    let tmp = parent.join(format!(
        ".{}.{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        now_nanos()
    ));
    let result = (|| -> Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();
    if result.is_err() && tmp.exists() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Segment-wise glob match: `*` and `?` within a segment, and patterns match
/// the trailing segments of the path (relative patterns anchor from the right).
fn glob_match(pattern: &str, path: &str) -> bool {
    fn segment_match(pat: &str, text: &str) -> bool {
        let pat: Vec<char> = pat.chars().collect();
        let text: Vec<char> = text.chars().collect();
        // Classic iterative wildcard match with backtracking on '*'.
        let (mut p, mut t) = (0usize, 0usize);
        let (mut star, mut mark) = (usize::MAX, 0usize);
        while t < text.len() {
            if p < pat.len() && (pat[p] == '?' || pat[p] == text[t]) {
                p += 1;
                t += 1;
            } else if p < pat.len() && pat[p] == '*' {
                star = p;
                mark = t;
                p += 1;
            } else if star != usize::MAX {
                p = star + 1;
                mark += 1;
                t = mark;
            } else {
                return false;
            }
        }
        while p < pat.len() && pat[p] == '*' {
            p += 1;
        }
        p == pat.len()
    }

    let normalized = path.replace('\\', "/");
    let pat_segs: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path_segs: Vec<&str> = normalized.split('/').filter(|s| !s.is_empty()).collect();
    if pat_segs.is_empty() || pat_segs.len() > path_segs.len() {
        return false;
    }
    let offset = path_segs.len() - pat_segs.len();
    pat_segs
        .iter()
        .zip(path_segs[offset..].iter())
        .all(|(p, t)| segment_match(p, t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::item::{Item, ItemKind};
    use crate::core::step::Step;
    use tempfile::tempdir;

    fn repo() -> (tempfile::TempDir, Repository) {
        let tmp = tempdir().unwrap();
        let repo = Repository::new(tmp.path()).unwrap();
        (tmp, repo)
    }

    #[test]
    fn test_save_bumps_revision_every_time() {
        let (_tmp, repo) = repo();
        let mut item = Item::new("TASK-001", ItemKind::Task, "t");
        repo.save(&mut item).unwrap();
        assert_eq!(item.revision, 1);
        repo.save(&mut item).unwrap();
        assert_eq!(item.revision, 2);
        let loaded = repo.load("TASK-001", "").unwrap().unwrap();
        assert_eq!(loaded.revision, 2);
    }

    #[test]
    fn test_load_falls_back_to_recursive_search() {
        let (_tmp, repo) = repo();
        let mut item = Item::new("TASK-001", ItemKind::Task, "t");
        item.domain = "backend/api".into();
        repo.save(&mut item).unwrap();
        let loaded = repo.load("TASK-001", "").unwrap().unwrap();
        assert_eq!(loaded.domain, "backend/api");
    }

    #[test]
    fn test_path_safety_rejections() {
        let (_tmp, repo) = repo();
        assert!(repo.resolve_path("../evil", "").is_err());
        assert!(repo.resolve_path("a/b", "").is_err());
        assert!(repo.resolve_path("a\\b", "").is_err());
        assert!(Repository::sanitize_domain("../up").is_err());
        assert!(Repository::sanitize_domain("/abs").is_err());
        assert!(Repository::sanitize_domain("ok/nested").is_ok());
        assert!(Repository::sanitize_domain(".snapshots").is_err());
    }

    #[test]
    fn test_list_skips_reserved_dirs() {
        let (tmp, repo) = repo();
        let mut item = Item::new("TASK-001", ItemKind::Task, "t");
        repo.save(&mut item).unwrap();
        let snapdir = tmp.path().join(".snapshots");
        fs::create_dir_all(&snapdir).unwrap();
        fs::write(snapdir.join("TASK-001-123.task"), "{}").unwrap();
        let items = repo.list("").unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn test_next_id_scans_suffixes() {
        let (_tmp, repo) = repo();
        assert_eq!(repo.next_id("TASK"), "TASK-001");
        let mut a = Item::new("TASK-007", ItemKind::Task, "a");
        repo.save(&mut a).unwrap();
        let mut b = Item::new("PLAN-002", ItemKind::Plan, "b");
        repo.save(&mut b).unwrap();
        assert_eq!(repo.next_id("TASK"), "TASK-008");
        assert_eq!(repo.next_id("PLAN"), "PLAN-003");
    }

    #[test]
    fn test_load_auto_promotes_done() {
        let (_tmp, repo) = repo();
        let mut item = Item::new("TASK-001", ItemKind::Task, "t");
        let mut step = Step::new("s", &["c".to_string()], &[], &[]).unwrap();
        step.completed = true;
        item.steps.push(step);
        item.status = Status::Active;
        item.status_manual = true; // block the save-time promotion
        repo.save(&mut item).unwrap();

        // Flip the manual pin off on disk, then reload.
        let path = repo.resolve_path("TASK-001", "").unwrap();
        let content = fs::read_to_string(&path).unwrap();
        let content = content.replace("\"status_manual\": true", "\"status_manual\": false");
        fs::write(&path, content).unwrap();

        let loaded = repo.load("TASK-001", "").unwrap().unwrap();
        assert_eq!(loaded.status, Status::Done);
    }

    #[test]
    fn test_move_and_delete() {
        let (_tmp, repo) = repo();
        let mut item = Item::new("TASK-001", ItemKind::Task, "t");
        repo.save(&mut item).unwrap();
        assert!(repo.move_item("TASK-001", "infra").unwrap());
        assert!(!repo.resolve_path("TASK-001", "").unwrap().exists());
        assert!(repo.resolve_path("TASK-001", "infra").unwrap().exists());
        assert!(repo.delete("TASK-001", "").unwrap());
        assert!(repo.list("").unwrap().is_empty());
    }

    #[test]
    fn test_glob_match_segments() {
        assert!(glob_match("TASK-*.task", "TASK-001.task"));
        assert!(glob_match("TASK-*.task", "backend/TASK-001.task"));
        assert!(glob_match("backend/*.task", "backend/TASK-001.task"));
        assert!(!glob_match("frontend/*.task", "backend/TASK-001.task"));
        assert!(!glob_match("*.json", "TASK-001.task"));
    }

    #[test]
    fn test_compute_signature_changes_on_write() {
        let (_tmp, repo) = repo();
        let mut item = Item::new("TASK-001", ItemKind::Task, "t");
        repo.save(&mut item).unwrap();
        let sig = repo.compute_signature();
        assert_ne!(sig, 0);
    }
}
