//! Tasks-root resolution.
//!
//! Order: explicit directory > `APPLY_TASK_TASKS_DIR` environment override >
//! `~/.tasks/<namespace>`, where the namespace is `owner_repo` derived from
//! the project's `.git/config` origin url (read directly, no git subprocess),
//! falling back to the project directory name.

use std::path::{Path, PathBuf};

pub const TASKS_DIR_ENV: &str = "APPLY_TASK_TASKS_DIR";

/// Canonical global storage root (`~/.tasks`).
pub fn global_storage_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tasks")
}

/// Best-effort read of the origin remote url from `.git/config`.
fn git_remote_url(project_dir: &Path) -> Option<String> {
    let config = project_dir.join(".git").join("config");
    let content = std::fs::read_to_string(config).ok()?;

    let mut current_remote: Option<String> = None;
    let mut origin: Option<String> = None;
    let mut first: Option<String> = None;
    for raw in content.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            current_remote = line
                .strip_prefix("[remote \"")
                .and_then(|rest| rest.strip_suffix("\"]"))
                .map(|name| name.to_string());
            continue;
        }
        if let (Some(remote), Some(url)) = (&current_remote, line.strip_prefix("url = ")) {
            let url = url.trim().to_string();
            if remote == "origin" && origin.is_none() {
                origin = Some(url.clone());
            }
            if first.is_none() {
                first = Some(url);
            }
        }
    }
    origin.or(first)
}

/// Derive `owner_repo` from a remote url (https, ssh, or scp-like forms).
fn namespace_from_remote_url(url: &str) -> Option<String> {
    let raw = url.trim();
    if raw.is_empty() {
        return None;
    }
    let path = if let Some(idx) = raw.find("://") {
        // scheme://host/owner/repo(.git)
        let rest = &raw[idx + 3..];
        rest.split_once('/').map(|(_, p)| p).unwrap_or("")
    } else if raw.contains('@') && raw.contains(':') {
        // scp-like: git@host:owner/repo.git
        raw.split_once(':').map(|(_, p)| p).unwrap_or("")
    } else {
        raw
    };
    let parts: Vec<&str> = path
        .trim_matches('/')
        .split('/')
        .filter(|p| !p.is_empty())
        .collect();
    if parts.len() < 2 {
        return None;
    }
    let owner = parts[parts.len() - 2];
    let repo = parts[parts.len() - 1]
        .strip_suffix(".git")
        .unwrap_or(parts[parts.len() - 1]);
    if owner.is_empty() || repo.is_empty() {
        return None;
    }
    Some(format!("{}_{}", owner, repo))
}

/// Derive the project namespace: git origin `owner_repo` or the dir name.
pub fn project_namespace(project_dir: &Path) -> String {
    git_remote_url(project_dir)
        .as_deref()
        .and_then(namespace_from_remote_url)
        .unwrap_or_else(|| {
            project_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "default".to_string())
        })
}

/// Resolve the tasks root for a project, honoring the env override.
pub fn resolve_tasks_dir(explicit: Option<&Path>, project_dir: &Path) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    if let Ok(env_dir) = std::env::var(TASKS_DIR_ENV) {
        let trimmed = env_dir.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    global_storage_dir().join(project_namespace(project_dir))
}
