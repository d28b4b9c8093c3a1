//! Best-effort evidence collectors.
//!
//! These enrich verification with ambient facts (CI run identity, git HEAD
//! state). They are strictly optional: they never collect secrets, never
//! block for long (2s subprocess cap), and never fail the caller.

use crate::core::evidence::VerificationCheck;
use serde_json::json;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

const GIT_TIMEOUT: Duration = Duration::from_secs(2);

fn is_truthy(value: Option<String>) -> bool {
    matches!(
        value.unwrap_or_default().trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_var(name: &str) -> String {
    std::env::var(name).unwrap_or_default().trim().to_string()
}

/// CI identity from GitHub Actions environment variables, when present.
pub fn collect_github_actions_check() -> Option<VerificationCheck> {
    if !is_truthy(std::env::var("GITHUB_ACTIONS").ok()) {
        return None;
    }
    let sha = env_var("GITHUB_SHA");
    let repository = env_var("GITHUB_REPOSITORY");
    let run_id = env_var("GITHUB_RUN_ID");
    let server_url = {
        let raw = env_var("GITHUB_SERVER_URL");
        if raw.is_empty() {
            "https://github.com".to_string()
        } else {
            raw
        }
    };
    let workflow = env_var("GITHUB_WORKFLOW");
    let ref_name = {
        let raw = env_var("GITHUB_REF_NAME");
        if raw.is_empty() { env_var("GITHUB_REF") } else { raw }
    };
    let run_attempt = env_var("GITHUB_RUN_ATTEMPT");

    let run_url = if !repository.is_empty() && !run_id.is_empty() {
        format!(
            "{}/{}/actions/runs/{}",
            server_url.trim_end_matches('/'),
            repository,
            run_id
        )
    } else {
        String::new()
    };

    let mut details = serde_json::Map::new();
    for (key, value) in [
        ("sha", &sha),
        ("repository", &repository),
        ("run_id", &run_id),
        ("run_url", &run_url),
        ("workflow", &workflow),
        ("ref", &ref_name),
        ("run_attempt", &run_attempt),
    ] {
        if !value.is_empty() {
            details.insert(key.to_string(), json!(value));
        }
    }

    let short = if sha.len() >= 12 { &sha[..12] } else { &sha };
    let preview = format!("github_actions run {} {}", run_id, short)
        .trim()
        .to_string();
    VerificationCheck::from_value(&json!({
        "kind": "ci",
        "spec": "github_actions",
        "outcome": "info",
        "preview": preview,
        "details": details,
    }))
    .ok()
}

/// Run a git command with a hard timeout. Returns trimmed stdout on success.
fn run_git(args: &[&str], cwd: &Path) -> Option<String> {
    let mut child = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .stdin(Stdio::null())
        .spawn()
        .ok()?;

    let deadline = Instant::now() + GIT_TIMEOUT;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                if !status.success() {
                    return None;
                }
                break;
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return None;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(_) => return None,
        }
    }
    let mut out = String::new();
    use std::io::Read;
    child.stdout.take()?.read_to_string(&mut out).ok()?;
    Some(out.trim().to_string())
}

/// Git HEAD state for the project root, when it is a git checkout.
pub fn collect_git_check(project_root: &Path) -> Option<VerificationCheck> {
    if !project_root.exists() {
        return None;
    }
    let sha = run_git(&["rev-parse", "HEAD"], project_root)?;
    let branch =
        run_git(&["rev-parse", "--abbrev-ref", "HEAD"], project_root).unwrap_or_else(|| "HEAD".into());
    let status = run_git(&["status", "--porcelain"], project_root).unwrap_or_default();
    let dirty = !status.trim().is_empty();
    let changed = status.lines().filter(|l| !l.trim().is_empty()).count();
    let describe = run_git(&["describe", "--always", "--dirty"], project_root).unwrap_or_default();

    let short = if sha.len() >= 12 { &sha[..12] } else { &sha };
    let preview = format!("git {} {}", short, if dirty { "dirty" } else { "clean" });
    VerificationCheck::from_value(&json!({
        "kind": "git",
        "spec": "head",
        "outcome": "info",
        "preview": preview,
        "details": {
            "sha": sha,
            "branch": branch,
            "dirty": dirty,
            "changed_files": changed,
            "describe": describe,
        },
    }))
    .ok()
}

/// All automatic checks that apply in the current environment.
pub fn collect_auto_verification_checks(project_root: &Path) -> Vec<VerificationCheck> {
    let mut checks = Vec::new();
    if let Some(ci) = collect_github_actions_check() {
        checks.push(ci);
    }
    if let Some(git) = collect_git_check(project_root) {
        checks.push(git);
    }
    checks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_check_absent_outside_checkout() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(collect_git_check(tmp.path()).is_none());
    }

    #[test]
    fn test_collectors_never_panic() {
        let tmp = tempfile::tempdir().unwrap();
        let _ = collect_auto_verification_checks(tmp.path());
    }
}
