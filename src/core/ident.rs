//! Identifier and step-path grammars.
//!
//! Two small closed grammars guard every addressable thing in the engine:
//!
//! - Item/node ids: `^[A-Za-z0-9_-]{1,64}$` (canonical forms `PLAN-###`,
//!   `TASK-###`, `STEP-…`, `NODE-…`, but ids are otherwise opaque).
//! - Step paths: `s:<n>` segments optionally descending through embedded
//!   task nodes, e.g. `s:0.t:1.s:2`. A path ending in `s:<n>` addresses a
//!   step; a path ending in `t:<n>` addresses a task node. Nesting is capped
//!   at [`MAX_NESTING_DEPTH`] segments.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const MAX_ID_LENGTH: usize = 64;
pub const MAX_NESTING_DEPTH: usize = 24;

/// Validate an item/node id against the id grammar.
///
/// Returns a human-readable problem description, or `None` when valid.
pub fn id_error(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        return Some("id is empty".to_string());
    }
    if value.len() > MAX_ID_LENGTH {
        return Some(format!("id too long (max {})", MAX_ID_LENGTH));
    }
    if value.contains("..") || value.contains('/') || value.contains('\\') {
        return Some("id contains path characters".to_string());
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Some("id must contain only letters/digits/_/-".to_string());
    }
    None
}

pub fn is_valid_id(value: &str) -> bool {
    id_error(value).is_none()
}

/// One segment of a step path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Seg {
    /// `s:<n>` — index into a step list.
    Step(usize),
    /// `t:<n>` — index into a plan node's task list.
    Node(usize),
}

/// A parsed step path: alternating `s:`/`t:` segments starting with `s:`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepPath {
    segs: Vec<Seg>,
}

impl StepPath {
    /// Parse a raw path string, enforcing grammar and nesting depth.
    pub fn parse(raw: &str) -> Result<StepPath, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("path is empty".to_string());
        }
        if raw.len() > 128 {
            return Err("path too long".to_string());
        }
        if raw.contains("..") || raw.contains('/') || raw.contains('\\') {
            return Err("path contains path characters".to_string());
        }
        let mut segs = Vec::new();
        for (pos, part) in raw.split('.').enumerate() {
            let (tag, num) = part
                .split_once(':')
                .ok_or_else(|| "path must use s:<n> / t:<n> segments".to_string())?;
            let idx: usize = num
                .parse()
                .map_err(|_| "path segment index must be a number".to_string())?;
            let seg = match tag {
                "s" => Seg::Step(idx),
                "t" => Seg::Node(idx),
                _ => return Err("path segments must be s:<n> or t:<n>".to_string()),
            };
            // Alternation: s at even positions, t at odd positions.
            let expects_step = pos % 2 == 0;
            match (expects_step, seg) {
                (true, Seg::Step(_)) | (false, Seg::Node(_)) => {}
                _ => return Err("path must be s:0 or s:0.t:1.s:2 shaped".to_string()),
            }
            segs.push(seg);
        }
        if segs.len() > MAX_NESTING_DEPTH {
            return Err(format!("path too deep (max {})", MAX_NESTING_DEPTH));
        }
        Ok(StepPath { segs })
    }

    /// Parse and require the path to address a step (`… s:<n>`).
    pub fn parse_step(raw: &str) -> Result<StepPath, String> {
        let path = StepPath::parse(raw)?;
        if !path.is_step_path() {
            return Err("path must address a step (ends with s:<n>)".to_string());
        }
        Ok(path)
    }

    /// Parse and require the path to address a task node (`… t:<n>`).
    pub fn parse_node(raw: &str) -> Result<StepPath, String> {
        let path = StepPath::parse(raw)?;
        if !path.is_node_path() {
            return Err("path must address a task node (ends with t:<n>)".to_string());
        }
        Ok(path)
    }

    pub fn segments(&self) -> &[Seg] {
        &self.segs
    }

    pub fn is_step_path(&self) -> bool {
        matches!(self.segs.last(), Some(Seg::Step(_)))
    }

    pub fn is_node_path(&self) -> bool {
        matches!(self.segs.last(), Some(Seg::Node(_)))
    }

    /// Build a child step path by appending `s:<idx>`.
    pub fn child_step(&self, idx: usize) -> StepPath {
        let mut segs = self.segs.clone();
        segs.push(Seg::Step(idx));
        StepPath { segs }
    }

    /// Build a child node path by appending `t:<idx>`.
    pub fn child_node(&self, idx: usize) -> StepPath {
        let mut segs = self.segs.clone();
        segs.push(Seg::Node(idx));
        StepPath { segs }
    }

    /// Root-level step path `s:<idx>`.
    pub fn root_step(idx: usize) -> StepPath {
        StepPath {
            segs: vec![Seg::Step(idx)],
        }
    }
}

impl fmt::Display for StepPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.segs.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            match seg {
                Seg::Step(n) => write!(f, "s:{}", n)?,
                Seg::Node(n) => write!(f, "t:{}", n)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_grammar() {
        assert!(is_valid_id("TASK-001"));
        assert!(is_valid_id("PLAN-042"));
        assert!(is_valid_id("opaque_id-1"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("a/b"));
        assert!(!is_valid_id("a\\b"));
        assert!(!is_valid_id(".."));
        assert!(!is_valid_id(&"x".repeat(65)));
        assert!(!is_valid_id("has space"));
    }

    #[test]
    fn test_path_roundtrip() {
        for raw in ["s:0", "s:0.t:1", "s:0.t:1.s:2", "s:3.t:0.s:1.t:2"] {
            let path = StepPath::parse(raw).unwrap();
            assert_eq!(path.to_string(), raw);
        }
    }

    #[test]
    fn test_path_alternation_enforced() {
        assert!(StepPath::parse("t:0").is_err());
        assert!(StepPath::parse("s:0.s:1").is_err());
        assert!(StepPath::parse("s:0.t:1.t:2").is_err());
        assert!(StepPath::parse("s:x").is_err());
        assert!(StepPath::parse("s:0..t:1").is_err());
    }

    #[test]
    fn test_path_kind_checks() {
        assert!(StepPath::parse_step("s:0.t:1.s:2").is_ok());
        assert!(StepPath::parse_step("s:0.t:1").is_err());
        assert!(StepPath::parse_node("s:0.t:1").is_ok());
        assert!(StepPath::parse_node("s:0").is_err());
    }

    #[test]
    fn test_path_depth_cap() {
        let mut raw = "s:0".to_string();
        for _ in 0..12 {
            raw.push_str(".t:0.s:0");
        }
        assert!(StepPath::parse(&raw).is_err());
    }
}
