//! Dependency validation with cycle detection.
//!
//! Pure domain logic: callers hand in the already-loaded dependency graph,
//! nothing here touches the filesystem.

use rustc_hash::{FxHashMap, FxHashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyError {
    pub task_id: String,
    /// "missing" | "self"
    pub error_type: String,
    pub details: String,
}

impl std::fmt::Display for DependencyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} - {}", self.task_id, self.error_type, self.details)
    }
}

pub type DependencyGraph = FxHashMap<String, Vec<String>>;

/// Build the graph from `(task_id, depends_on)` pairs.
pub fn build_dependency_graph(tasks: &[(String, Vec<String>)]) -> DependencyGraph {
    tasks.iter().cloned().collect()
}

/// Every dependency must exist and must not be a self-reference.
pub fn validate_dependency_exists(
    task_id: &str,
    depends_on: &[String],
    existing_ids: &FxHashSet<String>,
) -> Vec<DependencyError> {
    let mut errors = Vec::new();
    for dep in depends_on {
        if dep == task_id {
            errors.push(DependencyError {
                task_id: task_id.to_string(),
                error_type: "self".to_string(),
                details: "task cannot depend on itself".to_string(),
            });
        } else if !existing_ids.contains(dep) {
            errors.push(DependencyError {
                task_id: task_id.to_string(),
                error_type: "missing".to_string(),
                details: format!("dependency '{}' not found", dep),
            });
        }
    }
    errors
}

/// DFS cycle detection over the graph with the candidate edges applied.
/// Returns the cycle as a node path (closing node repeated) when found.
pub fn detect_cycle(
    task_id: &str,
    depends_on: &[String],
    graph: &DependencyGraph,
) -> Option<Vec<String>> {
    let mut graph: DependencyGraph = graph.clone();
    graph.insert(task_id.to_string(), depends_on.to_vec());

    // Iterative DFS with an explicit phase per frame so the recursion stack
    // mirrors the path being explored.
    enum Phase {
        Enter,
        Exit,
    }
    let mut visited: FxHashSet<String> = FxHashSet::default();
    let mut on_path: FxHashSet<String> = FxHashSet::default();
    let mut path: Vec<String> = Vec::new();
    let mut stack: Vec<(String, Phase)> = vec![(task_id.to_string(), Phase::Enter)];

    while let Some((node, phase)) = stack.pop() {
        match phase {
            Phase::Enter => {
                if visited.contains(&node) {
                    continue;
                }
                visited.insert(node.clone());
                on_path.insert(node.clone());
                path.push(node.clone());
                stack.push((node.clone(), Phase::Exit));
                for neighbor in graph.get(&node).into_iter().flatten() {
                    if on_path.contains(neighbor) {
                        let start = path.iter().position(|n| n == neighbor).unwrap_or(0);
                        let mut cycle: Vec<String> = path[start..].to_vec();
                        cycle.push(neighbor.clone());
                        return Some(cycle);
                    }
                    if !visited.contains(neighbor) {
                        stack.push((neighbor.clone(), Phase::Enter));
                    }
                }
            }
            Phase::Exit => {
                on_path.remove(&node);
                path.pop();
            }
        }
    }
    None
}

/// Full validation: existence first, cycles only when existence holds.
pub fn validate_dependencies(
    task_id: &str,
    depends_on: &[String],
    existing_ids: &FxHashSet<String>,
    graph: &DependencyGraph,
) -> (Vec<DependencyError>, Option<Vec<String>>) {
    let errors = validate_dependency_exists(task_id, depends_on, existing_ids);
    let cycle = if errors.is_empty() {
        detect_cycle(task_id, depends_on, graph)
    } else {
        None
    };
    (errors, cycle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(list: &[&str]) -> FxHashSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn deps(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_missing_and_self_dependencies() {
        let existing = ids(&["TASK-001", "TASK-002"]);
        let errors =
            validate_dependency_exists("TASK-001", &deps(&["TASK-001", "TASK-009"]), &existing);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].error_type, "self");
        assert_eq!(errors[1].error_type, "missing");
    }

    #[test]
    fn test_cycle_detection() {
        let graph = build_dependency_graph(&[
            ("TASK-002".to_string(), deps(&["TASK-003"])),
            ("TASK-003".to_string(), deps(&["TASK-001"])),
        ]);
        let cycle = detect_cycle("TASK-001", &deps(&["TASK-002"]), &graph).unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert!(cycle.contains(&"TASK-002".to_string()));
    }

    #[test]
    fn test_no_false_cycle_on_dag() {
        let graph = build_dependency_graph(&[
            ("TASK-002".to_string(), deps(&["TASK-003"])),
            ("TASK-003".to_string(), vec![]),
        ]);
        assert!(detect_cycle("TASK-001", &deps(&["TASK-002", "TASK-003"]), &graph).is_none());
    }

    #[test]
    fn test_validate_dependencies_skips_cycle_check_on_errors() {
        let existing = ids(&["TASK-001"]);
        let graph = DependencyGraph::default();
        let (errors, cycle) =
            validate_dependencies("TASK-001", &deps(&["TASK-404"]), &existing, &graph);
        assert_eq!(errors.len(), 1);
        assert!(cycle.is_none());
    }
}
