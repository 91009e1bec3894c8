//! Stage dependency graph.
//!
//! Built once per definition. Cycle detection is a depth-first walk with
//! white/gray/black coloring: reaching a gray node again is a back-edge,
//! and the whole definition is rejected. Each stage gets a dependency
//! depth (longest path from a root), used with declaration order and
//! name to order simultaneously-ready stages deterministically.

use std::collections::{BTreeSet, HashMap, HashSet};

use super::error::{CycleError, GraphError};
use super::pipeline::StageSpec;
use crate::domain::StageStatus;

/// A node in the stage graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageNode {
    pub name: String,
    /// Position in the definition
    pub index: usize,
    /// Direct dependencies
    pub depends_on: BTreeSet<String>,
    /// Direct dependents
    pub dependents: BTreeSet<String>,
    /// 0 for roots, otherwise 1 + the deepest dependency
    pub depth: usize,
}

/// Validated DAG of stages
#[derive(Debug, Clone)]
pub struct StageGraph {
    nodes: HashMap<String, StageNode>,
    /// Topological order: (depth, declaration index)
    order: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl StageGraph {
    /// Build and validate the graph for a list of stage specs
    pub fn build(specs: &[StageSpec]) -> Result<Self, GraphError> {
        let mut index_of: HashMap<&str, usize> = HashMap::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            if index_of.insert(spec.name.as_str(), i).is_some() {
                return Err(GraphError::DuplicateStage(spec.name.clone()));
            }
        }

        for spec in specs {
            for dep in &spec.depends_on {
                if !index_of.contains_key(dep.as_str()) {
                    return Err(GraphError::UnknownDependency {
                        stage: spec.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let mut colors = vec![Color::White; specs.len()];
        let mut depths = vec![0usize; specs.len()];
        let mut path: Vec<usize> = Vec::new();

        for start in 0..specs.len() {
            if colors[start] == Color::White {
                visit(start, specs, &index_of, &mut colors, &mut depths, &mut path)?;
            }
        }

        let mut nodes: HashMap<String, StageNode> = specs
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                (
                    spec.name.clone(),
                    StageNode {
                        name: spec.name.clone(),
                        index: i,
                        depends_on: spec.depends_on.iter().cloned().collect(),
                        dependents: BTreeSet::new(),
                        depth: depths[i],
                    },
                )
            })
            .collect();

        for spec in specs {
            for dep in &spec.depends_on {
                if let Some(node) = nodes.get_mut(dep) {
                    node.dependents.insert(spec.name.clone());
                }
            }
        }

        let mut order: Vec<String> = specs.iter().map(|s| s.name.clone()).collect();
        order.sort_by_key(|name| {
            let node = &nodes[name];
            (node.depth, node.index)
        });

        Ok(Self { nodes, order })
    }

    pub fn node(&self, name: &str) -> Option<&StageNode> {
        self.nodes.get(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Direct dependencies of a stage
    pub fn dependencies(&self, name: &str) -> impl Iterator<Item = &str> + '_ {
        self.nodes
            .get(name)
            .into_iter()
            .flat_map(|n| n.depends_on.iter().map(String::as_str))
    }

    /// Dependency depth of a stage
    pub fn depth(&self, name: &str) -> Option<usize> {
        self.nodes.get(name).map(|n| n.depth)
    }

    /// All stages in topological order
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// Reverse topological order, the order rollbacks run in
    pub fn rollback_order(&self) -> impl Iterator<Item = &str> + '_ {
        self.order.iter().rev().map(String::as_str)
    }

    /// Every stage downstream of `name`, in topological order
    pub fn transitive_dependents(&self, name: &str) -> Vec<String> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = vec![name];

        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.get(current) {
                for dependent in &node.dependents {
                    if seen.insert(dependent.as_str()) {
                        stack.push(dependent.as_str());
                    }
                }
            }
        }

        self.order
            .iter()
            .filter(|s| seen.contains(s.as_str()))
            .cloned()
            .collect()
    }

    /// Stages not yet started whose dependencies are all satisfied,
    /// ordered by (depth, declaration index, name).
    ///
    /// `statuses` must be a single consistent snapshot of the run.
    pub fn ready(&self, statuses: &HashMap<String, StageStatus>) -> Vec<String> {
        let status_of = |name: &str| statuses.get(name).copied().unwrap_or_default();

        let mut ready: Vec<&StageNode> = self
            .nodes
            .values()
            .filter(|node| status_of(&node.name).is_waiting())
            .filter(|node| {
                node.depends_on
                    .iter()
                    .all(|dep| status_of(dep).satisfies_dependents())
            })
            .collect();

        ready.sort_by(|a, b| {
            (a.depth, a.index, &a.name).cmp(&(b.depth, b.index, &b.name))
        });

        ready.into_iter().map(|n| n.name.clone()).collect()
    }
}

fn visit(
    current: usize,
    specs: &[StageSpec],
    index_of: &HashMap<&str, usize>,
    colors: &mut [Color],
    depths: &mut [usize],
    path: &mut Vec<usize>,
) -> Result<(), CycleError> {
    colors[current] = Color::Gray;
    path.push(current);

    let mut depth = 0;
    for dep in &specs[current].depends_on {
        let next = index_of[dep.as_str()];
        match colors[next] {
            Color::Gray => {
                let start = path.iter().position(|&i| i == next).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..]
                    .iter()
                    .map(|&i| specs[i].name.clone())
                    .collect();
                cycle.push(specs[next].name.clone());
                return Err(CycleError { path: cycle });
            }
            Color::White => visit(next, specs, index_of, colors, depths, path)?,
            Color::Black => {}
        }
        depth = depth.max(depths[next] + 1);
    }

    path.pop();
    depths[current] = depth;
    colors[current] = Color::Black;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pipeline::AdapterKind;

    fn stage(name: &str, deps: &[&str]) -> StageSpec {
        StageSpec::new(name, AdapterKind::Build).depends_on(deps.iter().copied())
    }

    #[test]
    fn test_chain_depths_and_order() {
        let specs = vec![
            stage("configure", &["deploy"]),
            stage("deploy", &["push"]),
            stage("push", &["build"]),
            stage("build", &[]),
        ];
        let graph = StageGraph::build(&specs).unwrap();

        assert_eq!(graph.depth("build"), Some(0));
        assert_eq!(graph.depth("configure"), Some(3));
        assert_eq!(
            graph.topological_order(),
            &["build", "push", "deploy", "configure"]
        );
        assert_eq!(
            graph.rollback_order().collect::<Vec<_>>(),
            vec!["configure", "deploy", "push", "build"]
        );
    }

    #[test]
    fn test_cycle_detected_with_path() {
        let specs = vec![stage("a", &["c"]), stage("b", &["a"]), stage("c", &["b"])];
        let err = StageGraph::build(&specs).unwrap_err();

        match err {
            GraphError::Cycle(cycle) => {
                assert_eq!(cycle.path.first(), cycle.path.last());
                assert_eq!(cycle.path.len(), 4);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let err = StageGraph::build(&[stage("a", &["a"])]).unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle(CycleError {
                path: vec!["a".into(), "a".into()]
            })
        );
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let specs = vec![
            stage("root", &[]),
            stage("left", &["root"]),
            stage("right", &["root"]),
            stage("join", &["left", "right"]),
        ];
        let graph = StageGraph::build(&specs).unwrap();
        assert_eq!(graph.depth("join"), Some(2));
        assert_eq!(graph.transitive_dependents("root"), vec!["left", "right", "join"]);
        assert_eq!(graph.transitive_dependents("left"), vec!["join"]);
    }

    #[test]
    fn test_duplicate_stage_rejected() {
        let err = StageGraph::build(&[stage("a", &[]), stage("a", &[])]).unwrap_err();
        assert_eq!(err, GraphError::DuplicateStage("a".into()));
    }

    #[test]
    fn test_ready_set_tie_break() {
        let specs = vec![
            stage("zeta", &[]),
            stage("alpha", &[]),
            stage("late", &["zeta"]),
        ];
        let graph = StageGraph::build(&specs).unwrap();

        let mut statuses: HashMap<String, StageStatus> = specs
            .iter()
            .map(|s| (s.name.clone(), StageStatus::Pending))
            .collect();

        // Declaration order wins over name among equal depths
        assert_eq!(graph.ready(&statuses), vec!["zeta", "alpha"]);

        statuses.insert("zeta".into(), StageStatus::Running);
        assert_eq!(graph.ready(&statuses), vec!["alpha"]);

        statuses.insert("zeta".into(), StageStatus::Succeeded);
        assert_eq!(graph.ready(&statuses), vec!["alpha", "late"]);

        statuses.insert("zeta".into(), StageStatus::Failed);
        assert_eq!(graph.ready(&statuses), vec!["alpha"]);
    }

    #[test]
    fn test_skipped_dependency_satisfies() {
        let specs = vec![stage("a", &[]), stage("b", &["a"])];
        let graph = StageGraph::build(&specs).unwrap();

        let statuses: HashMap<String, StageStatus> = [
            ("a".to_string(), StageStatus::Skipped),
            ("b".to_string(), StageStatus::Pending),
        ]
        .into_iter()
        .collect();

        assert_eq!(graph.ready(&statuses), vec!["b"]);
    }
}
