use std::collections::{BTreeMap, BTreeSet};

use crate::error::{OrchestratorError, Result};
use crate::models::{DependencyCondition, Model};

/// Service dependency DAG with a fixed topological order.
///
/// Edges point from a service to the services it depends on. Networks and
/// volumes are provisioned per service and never add edges here.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// service -> (dependency -> condition)
    dependencies: BTreeMap<String, BTreeMap<String, DependencyCondition>>,
    /// service -> services that depend on it
    dependents: BTreeMap<String, BTreeSet<String>>,
    order: Vec<String>,
}

impl DependencyGraph {
    pub fn build(model: &Model) -> Result<Self> {
        let mut dependencies: BTreeMap<String, BTreeMap<String, DependencyCondition>> =
            BTreeMap::new();
        let mut dependents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for (name, service) in &model.services {
            dependencies.insert(name.clone(), service.depends_on.clone());
            dependents.entry(name.clone()).or_default();
        }
        for (name, service) in &model.services {
            for dependency in service.depends_on.keys() {
                if !model.services.contains_key(dependency) {
                    return Err(OrchestratorError::ServiceNotFound(dependency.clone()));
                }
                dependents
                    .entry(dependency.clone())
                    .or_default()
                    .insert(name.clone());
            }
        }

        let order = topological_order(&dependencies, &dependents)?;
        tracing::debug!(order = ?order, "dependency graph built");
        Ok(Self {
            dependencies,
            dependents,
            order,
        })
    }

    /// Start order. Identical for identical inputs.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Teardown order: dependents before their dependencies.
    pub fn reverse_order(&self) -> Vec<String> {
        self.order.iter().rev().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.dependencies.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Services `name` depends on directly.
    pub fn predecessors(&self, name: &str) -> Vec<&str> {
        self.dependencies
            .get(name)
            .map(|deps| deps.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Services that depend on `name` directly.
    pub fn successors(&self, name: &str) -> Vec<&str> {
        self.dependents
            .get(name)
            .map(|deps| deps.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Everything that depends on `name`, directly or not, in topological order.
    pub fn transitive_dependents(&self, name: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![name];
        while let Some(current) = stack.pop() {
            for next in self.successors(current) {
                if seen.insert(next.to_string()) {
                    stack.push(next);
                }
            }
        }
        self.order
            .iter()
            .filter(|s| seen.contains(s.as_str()))
            .cloned()
            .collect()
    }

    /// Condition on the edge `dependent -> dependency`, if that edge exists.
    pub fn condition(&self, dependent: &str, dependency: &str) -> Option<DependencyCondition> {
        self.dependencies
            .get(dependent)
            .and_then(|deps| deps.get(dependency))
            .copied()
    }
}

fn topological_order(
    dependencies: &BTreeMap<String, BTreeMap<String, DependencyCondition>>,
    dependents: &BTreeMap<String, BTreeSet<String>>,
) -> Result<Vec<String>> {
    let mut in_degree: BTreeMap<&str, usize> = dependencies
        .iter()
        .map(|(name, deps)| (name.as_str(), deps.len()))
        .collect();

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();

    let mut order = Vec::with_capacity(dependencies.len());
    while let Some(next) = ready.pop_first() {
        order.push(next.to_string());
        for dependent in dependents.get(next).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(dependent.as_str());
                }
            }
        }
    }

    if order.len() == dependencies.len() {
        return Ok(order);
    }

    let placed: BTreeSet<&str> = order.iter().map(String::as_str).collect();
    let remaining: BTreeSet<&str> = dependencies
        .keys()
        .map(String::as_str)
        .filter(|n| !placed.contains(n))
        .collect();
    Err(OrchestratorError::CyclicDependency(find_cycle(
        dependencies,
        &remaining,
    )))
}

/// Every unplaced node still has an unplaced dependency, so walking
/// dependencies from any unplaced node must revisit one.
fn find_cycle(
    dependencies: &BTreeMap<String, BTreeMap<String, DependencyCondition>>,
    remaining: &BTreeSet<&str>,
) -> Vec<String> {
    let Some(&start) = remaining.first() else {
        return Vec::new();
    };
    let mut path: Vec<&str> = vec![start];
    loop {
        let Some(current) = path.last().copied() else {
            return Vec::new();
        };
        let next = dependencies
            .get(current)
            .and_then(|deps| deps.keys().map(String::as_str).find(|d| remaining.contains(d)));
        let Some(next) = next else {
            return path.iter().map(|s| s.to_string()).collect();
        };
        if let Some(pos) = path.iter().position(|p| *p == next) {
            let mut cycle: Vec<&str> = path[pos..].to_vec();
            let smallest = cycle
                .iter()
                .enumerate()
                .min_by_key(|(_, name)| **name)
                .map(|(i, _)| i)
                .unwrap_or(0);
            cycle.rotate_left(smallest);
            cycle.push(cycle[0]);
            return cycle.into_iter().map(str::to_string).collect();
        }
        path.push(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::loader::{load, LoadOptions};

    fn graph(yaml: &str) -> Result<DependencyGraph> {
        let model = load(yaml, &LoadOptions::default()).unwrap();
        DependencyGraph::build(&model)
    }

    #[test]
    fn orders_dependencies_first_with_lexicographic_ties() {
        let g = graph(
            r#"
services:
  web: { image: nginx, depends_on: [api] }
  api: { image: api, depends_on: [db, cache] }
  db: { image: postgres }
  cache: { image: redis }
  admin: { image: pgadmin, depends_on: [db] }
"#,
        )
        .unwrap();
        assert_eq!(g.order(), ["cache", "db", "admin", "api", "web"]);
        assert_eq!(g.reverse_order()[0], "web");
    }

    #[test]
    fn order_is_stable_across_builds() {
        let yaml = r#"
services:
  c: { image: x, depends_on: [a] }
  b: { image: x, depends_on: [a] }
  a: { image: x }
  d: { image: x }
"#;
        let first = graph(yaml).unwrap().order().to_vec();
        for _ in 0..10 {
            assert_eq!(graph(yaml).unwrap().order(), first.as_slice());
        }
        assert_eq!(first, ["a", "b", "c", "d"]);
    }

    #[test]
    fn cycle_is_reported_closed_from_smallest_member() {
        let err = graph(
            r#"
services:
  ok: { image: x }
  c: { image: x, depends_on: [b] }
  b: { image: x, depends_on: [d] }
  d: { image: x, depends_on: [c] }
"#,
        )
        .unwrap_err();
        match err {
            OrchestratorError::CyclicDependency(cycle) => {
                assert_eq!(cycle, ["b", "d", "c", "b"]);
            }
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let err = graph("services:\n  a: { image: x, depends_on: [a] }\n").unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::CyclicDependency(ref c) if c == &["a", "a"]
        ));
    }

    #[test]
    fn dependents_of_a_cycle_member_are_not_reported() {
        let err = graph(
            r#"
services:
  a: { image: x, depends_on: [z] }
  y: { image: x, depends_on: [z] }
  z: { image: x, depends_on: [y] }
"#,
        )
        .unwrap_err();
        match err {
            OrchestratorError::CyclicDependency(cycle) => assert_eq!(cycle, ["y", "z", "y"]),
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn shared_networks_do_not_add_edges() {
        let g = graph(
            r#"
services:
  a: { image: x, networks: [backend], volumes: ["data:/data"] }
  b: { image: x, networks: [backend], volumes: ["data:/data"] }
networks:
  backend:
volumes:
  data:
"#,
        )
        .unwrap();
        assert!(g.predecessors("a").is_empty());
        assert!(g.predecessors("b").is_empty());
    }

    #[test]
    fn queries() {
        let g = graph(
            r#"
services:
  a: { image: x }
  b: { image: x, depends_on: { a: { condition: service_healthy } } }
  c: { image: x, depends_on: [b] }
  d: { image: x }
"#,
        )
        .unwrap();
        assert_eq!(g.predecessors("b"), ["a"]);
        assert_eq!(g.successors("a"), ["b"]);
        assert_eq!(g.transitive_dependents("a"), ["b", "c"]);
        assert!(g.transitive_dependents("d").is_empty());
        assert_eq!(
            g.condition("b", "a"),
            Some(DependencyCondition::ServiceHealthy)
        );
        assert_eq!(
            g.condition("c", "b"),
            Some(DependencyCondition::ServiceStarted)
        );
        assert_eq!(g.condition("a", "b"), None);
        assert!(g.contains("d"));
        assert_eq!(g.len(), 4);
    }
}
