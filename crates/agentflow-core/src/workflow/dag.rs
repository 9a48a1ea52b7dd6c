//! Dependency graph construction, topological ordering and parallel levels.
//!
//! Dependencies are derived by inverting transitions: a transition `A -> B`
//! means `B` depends on `A`. Ordering uses Kahn's algorithm seeded in declared
//! order so results are deterministic. When a cycle exists, its members are
//! reported through `petgraph`'s strongly connected components.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use agentflow_types::execution::DependencyGraph;
use agentflow_types::workflow::WorkflowDefinition;
use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;

use super::definition::ValidationError;

// ---------------------------------------------------------------------------
// Dependency graph
// ---------------------------------------------------------------------------

/// For every declared step, the set of steps that must complete before it.
///
/// Transitions referencing undeclared steps are ignored here; definition
/// validation reports them.
pub fn build_dependency_graph(def: &WorkflowDefinition) -> DependencyGraph {
    let mut deps: DependencyGraph = def
        .steps
        .iter()
        .map(|s| (s.step_id.clone(), BTreeSet::new()))
        .collect();

    for (from, transitions) in &def.transitions {
        if !deps.contains_key(from) {
            continue;
        }
        for transition in transitions {
            if let Some(set) = deps.get_mut(&transition.to_step) {
                set.insert(from.clone());
            }
        }
    }

    deps
}

// ---------------------------------------------------------------------------
// Topological order
// ---------------------------------------------------------------------------

/// Order steps so that every step comes after all of its dependencies.
///
/// Kahn's algorithm, seeded with zero in-degree steps in declared order. A
/// cycle yields `ValidationError::DependencyCycle` naming the steps involved,
/// never a partial order.
pub fn topological_sort(
    def: &WorkflowDefinition,
    deps: &DependencyGraph,
) -> Result<Vec<String>, ValidationError> {
    let order: Vec<&str> = def.steps.iter().map(|s| s.step_id.as_str()).collect();

    let mut in_degree: HashMap<&str, usize> = order
        .iter()
        .map(|id| (*id, deps.get(*id).map_or(0, BTreeSet::len)))
        .collect();

    // dependency -> dependents, dependents in declared order
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for &id in &order {
        for dep in deps.get(id).into_iter().flatten() {
            dependents.entry(dep.as_str()).or_default().push(id);
        }
    }

    let mut queue: VecDeque<&str> = order
        .iter()
        .copied()
        .filter(|id| in_degree[id] == 0)
        .collect();
    let mut sorted = Vec::with_capacity(order.len());

    while let Some(id) = queue.pop_front() {
        sorted.push(id.to_string());
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(d) = in_degree.get_mut(dependent) {
                *d -= 1;
                if *d == 0 {
                    queue.push_back(*dependent);
                }
            }
        }
    }

    if sorted.len() < order.len() {
        return Err(ValidationError::DependencyCycle {
            steps: cycle_members(&order, deps),
        });
    }

    Ok(sorted)
}

/// Steps that sit on a cycle, in declared order.
fn cycle_members(order: &[&str], deps: &DependencyGraph) -> Vec<String> {
    let mut graph = DiGraph::<&str, ()>::new();
    let nodes: HashMap<&str, _> = order.iter().map(|id| (*id, graph.add_node(*id))).collect();
    for id in order {
        for dep in deps.get(*id).into_iter().flatten() {
            if let Some(from) = nodes.get(dep.as_str()) {
                graph.add_edge(*from, nodes[id], ());
            }
        }
    }

    let mut members = HashSet::new();
    for component in tarjan_scc(&graph) {
        let self_loop = component.len() == 1 && graph.contains_edge(component[0], component[0]);
        if component.len() > 1 || self_loop {
            members.extend(component.into_iter().map(|n| graph[n]));
        }
    }

    order
        .iter()
        .filter(|id| members.contains(*id))
        .map(|id| id.to_string())
        .collect()
}

// ---------------------------------------------------------------------------
// Parallel levels
// ---------------------------------------------------------------------------

/// Group steps into levels that may run concurrently.
///
/// With parallel execution disabled every step is its own group, in declared
/// order. Otherwise a step's level is 0 when it has no dependencies and
/// `1 + max(level(dep))` otherwise; steps within a level keep declared order.
pub fn get_parallel_execution_groups(
    def: &WorkflowDefinition,
) -> Result<Vec<Vec<String>>, ValidationError> {
    let deps = build_dependency_graph(def);
    let sorted = topological_sort(def, &deps)?;
    Ok(groups_from_order(def, &deps, &sorted))
}

fn groups_from_order(
    def: &WorkflowDefinition,
    deps: &DependencyGraph,
    sorted: &[String],
) -> Vec<Vec<String>> {
    if !def.parallel_execution_enabled {
        return def.steps.iter().map(|s| vec![s.step_id.clone()]).collect();
    }
    if sorted.is_empty() {
        return Vec::new();
    }

    let mut levels: HashMap<&str, usize> = HashMap::new();
    for id in sorted {
        let level = deps
            .get(id)
            .into_iter()
            .flatten()
            .map(|dep| levels.get(dep.as_str()).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        levels.insert(id.as_str(), level);
    }

    let max_level = levels.values().copied().max().unwrap_or(0);
    let mut groups: Vec<Vec<String>> = vec![Vec::new(); max_level + 1];
    for step in &def.steps {
        let level = levels[step.step_id.as_str()];
        groups[level].push(step.step_id.clone());
    }
    groups
}

// ---------------------------------------------------------------------------
// Execution plan
// ---------------------------------------------------------------------------

/// Graph, order and levels of a definition, computed once per scheduler.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub dependencies: DependencyGraph,
    pub topological_order: Vec<String>,
    pub groups: Vec<Vec<String>>,
}

impl ExecutionPlan {
    pub fn build(def: &WorkflowDefinition) -> Result<Self, ValidationError> {
        let dependencies = build_dependency_graph(def);
        let topological_order = topological_sort(def, &dependencies)?;
        let groups = groups_from_order(def, &dependencies, &topological_order);
        Ok(Self {
            dependencies,
            topological_order,
            groups,
        })
    }

    /// Direct dependencies of a step.
    pub fn dependencies_of(&self, step_id: &str) -> impl Iterator<Item = &String> {
        self.dependencies.get(step_id).into_iter().flatten()
    }
}

// ---------------------------------------------------------------------------
// Transitive dependency closure
// ---------------------------------------------------------------------------

/// Returns the transitive closure of all dependencies for a given step,
/// sorted by step ID.
///
/// If `step_id` is not found, returns an empty vec.
pub fn get_step_dependencies(step_id: &str, deps: &DependencyGraph) -> Vec<String> {
    let mut visited = BTreeSet::new();
    let mut stack = vec![step_id];

    while let Some(current) = stack.pop() {
        for dep in deps.get(current).into_iter().flatten() {
            if visited.insert(dep.clone()) {
                stack.push(dep.as_str());
            }
        }
    }

    visited.into_iter().collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use agentflow_types::workflow::{AgentConfig, StepConfig, Transition};
    use serde_json::Map;

    /// Helper: a definition with one `echo` agent and the given edges.
    pub(crate) fn definition(
        steps: &[&str],
        edges: &[(&str, &str)],
        parallel: bool,
    ) -> WorkflowDefinition {
        let mut transitions: HashMap<String, Vec<Transition>> = HashMap::new();
        for (from, to) in edges {
            transitions
                .entry(from.to_string())
                .or_default()
                .push(Transition::to(*to));
        }
        let mut agents = HashMap::new();
        agents.insert(
            "echo".to_string(),
            AgentConfig::Custom {
                handler: "echo".to_string(),
                options: Map::new(),
            },
        );

        WorkflowDefinition {
            workflow_id: "test".to_string(),
            name: "test".to_string(),
            description: None,
            steps: steps.iter().map(|s| StepConfig::new(*s, "echo")).collect(),
            transitions,
            agents,
            parallel_execution_enabled: parallel,
            global_context: Map::new(),
            error_handler: None,
            metadata: HashMap::new(),
        }
    }

    fn position(order: &[String], id: &str) -> usize {
        order.iter().position(|s| s == id).unwrap()
    }

    // -----------------------------------------------------------------------
    // Dependency graph
    // -----------------------------------------------------------------------

    #[test]
    fn test_dependencies_invert_transitions() {
        let def = definition(&["a", "b", "c"], &[("a", "b"), ("a", "c"), ("b", "c")], false);
        let deps = build_dependency_graph(&def);
        assert!(deps["a"].is_empty());
        assert_eq!(deps["b"].iter().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(deps["c"].len(), 2);
    }

    // -----------------------------------------------------------------------
    // Topological sort
    // -----------------------------------------------------------------------

    #[test]
    fn test_linear_chain_order() {
        let def = definition(&["a", "b", "c"], &[("a", "b"), ("b", "c")], false);
        let deps = build_dependency_graph(&def);
        assert_eq!(topological_sort(&def, &deps).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_sort_respects_dependencies_against_declared_order() {
        // Declared backwards, edges forwards.
        let def = definition(&["d", "c", "b", "a"], &[("a", "b"), ("b", "c"), ("c", "d")], true);
        let deps = build_dependency_graph(&def);
        let order = topological_sort(&def, &deps).unwrap();
        assert_eq!(order.len(), 4);
        for (step, ds) in &deps {
            for dep in ds {
                assert!(position(&order, dep) < position(&order, step));
            }
        }
    }

    #[test]
    fn test_independent_steps_keep_declared_order() {
        let def = definition(&["x", "y", "z"], &[], true);
        let deps = build_dependency_graph(&def);
        assert_eq!(topological_sort(&def, &deps).unwrap(), vec!["x", "y", "z"]);
    }

    #[test]
    fn test_cycle_reported_with_members() {
        let def = definition(
            &["start", "a", "b", "c"],
            &[("start", "a"), ("a", "b"), ("b", "c"), ("c", "a")],
            false,
        );
        let deps = build_dependency_graph(&def);
        let err = topological_sort(&def, &deps).unwrap_err();
        assert_eq!(
            err,
            ValidationError::DependencyCycle {
                steps: vec!["a".to_string(), "b".to_string(), "c".to_string()]
            }
        );
    }

    #[test]
    fn test_self_loop_is_cycle() {
        let def = definition(&["a", "b"], &[("a", "a")], false);
        let deps = build_dependency_graph(&def);
        let err = topological_sort(&def, &deps).unwrap_err();
        assert!(err.is_cycle());
        assert!(err.to_string().contains('a'));
    }

    // -----------------------------------------------------------------------
    // Parallel groups
    // -----------------------------------------------------------------------

    #[test]
    fn test_parallel_disabled_gives_singletons() {
        let def = definition(&["a", "b", "c"], &[("a", "c")], false);
        let groups = get_parallel_execution_groups(&def).unwrap();
        assert_eq!(groups, vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn test_linear_chain_groups() {
        let def = definition(&["a", "b", "c"], &[("a", "b"), ("b", "c")], true);
        let groups = get_parallel_execution_groups(&def).unwrap();
        assert_eq!(groups, vec![vec!["a"], vec!["b"], vec!["c"]]);
    }

    #[test]
    fn test_diamond_groups() {
        let def = definition(
            &["a", "b", "c", "d"],
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
            true,
        );
        let groups = get_parallel_execution_groups(&def).unwrap();
        assert_eq!(groups, vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
    }

    #[test]
    fn test_groups_partition_and_respect_levels() {
        let def = definition(
            &["e", "a", "b", "c", "d", "f"],
            &[("a", "b"), ("a", "c"), ("c", "d"), ("b", "d"), ("e", "d"), ("d", "f")],
            true,
        );
        let groups = get_parallel_execution_groups(&def).unwrap();
        let deps = build_dependency_graph(&def);

        let mut seen = HashSet::new();
        let mut level_of = HashMap::new();
        for (level, group) in groups.iter().enumerate() {
            for id in group {
                assert!(seen.insert(id.clone()), "step {id} appears twice");
                level_of.insert(id.clone(), level);
            }
        }
        assert_eq!(seen.len(), def.steps.len());

        for (step, ds) in &deps {
            for dep in ds {
                assert!(level_of[dep] < level_of[step], "{dep} must precede {step}");
            }
        }
        // "e" and "a" are roots, declared order inside the level
        assert_eq!(groups[0], vec!["e", "a"]);
    }

    #[test]
    fn test_groups_reject_cycle() {
        let def = definition(&["a", "b"], &[("a", "b"), ("b", "a")], true);
        assert!(get_parallel_execution_groups(&def).unwrap_err().is_cycle());
    }

    #[test]
    fn test_execution_plan_bundles_everything() {
        let def = definition(&["a", "b"], &[("a", "b")], true);
        let plan = ExecutionPlan::build(&def).unwrap();
        assert_eq!(plan.topological_order, vec!["a", "b"]);
        assert_eq!(plan.groups.len(), 2);
        assert_eq!(plan.dependencies_of("b").collect::<Vec<_>>(), vec!["a"]);
    }

    // -----------------------------------------------------------------------
    // Transitive closure
    // -----------------------------------------------------------------------

    #[test]
    fn test_step_dependencies_transitive() {
        let def = definition(
            &["a", "b", "c", "d"],
            &[("a", "b"), ("b", "c"), ("c", "d")],
            false,
        );
        let deps = build_dependency_graph(&def);
        assert_eq!(get_step_dependencies("d", &deps), vec!["a", "b", "c"]);
        assert!(get_step_dependencies("a", &deps).is_empty());
        assert!(get_step_dependencies("nope", &deps).is_empty());
    }
}
