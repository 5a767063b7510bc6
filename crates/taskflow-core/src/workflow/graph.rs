//! Validated task graph.
//!
//! Tasks live in a flat arena indexed by their position in the definition;
//! dependency edges, transitions and error-handler routes are index lists.
//! Building a graph runs every registration-time check: structural
//! validation, reference resolution, cycle detection (Kahn's algorithm, with
//! `petgraph` naming the strongly connected tasks), reachability from the
//! start tasks and compilation of every embedded expression.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use taskflow_types::workflow::{ErrorKind, JoinType, TaskDefinition, WorkflowDefinition};

use super::definition::{DefinitionError, validate_definition};
use super::expression::{CompiledExpression, ExpressionEvaluator};

// ---------------------------------------------------------------------------
// Graph types
// ---------------------------------------------------------------------------

/// An outgoing transition resolved to a target index.
#[derive(Debug, Clone)]
pub struct TransitionEdge {
    pub target: usize,
    /// `None` for automatic or unguarded transitions.
    pub guard: Option<CompiledExpression>,
    /// Guard reads `error`: considered only when the source fails.
    pub on_error: bool,
}

#[derive(Debug, Clone)]
pub struct TaskNode {
    pub index: usize,
    pub id: String,
    pub join: JoinType,
    pub dependencies: Vec<usize>,
    pub dependents: Vec<usize>,
    pub transitions: Vec<TransitionEdge>,
    /// Sources of transitions into this task (deduplicated).
    pub transition_sources: Vec<usize>,
    /// Named by a workflow error handler; runs only when routed to.
    pub handler_target: bool,
    pub publish: Vec<(String, CompiledExpression)>,
}

impl TaskNode {
    /// Runs only after an incoming transition or handler releases it.
    pub fn is_gated(&self) -> bool {
        self.handler_target || !self.transition_sources.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct HandlerRoute {
    pub error_kind: Option<ErrorKind>,
    pub target: usize,
}

/// A definition that passed every load-time check, ready to be scheduled.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    definition: Arc<WorkflowDefinition>,
    nodes: Vec<TaskNode>,
    index: HashMap<String, usize>,
    order: Vec<usize>,
    start: Vec<usize>,
    handlers: Vec<HandlerRoute>,
}

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

impl WorkflowGraph {
    /// Validate a definition and build its graph. Pure; no execution state
    /// is created.
    pub fn build(
        definition: &WorkflowDefinition,
        evaluator: &ExpressionEvaluator,
    ) -> Result<Self, DefinitionError> {
        validate_definition(definition)?;

        let index: HashMap<String, usize> = definition
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();

        let mut nodes: Vec<TaskNode> = definition
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| TaskNode {
                index: i,
                id: t.id.clone(),
                join: t.join,
                dependencies: Vec::new(),
                dependents: Vec::new(),
                transitions: Vec::new(),
                transition_sources: Vec::new(),
                handler_target: false,
                publish: Vec::new(),
            })
            .collect();

        // Resolve references.
        for (i, task) in definition.tasks.iter().enumerate() {
            for dep in &task.depends_on {
                let from = *index.get(dep).ok_or_else(|| DefinitionError::UnknownDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                })?;
                nodes[i].dependencies.push(from);
                nodes[from].dependents.push(i);
            }

            for transition in &task.transitions {
                let target = *index.get(&transition.target).ok_or_else(|| {
                    DefinitionError::UnknownTransitionTarget {
                        task: task.id.clone(),
                        target: transition.target.clone(),
                    }
                })?;
                if target == i {
                    return Err(DefinitionError::CyclicGraph {
                        tasks: vec![task.id.clone()],
                    });
                }
                let guard = match (&transition.guard, transition.automatic) {
                    (Some(source), false) => Some(compile(evaluator, task, source)?),
                    _ => None,
                };
                let on_error = guard.as_ref().is_some_and(|g| g.references_root("error"));
                nodes[i].transitions.push(TransitionEdge {
                    target,
                    guard,
                    on_error,
                });
                if !nodes[target].transition_sources.contains(&i) {
                    nodes[target].transition_sources.push(i);
                }
            }

            for (key, source) in &task.publish {
                let compiled = compile(evaluator, task, source)?;
                nodes[i].publish.push((key.clone(), compiled));
            }

            evaluator
                .validate_template(&task.input)
                .map_err(|source| DefinitionError::Expression {
                    task: task.id.clone(),
                    source,
                })?;
        }

        let mut handlers = Vec::with_capacity(definition.error_handlers.len());
        for handler in &definition.error_handlers {
            let target = *index
                .get(&handler.task)
                .ok_or_else(|| DefinitionError::UnknownHandlerTarget(handler.task.clone()))?;
            nodes[target].handler_target = true;
            handlers.push(HandlerRoute {
                error_kind: handler.error_kind,
                target,
            });
        }

        for node in &nodes {
            if node.join == JoinType::Any && node.dependencies.len() < 2 {
                return Err(DefinitionError::Invalid(format!(
                    "task '{}' uses an 'any' join but has fewer than two dependencies",
                    node.id
                )));
            }
        }

        let order = topological_sort(&nodes)?;
        let start = resolve_start_tasks(definition, &nodes, &index)?;
        check_reachability(&nodes, &start)?;

        tracing::debug!(
            workflow = %definition.id,
            version = %definition.version,
            tasks = nodes.len(),
            start_tasks = start.len(),
            "workflow graph built"
        );

        Ok(Self {
            definition: Arc::new(definition.clone()),
            nodes,
            index,
            order,
            start,
            handlers,
        })
    }
}

fn compile(
    evaluator: &ExpressionEvaluator,
    task: &TaskDefinition,
    source: &str,
) -> Result<CompiledExpression, DefinitionError> {
    evaluator
        .compile(source)
        .map_err(|source| DefinitionError::Expression {
            task: task.id.clone(),
            source,
        })
}

/// Successors along dependency and transition edges.
fn successors(node: &TaskNode) -> impl Iterator<Item = usize> + '_ {
    node.dependents
        .iter()
        .copied()
        .chain(node.transitions.iter().map(|t| t.target))
}

/// Kahn's algorithm over dependency plus transition edges. Ties resolve in
/// definition order.
fn topological_sort(nodes: &[TaskNode]) -> Result<Vec<usize>, DefinitionError> {
    let mut in_degree = vec![0usize; nodes.len()];
    for node in nodes {
        for next in successors(node) {
            in_degree[next] += 1;
        }
    }

    let mut queue: VecDeque<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(i) = queue.pop_front() {
        order.push(i);
        for next in successors(&nodes[i]) {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if order.len() == nodes.len() {
        return Ok(order);
    }

    // Name the tasks that actually sit on a cycle, not everything downstream.
    let mut graph = DiGraph::<usize, ()>::with_capacity(nodes.len(), 0);
    let ids: Vec<_> = (0..nodes.len()).map(|i| graph.add_node(i)).collect();
    for node in nodes {
        for next in successors(node) {
            graph.add_edge(ids[node.index], ids[next], ());
        }
    }
    let mut tasks: Vec<String> = tarjan_scc(&graph)
        .into_iter()
        .filter(|scc| scc.len() > 1)
        .flatten()
        .map(|n| nodes[graph[n]].id.clone())
        .collect();
    tasks.sort();
    Err(DefinitionError::CyclicGraph { tasks })
}

fn resolve_start_tasks(
    definition: &WorkflowDefinition,
    nodes: &[TaskNode],
    index: &HashMap<String, usize>,
) -> Result<Vec<usize>, DefinitionError> {
    if definition.start_tasks.is_empty() {
        let roots: Vec<usize> = nodes
            .iter()
            .filter(|n| n.dependencies.is_empty() && !n.is_gated())
            .map(|n| n.index)
            .collect();
        if roots.is_empty() {
            return Err(DefinitionError::Invalid(
                "workflow has no start task: every task has dependencies or incoming transitions"
                    .to_string(),
            ));
        }
        return Ok(roots);
    }

    let mut start = Vec::with_capacity(definition.start_tasks.len());
    for id in &definition.start_tasks {
        let i = *index
            .get(id)
            .ok_or_else(|| DefinitionError::UnknownStartTask(id.clone()))?;
        let node = &nodes[i];
        if !node.dependencies.is_empty() || node.is_gated() {
            return Err(DefinitionError::Invalid(format!(
                "start task '{id}' cannot have dependencies, incoming transitions or handlers"
            )));
        }
        if !start.contains(&i) {
            start.push(i);
        }
    }
    Ok(start)
}

/// Every task must be reachable from a start task or an error handler entry.
fn check_reachability(nodes: &[TaskNode], start: &[usize]) -> Result<(), DefinitionError> {
    let mut seen: HashSet<usize> = HashSet::new();
    let mut stack: Vec<usize> = start.to_vec();
    stack.extend(nodes.iter().filter(|n| n.handler_target).map(|n| n.index));

    while let Some(i) = stack.pop() {
        if seen.insert(i) {
            stack.extend(successors(&nodes[i]).filter(|n| !seen.contains(n)));
        }
    }

    if seen.len() == nodes.len() {
        return Ok(());
    }
    let tasks = nodes
        .iter()
        .filter(|n| !seen.contains(&n.index))
        .map(|n| n.id.clone())
        .collect();
    Err(DefinitionError::Unreachable { tasks })
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

impl WorkflowGraph {
    pub fn definition(&self) -> &Arc<WorkflowDefinition> {
        &self.definition
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> &TaskNode {
        &self.nodes[index]
    }

    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    pub fn task(&self, index: usize) -> &TaskDefinition {
        &self.definition.tasks[index]
    }

    pub fn index_of(&self, task_id: &str) -> Option<usize> {
        self.index.get(task_id).copied()
    }

    /// Task indices in dependency order.
    pub fn topological_order(&self) -> &[usize] {
        &self.order
    }

    pub fn start_tasks(&self) -> &[usize] {
        &self.start
    }

    pub fn dependencies(&self, index: usize) -> &[usize] {
        &self.nodes[index].dependencies
    }

    pub fn dependents(&self, index: usize) -> &[usize] {
        &self.nodes[index].dependents
    }

    pub fn handlers(&self) -> &[HandlerRoute] {
        &self.handlers
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::test_support::{definition, task};
    use taskflow_types::workflow::{ErrorHandler, Transition};

    fn build(def: &WorkflowDefinition) -> Result<WorkflowGraph, DefinitionError> {
        WorkflowGraph::build(def, &ExpressionEvaluator::new())
    }

    fn ids(graph: &WorkflowGraph, indices: &[usize]) -> Vec<String> {
        indices.iter().map(|&i| graph.node(i).id.clone()).collect()
    }

    #[test]
    fn test_linear_pipeline() {
        let def = definition(vec![
            task("generate_report", &["process_data"]),
            task("process_data", &["fetch_data"]),
            task("fetch_data", &[]),
        ]);
        let graph = build(&def).unwrap();
        assert_eq!(
            ids(&graph, graph.topological_order()),
            vec!["fetch_data", "process_data", "generate_report"]
        );
        assert_eq!(ids(&graph, graph.start_tasks()), vec!["fetch_data"]);
        let process = graph.index_of("process_data").unwrap();
        assert_eq!(ids(&graph, graph.dependencies(process)), vec!["fetch_data"]);
        assert_eq!(ids(&graph, graph.dependents(process)), vec!["generate_report"]);
    }

    #[test]
    fn test_two_task_cycle_rejected() {
        let def = definition(vec![task("a", &["b"]), task("b", &["a"]), task("c", &[])]);
        match build(&def) {
            Err(DefinitionError::CyclicGraph { tasks }) => assert_eq!(tasks, vec!["a", "b"]),
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_cycle_through_transition_rejected() {
        let mut a = task("a", &[]);
        a.transitions.push(Transition {
            target: "b".to_string(),
            guard: None,
            automatic: true,
        });
        let b = task("b", &["a"]);
        let mut c = task("c", &["b"]);
        c.transitions.push(Transition {
            target: "b".to_string(),
            guard: None,
            automatic: true,
        });
        let def = definition(vec![a, b, c]);
        assert!(matches!(build(&def), Err(DefinitionError::CyclicGraph { .. })));
    }

    #[test]
    fn test_unknown_references() {
        let def = definition(vec![task("a", &["ghost"])]);
        assert!(matches!(
            build(&def),
            Err(DefinitionError::UnknownDependency { dependency, .. }) if dependency == "ghost"
        ));

        let mut a = task("a", &[]);
        a.transitions.push(Transition {
            target: "nowhere".to_string(),
            guard: None,
            automatic: true,
        });
        assert!(matches!(
            build(&definition(vec![a])),
            Err(DefinitionError::UnknownTransitionTarget { .. })
        ));

        let mut def = definition(vec![task("a", &[])]);
        def.error_handlers.push(ErrorHandler {
            error_kind: None,
            task: "missing".to_string(),
        });
        assert!(matches!(
            build(&def),
            Err(DefinitionError::UnknownHandlerTarget(t)) if t == "missing"
        ));
    }

    #[test]
    fn test_unreachable_task_rejected() {
        let mut def = definition(vec![task("a", &[]), task("b", &["a"]), task("orphan", &[])]);
        def.start_tasks = vec!["a".to_string()];
        match build(&def) {
            Err(DefinitionError::Unreachable { tasks }) => assert_eq!(tasks, vec!["orphan"]),
            other => panic!("expected unreachable error, got {other:?}"),
        }
    }

    #[test]
    fn test_handler_target_is_not_a_root() {
        let mut def = definition(vec![task("work", &[]), task("notify", &[])]);
        def.error_handlers.push(ErrorHandler {
            error_kind: Some(ErrorKind::TaskTimeout),
            task: "notify".to_string(),
        });
        let graph = build(&def).unwrap();
        assert_eq!(ids(&graph, graph.start_tasks()), vec!["work"]);
        let notify = graph.index_of("notify").unwrap();
        assert!(graph.node(notify).handler_target);
        assert_eq!(graph.handlers()[0].target, notify);
    }

    #[test]
    fn test_error_transition_classified() {
        let mut a = task("a", &[]);
        a.transitions = vec![
            Transition {
                target: "ok".to_string(),
                guard: Some("state.tasks.a.output.rows > 0".to_string()),
                automatic: false,
            },
            Transition {
                target: "recover".to_string(),
                guard: Some("error.kind == 'task_timeout'".to_string()),
                automatic: false,
            },
        ];
        let def = definition(vec![a, task("ok", &[]), task("recover", &[])]);
        let graph = build(&def).unwrap();
        let edges = &graph.node(0).transitions;
        assert!(!edges[0].on_error);
        assert!(edges[1].on_error);
        assert!(graph.node(1).is_gated());
        assert_eq!(ids(&graph, graph.start_tasks()), vec!["a"]);
    }

    #[test]
    fn test_bad_guard_rejected_at_build() {
        let mut a = task("a", &[]);
        a.transitions.push(Transition {
            target: "b".to_string(),
            guard: Some("state.x = 1".to_string()),
            automatic: false,
        });
        let def = definition(vec![a, task("b", &[])]);
        assert!(matches!(
            build(&def),
            Err(DefinitionError::Expression { task, .. }) if task == "a"
        ));
    }

    #[test]
    fn test_bad_input_template_rejected() {
        let mut a = task("a", &[]);
        a.input = serde_json::json!({ "url": "${input.url" });
        assert!(matches!(
            build(&definition(vec![a])),
            Err(DefinitionError::Expression { .. })
        ));
    }

    #[test]
    fn test_any_join_needs_two_dependencies() {
        let mut b = task("b", &["a"]);
        b.join = JoinType::Any;
        let def = definition(vec![task("a", &[]), b]);
        assert!(matches!(build(&def), Err(DefinitionError::Invalid(_))));
    }
}
