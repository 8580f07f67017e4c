// Task graph: a DAG of task nodes rooted at a user-supplied set.
//
// Building a graph freezes the pre-freeze `TaskNode` handles into a dense
// topology with index-based edges, validates acyclicity (reporting the
// offending path) and reachability, and records per-node visitation
// counters. Frozen graphs are cloned structurally into frame instances:
// the topology is shared immutably, per-frame completion state is fresh.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use tracing::{debug, info};

use crate::error::{CoreError, Result};
use crate::scheduler::node::{next_node_id, FrameNodeState, NodeCell, NodeTopology, TaskNode};
use crate::scheduler::task::{effective_outcome, RunOutcome, Task, TaskKind};

/// Worker count a graph is paired with when the caller does not choose one
pub const DEFAULT_WORKER_COUNT: u8 = 8;

/// Frozen graph shape shared by every frame instance.
pub(crate) struct GraphTopology {
    pub(crate) name: String,
    pub(crate) nodes: Vec<NodeTopology>,
    /// Index of the end-of-frame guard once the sink injected it
    pub(crate) guard_index: Option<usize>,
}

/// A set of task nodes reachable from a root set, validated to be acyclic,
/// paired with a worker count and a display name.
pub struct TaskGraph {
    topology: GraphTopology,
    workers: u8,
    index_of: HashMap<u32, usize>,
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("name", &self.topology.name)
            .field("workers", &self.workers)
            .field("node_count", &self.topology.nodes.len())
            .finish()
    }
}

impl TaskGraph {
    /// Build a graph from the given root nodes.
    ///
    /// Walks the `dependents` edges from the roots, assigning every
    /// reachable node a dense index. Fails with
    /// [`CoreError::CycleDetected`] if the transitive dependent closure
    /// contains a cycle, and with [`CoreError::InvalidGraphState`] if a
    /// reachable node depends on a node the roots cannot reach.
    pub fn new(roots: &[TaskNode], workers: u8, name: &str) -> Result<Self> {
        let cells = collect_reachable(roots)?;
        let index_of: HashMap<u32, usize> = cells
            .iter()
            .enumerate()
            .map(|(index, cell)| (cell.id, index))
            .collect();

        let mut nodes = Vec::with_capacity(cells.len());
        for cell in &cells {
            let edges = cell.edges.lock();

            let mut dependents = Vec::with_capacity(edges.dependents.len());
            for weak in &edges.dependents {
                let target = upgrade(weak)?;
                // Every dependent of a reachable node was traversed, so the
                // lookup cannot miss.
                dependents.push(index_of[&target.id]);
            }

            let mut dependencies = Vec::with_capacity(edges.dependencies.len());
            for weak in &edges.dependencies {
                let source = upgrade(weak)?;
                match index_of.get(&source.id) {
                    Some(&index) => dependencies.push(index),
                    None => {
                        return Err(CoreError::InvalidGraphState(format!(
                            "task \"{}\" depends on \"{}\", which is not reachable from the graph roots",
                            cell.task.name(),
                            source.task.name(),
                        )))
                    }
                }
            }

            nodes.push(NodeTopology {
                id: cell.id,
                task: Arc::clone(&cell.task),
                dependencies,
                dependents,
                visits: 0,
                exposed: true,
            });
        }

        // A node is visited once per root listing and once per incoming edge
        for root in roots {
            nodes[index_of[&root.cell.id]].record_visit();
        }
        for index in 0..nodes.len() {
            for dependent in nodes[index].dependents.clone() {
                nodes[dependent].record_visit();
            }
        }

        if let Some(path) = find_cycle(&nodes) {
            return Err(CoreError::CycleDetected {
                path: path.iter().map(|&i| nodes[i].task.name().to_owned()).collect(),
            });
        }

        for node in &nodes {
            if node.visits > 1 {
                debug!(
                    graph = name,
                    task = node.task.name(),
                    id = node.id,
                    "node is shared between several branches"
                );
            }
        }

        info!(
            graph = name,
            nodes = nodes.len(),
            workers,
            "task graph built"
        );

        Ok(Self {
            topology: GraphTopology {
                name: name.to_owned(),
                nodes,
                guard_index: None,
            },
            workers,
            index_of,
        })
    }

    /// Build a graph sized to the machine's logical CPU count.
    pub fn with_hardware_workers(roots: &[TaskNode], name: &str) -> Result<Self> {
        let workers = num_cpus::get().clamp(1, u8::MAX as usize) as u8;
        Self::new(roots, workers, name)
    }

    /// Number of worker threads assigned to this graph
    pub fn worker_count(&self) -> u8 {
        self.workers
    }

    /// Display name of this graph
    pub fn name(&self) -> &str {
        &self.topology.name
    }

    /// Number of nodes in the frozen graph
    pub fn node_count(&self) -> usize {
        self.topology.nodes.len()
    }

    /// Add a dependency edge between two nodes that are already part of
    /// this graph: `to` will only start once `from` completed.
    ///
    /// Fails with [`CoreError::InvalidGraphState`] if either node is not in
    /// the graph and with [`CoreError::CycleDetected`] if the edge would
    /// close a cycle (the edge is not inserted in that case).
    pub fn add_dependent(&mut self, from: &TaskNode, to: &TaskNode) -> Result<()> {
        let from_index = self.lookup(from)?;
        let to_index = self.lookup(to)?;

        self.topology.nodes[from_index].dependents.push(to_index);
        self.topology.nodes[to_index].dependencies.push(from_index);
        self.topology.nodes[to_index].record_visit();

        if let Some(path) = find_cycle(&self.topology.nodes) {
            self.topology.nodes[from_index].dependents.pop();
            self.topology.nodes[to_index].dependencies.pop();
            return Err(CoreError::CycleDetected {
                path: path
                    .iter()
                    .map(|&i| self.topology.nodes[i].task.name().to_owned())
                    .collect(),
            });
        }

        debug!(
            graph = self.topology.name.as_str(),
            from = self.topology.nodes[from_index].task.name(),
            to = self.topology.nodes[to_index].task.name(),
            "dependency edge added"
        );
        Ok(())
    }

    /// Attach `task` as an additional dependent of every node that has no
    /// dependents, making it the unique sink of the graph.
    pub fn inject_dependent_task(&mut self, task: Arc<dyn Task>) -> Result<()> {
        self.inject_node(task, true)
    }

    pub(crate) fn inject_guard(&mut self, task: Arc<dyn Task>) -> Result<usize> {
        self.inject_node(task, false)?;
        let index = self.topology.nodes.len() - 1;
        self.topology.guard_index = Some(index);
        Ok(index)
    }

    fn inject_node(&mut self, task: Arc<dyn Task>, exposed: bool) -> Result<()> {
        let terminals: Vec<usize> = (0..self.topology.nodes.len())
            .filter(|&i| self.topology.nodes[i].dependents.is_empty())
            .collect();
        if terminals.is_empty() {
            return Err(CoreError::InvalidGraphState(format!(
                "graph \"{}\" has no terminal node to attach \"{}\" to",
                self.topology.name,
                task.name(),
            )));
        }

        let index = self.topology.nodes.len();
        for &terminal in &terminals {
            self.topology.nodes[terminal].dependents.push(index);
        }
        let id = next_node_id();
        self.index_of.insert(id, index);
        self.topology.nodes.push(NodeTopology {
            id,
            task,
            dependencies: terminals,
            dependents: Vec::new(),
            visits: 1,
            exposed,
        });
        Ok(())
    }

    /// Render the graph in Graphviz DOT. Nodes are emitted in index order,
    /// so repeated calls produce identical output. The format is a
    /// debugging aid, not a stable interface.
    pub fn to_dot(&self) -> String {
        let mut dot = format!("digraph {} {{\n", sanitize_dot_name(&self.topology.name));
        dot.push_str("node[style=filled];\n");

        for (index, node) in self.topology.nodes.iter().enumerate() {
            if !node.exposed {
                continue;
            }
            let style = match node.task.kind() {
                TaskKind::Cpu => "fillcolor=lightblue, shape=box",
                TaskKind::GpuDraw => "fillcolor=yellow, shape=oval",
                TaskKind::GpuCompute => "fillcolor=red, fontcolor=white, shape=hexagon",
                TaskKind::GpuCopy => "fillcolor=gray, fontcolor=white, shape=diamond",
                TaskKind::Other => "fillcolor=white, shape=triangle",
                TaskKind::Exit => "fillcolor=black, fontcolor=white, shape=doubleoctagon",
            };
            dot.push_str(&format!(
                "task{}[label=\"{}\", {}];\n",
                index,
                node.task.name(),
                style
            ));
        }

        for (index, node) in self.topology.nodes.iter().enumerate() {
            if !node.exposed {
                continue;
            }
            for &dependent in &node.dependents {
                if !self.topology.nodes[dependent].exposed {
                    continue;
                }
                dot.push_str(&format!("task{}->task{};\n", index, dependent));
            }
        }

        dot.push_str("}\n");
        dot
    }

    /// Write the DOT rendering to `path`.
    pub fn write_dot(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.to_dot())?;
        Ok(())
    }

    pub(crate) fn into_parts(self) -> (Arc<GraphTopology>, u8) {
        (Arc::new(self.topology), self.workers)
    }

    fn lookup(&self, node: &TaskNode) -> Result<usize> {
        self.index_of.get(&node.cell.id).copied().ok_or_else(|| {
            CoreError::InvalidGraphState(format!(
                "task \"{}\" is not part of graph \"{}\"",
                node.task().name(),
                self.topology.name,
            ))
        })
    }
}

fn upgrade(weak: &Weak<NodeCell>) -> Result<Arc<NodeCell>> {
    weak.upgrade().ok_or_else(|| {
        CoreError::InvalidGraphState(
            "a graph node was dropped before the graph was built".to_owned(),
        )
    })
}

/// Depth-first collection of every node reachable from the roots, in
/// deterministic discovery order.
fn collect_reachable(roots: &[TaskNode]) -> Result<Vec<Arc<NodeCell>>> {
    let mut order: Vec<Arc<NodeCell>> = Vec::new();
    let mut seen: HashSet<u32> = HashSet::new();
    let mut stack: Vec<Arc<NodeCell>> = Vec::new();

    for root in roots.iter().rev() {
        stack.push(Arc::clone(&root.cell));
    }

    while let Some(cell) = stack.pop() {
        if !seen.insert(cell.id) {
            continue;
        }

        let dependents = {
            let edges = cell.edges.lock();
            edges.dependents.clone()
        };
        // Reverse keeps the first-listed dependent first in discovery order
        for weak in dependents.iter().rev() {
            let target = upgrade(weak)?;
            if !seen.contains(&target.id) {
                stack.push(target);
            }
        }
        order.push(cell);
    }

    Ok(order)
}

/// DFS cycle search over the index edges; returns the nodes on the cycle,
/// first node repeated at the end.
fn find_cycle(nodes: &[NodeTopology]) -> Option<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        White,
        Grey,
        Black,
    }

    let mut marks = vec![Mark::White; nodes.len()];

    for start in 0..nodes.len() {
        if marks[start] != Mark::White {
            continue;
        }
        marks[start] = Mark::Grey;
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];

        while let Some(frame) = stack.last_mut() {
            let (node, edge) = (frame.0, frame.1);
            frame.1 += 1;

            if edge >= nodes[node].dependents.len() {
                marks[node] = Mark::Black;
                stack.pop();
                continue;
            }

            let next = nodes[node].dependents[edge];
            match marks[next] {
                Mark::White => {
                    marks[next] = Mark::Grey;
                    stack.push((next, 0));
                }
                Mark::Grey => {
                    let first = stack
                        .iter()
                        .position(|&(n, _)| n == next)
                        .unwrap_or(0);
                    let mut path: Vec<usize> = stack[first..].iter().map(|&(n, _)| n).collect();
                    path.push(next);
                    return Some(path);
                }
                Mark::Black => {}
            }
        }
    }

    None
}

fn sanitize_dot_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, 'g');
    }
    out
}

/// One clone of the graph for a single in-flight execution pass.
///
/// Shares the frozen topology; carries fresh per-node completion state.
/// The `frame_index` equals the instance's slot in the sink's ring, so
/// per-frame state is indexed modulo the ring length by construction.
pub(crate) struct FrameInstance {
    topology: Arc<GraphTopology>,
    frame_index: u16,
    states: Vec<FrameNodeState>,
    /// Tickets of this frame currently sitting in the queue
    pending: AtomicU32,
    /// Nodes of this frame currently being executed
    running: AtomicU32,
}

impl FrameInstance {
    pub(crate) fn new(topology: Arc<GraphTopology>, frame_index: u16) -> Self {
        let states = (0..topology.nodes.len())
            .map(|_| FrameNodeState::new())
            .collect();
        Self {
            topology,
            frame_index,
            states,
            pending: AtomicU32::new(0),
            running: AtomicU32::new(0),
        }
    }

    pub(crate) fn frame_index(&self) -> u16 {
        self.frame_index
    }

    pub(crate) fn node_count(&self) -> usize {
        self.topology.nodes.len()
    }

    pub(crate) fn reset_for_frame(&self) {
        for state in &self.states {
            state.reset();
        }
    }

    pub(crate) fn is_completed(&self, node: usize) -> bool {
        self.states[node].is_completed()
    }

    /// A node is ready to launch once every dependency completed for the
    /// frame this instance represents.
    pub(crate) fn is_ready(&self, node: usize) -> bool {
        self.topology.nodes[node]
            .dependencies
            .iter()
            .all(|&dep| self.states[dep].is_completed())
    }

    pub(crate) fn try_mark_scheduled(&self, node: usize) -> bool {
        self.states[node].try_mark_scheduled()
    }

    pub(crate) fn clear_scheduled(&self, node: usize) {
        self.states[node].clear_scheduled();
    }

    pub(crate) fn retries(&self, node: usize) -> u32 {
        self.states[node].retries()
    }

    pub(crate) fn note_enqueued(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Undo `note_enqueued` when handing the ticket to the queue failed.
    pub(crate) fn note_enqueue_aborted(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn note_execution_started(&self) {
        self.running.fetch_add(1, Ordering::AcqRel);
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn note_execution_finished(&self) {
        self.running.fetch_sub(1, Ordering::AcqRel);
    }

    /// No tickets queued and nothing executing for this instance.
    pub(crate) fn is_quiescent(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0 && self.running.load(Ordering::Acquire) == 0
    }

    /// Whether any node could still be handed to the queue. Used by the
    /// post-exit recovery to distinguish stuck frames from frames that are
    /// merely between dispatcher passes.
    pub(crate) fn has_schedulable_node(&self, skip_retried: bool) -> bool {
        (0..self.topology.nodes.len()).any(|node| {
            let state = &self.states[node];
            !state.is_completed()
                && !state.is_scheduled()
                && !(skip_retried && state.retries() > 0)
                && self.is_ready(node)
        })
    }

    pub(crate) fn all_completed(&self) -> bool {
        (0..self.topology.nodes.len()).all(|node| {
            self.topology.guard_index == Some(node) || self.states[node].is_completed()
        })
    }

    pub(crate) fn node_name(&self, node: usize) -> &str {
        self.topology.nodes[node].task.name()
    }

    /// Execute the node's task and update the per-frame state according to
    /// the outcome. The completion store uses release ordering, which is
    /// what establishes the happens-before edge to dependent tasks.
    pub(crate) fn execute(&self, node: usize, worker_id: u8) -> RunOutcome {
        let topo = &self.topology.nodes[node];
        let started = Instant::now();
        let outcome = effective_outcome(&*topo.task, topo.task.run(worker_id, self.frame_index));
        if let Some(stats) = topo.task.execution_stats() {
            stats.record(worker_id, started.elapsed());
        }

        if self.topology.guard_index == Some(node) {
            // The guard released this frame slot inside run(); the slot may
            // already be claimed and reset for a new frame, so its per-node
            // state must not be touched from here on.
            return outcome;
        }

        match outcome {
            RunOutcome::Done => self.states[node].mark_completed(),
            RunOutcome::Retry => {
                self.states[node].note_retry();
                self.states[node].clear_scheduled();
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::task::FnTask;

    fn cpu_node(name: &str) -> TaskNode {
        TaskNode::new(Arc::new(FnTask::new(name, TaskKind::Cpu, |_, _| {
            RunOutcome::Done
        })))
    }

    #[test]
    fn test_build_linear_graph() {
        let a = cpu_node("a");
        let b = cpu_node("b");
        let c = cpu_node("c");
        a.add_dependent(&b);
        b.add_dependent(&c);

        let graph = TaskGraph::new(&[a], 4, "linear").unwrap();
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.worker_count(), 4);
        assert_eq!(graph.name(), "linear");
    }

    #[test]
    fn test_cycle_detection_reports_path() {
        let a = cpu_node("a");
        let b = cpu_node("b");
        let c = cpu_node("c");
        a.add_dependent(&b);
        b.add_dependent(&c);
        c.add_dependent(&a);

        let err = TaskGraph::new(&[a], 2, "cyclic").unwrap_err();
        match err {
            CoreError::CycleDetected { path } => {
                for name in ["a", "b", "c"] {
                    assert!(path.iter().any(|p| p == name), "missing {name} in {path:?}");
                }
            }
            other => panic!("expected CycleDetected, got {other}"),
        }
    }

    #[test]
    fn test_unreachable_dependency_is_rejected() {
        let orphan = cpu_node("orphan");
        let root = cpu_node("root");
        let child = cpu_node("child");
        root.add_dependent(&child);
        orphan.add_dependent(&child);

        let err = TaskGraph::new(&[root], 2, "partial").unwrap_err();
        assert!(matches!(err, CoreError::InvalidGraphState(_)));
    }

    #[test]
    fn test_graph_level_add_dependent() {
        let a = cpu_node("a");
        let b = cpu_node("b");
        let c = cpu_node("c");
        a.add_dependent(&b);
        a.add_dependent(&c);

        let mut graph = TaskGraph::new(&[a.clone()], 2, "edges").unwrap();
        graph.add_dependent(&b, &c).unwrap();

        // Closing the cycle back to the root must be rejected and rolled back
        let err = graph.add_dependent(&c, &a).unwrap_err();
        assert!(matches!(err, CoreError::CycleDetected { .. }));
        assert_eq!(graph.node_count(), 3);
    }

    #[test]
    fn test_add_dependent_requires_membership() {
        let a = cpu_node("a");
        let stranger = cpu_node("stranger");
        let mut graph = TaskGraph::new(&[a.clone()], 2, "closed").unwrap();

        let err = graph.add_dependent(&a, &stranger).unwrap_err();
        assert!(matches!(err, CoreError::InvalidGraphState(_)));
    }

    #[test]
    fn test_inject_dependent_task_becomes_unique_sink() {
        let root = cpu_node("root");
        let left = cpu_node("left");
        let right = cpu_node("right");
        root.add_dependent(&left);
        root.add_dependent(&right);

        let mut graph = TaskGraph::new(&[root], 2, "fanout").unwrap();
        let tail = Arc::new(FnTask::new("tail", TaskKind::Cpu, |_, _| RunOutcome::Done));
        graph.inject_dependent_task(tail).unwrap();

        assert_eq!(graph.node_count(), 4);
        let dot = graph.to_dot();
        assert!(dot.contains("task1->task3"));
        assert!(dot.contains("task2->task3"));
    }

    #[test]
    fn test_inject_into_empty_graph_fails() {
        let mut graph = TaskGraph::new(&[], 2, "empty").unwrap();
        let tail = Arc::new(FnTask::new("tail", TaskKind::Cpu, |_, _| RunOutcome::Done));
        assert!(matches!(
            graph.inject_dependent_task(tail),
            Err(CoreError::InvalidGraphState(_))
        ));
    }

    #[test]
    fn test_dot_is_deterministic_and_styled() {
        let a = TaskNode::new(Arc::new(FnTask::new("draw", TaskKind::GpuDraw, |_, _| {
            RunOutcome::Done
        })));
        let b = TaskNode::new(Arc::new(FnTask::new("compute", TaskKind::GpuCompute, |_, _| {
            RunOutcome::Done
        })));
        a.add_dependent(&b);

        let graph = TaskGraph::new(&[a], 2, "render pass").unwrap();
        let first = graph.to_dot();
        let second = graph.to_dot();
        assert_eq!(first, second);

        assert!(first.starts_with("digraph render_pass {"));
        assert!(first.contains("fillcolor=yellow, shape=oval"));
        assert!(first.contains("fillcolor=red, fontcolor=white, shape=hexagon"));
        assert!(first.contains("task0->task1;"));
    }

    #[test]
    fn test_visit_counters_mark_shared_nodes() {
        let root = cpu_node("root");
        let left = cpu_node("left");
        let right = cpu_node("right");
        let join = cpu_node("join");
        root.add_dependent(&left);
        root.add_dependent(&right);
        left.add_dependent(&join);
        right.add_dependent(&join);

        let graph = TaskGraph::new(&[root], 2, "diamond").unwrap();
        let (topology, _) = graph.into_parts();

        // Discovery order: root, left, join, right
        assert_eq!(topology.nodes[0].visits, 1);
        assert_eq!(topology.nodes[1].visits, 1);
        assert_eq!(topology.nodes[2].visits, 2, "join is reached twice");
        assert_eq!(topology.nodes[3].visits, 1);
    }

    #[test]
    fn test_frame_instance_readiness() {
        let a = cpu_node("a");
        let b = cpu_node("b");
        a.add_dependent(&b);

        let graph = TaskGraph::new(&[a], 2, "frames").unwrap();
        let (topology, _) = graph.into_parts();
        let frame = FrameInstance::new(topology, 3);

        assert_eq!(frame.frame_index(), 3);
        assert!(frame.is_ready(0));
        assert!(!frame.is_ready(1));

        assert_eq!(frame.execute(0, 0), RunOutcome::Done);
        assert!(frame.is_completed(0));
        assert!(frame.is_ready(1));

        frame.reset_for_frame();
        assert!(!frame.is_completed(0));
        assert!(!frame.is_ready(1));
    }
}
