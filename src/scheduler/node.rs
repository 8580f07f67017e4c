// Task-graph nodes.
//
// A node exists in two forms. Before a graph is frozen, users connect
// [`TaskNode`] handles with `add_dependent`; edges are kept as weak links
// so even a (rejected) cyclic construction cannot leak. Freezing turns the
// reachable handles into [`NodeTopology`] entries whose edges are plain
// indices into the graph's node vector, and every in-flight frame carries
// one [`FrameNodeState`] per node.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::scheduler::task::Task;

static NEXT_NODE_ID: AtomicU32 = AtomicU32::new(1);

/// Allocate a fresh process-wide unique node id
pub(crate) fn next_node_id() -> u32 {
    NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Default)]
pub(crate) struct NodeEdges {
    pub(crate) dependents: Vec<Weak<NodeCell>>,
    pub(crate) dependencies: Vec<Weak<NodeCell>>,
}

/// Shared interior of a pre-freeze node handle
pub(crate) struct NodeCell {
    pub(crate) id: u32,
    pub(crate) task: Arc<dyn Task>,
    pub(crate) edges: Mutex<NodeEdges>,
}

/// A task wrapped for graph construction.
///
/// Handles are cheap to clone and refer to the same underlying node. The
/// wrapped task is shared, not owned: several nodes may wrap the same
/// task, and the task outlives the graphs built from it.
#[derive(Clone)]
pub struct TaskNode {
    pub(crate) cell: Arc<NodeCell>,
}

impl TaskNode {
    pub fn new(task: Arc<dyn Task>) -> Self {
        Self {
            cell: Arc::new(NodeCell {
                id: next_node_id(),
                task,
                edges: Mutex::new(NodeEdges::default()),
            }),
        }
    }

    /// Stable identifier of this node
    pub fn id(&self) -> u32 {
        self.cell.id
    }

    /// The task carried by this node
    pub fn task(&self) -> &Arc<dyn Task> {
        &self.cell.task
    }

    /// Declare that `other` depends on this node: `other` can only start
    /// once this node's task has completed for the frame. Both edge lists
    /// are kept in mirror.
    pub fn add_dependent(&self, other: &TaskNode) {
        self.cell
            .edges
            .lock()
            .dependents
            .push(Arc::downgrade(&other.cell));
        other
            .cell
            .edges
            .lock()
            .dependencies
            .push(Arc::downgrade(&self.cell));
    }
}

/// One node of a frozen graph. Edges are indices into the owning graph's
/// node vector, so the topology carries no ownership cycles.
pub(crate) struct NodeTopology {
    pub(crate) id: u32,
    pub(crate) task: Arc<dyn Task>,
    pub(crate) dependencies: Vec<usize>,
    pub(crate) dependents: Vec<usize>,
    /// How often the node was encountered while parsing the root set:
    /// 0 = never, 1 = once, 2 = more than once
    pub(crate) visits: u8,
    /// Whether the node shows up in DOT output; internal helper nodes
    /// such as the end-of-frame guard are hidden
    pub(crate) exposed: bool,
}

impl NodeTopology {
    pub(crate) fn record_visit(&mut self) {
        self.visits = (self.visits + 1).min(2);
    }
}

/// Per-frame mutable state of one node.
pub(crate) struct FrameNodeState {
    /// Completion flag for the frame the instance currently represents
    completed: AtomicBool,
    /// Set while the node sits in the queue or runs; guards against a node
    /// being executed twice within one frame
    scheduled: AtomicBool,
    /// Consecutive retries within the current frame
    retries: AtomicU32,
}

impl FrameNodeState {
    pub(crate) fn new() -> Self {
        Self {
            completed: AtomicBool::new(false),
            scheduled: AtomicBool::new(false),
            retries: AtomicU32::new(0),
        }
    }

    pub(crate) fn reset(&self) {
        self.completed.store(false, Ordering::Relaxed);
        self.scheduled.store(false, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
    }

    /// The release store pairs with the acquire in `is_completed`; it is
    /// what establishes the dependency happens-before edge between tasks.
    pub(crate) fn mark_completed(&self) {
        self.completed.store(true, Ordering::Release);
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Claim the right to enqueue this node for the current frame.
    pub(crate) fn try_mark_scheduled(&self) -> bool {
        self.scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Give the slot back after a retry so a later dispatcher pass can
    /// re-queue the node.
    pub(crate) fn clear_scheduled(&self) {
        self.scheduled.store(false, Ordering::Release);
    }

    pub(crate) fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }

    pub(crate) fn note_retry(&self) -> u32 {
        self.retries.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn retries(&self) -> u32 {
        self.retries.load(Ordering::Acquire)
    }
}
