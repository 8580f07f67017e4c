// Task-graph scheduling module
//
// A task graph is built once from a user root set, validated to be
// acyclic, and then executed frame after frame by the task sink: the
// dispatcher feeds launch-ready nodes of every in-flight frame into the
// shared lock-free queue and the worker pool drains it.

pub mod graph;
pub mod node;
pub mod sink;
pub mod task;

// Re-export main types
pub use graph::{TaskGraph, DEFAULT_WORKER_COUNT};
pub use node::TaskNode;
pub use sink::{SinkController, SinkOptions, TaskSink, WorkerLogStream, DEFAULT_FRAMES_IN_FLIGHT};
pub use task::{
    next_task_id, ExecutionStats, ExitLoopTask, FnTask, RunOutcome, Task, TaskId, TaskKind,
};
