// FrameFlow - concurrent task execution core for rendering engines
//
// The crate provides three layers, bottom up:
// - `concurrent`: a hazard-pointer pool and a lock-free MPMC queue built
//   on top of it
// - `scheduler::graph` / `scheduler::node` / `scheduler::task`: a typed,
//   acyclic task graph that can be cloned per in-flight frame
// - `scheduler::sink`: the dispatcher + worker pool driving up to N frame
//   instances of the graph at once
//
// The GPU backend, windowing, shader tooling and the rest of an engine
// live elsewhere; they plug in through the `Task` trait only.

pub mod concurrent;
pub mod error;
pub mod scheduler;

pub use error::{CoreError, Result};
pub use scheduler::{
    next_task_id, ExecutionStats, ExitLoopTask, FnTask, RunOutcome, SinkController, SinkOptions,
    Task, TaskGraph, TaskId, TaskKind, TaskNode, TaskSink, WorkerLogStream,
    DEFAULT_FRAMES_IN_FLIGHT, DEFAULT_WORKER_COUNT,
};
