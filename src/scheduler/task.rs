// Task abstraction executed by the sink's worker threads.
//
// Tasks are polymorphic and opaque to the core: a task performs arbitrary
// domain work (CPU-side preparation, GPU command recording, uploads, ...)
// and only reports whether it finished or wants to be rescheduled.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use tracing::warn;

/// Stable task identifier
pub type TaskId = u64;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh process-wide unique task id
pub fn next_task_id() -> TaskId {
    NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)
}

/// Task classification.
///
/// Purely informational for the core: it drives graph visualisation and
/// gives policy hooks something to dispatch on. `Exit` marks a task that
/// user code uses to signal "the sink should drain and stop"; the actual
/// exit condition is [`dispatch_exit_signal`](crate::TaskSink::dispatch_exit_signal),
/// the kind is advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Cpu,
    GpuDraw,
    GpuCompute,
    GpuCopy,
    Other,
    Exit,
}

/// Result of one task invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The task finished; its completion flag may be set
    Done,
    /// The task wants to run again later; its completion flag stays clear
    /// and the dispatcher re-queues it on a later pass
    Retry,
}

/// Per-task execution statistics: which worker ran the task last and how
/// long the run took. Updated by the node wrapper after every invocation.
#[derive(Debug, Default)]
pub struct ExecutionStats {
    worker: AtomicU8,
    duration_ns: AtomicU64,
}

impl ExecutionStats {
    pub const fn new() -> Self {
        Self {
            worker: AtomicU8::new(0),
            duration_ns: AtomicU64::new(0),
        }
    }

    pub fn record(&self, worker: u8, duration: Duration) {
        self.worker.store(worker, Ordering::Relaxed);
        self.duration_ns
            .store(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn last_worker(&self) -> u8 {
        self.worker.load(Ordering::Relaxed)
    }

    pub fn last_duration(&self) -> Duration {
        Duration::from_nanos(self.duration_ns.load(Ordering::Relaxed))
    }
}

/// An abstract unit of work scheduled through the task graph.
///
/// The graph topology guarantees at most one concurrent invocation per
/// task unless the user wires the same task into several nodes, in which
/// case the task itself is responsible for its own synchronisation. The
/// `frame_index` parameter identifies the in-flight frame the invocation
/// belongs to and can be used to partition per-frame state.
pub trait Task: Send + Sync {
    /// Stable identifier of this task
    fn id(&self) -> TaskId;

    /// Human-readable name, used in logs and DOT output
    fn name(&self) -> &str;

    /// Classification of this task
    fn kind(&self) -> TaskKind;

    /// Perform the work of this task
    fn run(&self, worker_id: u8, frame_index: u16) -> RunOutcome;

    /// Whether the task may answer [`RunOutcome::Retry`]. A retry from a
    /// task that forbids rescheduling is demoted to `Done` with a warning.
    fn allow_reschedule(&self) -> bool {
        true
    }

    /// Execution statistics record, if the task keeps one
    fn execution_stats(&self) -> Option<&ExecutionStats> {
        None
    }
}

/// Resolve a task's outcome against its reschedule policy.
pub(crate) fn effective_outcome(task: &dyn Task, outcome: RunOutcome) -> RunOutcome {
    if outcome == RunOutcome::Retry && !task.allow_reschedule() {
        warn!(
            task = task.name(),
            "task asked for a retry but forbids rescheduling; treating as done"
        );
        return RunOutcome::Done;
    }
    outcome
}

/// Closure-backed [`Task`], the convenient way to assemble graphs without
/// writing a struct per operation.
pub struct FnTask<F>
where
    F: Fn(u8, u16) -> RunOutcome + Send + Sync,
{
    id: TaskId,
    name: String,
    kind: TaskKind,
    reschedulable: bool,
    stats: ExecutionStats,
    body: F,
}

impl<F> FnTask<F>
where
    F: Fn(u8, u16) -> RunOutcome + Send + Sync,
{
    pub fn new(name: impl Into<String>, kind: TaskKind, body: F) -> Self {
        Self {
            id: next_task_id(),
            name: name.into(),
            kind,
            reschedulable: true,
            stats: ExecutionStats::new(),
            body,
        }
    }

    /// Forbid [`RunOutcome::Retry`] answers from this task
    pub fn pinned(mut self) -> Self {
        self.reschedulable = false;
        self
    }
}

impl<F> Task for FnTask<F>
where
    F: Fn(u8, u16) -> RunOutcome + Send + Sync,
{
    fn id(&self) -> TaskId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TaskKind {
        self.kind
    }

    fn run(&self, worker_id: u8, frame_index: u16) -> RunOutcome {
        (self.body)(worker_id, frame_index)
    }

    fn allow_reschedule(&self) -> bool {
        self.reschedulable
    }

    fn execution_stats(&self) -> Option<&ExecutionStats> {
        Some(&self.stats)
    }
}

/// No-op task of kind [`TaskKind::Exit`]; wired into a graph as an
/// advisory marker for the spot where user code raises the exit signal.
pub struct ExitLoopTask {
    id: TaskId,
    name: String,
}

impl ExitLoopTask {
    pub fn new() -> Self {
        Self {
            id: next_task_id(),
            name: "exit-main-loop".to_owned(),
        }
    }
}

impl Default for ExitLoopTask {
    fn default() -> Self {
        Self::new()
    }
}

impl Task for ExitLoopTask {
    fn id(&self) -> TaskId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Exit
    }

    fn run(&self, _worker_id: u8, _frame_index: u16) -> RunOutcome {
        RunOutcome::Done
    }
}
