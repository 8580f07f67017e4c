// Task sink: drives multiple in-flight frames of a task graph.
//
// The sink owns a ring of frame instances, a pool of worker threads and
// the shared MPMC queue of ready nodes. The thread calling `run` becomes
// the dispatcher: it claims idle frame slots and enqueues every node whose
// dependencies are satisfied; parked workers wake up to execute them.
// A hidden end-of-frame guard node, injected as the unique sink of the
// graph, releases each frame slot for reuse once the whole frame ran.

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::sync::{Parker, Unparker};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::concurrent::queue::{LockFreeQueue, QueueStats};
use crate::concurrent::Backoff;
use crate::error::{CoreError, Result};
use crate::scheduler::graph::{FrameInstance, TaskGraph};
use crate::scheduler::task::{next_task_id, RunOutcome, Task, TaskId, TaskKind};

/// Ring size used when the caller does not choose one
pub const DEFAULT_FRAMES_IN_FLIGHT: u16 = 16;

/// How long an idle worker parks before rechecking the exit condition
const WORKER_PARK_TIMEOUT: Duration = Duration::from_micros(500);

/// Tunable sink policies.
#[derive(Debug, Clone)]
pub struct SinkOptions {
    /// Number of frame instances kept in flight (the ring size)
    pub max_frames_in_flight: u16,
    /// Maximum consecutive [`RunOutcome::Retry`] answers tolerated per node
    /// and frame; one more raises the exit signal and surfaces
    /// [`CoreError::TaskRetryBudgetExceeded`] from [`TaskSink::run`].
    /// `None` disables the limit.
    pub retry_budget: Option<u32>,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            max_frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            retry_budget: None,
        }
    }
}

/// Diagnostic output sink associated with one worker thread
pub type WorkerLogStream = Box<dyn Write + Send>;

/// Busy flags and the in-flight counter, shared between the sink state and
/// the end-of-frame guard. Kept separate so the guard task does not have
/// to reference the sink (which references the topology, which references
/// the guard).
struct FrameControl {
    busy: Box<[AtomicBool]>,
    in_flight: AtomicU32,
}

/// Sentinel task injected as the unique sink of every frame instance; its
/// completion releases the frame slot and retires the frame from the
/// in-flight count.
struct FrameEndGuard {
    id: TaskId,
    control: Arc<FrameControl>,
}

impl Task for FrameEndGuard {
    fn id(&self) -> TaskId {
        self.id
    }

    fn name(&self) -> &str {
        "frame-end-guard"
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Cpu
    }

    fn run(&self, _worker_id: u8, frame_index: u16) -> RunOutcome {
        self.control.busy[frame_index as usize].store(false, Ordering::Release);
        self.control.in_flight.fetch_sub(1, Ordering::AcqRel);
        RunOutcome::Done
    }
}

/// Handle to one node of one in-flight frame, passed through the queue
#[derive(Debug, Clone, Copy)]
struct NodeTicket {
    slot: u16,
    node: u32,
}

struct SinkState {
    name: String,
    queue: LockFreeQueue<NodeTicket>,
    frames: Vec<FrameInstance>,
    control: Arc<FrameControl>,
    exit_signal: AtomicBool,
    /// 0 disables the retry budget
    retry_budget: AtomicU32,
    budget_breach: Mutex<Option<(String, u32)>>,
}

/// Worker-pool executor for a task graph.
///
/// `run` blocks the calling thread (which becomes the dispatcher) until
/// [`dispatch_exit_signal`](Self::dispatch_exit_signal) has been raised
/// **and** every in-flight frame has drained.
pub struct TaskSink {
    state: Arc<SinkState>,
    worker_count: u8,
    streams: Mutex<Vec<WorkerLogStream>>,
}

impl TaskSink {
    /// Create a sink over `source_graph` with default policies.
    ///
    /// `worker_log_streams` are handed to the workers in order; workers
    /// beyond the vector's length run without a stream. The worker count
    /// comes from the graph.
    pub fn new(
        source_graph: TaskGraph,
        worker_log_streams: Vec<WorkerLogStream>,
        max_frames_in_flight: u16,
        name: &str,
    ) -> Result<Self> {
        Self::with_options(
            source_graph,
            worker_log_streams,
            SinkOptions {
                max_frames_in_flight,
                ..SinkOptions::default()
            },
            name,
        )
    }

    pub fn with_options(
        source_graph: TaskGraph,
        worker_log_streams: Vec<WorkerLogStream>,
        options: SinkOptions,
        name: &str,
    ) -> Result<Self> {
        if options.max_frames_in_flight == 0 {
            return Err(CoreError::InvalidGraphState(format!(
                "sink \"{name}\" needs at least one frame slot"
            )));
        }
        let worker_count = source_graph.worker_count();
        if worker_count == 0 {
            return Err(CoreError::InvalidGraphState(format!(
                "sink \"{name}\" needs at least one worker thread"
            )));
        }

        let slots = options.max_frames_in_flight as usize;
        let control = Arc::new(FrameControl {
            busy: (0..slots)
                .map(|_| AtomicBool::new(false))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            in_flight: AtomicU32::new(0),
        });

        let mut graph = source_graph;
        graph.inject_guard(Arc::new(FrameEndGuard {
            id: next_task_id(),
            control: Arc::clone(&control),
        }))?;

        let (topology, _) = graph.into_parts();
        let frames = (0..slots)
            .map(|slot| FrameInstance::new(Arc::clone(&topology), slot as u16))
            .collect();

        info!(
            sink = name,
            frames = slots,
            workers = worker_count,
            "task sink created"
        );

        Ok(Self {
            state: Arc::new(SinkState {
                name: name.to_owned(),
                queue: LockFreeQueue::new(),
                frames,
                control,
                exit_signal: AtomicBool::new(false),
                retry_budget: AtomicU32::new(options.retry_budget.unwrap_or(0)),
                budget_breach: Mutex::new(None),
            }),
            worker_count,
            streams: Mutex::new(worker_log_streams),
        })
    }

    /// Display name of this sink
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Number of worker threads `run` will spawn
    pub fn worker_count(&self) -> u8 {
        self.worker_count
    }

    /// Number of frame slots in the ring
    pub fn frame_count(&self) -> usize {
        self.state.frames.len()
    }

    /// Install or clear the retry budget; may be called before `run`.
    pub fn set_retry_budget(&self, budget: Option<u32>) {
        self.state
            .retry_budget
            .store(budget.unwrap_or(0), Ordering::Relaxed);
    }

    /// Raise the exit signal. The dispatcher stops claiming frame slots;
    /// frames already in flight drain through their end-of-frame guard.
    pub fn dispatch_exit_signal(&self) {
        self.state.raise_exit_signal();
    }

    /// A cloneable handle for raising the exit signal from other threads.
    pub fn controller(&self) -> SinkController {
        SinkController {
            state: Arc::clone(&self.state),
        }
    }

    /// Conservation counters of the shared task queue
    pub fn queue_stats(&self) -> QueueStats {
        self.state.queue.stats()
    }

    /// Execute the sink: spawn the workers, then dispatch frames on the
    /// calling thread until the exit signal is set and the in-flight
    /// counter reaches zero. Intended to be called once per sink.
    pub fn run(&self) -> Result<()> {
        info!(sink = self.state.name.as_str(), "starting worker threads");

        let mut stream_iter = {
            let mut streams = self.streams.lock();
            std::mem::take(&mut *streams).into_iter()
        };

        let mut handles = Vec::with_capacity(self.worker_count as usize);
        let mut unparkers = Vec::with_capacity(self.worker_count as usize);
        for worker_id in 0..self.worker_count {
            let parker = Parker::new();
            unparkers.push(parker.unparker().clone());
            let state = Arc::clone(&self.state);
            let stream = stream_iter.next();
            let spawned = thread::Builder::new()
                .name(format!("{}-worker-{}", self.state.name, worker_id))
                .spawn(move || worker_loop(state, worker_id, parker, stream));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    // Tear down whatever already started before surfacing
                    self.state.raise_exit_signal();
                    for unparker in &unparkers {
                        unparker.unpark();
                    }
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(err.into());
                }
            }
        }

        self.dispatch_loop(&unparkers);

        self.state.queue.shutdown();
        for unparker in &unparkers {
            unparker.unpark();
        }
        for handle in handles {
            let _ = handle.join();
        }
        self.state.queue.clear_cache();

        if let Some((task, budget)) = self.state.budget_breach.lock().take() {
            return Err(CoreError::TaskRetryBudgetExceeded { task, budget });
        }

        info!(sink = self.state.name.as_str(), "main loop finished");
        Ok(())
    }

    /// The dispatcher: one pass claims idle frame slots (unless exit was
    /// requested) and feeds every launch-ready node of every busy slot to
    /// the queue. The loop never blocks on a task and backs off instead of
    /// hot-spinning when a pass makes no progress.
    fn dispatch_loop(&self, unparkers: &[Unparker]) {
        let state = &*self.state;
        let mut backoff = Backoff::new();
        let mut next_unparker = 0usize;

        loop {
            let exit = state.exit_signal.load(Ordering::Acquire);
            if exit && state.control.in_flight.load(Ordering::Acquire) == 0 {
                break;
            }

            let mut progress = false;

            for slot in 0..state.frames.len() {
                let frame = &state.frames[slot];
                let busy = &state.control.busy[slot];

                if !exit
                    && busy
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    frame.reset_for_frame();
                    state.control.in_flight.fetch_add(1, Ordering::AcqRel);
                    trace!(
                        sink = state.name.as_str(),
                        slot,
                        "frame slot claimed"
                    );
                    progress = true;
                }

                if !busy.load(Ordering::Acquire) {
                    continue;
                }

                let mut enqueued_any = false;
                for node in 0..frame.node_count() {
                    if frame.is_completed(node) || !frame.is_ready(node) {
                        continue;
                    }
                    // Once exit is requested, nodes stuck in a retry loop
                    // are no longer re-queued so their frame can drain.
                    if exit && frame.retries(node) > 0 {
                        continue;
                    }
                    if !frame.try_mark_scheduled(node) {
                        continue;
                    }

                    frame.note_enqueued();
                    let ticket = NodeTicket {
                        slot: slot as u16,
                        node: node as u32,
                    };
                    match state.queue.enqueue(ticket) {
                        Ok(()) => {
                            unparkers[next_unparker % unparkers.len()].unpark();
                            next_unparker = next_unparker.wrapping_add(1);
                            enqueued_any = true;
                            progress = true;
                        }
                        Err(_) => {
                            // The queue only refuses after shutdown, which
                            // happens after this loop has returned
                            frame.note_enqueue_aborted();
                            frame.clear_scheduled(node);
                        }
                    }
                }

                // Post-exit recovery: a busy frame with nothing queued,
                // nothing running and nothing schedulable can never finish
                // through its guard; release it so the sink can exit.
                if exit
                    && !enqueued_any
                    && busy.load(Ordering::Acquire)
                    && frame.is_quiescent()
                    && !frame.all_completed()
                    && !frame.has_schedulable_node(true)
                {
                    warn!(
                        sink = state.name.as_str(),
                        slot,
                        "abandoning stuck frame after exit request"
                    );
                    busy.store(false, Ordering::Release);
                    state.control.in_flight.fetch_sub(1, Ordering::AcqRel);
                    progress = true;
                }
            }

            if progress {
                backoff.reset();
            } else {
                backoff.snooze();
            }
        }
    }
}

impl SinkState {
    fn raise_exit_signal(&self) {
        self.exit_signal.store(true, Ordering::Release);
    }
}

/// Cloneable handle that lets any thread raise a sink's exit signal.
#[derive(Clone)]
pub struct SinkController {
    state: Arc<SinkState>,
}

impl SinkController {
    /// Raise the exit signal; safe to call from any thread, repeatedly.
    pub fn dispatch_exit_signal(&self) {
        self.state.raise_exit_signal();
    }

    pub fn is_exit_requested(&self) -> bool {
        self.state.exit_signal.load(Ordering::Acquire)
    }
}

fn worker_loop(
    state: Arc<SinkState>,
    worker_id: u8,
    parker: Parker,
    mut stream: Option<WorkerLogStream>,
) {
    if let Some(stream) = stream.as_mut() {
        let _ = writeln!(
            stream,
            "worker {} started on sink \"{}\"",
            worker_id, state.name
        );
    }
    debug!(sink = state.name.as_str(), worker_id, "worker started");

    loop {
        match state.queue.dequeue() {
            Some(ticket) => {
                let frame = &state.frames[ticket.slot as usize];
                let node = ticket.node as usize;

                frame.note_execution_started();
                let outcome = frame.execute(node, worker_id);
                frame.note_execution_finished();

                trace!(
                    sink = state.name.as_str(),
                    worker_id,
                    frame = ticket.slot,
                    task = frame.node_name(node),
                    ?outcome,
                    "task executed"
                );

                if outcome == RunOutcome::Retry {
                    let budget = state.retry_budget.load(Ordering::Relaxed);
                    if budget > 0 && frame.retries(node) > budget {
                        let mut breach = state.budget_breach.lock();
                        if breach.is_none() {
                            warn!(
                                sink = state.name.as_str(),
                                task = frame.node_name(node),
                                budget,
                                "retry budget exceeded, raising exit signal"
                            );
                            *breach = Some((frame.node_name(node).to_owned(), budget));
                        }
                        drop(breach);
                        state.raise_exit_signal();
                    }
                }
            }
            None => {
                if state.exit_signal.load(Ordering::Acquire)
                    && state.control.in_flight.load(Ordering::Acquire) == 0
                {
                    break;
                }
                parker.park_timeout(WORKER_PARK_TIMEOUT);
            }
        }
    }

    // Reclaim queue nodes this worker retired before the thread goes away
    state.queue.clear_cache();

    if let Some(stream) = stream.as_mut() {
        let _ = writeln!(stream, "worker {} stopped", worker_id);
        let _ = stream.flush();
    }
    debug!(sink = state.name.as_str(), worker_id, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::node::TaskNode;
    use crate::scheduler::task::FnTask;
    use std::sync::atomic::AtomicUsize;

    fn counting_node(name: &str, counter: &Arc<AtomicUsize>) -> TaskNode {
        let counter = Arc::clone(counter);
        TaskNode::new(Arc::new(FnTask::new(name, TaskKind::Cpu, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            RunOutcome::Done
        })))
    }

    #[test]
    fn test_sink_rejects_empty_ring() {
        let counter = Arc::new(AtomicUsize::new(0));
        let root = counting_node("root", &counter);
        let graph = TaskGraph::new(&[root], 2, "tiny").unwrap();
        assert!(matches!(
            TaskSink::new(graph, Vec::new(), 0, "tiny"),
            Err(CoreError::InvalidGraphState(_))
        ));
    }

    #[test]
    fn test_sink_runs_frames_until_exit() {
        let counter = Arc::new(AtomicUsize::new(0));
        let root = counting_node("root", &counter);
        let graph = TaskGraph::new(&[root], 2, "spin").unwrap();
        let sink = TaskSink::new(graph, Vec::new(), 2, "spin").unwrap();
        let controller = sink.controller();

        let runner = thread::spawn({
            let counter = Arc::clone(&counter);
            move || {
                // Let a few frames through, then stop
                while counter.load(Ordering::SeqCst) < 8 {
                    thread::yield_now();
                }
                controller.dispatch_exit_signal();
            }
        });

        sink.run().unwrap();
        runner.join().unwrap();

        assert!(counter.load(Ordering::SeqCst) >= 8);
        let stats = sink.queue_stats();
        assert_eq!(stats.enqueued, stats.dequeued);
    }

    #[test]
    fn test_exit_before_run_means_no_frames() {
        let counter = Arc::new(AtomicUsize::new(0));
        let root = counting_node("root", &counter);
        let graph = TaskGraph::new(&[root], 2, "norun").unwrap();
        let sink = TaskSink::new(graph, Vec::new(), 4, "norun").unwrap();

        sink.dispatch_exit_signal();
        sink.run().unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
