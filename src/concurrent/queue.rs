// Copyright (c) 2025 FrameFlow Contributors
//
// Lock-free queue implementation
//
// This module implements the Michael-Scott lock-free queue algorithm,
// a non-blocking FIFO queue that uses compare-and-swap operations and
// hazard pointers for safe memory reclamation.
// Reference: "Simple, Fast, and Practical Non-Blocking and Blocking
// Concurrent Queue Algorithms" by Michael and Scott (1996)

use super::hazard::{HazardPointerPool, HazardPoolStats};
use super::Backoff;
use crate::error::CoreError;

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

/// Cache-line padded node to avoid false sharing
#[repr(C, align(64))]
struct QueueNode<T> {
    /// The value carried by this node; `None` once it has served as the
    /// dummy or after the winning dequeuer took the value out
    data: UnsafeCell<Option<T>>,
    /// Pointer to the next node
    next: AtomicPtr<QueueNode<T>>,
}

impl<T> QueueNode<T> {
    fn new(data: T) -> Self {
        Self {
            data: UnsafeCell::new(Some(data)),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Create the dummy node the queue is seeded with
    fn dummy() -> Self {
        Self {
            data: UnsafeCell::new(None),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

unsafe fn drop_node<T>(ptr: *mut u8) {
    drop(Box::from_raw(ptr as *mut QueueNode<T>));
}

/// Michael-Scott lock-free MPMC queue protected by hazard pointers.
///
/// The queue always holds at least one node: a dummy at the head whose
/// successor carries the first live value. `head` and `tail` only move
/// forward and only via CAS. A node is physically freed after it has been
/// unlinked *and* retired through the hazard pool, once no thread keeps it
/// hazardous.
///
/// # Cache-line optimization
///
/// The head and tail pointers live in separate cache lines to minimize
/// false sharing between enqueueing and dequeueing threads.
#[repr(C)]
pub struct LockFreeQueue<T> {
    /// Head pointer (for dequeue); always a dummy node
    head: AtomicPtr<QueueNode<T>>,
    /// Padding to separate head and tail into different cache lines
    _pad1: [u8; 56], // 64 - 8 (pointer size) = 56
    /// Tail pointer (for enqueue)
    tail: AtomicPtr<QueueNode<T>>,
    /// Padding to prevent false sharing
    _pad2: [u8; 56], // 64 - 8 (pointer size) = 56
    /// Hazard pool protecting queue nodes from premature reclamation
    hazard: HazardPointerPool,
    /// Once set, further enqueues are rejected
    shut_down: AtomicBool,
    /// Size estimate (may be slightly inaccurate due to concurrency)
    size: AtomicUsize,
    /// Total number of enqueues, asserted against dequeues at destruction
    enqueued: AtomicU64,
    /// Total number of dequeues
    dequeued: AtomicU64,
}

impl<T> LockFreeQueue<T> {
    /// Create a new empty queue
    pub fn new() -> Self {
        let dummy = Box::into_raw(Box::new(QueueNode::dummy()));

        Self {
            head: AtomicPtr::new(dummy),
            _pad1: [0; 56],
            tail: AtomicPtr::new(dummy),
            _pad2: [0; 56],
            hazard: HazardPointerPool::new(),
            shut_down: AtomicBool::new(false),
            size: AtomicUsize::new(0),
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
        }
    }

    /// Enqueue a value at the back of the queue.
    ///
    /// Lock-free; under contention threads help each other advance the
    /// tail and back off exponentially. After [`shutdown`](Self::shutdown)
    /// the value is handed back unchanged.
    pub fn enqueue(&self, value: T) -> Result<(), T> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(value);
        }

        let node = Box::into_raw(Box::new(QueueNode::new(value)));
        let mut backoff = Backoff::new();

        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let hp_tail = self.hazard.acquire(tail.cast());
            hp_tail.set_hazardous();
            // Protection only counts if the tail has not moved on meanwhile
            if self.tail.load(Ordering::Acquire) != tail {
                backoff.snooze();
                continue;
            }

            // Safety: `tail` is hazard-protected and revalidated above
            let tail_ref = unsafe { &*tail };
            let next = tail_ref.next.load(Ordering::Acquire);

            if !next.is_null() {
                // The tail node is no longer the actual tail; help move it
                // forward and retry.
                let _ = self.tail.compare_exchange_weak(
                    tail,
                    next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                continue;
            }

            if tail_ref
                .next
                .compare_exchange_weak(ptr::null_mut(), node, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // Linked; swinging the tail may fail if someone helped first
                let _ = self.tail.compare_exchange_weak(
                    tail,
                    node,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                self.size.fetch_add(1, Ordering::Relaxed);
                self.enqueued.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }

            backoff.spin();
        }
    }

    /// Dequeue a value from the front of the queue.
    ///
    /// Returns `None` when the queue is observed empty; never blocks, also
    /// not during or after shutdown.
    pub fn dequeue(&self) -> Option<T> {
        let mut backoff = Backoff::new();

        loop {
            let head = self.head.load(Ordering::Acquire);
            let hp_head = self.hazard.acquire(head.cast());
            hp_head.set_hazardous();
            if self.head.load(Ordering::Acquire) != head {
                backoff.snooze();
                continue;
            }

            // Safety: `head` is hazard-protected and revalidated above
            let next = unsafe { &*head }.next.load(Ordering::Acquire);
            let hp_next = self.hazard.acquire(next.cast());
            hp_next.set_hazardous();
            // While `head` is still the head its successor cannot have been
            // retired, so protecting `next` is valid once this check passes.
            if self.head.load(Ordering::Acquire) != head {
                backoff.snooze();
                continue;
            }

            let tail = self.tail.load(Ordering::Acquire);
            let hp_tail = self.hazard.acquire(tail.cast());
            hp_tail.set_hazardous();
            if self.tail.load(Ordering::Acquire) != tail {
                backoff.snooze();
                continue;
            }

            if head == tail {
                if next.is_null() {
                    return None;
                }
                // Non-empty but the tail lags behind; help it forward
                let _ = self.tail.compare_exchange_weak(
                    tail,
                    next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                backoff.spin();
                continue;
            }

            if next.is_null() {
                // Inconsistent snapshot (head advanced past our tail read)
                backoff.spin();
                continue;
            }

            match self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    // `next` is the new dummy; only this thread, as the CAS
                    // winner, touches its payload.
                    // Safety: hazard-protected and uniquely claimed by the CAS
                    let value = unsafe { (*(*next).data.get()).take() };

                    // The old dummy is unlinked; hand it to the collector
                    self.hazard.retire(hp_head, drop_node::<T>);

                    self.size.fetch_sub(1, Ordering::Relaxed);
                    self.dequeued.fetch_add(1, Ordering::Relaxed);
                    return value;
                }
                Err(_) => {
                    backoff.spin();
                }
            }
        }
    }

    /// Stop accepting enqueues. Consumers drain whatever is already linked
    /// and then observe the queue as empty; `dequeue` keeps returning
    /// without blocking.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
    }

    /// `true` once [`shutdown`](Self::shutdown) has been called
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Run a reclamation pass for the calling thread, freeing nodes it has
    /// retired. Consumer threads should call this before exiting.
    pub fn clear_cache(&self) {
        self.hazard.flush();
    }

    /// Returns `true` if the queue is observed empty.
    ///
    /// Compares head and tail without dereferencing either, so the answer
    /// may be stale by the time it is returned.
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }

    /// Approximate number of values currently queued
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Conservation counters for this queue
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            current_size: self.size.load(Ordering::Relaxed),
        }
    }

    /// Snapshot of the underlying hazard pool, for leak diagnostics
    pub fn hazard_stats(&self) -> HazardPoolStats {
        self.hazard.stats()
    }
}

impl<T> Default for LockFreeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LockFreeQueue<T> {
    fn drop(&mut self) {
        self.shutdown();

        // Drain remaining values so their drops run
        while self.dequeue().is_some() {}

        // Free whatever this thread retired (other threads are expected to
        // have called `clear_cache` before letting go of the queue)
        self.hazard.flush();

        debug_assert_eq!(
            self.enqueued.load(Ordering::Relaxed),
            self.dequeued.load(Ordering::Relaxed),
        );

        let head = self.head.load(Ordering::Relaxed);
        debug_assert_eq!(head, self.tail.load(Ordering::Relaxed));
        // Safety: drop has exclusive access; only the dummy node remains
        unsafe { drop(Box::from_raw(head)) };
    }
}

// Safety: the queue hands values across threads but every node mutation
// goes through atomics or the hazard protocol
unsafe impl<T: Send> Send for LockFreeQueue<T> {}
unsafe impl<T: Send> Sync for LockFreeQueue<T> {}

/// Conservation counters of a queue
#[derive(Debug, Clone, Copy)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dequeued: u64,
    pub current_size: usize,
}

/// A capacity-checked wrapper around [`LockFreeQueue`].
///
/// Rejects enqueues when full, for callers that want bounded resource
/// usage instead of the default unbounded backend.
pub struct BoundedTaskQueue<T> {
    inner: LockFreeQueue<T>,
    capacity: usize,
}

impl<T> BoundedTaskQueue<T> {
    /// Create a bounded queue with the given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: LockFreeQueue::new(),
            capacity,
        }
    }

    /// Try to enqueue a value, handing it back if the queue is full or
    /// shut down.
    pub fn try_enqueue(&self, value: T) -> Result<(), T> {
        if self.inner.len() >= self.capacity {
            return Err(value);
        }
        self.inner.enqueue(value)
    }

    /// Enqueue a value, mapping an overflow to [`CoreError::QueueExhausted`].
    /// The rejected value is dropped.
    pub fn enqueue(&self, value: T) -> crate::Result<()> {
        self.try_enqueue(value).map_err(|_| CoreError::QueueExhausted {
            capacity: self.capacity,
        })
    }

    /// Dequeue a value
    pub fn dequeue(&self) -> Option<T> {
        self.inner.dequeue()
    }

    /// Check if the queue is observed empty
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Check if the queue is at capacity
    pub fn is_full(&self) -> bool {
        self.inner.len() >= self.capacity
    }

    /// Approximate current length
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
