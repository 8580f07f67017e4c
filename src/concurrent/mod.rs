// Copyright (c) 2025 FrameFlow Contributors
//
// Lock-free concurrency primitives
//
// This module provides the non-blocking building blocks of the task core:
// a hazard-pointer pool for safe memory reclamation and a multi-producer
// multi-consumer queue built on top of it. All structures use atomic
// operations and careful memory ordering to achieve linearizability
// without locks.

pub mod hazard;
pub mod queue;

// Re-export main types
pub use hazard::{HazardPointerPool, HazardPoolStats, HazardRecord, DEFAULT_GC_THRESHOLD};
pub use queue::{BoundedTaskQueue, LockFreeQueue, QueueStats};

/// Cache line size for padding to avoid false sharing
pub const CACHE_LINE_SIZE: usize = 64;

/// Backoff strategy for CAS retry loops
pub struct Backoff {
    step: u32,
    max_step: u32,
}

impl Backoff {
    /// Create a new backoff strategy
    pub fn new() -> Self {
        Self {
            step: 0,
            max_step: 10,
        }
    }

    /// Perform a backoff step
    pub fn spin(&mut self) {
        for _ in 0..(1 << self.step.min(self.max_step)) {
            std::hint::spin_loop();
        }
        self.step = self.step.saturating_add(1);
    }

    /// Reset backoff to initial state
    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// Check if we should yield to scheduler
    pub fn should_yield(&self) -> bool {
        self.step > 6
    }

    /// Snooze - either spin or yield
    pub fn snooze(&mut self) {
        if self.should_yield() {
            std::thread::yield_now();
        } else {
            self.spin();
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.step, 0);

        backoff.spin();
        assert_eq!(backoff.step, 1);

        backoff.reset();
        assert_eq!(backoff.step, 0);
    }

    #[test]
    fn test_backoff_yields_eventually() {
        let mut backoff = Backoff::new();
        for _ in 0..8 {
            backoff.spin();
        }
        assert!(backoff.should_yield());
    }
}
