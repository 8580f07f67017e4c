// Copyright (c) 2025 FrameFlow Contributors
//
// Hazard Pointers - Safe Memory Reclamation for Lock-Free Data Structures
//
// A thread that wants to dereference a shared pointer first publishes it
// through a hazard record; a thread that wants to free a pointer retires it
// instead and the pointer is only reclaimed once no record reports it as
// hazardous. Trade-offs versus epoch schemes:
// - Lower memory overhead
// - Immediate reclamation (no epochs)
// - Per-thread deletion lists with batched scan passes
//
// References:
// - Maged M. Michael. "Hazard pointers: Safe memory reclamation for lock-free objects."
//   IEEE Transactions on Parallel and Distributed Systems, 2004.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

/// Default number of retired pointers a thread accumulates before a scan
/// pass. Lock-free algorithms rarely hold more than three hazards per
/// thread, so 24 comfortably covers an eight-core machine.
pub const DEFAULT_GC_THRESHOLD: usize = 24;

/// Monotonic pool identities; thread-local reclamation state is keyed by
/// these so distinct pools never share deletion lists.
static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// One entry of the shared hazard list.
///
/// Slots are appended to the list and never unlinked; `active` recycles
/// them between owners.
#[repr(C, align(64))]
struct HazardSlot {
    /// Raw address currently protected by the owning thread
    value: AtomicPtr<u8>,

    /// Slot is claimed by some thread
    active: AtomicBool,

    /// Owning thread asserts the protected address must not be freed
    hazardous: AtomicBool,

    /// Next entry in the shared list
    next: AtomicPtr<HazardSlot>,
}

impl HazardSlot {
    fn new() -> Self {
        Self {
            value: AtomicPtr::new(ptr::null_mut()),
            active: AtomicBool::new(false),
            hazardous: AtomicBool::new(false),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Claim this slot for the calling thread and publish `raw` in it.
    fn try_claim(&self, raw: *mut u8) -> bool {
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.value.store(raw, Ordering::Release);
        true
    }
}

/// A retired pointer parked on a thread-local deletion list until no
/// hazard record protects it any longer.
struct Retired {
    slot: NonNull<HazardSlot>,
    ptr: *mut u8,
    deleter: unsafe fn(*mut u8),
}

#[derive(Default)]
struct ReclaimState {
    /// Pointers this thread wants to free
    deletion: Vec<Retired>,
    /// Reusable snapshot of the hazardous set taken during scan passes
    protected: Vec<*mut u8>,
}

thread_local! {
    static RECLAIM: RefCell<HashMap<u64, ReclaimState>> = RefCell::new(HashMap::new());
}

/// Pool of hazard pointers protecting raw addresses against concurrent
/// reclamation.
///
/// The pool owns a single append-only lock-free list of [`HazardSlot`]s
/// shared by all threads. Deletion lists are thread-local; a scan pass
/// frees every retired pointer that no active slot reports as hazardous.
pub struct HazardPointerPool {
    /// First slot of the shared list; fixed after construction
    head: NonNull<HazardSlot>,

    /// Last known slot of the shared list, advanced lock-free
    tail: AtomicPtr<HazardSlot>,

    /// Estimate of the number of slots ever appended
    slots: AtomicUsize,

    /// Amortisation parameter for the deletion lists
    gc_threshold: AtomicUsize,

    pool_id: u64,
}

// Safety: the slot list is only mutated through atomics and slots are
// never unlinked while the pool is alive.
unsafe impl Send for HazardPointerPool {}
unsafe impl Sync for HazardPointerPool {}

impl HazardPointerPool {
    /// Create a pool seeded with a single unclaimed slot.
    pub fn new() -> Self {
        let first = Box::into_raw(Box::new(HazardSlot::new()));
        Self {
            // Safety: Box::into_raw never returns null
            head: unsafe { NonNull::new_unchecked(first) },
            tail: AtomicPtr::new(first),
            slots: AtomicUsize::new(1),
            gc_threshold: AtomicUsize::new(DEFAULT_GC_THRESHOLD),
            pool_id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Acquire a hazard record protecting `raw`.
    ///
    /// The record is not yet hazardous; callers must invoke
    /// [`HazardRecord::set_hazardous`] and then re-read the shared location
    /// `raw` was loaded from. If the location moved on, the protection came
    /// too late and the caller must retry with a fresh record.
    pub fn acquire(&self, raw: *mut u8) -> HazardRecord<'_> {
        // First pass: recycle an inactive slot from the shared list.
        let mut cursor = self.head.as_ptr();
        while !cursor.is_null() {
            // Safety: slots are never freed while the pool is alive
            let slot = unsafe { &*cursor };
            if !slot.active.load(Ordering::Acquire) && slot.try_claim(raw) {
                return HazardRecord {
                    pool: self,
                    // Safety: cursor was checked non-null above
                    slot: unsafe { NonNull::new_unchecked(cursor) },
                };
            }
            cursor = slot.next.load(Ordering::Acquire);
        }

        // No slot could be reused: append a fresh one at the tail with the
        // two-step Michael-Scott insertion. Both swings tolerate preemption.
        let fresh = Box::into_raw(Box::new(HazardSlot::new()));
        // Safety: `fresh` is exclusively ours until it is linked below
        unsafe {
            (*fresh).active.store(true, Ordering::Relaxed);
            (*fresh).value.store(raw, Ordering::Relaxed);
        }

        loop {
            let tail = self.tail.load(Ordering::Acquire);
            // Safety: slots are never freed while the pool is alive
            let tail_ref = unsafe { &*tail };
            let next = tail_ref.next.load(Ordering::Acquire);

            if !next.is_null() {
                // The tail is lagging; help it forward and retry.
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
                .compare_exchange_weak(
                    ptr::null_mut(),
                    fresh,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                let _ = self.tail.compare_exchange_weak(
                    tail,
                    fresh,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                self.slots.fetch_add(1, Ordering::Relaxed);
                return HazardRecord {
                    pool: self,
                    // Safety: Box::into_raw never returns null
                    slot: unsafe { NonNull::new_unchecked(fresh) },
                };
            }
        }
    }

    /// Retire the pointer held by `record`.
    ///
    /// The slot keeps holding the address (no longer hazardous) on the
    /// calling thread's deletion list until a scan pass proves that no
    /// other thread protects it, at which point `deleter` runs and the
    /// slot returns to the free pool.
    pub fn retire(&self, record: HazardRecord<'_>, deleter: unsafe fn(*mut u8)) {
        let slot = record.slot;
        // The slot now belongs to the garbage collector, not the record.
        std::mem::forget(record);

        // Safety: slots are never freed while the pool is alive
        let slot_ref = unsafe { slot.as_ref() };
        slot_ref.hazardous.store(false, Ordering::Release);
        let ptr = slot_ref.value.load(Ordering::Acquire);

        RECLAIM.with(|map| {
            let mut map = map.borrow_mut();
            let state = map.entry(self.pool_id).or_default();
            state.deletion.push(Retired { slot, ptr, deleter });
            if state.deletion.len() >= self.scan_trigger() {
                self.scan(state);
            }
        });
    }

    /// Unconditionally run a scan pass for the calling thread.
    pub fn flush(&self) {
        RECLAIM.with(|map| {
            if let Some(state) = map.borrow_mut().get_mut(&self.pool_id) {
                self.scan(state);
            }
        });
    }

    /// Set the number of retired pointers that triggers a scan pass.
    pub fn set_gc_threshold(&self, threshold: usize) {
        self.gc_threshold.store(threshold, Ordering::Relaxed);
    }

    /// Collect a snapshot of the pool state, primarily for tests and
    /// diagnostics.
    pub fn stats(&self) -> HazardPoolStats {
        let mut total = 0;
        let mut active = 0;
        let mut hazardous = 0;

        let mut cursor = self.head.as_ptr();
        while !cursor.is_null() {
            // Safety: slots are never freed while the pool is alive
            let slot = unsafe { &*cursor };
            total += 1;
            if slot.active.load(Ordering::Acquire) {
                active += 1;
            }
            if slot.hazardous.load(Ordering::Acquire) {
                hazardous += 1;
            }
            cursor = slot.next.load(Ordering::Acquire);
        }

        let retired_local = RECLAIM.with(|map| {
            map.borrow()
                .get(&self.pool_id)
                .map(|state| state.deletion.len())
                .unwrap_or(0)
        });

        HazardPoolStats {
            slots: total,
            active,
            hazardous,
            retired_local,
        }
    }

    /// Scans are triggered once a deletion list grows past both the
    /// configured threshold and the number of observed slots, keeping the
    /// amortised reclamation cost per retire O(1).
    fn scan_trigger(&self) -> usize {
        self.gc_threshold
            .load(Ordering::Relaxed)
            .max(self.slots.load(Ordering::Relaxed))
    }

    /// One scan pass: snapshot the hazardous set, then free every retired
    /// pointer absent from it. Reclamation is opportunistic; whatever is
    /// still protected stays on the list for a later pass.
    fn scan(&self, state: &mut ReclaimState) {
        if state.deletion.is_empty() {
            return;
        }

        let ReclaimState {
            deletion,
            protected,
        } = state;

        protected.clear();
        let mut cursor = self.head.as_ptr();
        while !cursor.is_null() {
            // Safety: slots are never freed while the pool is alive
            let slot = unsafe { &*cursor };
            // SeqCst pairs with the store in `set_hazardous`: a thread that
            // published its hazard before this load is guaranteed to be seen.
            if slot.active.load(Ordering::Acquire) && slot.hazardous.load(Ordering::SeqCst) {
                let value = slot.value.load(Ordering::Acquire);
                if !value.is_null() {
                    protected.push(value);
                }
            }
            cursor = slot.next.load(Ordering::Acquire);
        }
        protected.sort_unstable();
        protected.dedup();

        deletion.retain(|retired| {
            if protected.binary_search(&retired.ptr).is_ok() {
                // Still protected somewhere, keep it for the next pass
                return true;
            }
            // Safety: the pointer is unlinked from its data structure and no
            // hazard record reports it, so this thread is its sole owner.
            unsafe { (retired.deleter)(retired.ptr) };
            // Safety: slots are never freed while the pool is alive
            let slot_ref = unsafe { retired.slot.as_ref() };
            slot_ref.value.store(ptr::null_mut(), Ordering::Relaxed);
            slot_ref.active.store(false, Ordering::Release);
            false
        });
    }
}

impl Default for HazardPointerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HazardPointerPool {
    fn drop(&mut self) {
        // Owning threads must have flushed their deletion lists and released
        // every record by now; a hazardous slot here is a bug in the caller.
        let _ = RECLAIM.try_with(|map| {
            let mut map = map.borrow_mut();
            if let Some(state) = map.get_mut(&self.pool_id) {
                self.scan(state);
                debug_assert!(state.deletion.is_empty());
            }
            map.remove(&self.pool_id);
        });

        let mut cursor = self.head.as_ptr();
        while !cursor.is_null() {
            // Safety: drop has exclusive access, nothing walks the list now
            let slot = unsafe { Box::from_raw(cursor) };
            debug_assert!(!slot.hazardous.load(Ordering::Relaxed));
            cursor = slot.next.load(Ordering::Relaxed);
        }
    }
}

/// RAII handle over a claimed [`HazardSlot`].
///
/// Dropping the record releases the slot for reuse. Passing it to
/// [`HazardPointerPool::retire`] instead hands the protected pointer to the
/// garbage collector.
pub struct HazardRecord<'pool> {
    pool: &'pool HazardPointerPool,
    slot: NonNull<HazardSlot>,
}

impl HazardRecord<'_> {
    /// The raw address currently protected by this record.
    pub fn get(&self) -> *mut u8 {
        // Safety: the slot outlives the pool borrow held by the record
        unsafe { self.slot.as_ref() }.value.load(Ordering::Acquire)
    }

    /// Assert that no other thread may free the protected address.
    ///
    /// Protection only holds if the address is still published in the
    /// location it was read from; callers must re-read that location after
    /// this call and retry on a mismatch.
    pub fn set_hazardous(&self) {
        // SeqCst orders this store before the caller's revalidation load,
        // which the scan pass on other threads relies on.
        // Safety: the slot outlives the pool borrow held by the record
        unsafe { self.slot.as_ref() }
            .hazardous
            .store(true, Ordering::SeqCst);
    }

    /// Declare the protected address safe to reclaim by others.
    pub fn set_safe(&self) {
        // Safety: the slot outlives the pool borrow held by the record
        unsafe { self.slot.as_ref() }
            .hazardous
            .store(false, Ordering::Release);
    }

    /// Pool this record belongs to.
    pub fn pool(&self) -> &HazardPointerPool {
        self.pool
    }
}

impl Drop for HazardRecord<'_> {
    fn drop(&mut self) {
        // Safety: the slot outlives the pool borrow held by the record
        let slot = unsafe { self.slot.as_ref() };
        slot.hazardous.store(false, Ordering::Release);
        slot.value.store(ptr::null_mut(), Ordering::Relaxed);
        // Publishing `active = false` last hands the slot back to the pool.
        slot.active.store(false, Ordering::Release);
    }
}

/// Diagnostic snapshot of a pool.
#[derive(Debug, Clone, Copy)]
pub struct HazardPoolStats {
    pub slots: usize,
    pub active: usize,
    pub hazardous: usize,
    pub retired_local: usize,
}
