// Concurrency tests for the lock-free task queue and its hazard-pointer
// reclamation: per-producer FIFO, conservation of elements, and the
// producer/consumer scenarios the engine relies on during frame dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use frameflow::concurrent::LockFreeQueue;

#[test]
fn fifo_is_preserved_per_producer() {
    const PRODUCERS: u64 = 3;
    const PER_PRODUCER: u64 = 2_000;

    let queue = Arc::new(LockFreeQueue::new());
    let mut handles = Vec::new();

    for producer in 0..PRODUCERS {
        let queue = Arc::clone(&queue);
        handles.push(thread::spawn(move || {
            for seq in 0..PER_PRODUCER {
                queue.enqueue((producer, seq)).unwrap();
            }
            queue.clear_cache();
        }));
    }

    let consumed: Vec<_> = (0..2)
        .map(|_| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut seen: Vec<(u64, u64)> = Vec::new();
                loop {
                    match queue.dequeue() {
                        Some(pair) => seen.push(pair),
                        None => {
                            if queue.stats().dequeued >= PRODUCERS * PER_PRODUCER {
                                break;
                            }
                            thread::yield_now();
                        }
                    }
                }
                queue.clear_cache();
                seen
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    // Per producer, the sequence numbers must come out strictly increasing
    // in every consumer's local order
    let mut last_seen: HashMap<u64, HashMap<u64, u64>> = HashMap::new();
    let mut total = 0;
    for (consumer, handle) in consumed.into_iter().enumerate() {
        let seen = handle.join().unwrap();
        total += seen.len() as u64;
        let per_producer = last_seen.entry(consumer as u64).or_default();
        for (producer, seq) in seen {
            if let Some(&prev) = per_producer.get(&producer) {
                assert!(
                    seq > prev,
                    "producer {producer} went backwards: {seq} after {prev}"
                );
            }
            per_producer.insert(producer, seq);
        }
    }
    assert_eq!(total, PRODUCERS * PER_PRODUCER);
}

#[test]
fn conservation_holds_at_shutdown() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: u64 = 5_000;
    const CONSUMED_EACH: u64 = 3_000;

    let queue = Arc::new(LockFreeQueue::new());
    let mut handles = Vec::new();

    for producer in 0..PRODUCERS as u64 {
        let queue = Arc::clone(&queue);
        handles.push(thread::spawn(move || {
            for seq in 0..PER_PRODUCER {
                queue.enqueue(producer * PER_PRODUCER + seq).unwrap();
            }
            queue.clear_cache();
        }));
    }

    let barrier = Arc::new(Barrier::new(PRODUCERS));
    for _ in 0..PRODUCERS {
        let queue = Arc::clone(&queue);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            let mut taken = 0;
            while taken < CONSUMED_EACH {
                if queue.dequeue().is_some() {
                    taken += 1;
                } else {
                    thread::yield_now();
                }
            }
            barrier.wait();
            queue.clear_cache();
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }

    queue.shutdown();
    let mut residue = 0;
    while queue.dequeue().is_some() {
        residue += 1;
    }
    queue.clear_cache();

    let stats = queue.stats();
    assert_eq!(stats.enqueued, PRODUCERS as u64 * PER_PRODUCER);
    assert_eq!(
        stats.enqueued,
        PRODUCERS as u64 * CONSUMED_EACH + residue,
        "elements were lost or duplicated"
    );
    assert_eq!(stats.enqueued, stats.dequeued);
}

#[test]
fn stress_eight_producers_eight_consumers() {
    const THREADS: usize = 8;
    const TOTAL: u64 = 100_000;
    const PER_PRODUCER: u64 = TOTAL / THREADS as u64;

    /// Payload whose drop is observable, to account for every value
    struct Tracked {
        drops: Arc<AtomicUsize>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    let queue = Arc::new(LockFreeQueue::new());
    let drops = Arc::new(AtomicUsize::new(0));
    let dequeues = Arc::new(AtomicU64::new(0));
    let consumer_barrier = Arc::new(Barrier::new(THREADS));
    let mut handles = Vec::new();

    for _ in 0..THREADS {
        let queue = Arc::clone(&queue);
        let drops = Arc::clone(&drops);
        handles.push(thread::spawn(move || {
            for _ in 0..PER_PRODUCER {
                queue
                    .enqueue(Tracked {
                        drops: Arc::clone(&drops),
                    })
                    .map_err(|_| "enqueue refused")
                    .unwrap();
            }
            queue.clear_cache();
        }));
    }

    for _ in 0..THREADS {
        let queue = Arc::clone(&queue);
        let dequeues = Arc::clone(&dequeues);
        let consumer_barrier = Arc::clone(&consumer_barrier);
        handles.push(thread::spawn(move || {
            loop {
                match queue.dequeue() {
                    Some(value) => {
                        drop(value);
                        dequeues.fetch_add(1, Ordering::SeqCst);
                    }
                    None => {
                        if dequeues.load(Ordering::SeqCst) >= TOTAL {
                            break;
                        }
                        thread::yield_now();
                    }
                }
            }
            // Everyone stops dequeuing before anyone reclaims, so no
            // transient hazard can keep a node parked on an exiting thread
            consumer_barrier.wait();
            queue.clear_cache();
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }
    queue.clear_cache();

    let stats = queue.stats();
    assert_eq!(stats.enqueued, TOTAL);
    assert_eq!(stats.dequeued, TOTAL);
    assert_eq!(drops.load(Ordering::SeqCst), TOTAL as usize);

    let hazards = queue.hazard_stats();
    assert_eq!(hazards.hazardous, 0, "hazard flags leaked: {hazards:?}");
    assert_eq!(hazards.active, 0, "queue nodes leaked: {hazards:?}");
    assert_eq!(hazards.retired_local, 0);
}

#[test]
fn single_producer_seven_consumers_drain_everything() {
    const CONSUMERS: usize = 7;
    const TOTAL: u64 = 100_000;

    let queue: Arc<LockFreeQueue<Option<u64>>> = Arc::new(LockFreeQueue::new());
    let production_finished = Arc::new(AtomicBool::new(false));
    let consumed = Arc::new(AtomicU64::new(0));
    let consumer_barrier = Arc::new(Barrier::new(CONSUMERS));

    let producer = {
        let queue = Arc::clone(&queue);
        let production_finished = Arc::clone(&production_finished);
        thread::spawn(move || {
            for _ in 0..TOTAL {
                // Null task handles, as dispatched between frames
                queue.enqueue(None).unwrap();
            }
            production_finished.store(true, Ordering::Release);
            queue.shutdown();
            queue.clear_cache();
        })
    };

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let production_finished = Arc::clone(&production_finished);
            let consumed = Arc::clone(&consumed);
            let consumer_barrier = Arc::clone(&consumer_barrier);
            thread::spawn(move || {
                loop {
                    match queue.dequeue() {
                        Some(_handle) => {
                            consumed.fetch_add(1, Ordering::SeqCst);
                        }
                        None => {
                            if production_finished.load(Ordering::Acquire)
                                && consumed.load(Ordering::SeqCst) >= TOTAL
                            {
                                break;
                            }
                            thread::yield_now();
                        }
                    }
                }
                consumer_barrier.wait();
                queue.clear_cache();
            })
        })
        .collect();

    producer.join().unwrap();
    for consumer in consumers {
        consumer.join().unwrap();
    }

    assert!(queue.is_shut_down());
    assert_eq!(queue.enqueue(None), Err(None));

    let stats = queue.stats();
    assert_eq!(stats.enqueued, TOTAL);
    assert_eq!(stats.dequeued, TOTAL);
    assert_eq!(stats.current_size, 0);
}
