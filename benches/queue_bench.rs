// Task queue performance benchmarks
// Measures uncontended enqueue/dequeue throughput and the mixed
// multi-producer multi-consumer pattern the sink's dispatcher produces.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use frameflow::concurrent::LockFreeQueue;
use std::sync::Arc;
use std::thread;

fn bench_uncontended(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_uncontended");

    group.bench_function("enqueue_dequeue_pair", |b| {
        let queue = LockFreeQueue::new();
        b.iter(|| {
            queue.enqueue(black_box(42u64)).unwrap();
            black_box(queue.dequeue());
        });
    });

    group.bench_function("enqueue_batch_drain", |b| {
        b.iter(|| {
            let queue = LockFreeQueue::new();
            for i in 0..256u64 {
                queue.enqueue(black_box(i)).unwrap();
            }
            while queue.dequeue().is_some() {}
        });
    });

    group.finish();
}

fn bench_mpmc(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_mpmc");
    group.sample_size(10);

    for threads in [2usize, 4, 8] {
        group.bench_with_input(
            BenchmarkId::new("producers_consumers", threads),
            &threads,
            |b, &threads| {
                b.iter(|| {
                    const PER_PRODUCER: u64 = 10_000;
                    let queue = Arc::new(LockFreeQueue::new());
                    let mut handles = Vec::new();

                    for _ in 0..threads {
                        let q = Arc::clone(&queue);
                        handles.push(thread::spawn(move || {
                            for i in 0..PER_PRODUCER {
                                q.enqueue(black_box(i)).unwrap();
                            }
                            q.clear_cache();
                        }));
                    }

                    for _ in 0..threads {
                        let q = Arc::clone(&queue);
                        handles.push(thread::spawn(move || {
                            let mut taken = 0;
                            while taken < PER_PRODUCER {
                                if q.dequeue().is_some() {
                                    taken += 1;
                                } else {
                                    thread::yield_now();
                                }
                            }
                            q.clear_cache();
                        }));
                    }

                    for handle in handles {
                        handle.join().unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_uncontended, bench_mpmc);
criterion_main!(benches);
