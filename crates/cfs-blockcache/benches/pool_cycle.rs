use cfs_blockcache::{BlockPool, ThreadPool};
use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const KIB: u64 = 1024;

fn pool_get_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_pool");
    group.throughput(Throughput::Elements(1));

    let pool = BlockPool::new(64 * KIB, 64 * 64 * KIB).expect("pool");
    // Warm the free list so the loop measures recycling, not first allocation.
    let warm: Vec<_> = (0..pool.max_blocks()).map(|_| pool.get().expect("get")).collect();
    for block in warm {
        pool.release(block);
    }

    group.bench_function("get_release_cycle", |b| {
        b.iter(|| {
            let block = pool.get().expect("get");
            pool.release(block);
        });
    });
    group.finish();
}

fn thread_pool_schedule(c: &mut Criterion) {
    let mut group = c.benchmark_group("thread_pool");
    group.throughput(Throughput::Elements(1));

    let done = Arc::new(AtomicUsize::new(0));
    let reader = {
        let done = Arc::clone(&done);
        Arc::new(move |_item: u64| {
            done.fetch_add(1, Ordering::Relaxed);
        })
    };
    let pool = ThreadPool::new(4, reader).expect("pool");
    pool.start().expect("start");

    group.bench_function("schedule_normal", |b| {
        b.iter(|| pool.schedule(false, 1).expect("schedule"));
    });
    group.finish();

    pool.stop();
}

criterion_group!(benches, pool_get_release, thread_pool_schedule);
criterion_main!(benches);
