use criterion::{Criterion, criterion_group, criterion_main};
use fixedpool::FixedPool;
use std::sync::Arc;
use std::thread;

fn bench_alloc_free(c: &mut Criterion) {
    let pool: FixedPool<u64> = FixedPool::new(1024);
    c.bench_function("alloc_free_single_thread", |b| {
        b.iter(|| {
            let h = pool.allocate(7);
            pool.free(h);
        })
    });
}

fn bench_alloc_free_contended(c: &mut Criterion) {
    c.bench_function("alloc_free_4_threads_10k", |b| {
        b.iter(|| {
            let pool: Arc<FixedPool<u64>> = Arc::new(FixedPool::new(256));
            let joins: Vec<_> = (0..4)
                .map(|_| {
                    let pool = pool.clone();
                    thread::spawn(move || {
                        for i in 0..10_000u64 {
                            let h = pool.allocate(i);
                            pool.free(h);
                        }
                    })
                })
                .collect();
            for j in joins {
                j.join().unwrap();
            }
        })
    });
}

criterion_group!(benches, bench_alloc_free, bench_alloc_free_contended);
criterion_main!(benches);
