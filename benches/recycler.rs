use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use repool::{Pooled, Recycler, RecyclerConfig};

const OPS_PER_ITER: u64 = 1_000;

// ============================================================================
// 1. Owner-thread fast path
// ============================================================================

fn bench_owner_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("recycler/owner_cycle");
    group.throughput(Throughput::Elements(OPS_PER_ITER));

    group.bench_function("acquire_recycle", |b| {
        let pool = Recycler::new(|| vec![0u8; 256]).unwrap();
        // Warm the stack so the loop measures reuse, not construction.
        let seed = pool.acquire();
        seed.recycle().unwrap();
        drop(seed);

        b.iter(|| {
            for _ in 0..OPS_PER_ITER {
                let value = pool.acquire();
                black_box(&*value);
                value.recycle().unwrap();
            }
        });
    });

    group.bench_function("unpooled_baseline", |b| {
        let pool = Recycler::with_config(
            RecyclerConfig {
                max_capacity_per_thread: 0,
                ..RecyclerConfig::default()
            },
            || vec![0u8; 256],
        )
        .unwrap();

        b.iter(|| {
            for _ in 0..OPS_PER_ITER {
                let value = pool.acquire();
                black_box(&*value);
                value.recycle().unwrap();
            }
        });
    });

    group.finish();
}

// ============================================================================
// 2. Foreign release + owner scavenge
// ============================================================================

fn bench_foreign_handoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("recycler/foreign_handoff");
    group.throughput(Throughput::Elements(16));

    group.bench_function("recycle_16_scavenge", |b| {
        let pool = Recycler::new(|| 0u64).unwrap();

        b.iter(|| {
            let batch: Vec<Pooled<u64>> = (0..16).map(|_| pool.acquire()).collect();
            let remote: Vec<Pooled<u64>> = batch.iter().cloned().collect();
            std::thread::spawn(move || {
                for value in remote {
                    value.recycle().unwrap();
                }
            })
            .join()
            .unwrap();
            // Next acquire scavenges the staged batch back.
            black_box(pool.acquire());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_owner_cycle, bench_foreign_handoff);
criterion_main!(benches);
