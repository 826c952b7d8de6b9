//! Benchmarks for work submission through a host-only system.
//!
//! Run with: `cargo bench -p localrt-core --bench submit`
//!
//! These benchmarks measure:
//! - Round-trip latency of a single submit-and-wait
//! - Throughput of a burst of submissions on one device
//! - Throughput with several concurrent submitters

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use localrt_core::{BackendKind, DeviceId, System, SystemConfig, SystemFactory};
use std::time::Duration;

const BURST: usize = 1_000;

fn host_system(workers: usize) -> System {
    SystemFactory::with_compiled_backends()
        .build(&SystemConfig::host_only().with_worker_threads(workers))
        .expect("host backend should always build")
}

fn host0() -> DeviceId {
    DeviceId::new(BackendKind::HostCpu, 0)
}

// =============================================================================
// Latency
// =============================================================================

fn bench_round_trip(c: &mut Criterion) {
    let system = host_system(1);
    let device = host0();

    let mut group = c.benchmark_group("submit_round_trip");
    group.sample_size(50);
    group.bench_function("noop", |b| {
        b.iter(|| {
            system
                .submit(&device, |ctx| {
                    black_box(ctx.worker);
                })
                .unwrap()
                .wait()
                .unwrap();
        });
    });
    group.finish();
}

// =============================================================================
// Throughput
// =============================================================================

fn bench_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("submit_burst");
    group.sample_size(20);
    group.measurement_time(Duration::from_secs(10));
    group.throughput(Throughput::Elements(BURST as u64));

    for workers in [1usize, 4] {
        let system = host_system(workers);
        let device = host0();
        group.bench_with_input(BenchmarkId::new("workers", workers), &workers, |b, _| {
            b.iter(|| {
                let completions: Vec<_> = (0..BURST)
                    .map(|i| {
                        system
                            .submit(&device, move |_| {
                                black_box(i * 2);
                            })
                            .unwrap()
                    })
                    .collect();
                for completion in completions {
                    completion.wait().unwrap();
                }
            });
        });
    }
    group.finish();
}

fn bench_concurrent_submitters(c: &mut Criterion) {
    let system = host_system(4);
    let device = host0();

    let mut group = c.benchmark_group("submit_concurrent");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(15));

    for submitters in [2usize, 8] {
        group.throughput(Throughput::Elements((submitters * BURST) as u64));
        group.bench_with_input(
            BenchmarkId::new("submitters", submitters),
            &submitters,
            |b, &submitters| {
                b.iter(|| {
                    std::thread::scope(|scope| {
                        for _ in 0..submitters {
                            let system = &system;
                            scope.spawn(move || {
                                let completions: Vec<_> = (0..BURST)
                                    .map(|_| system.submit(&device, |_| {}).unwrap())
                                    .collect();
                                for completion in completions {
                                    completion.wait().unwrap();
                                }
                            });
                        }
                    });
                });
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_round_trip,
    bench_burst,
    bench_concurrent_submitters
);
criterion_main!(benches);
