//! Fan-out benchmarks for the broadcast engine.
//!
//! Every iteration merges one update and queues it for every member, then
//! drains the queues so they never fill up.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use live_relay_bench::{Fixture, TOPIC};
use live_relay_core::{BroadcastPolicy, ConnectionHandle, ConnectionId, MergeStrategy};
use std::time::Instant;

/// Benchmark one update against growing topic sizes.
fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout");

    for members in [1, 10, 100, 1000] {
        group.throughput(Throughput::Elements(members as u64));
        group.bench_with_input(BenchmarkId::from_parameter(members), &members, |b, &members| {
            let mut fixture = Fixture::new(members, 4, BroadcastPolicy::Others, MergeStrategy::Replace);
            let payload = vec![b'x'; 1024];

            b.iter(|| {
                let report = fixture
                    .engine
                    .on_update(TOPIC, fixture.origin, black_box(&payload))
                    .unwrap();
                fixture.drain();
                report
            });
        });
    }

    group.finish();
}

/// Benchmark updates that land on full queues and evict every member.
fn bench_eviction(c: &mut Criterion) {
    c.bench_function("evict_100_stalled", |b| {
        b.iter_custom(|iters| {
            let mut total = std::time::Duration::ZERO;
            for _ in 0..iters {
                let fixture = Fixture::new(100, 1, BroadcastPolicy::Others, MergeStrategy::Replace);
                fixture.engine.on_update(TOPIC, fixture.origin, b"fill").unwrap();

                let start = Instant::now();
                let report = fixture.engine.on_update(TOPIC, fixture.origin, b"evict").unwrap();
                total += start.elapsed();
                assert_eq!(report.failed.len(), 100);
            }
            total
        });
    });
}

/// Benchmark joining a topic that already has content.
fn bench_join_with_snapshot(c: &mut Criterion) {
    let fixture = Fixture::new(0, 1, BroadcastPolicy::Others, MergeStrategy::Replace);
    fixture
        .engine
        .on_update(TOPIC, fixture.origin, &[b'x'; 4096])
        .unwrap();

    c.bench_function("join_with_snapshot", |b| {
        b.iter(|| {
            let id = ConnectionId::next();
            let (handle, rx) = ConnectionHandle::channel(id, 1);
            fixture.engine.join(TOPIC, handle).unwrap();
            fixture.engine.leave(id);
            rx
        });
    });
}

criterion_group!(benches, bench_fanout, bench_eviction, bench_join_with_snapshot);
criterion_main!(benches);
