// Criterion benchmarks for madrpc-common flow control
//
// Run benchmarks with:
//   cargo bench -p madrpc-common
//
// For detailed output with plots:
//   cargo bench -p madrpc-common -- --save-baseline main

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use madrpc_common::{FlowConfigSnapshot, FlowControlConfig, LatencyTimeSnapshot, RetryLimitChecker};

fn bench_flow_switch(c: &mut Criterion) {
    let mut group = c.benchmark_group("flow_switch");

    let mut snapshot = FlowConfigSnapshot::new();
    for i in 0..64 {
        snapshot.update(
            &format!("strategy-{}", i),
            Some(FlowControlConfig::default().with_retry(i % 2 == 0)),
        );
    }

    group.bench_function("two_strategies", |b| {
        b.iter(|| snapshot.get_flow_control_switch(black_box(["strategy-1", "strategy-2"])));
    });

    group.bench_function("unknown_strategies", |b| {
        b.iter(|| snapshot.get_flow_control_switch(black_box(["missing-a", "missing-b"])));
    });

    group.bench_function("clone_64", |b| {
        b.iter(|| black_box(&snapshot).clone());
    });

    group.finish();
}

fn bench_retry_checker(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_checker");
    let checker = RetryLimitChecker::new();

    group.bench_function("unlimited", |b| {
        b.iter(|| checker.can_retry(black_box("s"), black_box(100), -1));
    });

    group.bench_function("limited_same_second", |b| {
        b.iter(|| checker.can_retry(black_box("s"), black_box(100), 1_000_000));
    });

    group.finish();
}

fn bench_latency_push(c: &mut Criterion) {
    let mut group = c.benchmark_group("latency");
    let snapshot = LatencyTimeSnapshot::new();
    snapshot.update_latency_time_window("biz", 1000);

    group.bench_function("push_tracked", |b| {
        b.iter(|| snapshot.push(black_box("biz"), black_box(42)));
    });

    group.bench_function("push_untracked", |b| {
        b.iter(|| snapshot.push(black_box("other"), black_box(42)));
    });

    group.finish();
}

criterion_group!(benches, bench_flow_switch, bench_retry_checker, bench_latency_push);
criterion_main!(benches);
