//! End-to-end engine benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use syncflow_bench::{chain_engine, chain_input};
use syncflow_log::{Fields, FlowId};
use syncflow_testkit::{completion, fields, join_rule, memory_services, test_engine};
use tokio::runtime::Runtime;

/// Benchmark flows that cascade through a chain of rules.
fn bench_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain");
    let runtime = Runtime::new().unwrap();

    for length in [1usize, 8, 32].iter() {
        let engine = chain_engine(*length);
        let engine = &engine;
        group.throughput(Throughput::Elements(*length as u64));
        group.bench_with_input(BenchmarkId::from_parameter(length), length, |b, _| {
            b.to_async(&runtime).iter(|| async move {
                let report = engine.start_flow("S0", "step", chain_input(1)).await.unwrap();
                black_box(report);
            });
        });
    }
    group.finish();
}

/// Benchmark the join rule firing from externally delivered completions.
fn bench_join_completions(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let engine = test_engine("bench");
    memory_services(&engine, &["A", "B", "C"]);
    engine.register_rule(join_rule()).unwrap();
    let engine = &engine;

    c.bench_function("join_completions", |b| {
        b.to_async(&runtime).iter(|| async move {
            let flow = FlowId::new();
            for service in ["A", "B"] {
                let done = completion(
                    service,
                    "run",
                    Fields::new(),
                    "ok",
                    fields([("x", json!(1))]),
                    flow,
                );
                let report = engine.on_completion(done).await.unwrap();
                black_box(report);
            }
        });
    });
}

criterion_group!(benches, bench_chain, bench_join_completions);

criterion_main!(benches);
