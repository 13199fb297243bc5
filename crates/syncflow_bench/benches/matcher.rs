//! Pattern matching and log benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use syncflow_bench::join_history;
use syncflow_engine::Matcher;
use syncflow_log::{ActionLog, ActionRecord, Fields, FlowId};
use syncflow_testkit::join_rule;

/// Benchmark a single pattern against one completion.
fn bench_match_pattern(c: &mut Criterion) {
    let rule = join_rule();
    let flow = FlowId::new();
    let record = join_history(flow, 1, 1).remove(0);

    c.bench_function("match_pattern", |b| {
        b.iter(|| {
            let values = Matcher::match_pattern(black_box(&rule.when[0]), black_box(&record));
            black_box(values);
        });
    });
}

/// Benchmark the two-pattern join over growing flow histories.
fn bench_match_rule(c: &mut Criterion) {
    let mut group = c.benchmark_group("match_rule");
    let rule = join_rule();

    for count in [10usize, 100, 1000].iter() {
        let flow = FlowId::new();
        let history = join_history(flow, *count, 8);
        let trigger = Arc::clone(&history[history.len() - 1]);
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &history, |b, history| {
            b.iter(|| {
                let bindings = Matcher::match_rule(black_box(&rule), &trigger, history);
                black_box(bindings);
            });
        });
    }
    group.finish();
}

/// Benchmark appends to an in-memory log.
fn bench_log_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("log_append");

    for count in [100usize, 1000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            b.iter_batched(
                || {
                    let flow = FlowId::new();
                    (0..count)
                        .map(|_| ActionRecord::invocation("A", "run", Fields::new(), flow))
                        .collect::<Vec<_>>()
                },
                |records| {
                    let log = ActionLog::new();
                    for record in records {
                        log.append(record).unwrap();
                    }
                    black_box(log.len());
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_match_pattern, bench_match_rule, bench_log_append);

criterion_main!(benches);
