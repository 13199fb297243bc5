//! Benchmark utilities.

use serde_json::json;
use std::sync::Arc;
use syncflow_engine::{CompiledRule, Engine};
use syncflow_log::{ActionRecord, Fields, FlowId};
use syncflow_testkit::{fields, join_records, memory_services, test_engine, var, RuleBuilder, Side};

/// Generate a flow history of `count` completions alternating between the
/// two join sides, with `distinct` values of `x`.
pub fn join_history(flow: FlowId, count: usize, distinct: usize) -> Vec<Arc<ActionRecord>> {
    let history: Vec<(Side, i64)> = (0..count)
        .map(|i| {
            let side = if i % 2 == 0 { Side::Left } else { Side::Right };
            (side, (i % distinct.max(1)) as i64)
        })
        .collect();
    join_records(flow, &history).into_iter().map(Arc::new).collect()
}

/// A chain of `length` rules: `S0/step` fires `S1/step`, and so on.
pub fn chain_rules(length: usize) -> Vec<CompiledRule> {
    (0..length)
        .map(|i| {
            RuleBuilder::new(format!("Step{i}"))
                .when(&format!("S{i}"), "step")
                .variant("ok")
                .output("n", var("n"))
                .then(&format!("S{}", i + 1), "step")
                .field("n", var("n"))
                .build()
        })
        .collect()
}

/// An engine with [`chain_rules`] loaded and every service of the chain
/// registered.
pub fn chain_engine(length: usize) -> Arc<Engine> {
    let engine = test_engine("bench");
    let names: Vec<String> = (0..=length).map(|i| format!("S{i}")).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    memory_services(&engine, &refs);
    for rule in chain_rules(length) {
        engine.register_rule(rule).expect("Failed to register rule");
    }
    engine
}

/// The stimulus input of a chain run.
pub fn chain_input(n: i64) -> Fields {
    fields([("n", json!(n))])
}
