//! Property-based test generators using proptest.
//!
//! The join generators describe a flow as a list of `(side, x)` pairs: each
//! pair becomes a completion of `A/run` (left) or `B/run` (right) with
//! output `x`. [`join_rule`] joins the two sides on `?x`.

use proptest::prelude::*;
use serde_json::{json, Value};
use syncflow_engine::CompiledRule;
use syncflow_log::{ActionRecord, Fields, FlowId};

use crate::fixtures::fields;
use crate::rules::{var, RuleBuilder};

/// Which side of the join a generated completion belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// `A/run`.
    Left,
    /// `B/run`.
    Right,
}

impl Side {
    /// Returns the service of this side.
    pub fn service(self) -> &'static str {
        match self {
            Self::Left => "A",
            Self::Right => "B",
        }
    }
}

/// Strategy for small scalar field values.
pub fn field_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        (0i64..8).prop_map(|n| json!(n)),
        prop::string::string_regex("[a-d]{1,2}")
            .expect("Invalid regex")
            .prop_map(Value::String),
        any::<bool>().prop_map(Value::Bool),
    ]
}

/// Strategy for field maps with short lowercase names.
pub fn fields_strategy() -> impl Strategy<Value = Fields> {
    prop::collection::btree_map(
        prop::string::string_regex("[a-z]{1,4}").expect("Invalid regex"),
        field_value_strategy(),
        0..4,
    )
}

/// Strategy for a join history of up to `max` completions over few values
/// of `x`, so that both matching and clashing pairs are common.
pub fn join_history_strategy(max: usize) -> impl Strategy<Value = Vec<(Side, i64)>> {
    prop::collection::vec(
        (prop_oneof![Just(Side::Left), Just(Side::Right)], 0i64..4),
        1..=max,
    )
}

/// The rule joining `A/run` and `B/run` on `?x` into `C/log`.
pub fn join_rule() -> CompiledRule {
    RuleBuilder::new("Join")
        .when("A", "run")
        .variant("ok")
        .output("x", var("x"))
        .when("B", "run")
        .variant("ok")
        .output("x", var("x"))
        .then("C", "log")
        .field("x", var("x"))
        .build()
}

/// Turns a join history into completions of one flow, in order.
pub fn join_records(flow: FlowId, history: &[(Side, i64)]) -> Vec<ActionRecord> {
    history
        .iter()
        .enumerate()
        .map(|(i, (side, x))| {
            ActionRecord::completion(
                side.service(),
                "run",
                Fields::new(),
                "ok",
                fields([("x", json!(x))]),
                flow,
            )
            .with_timestamp(i as u64 + 1)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn join_records_follow_history(history in join_history_strategy(10)) {
            let flow = FlowId::new();
            let records = join_records(flow, &history);
            prop_assert_eq!(records.len(), history.len());
            for (record, (side, x)) in records.iter().zip(&history) {
                prop_assert_eq!(record.service.as_str(), side.service());
                prop_assert_eq!(&record.output().unwrap()["x"], &json!(x));
            }
        }
    }

    #[test]
    fn join_rule_is_valid() {
        assert!(join_rule().validate().is_ok());
    }
}
