//! Relational matching of when-patterns against a flow's completions.
//!
//! For one trigger completion, the matcher returns every consistent
//! assignment of completions to a rule's patterns that includes the trigger.
//! It is pure: no I/O, no locks, no side effects.
//!
//! Cost is kept down by:
//! - filtering candidates per pattern before joining
//! - fixing the trigger at one position per pass; no other position may
//!   take it
//! - hash buckets on each pattern's first join variable
//! - checking variable consistency as each position is filled

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use syncflow_log::{ActionRecord, RecordId};

use crate::binding::{constrain, merge, Binding, MatchKey, Values};
use crate::rule::{CompiledRule, WhenPattern};

/// Computes bindings for a rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct Matcher;

struct Candidate<'a> {
    record: &'a ActionRecord,
    values: Values,
}

struct Column<'a> {
    candidates: Vec<Candidate<'a>>,
    join: Option<(String, HashMap<String, Vec<usize>>)>,
}

impl Column<'_> {
    fn indices(&self, values: &Values) -> Vec<usize> {
        if let Some((var, buckets)) = &self.join {
            if let Some(value) = values.get(var) {
                return buckets.get(&bucket_key(value)).cloned().unwrap_or_default();
            }
        }
        (0..self.candidates.len()).collect()
    }
}

struct Sink {
    seen: HashSet<MatchKey>,
    out: Vec<Binding>,
}

impl Matcher {
    /// Returns the per-pattern values a record binds, or `None` if it does
    /// not satisfy the pattern on its own.
    #[must_use]
    pub fn match_pattern(pattern: &WhenPattern, record: &ActionRecord) -> Option<Values> {
        let variant = record.variant()?;
        if record.service != pattern.service
            || !pattern.matches_action(&record.action)
            || !pattern.variant.matches(variant)
        {
            return None;
        }
        let output = record.output()?;
        let mut values = Values::new();
        for constraint in &pattern.input {
            if !constrain(&record.input, constraint, &mut values) {
                return None;
            }
        }
        for constraint in &pattern.output {
            if !constrain(output, constraint, &mut values) {
                return None;
            }
        }
        Some(values)
    }

    /// Returns every binding of `rule` over `completions` whose matched set
    /// contains `trigger`.
    ///
    /// Bindings come in pattern-declaration order, then arrival order, and
    /// are deduplicated by matched set. `completions` is the flow's history
    /// in arrival order; the trigger may or may not be part of it, and
    /// records of other flows are ignored.
    #[must_use]
    pub fn match_rule(
        rule: &CompiledRule,
        trigger: &ActionRecord,
        completions: &[Arc<ActionRecord>],
    ) -> Vec<Binding> {
        let mut sink = Sink {
            seen: HashSet::new(),
            out: Vec::new(),
        };
        let trigger_hits: Vec<Option<Values>> = rule
            .when
            .iter()
            .map(|pattern| Self::match_pattern(pattern, trigger))
            .collect();
        if trigger_hits.iter().all(Option::is_none) {
            return sink.out;
        }

        let others: Vec<Vec<Candidate<'_>>> = rule
            .when
            .iter()
            .map(|pattern| {
                completions
                    .iter()
                    .filter(|record| record.flow == trigger.flow && record.id != trigger.id)
                    .filter_map(|record| {
                        Self::match_pattern(pattern, record).map(|values| Candidate {
                            record: record.as_ref(),
                            values,
                        })
                    })
                    .collect()
            })
            .collect();

        for (position, hit) in trigger_hits.iter().enumerate() {
            let Some(trigger_values) = hit else {
                continue;
            };
            let columns: Vec<Column<'_>> = rule
                .when
                .iter()
                .enumerate()
                .map(|(idx, pattern)| {
                    let candidates = if idx == position {
                        vec![Candidate {
                            record: trigger,
                            values: trigger_values.clone(),
                        }]
                    } else {
                        others[idx]
                            .iter()
                            .map(|c| Candidate {
                                record: c.record,
                                values: c.values.clone(),
                            })
                            .collect()
                    };
                    Column::new(candidates, join_variable(rule, idx, pattern))
                })
                .collect();

            if columns.iter().any(|c| c.candidates.is_empty()) {
                continue;
            }
            let mut chosen = Vec::with_capacity(columns.len());
            descend(&columns, 0, &Values::new(), &mut chosen, &mut sink);
        }
        sink.out
    }

    /// Returns labels of patterns that no completion in `completions` can
    /// fill, counting `trigger` as available.
    #[must_use]
    pub fn missing_patterns(
        rule: &CompiledRule,
        trigger: &ActionRecord,
        completions: &[Arc<ActionRecord>],
    ) -> Vec<String> {
        rule.when
            .iter()
            .filter(|pattern| {
                Self::match_pattern(pattern, trigger).is_none()
                    && !completions
                        .iter()
                        .any(|record| Self::match_pattern(pattern, record).is_some())
            })
            .map(WhenPattern::label)
            .collect()
    }
}

impl<'a> Column<'a> {
    fn new(candidates: Vec<Candidate<'a>>, join: Option<String>) -> Self {
        let join = join.map(|var| {
            let mut buckets: HashMap<String, Vec<usize>> = HashMap::new();
            for (idx, candidate) in candidates.iter().enumerate() {
                if let Some(value) = candidate.values.get(&var) {
                    buckets.entry(bucket_key(value)).or_default().push(idx);
                }
            }
            (var, buckets)
        });
        Self { candidates, join }
    }
}

/// First variable of pattern `idx` that an earlier pattern also binds.
fn join_variable(rule: &CompiledRule, idx: usize, pattern: &WhenPattern) -> Option<String> {
    pattern
        .variables()
        .find(|var| rule.when[..idx].iter().any(|p| p.variables().any(|v| v == *var)))
        .map(str::to_string)
}

fn bucket_key(value: &Value) -> String {
    value.to_string()
}

fn descend(
    columns: &[Column<'_>],
    position: usize,
    values: &Values,
    chosen: &mut Vec<RecordId>,
    sink: &mut Sink,
) {
    if position == columns.len() {
        let binding = Binding::new(values.clone(), chosen.clone());
        if sink.seen.insert(binding.key()) {
            sink.out.push(binding);
        }
        return;
    }
    let column = &columns[position];
    for idx in column.indices(values) {
        let candidate = &column.candidates[idx];
        if chosen.contains(&candidate.record.id) {
            continue;
        }
        let mut extended = values.clone();
        if !merge(&mut extended, &candidate.values) {
            continue;
        }
        chosen.push(candidate.record.id);
        descend(columns, position + 1, &extended, chosen, sink);
        chosen.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{Delivery, FieldConstraint, Term, ThenTemplate, VariantMatch};
    use serde_json::json;
    use syncflow_log::{Fields, FlowId};

    fn done(service: &str, flow: FlowId, variant: &str, x: i64) -> Arc<ActionRecord> {
        let mut output = Fields::new();
        output.insert("x".into(), json!(x));
        Arc::new(ActionRecord::completion(service, "run", Fields::new(), variant, output, flow))
    }

    fn pattern(service: &str, variant: VariantMatch, term: Term) -> WhenPattern {
        WhenPattern {
            service: service.into(),
            action: "run".into(),
            variant,
            input: Vec::new(),
            output: vec![FieldConstraint::new("x", term)],
        }
    }

    fn rule(when: Vec<WhenPattern>) -> CompiledRule {
        CompiledRule {
            name: "R".into(),
            when,
            condition: None,
            then: vec![ThenTemplate {
                service: "C".into(),
                action: "go".into(),
                fields: Vec::new(),
                write: None,
            }],
            delivery: Delivery::Immediate,
        }
    }

    fn join_rule() -> CompiledRule {
        rule(vec![
            pattern("A", VariantMatch::Is("ok".into()), Term::var("x")),
            pattern("B", VariantMatch::Is("ok".into()), Term::var("x")),
        ])
    }

    #[test]
    fn single_pair_join() {
        let flow = FlowId::new();
        let a = done("A", flow, "ok", 1);
        let b = done("B", flow, "ok", 1);
        let history = vec![a.clone(), b.clone()];

        let bindings = Matcher::match_rule(&join_rule(), &b, &history);
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].get("x"), Some(&json!(1)));
        assert_eq!(bindings[0].matched(), &[a.id, b.id]);
    }

    #[test]
    fn any_action_pattern_matches_every_action_of_its_service() {
        let flow = FlowId::new();
        let mut any = pattern("A", VariantMatch::Any, Term::var("x"));
        any.action = "*".into();
        let mut output = Fields::new();
        output.insert("x".into(), json!(4));
        let other = ActionRecord::completion("A", "refund", Fields::new(), "ok", output.clone(), flow);
        let foreign = ActionRecord::completion("B", "refund", Fields::new(), "ok", output, flow);

        let values = Matcher::match_pattern(&any, &other).unwrap();
        assert_eq!(values.get("x"), Some(&json!(4)));
        assert!(Matcher::match_pattern(&any, &foreign).is_none());
        assert!(Matcher::match_pattern(&any, &done("A", flow, "ok", 4)).is_some());
        // An exact pattern still only takes its own action.
        let exact = pattern("A", VariantMatch::Any, Term::var("x"));
        assert!(Matcher::match_pattern(&exact, &other).is_none());
    }

    #[test]
    fn disagreeing_values_do_not_join() {
        let flow = FlowId::new();
        let a = done("A", flow, "ok", 1);
        let b = done("B", flow, "ok", 2);
        let history = vec![a, b.clone()];
        assert!(Matcher::match_rule(&join_rule(), &b, &history).is_empty());
    }

    #[test]
    fn trigger_must_be_in_every_binding() {
        let flow = FlowId::new();
        let a1 = done("A", flow, "ok", 1);
        let b1 = done("B", flow, "ok", 1);
        let a2 = done("A", flow, "ok", 2);
        let b2 = done("B", flow, "ok", 2);
        let history = vec![a1.clone(), b1.clone(), a2.clone(), b2.clone()];

        let bindings = Matcher::match_rule(&join_rule(), &b2, &history);
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].matched(), &[a2.id, b2.id]);
    }

    #[test]
    fn fan_in_returns_one_binding_per_pairing() {
        let flow = FlowId::new();
        let a1 = done("A", flow, "ok", 1);
        let a2 = done("A", flow, "ok", 1);
        let b = done("B", flow, "ok", 1);
        let history = vec![a1.clone(), a2.clone(), b.clone()];

        let bindings = Matcher::match_rule(&join_rule(), &b, &history);
        let matched: Vec<_> = bindings.iter().map(|b| b.matched().to_vec()).collect();
        assert_eq!(matched, vec![vec![a1.id, b.id], vec![a2.id, b.id]]);
    }

    #[test]
    fn variant_filter_applies() {
        let flow = FlowId::new();
        let a = done("A", flow, "error", 1);
        let b = done("B", flow, "ok", 1);
        let history = vec![a, b.clone()];
        assert!(Matcher::match_rule(&join_rule(), &b, &history).is_empty());
        assert_eq!(
            Matcher::missing_patterns(&join_rule(), &b, &history),
            vec!["A/run -> ok".to_string()]
        );
    }

    #[test]
    fn record_fills_one_position_and_sets_dedup() {
        let r = rule(vec![
            pattern("A", VariantMatch::Any, Term::var("x")),
            pattern("A", VariantMatch::Any, Term::var("x")),
        ]);
        let flow = FlowId::new();
        let first = done("A", flow, "ok", 1);
        let second = done("A", flow, "ok", 1);

        assert!(Matcher::match_rule(&r, &first, &[first.clone()]).is_empty());

        let history = vec![first.clone(), second.clone()];
        let bindings = Matcher::match_rule(&r, &second, &history);
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].matched(), &[second.id, first.id]);
    }

    #[test]
    fn literal_and_wildcard_terms() {
        let r = rule(vec![pattern("A", VariantMatch::Any, Term::lit(5))]);
        let flow = FlowId::new();
        let five = done("A", flow, "ok", 5);
        let six = done("A", flow, "ok", 6);
        assert_eq!(Matcher::match_rule(&r, &five, &[five.clone()]).len(), 1);
        assert!(Matcher::match_rule(&r, &six, &[six.clone()]).is_empty());

        let any = rule(vec![pattern("A", VariantMatch::Any, Term::Wildcard)]);
        assert_eq!(Matcher::match_rule(&any, &six, &[six.clone()]).len(), 1);
    }

    #[test]
    fn invocations_never_match() {
        let r = rule(vec![pattern("A", VariantMatch::Any, Term::Wildcard)]);
        let flow = FlowId::new();
        let inv = Arc::new(ActionRecord::invocation("A", "run", Fields::new(), flow));
        assert!(Matcher::match_rule(&r, &inv, &[inv.clone()]).is_empty());
    }

    #[test]
    fn other_flows_are_ignored() {
        let flow = FlowId::new();
        let a = done("A", FlowId::new(), "ok", 1);
        let b = done("B", flow, "ok", 1);
        assert!(Matcher::match_rule(&join_rule(), &b, &[a]).is_empty());
    }
}
