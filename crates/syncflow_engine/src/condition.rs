//! Side-condition evaluation.
//!
//! A condition plan is run as a nested-loop join: every partial binding is
//! extended by each step in order, and a query that returns several rows
//! fans the binding out. This is the only place besides dispatch where the
//! engine waits on a service.

use syncflow_log::Fields;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::binding::{constrain, unify, Values};
use crate::error::TransportError;
use crate::registry::ServiceRegistry;
use crate::rule::{CompiledRule, ConditionStep, QueryStep, Term};
use crate::transport::QueryRequest;

/// A branch that could not proceed because a service was unreachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blocked {
    /// Unreachable service.
    pub service: String,
    /// Index of the step that needed it.
    pub step: usize,
}

/// A branch discarded because a step failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    /// Index of the failing step.
    pub step: usize,
    /// Error text.
    pub reason: String,
}

/// Result of evaluating a condition plan for one binding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConditionOutcome {
    /// Fully resolved bindings, in fan-out order.
    pub resolved: Vec<Values>,
    /// Branches waiting on an unavailable service.
    pub blocked: Vec<Blocked>,
    /// Branches discarded by step failures.
    pub failures: Vec<StepFailure>,
}

impl ConditionOutcome {
    /// Returns the first blocking service, if any branch was blocked.
    #[must_use]
    pub fn blocking_service(&self) -> Option<&str> {
        self.blocked.first().map(|b| b.service.as_str())
    }
}

/// Runs condition plans against registered services.
#[derive(Debug)]
pub struct ConditionEvaluator<'a> {
    registry: &'a ServiceRegistry,
    token: &'a CancellationToken,
    local_only: bool,
}

impl<'a> ConditionEvaluator<'a> {
    /// Creates an evaluator that races every query against `token`.
    #[must_use]
    pub fn new(registry: &'a ServiceRegistry, token: &'a CancellationToken) -> Self {
        Self {
            registry,
            token,
            local_only: false,
        }
    }

    /// Restricts queries to locally reached services.
    #[must_use]
    pub fn local_only(mut self, local_only: bool) -> Self {
        self.local_only = local_only;
        self
    }

    /// Evaluates `rule`'s condition starting from the matcher's values.
    ///
    /// A rule without a condition resolves to the seed unchanged. A step
    /// that fails for one branch discards only that branch.
    pub async fn evaluate(&self, rule: &CompiledRule, seed: &Values) -> ConditionOutcome {
        let mut outcome = ConditionOutcome::default();
        let mut frontier = vec![seed.clone()];

        for (idx, step) in rule.condition_steps().iter().enumerate() {
            let mut next = Vec::new();
            for partial in frontier {
                match step {
                    ConditionStep::Query(query) => {
                        self.query_step(rule, idx, query, partial, &mut next, &mut outcome)
                            .await;
                    }
                    ConditionStep::Bind { var, term } => match term.resolve(&partial) {
                        Some(value) => {
                            let mut partial = partial;
                            if unify(&mut partial, var, &value) {
                                next.push(partial);
                            }
                        }
                        None => outcome.failures.push(StepFailure {
                            step: idx,
                            reason: format!("bind ?{var} from an unresolved term"),
                        }),
                    },
                    ConditionStep::Guard { left, op, right } => {
                        if let (Some(l), Some(r)) = (left.resolve(&partial), right.resolve(&partial)) {
                            if op.holds(&l, &r) {
                                next.push(partial);
                            }
                        }
                    }
                }
            }
            frontier = next;
            if frontier.is_empty() {
                break;
            }
        }

        outcome.resolved = frontier;
        debug!(
            rule = %rule.name,
            resolved = outcome.resolved.len(),
            blocked = outcome.blocked.len(),
            failed = outcome.failures.len(),
            "evaluated condition"
        );
        outcome
    }

    async fn query_step(
        &self,
        rule: &CompiledRule,
        idx: usize,
        query: &QueryStep,
        partial: Values,
        next: &mut Vec<Values>,
        outcome: &mut ConditionOutcome,
    ) {
        let blocked = |outcome: &mut ConditionOutcome| {
            outcome.blocked.push(Blocked {
                service: query.service.clone(),
                step: idx,
            });
        };
        if !self.registry.is_available(&query.service)
            || (self.local_only && !self.registry.is_local(&query.service))
        {
            blocked(outcome);
            return;
        }

        let mut args = Fields::new();
        for arg in &query.args {
            match &arg.term {
                Term::Wildcard => {}
                term => match term.resolve(&partial) {
                    Some(value) => {
                        args.insert(arg.field.clone(), value);
                    }
                    None => {
                        outcome.failures.push(StepFailure {
                            step: idx,
                            reason: format!("argument {} is unbound", arg.field),
                        });
                        return;
                    }
                },
            }
        }

        let request = QueryRequest::new(query.relation.clone(), args);
        let result = tokio::select! {
            biased;
            () = self.token.cancelled() => Err(TransportError::Cancelled),
            rows = self.registry.query(&query.service, request) => rows,
        };
        match result {
            Ok(rows) => {
                for row in rows {
                    let mut extended = partial.clone();
                    if query
                        .bind
                        .iter()
                        .all(|column| constrain(&row, column, &mut extended))
                    {
                        next.push(extended);
                    }
                }
            }
            Err(err) if err.is_unavailable() => {
                self.registry.set_available(&query.service, false);
                blocked(outcome);
            }
            Err(err) => {
                warn!(
                    rule = %rule.name,
                    service = %query.service,
                    relation = %query.relation,
                    error = %err,
                    "condition query failed, binding discarded"
                );
                outcome.failures.push(StepFailure {
                    step: idx,
                    reason: err.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{
        Comparison, ConditionPlan, Delivery, FieldConstraint, ThenTemplate, VariantMatch,
        WhenPattern,
    };
    use crate::transport::MockTransport;
    use serde_json::json;
    use std::sync::Arc;

    fn rule(steps: Vec<ConditionStep>) -> CompiledRule {
        CompiledRule {
            name: "Restock".into(),
            when: vec![WhenPattern {
                service: "Order".into(),
                action: "place".into(),
                variant: VariantMatch::Any,
                input: Vec::new(),
                output: vec![FieldConstraint::new("item", Term::var("item"))],
            }],
            condition: Some(ConditionPlan { steps }),
            then: vec![ThenTemplate {
                service: "Supplier".into(),
                action: "order".into(),
                fields: vec![FieldConstraint::new("item", Term::var("item"))],
                write: None,
            }],
            delivery: Delivery::Immediate,
        }
    }

    fn stock_query() -> ConditionStep {
        ConditionStep::Query(QueryStep {
            service: "Inventory".into(),
            relation: "stock".into(),
            args: vec![FieldConstraint::new("item", Term::var("item"))],
            bind: vec![
                FieldConstraint::new("warehouse", Term::var("wh")),
                FieldConstraint::new("qty", Term::var("qty")),
            ],
        })
    }

    fn row(item: &str, wh: &str, qty: i64) -> Fields {
        let mut f = Fields::new();
        f.insert("item".into(), json!(item));
        f.insert("warehouse".into(), json!(wh));
        f.insert("qty".into(), json!(qty));
        f
    }

    fn seed() -> Values {
        let mut v = Values::new();
        v.insert("item".into(), json!("apple"));
        v
    }

    fn setup() -> (ServiceRegistry, Arc<MockTransport>) {
        let registry = ServiceRegistry::new();
        let mock = Arc::new(MockTransport::new("Inventory"));
        mock.set_rows(
            "stock",
            vec![row("apple", "north", 0), row("apple", "south", 4), row("pear", "north", 9)],
        );
        registry.register("Inventory", mock.clone());
        (registry, mock)
    }

    #[tokio::test]
    async fn query_fans_out_and_guard_filters() {
        let (registry, mock) = setup();
        let token = CancellationToken::new();
        let evaluator = ConditionEvaluator::new(&registry, &token);

        let fanned = evaluator.evaluate(&rule(vec![stock_query()]), &seed()).await;
        assert_eq!(fanned.resolved.len(), 2);

        let guarded = rule(vec![
            stock_query(),
            ConditionStep::Guard {
                left: Term::var("qty"),
                op: Comparison::Gt,
                right: Term::lit(0),
            },
            ConditionStep::Bind {
                var: "note".into(),
                term: Term::lit("restock"),
            },
        ]);
        let outcome = evaluator.evaluate(&guarded, &seed()).await;
        assert_eq!(outcome.resolved.len(), 1);
        assert_eq!(outcome.resolved[0]["wh"], json!("south"));
        assert_eq!(outcome.resolved[0]["note"], json!("restock"));
        assert_eq!(mock.queries()[0].args["item"], json!("apple"));
    }

    #[tokio::test]
    async fn zero_rows_resolve_to_nothing() {
        let (registry, _mock) = setup();
        let token = CancellationToken::new();
        let mut seed = seed();
        seed.insert("item".into(), json!("plum"));
        let outcome = ConditionEvaluator::new(&registry, &token)
            .evaluate(&rule(vec![stock_query()]), &seed)
            .await;
        assert!(outcome.resolved.is_empty());
        assert!(outcome.blocked.is_empty());
        assert!(outcome.failures.is_empty());
    }

    #[tokio::test]
    async fn unavailable_service_blocks() {
        let (registry, mock) = setup();
        mock.set_available(false);
        let token = CancellationToken::new();
        let outcome = ConditionEvaluator::new(&registry, &token)
            .evaluate(&rule(vec![stock_query()]), &seed())
            .await;
        assert_eq!(outcome.blocking_service(), Some("Inventory"));
        assert!(!registry.is_available("Inventory"));
    }

    #[tokio::test]
    async fn failure_discards_branch() {
        let (registry, mock) = setup();
        mock.fail_with(Some(TransportError::fatal("relation locked")));
        let token = CancellationToken::new();
        let outcome = ConditionEvaluator::new(&registry, &token)
            .evaluate(&rule(vec![stock_query()]), &seed())
            .await;
        assert!(outcome.resolved.is_empty());
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.failures[0].reason.contains("relation locked"));
    }

    #[tokio::test]
    async fn cancelled_token_fails_queries() {
        let (registry, _mock) = setup();
        let token = CancellationToken::new();
        token.cancel();
        let outcome = ConditionEvaluator::new(&registry, &token)
            .evaluate(&rule(vec![stock_query()]), &seed())
            .await;
        assert!(outcome.resolved.is_empty());
        assert_eq!(outcome.failures.len(), 1);
    }

    #[tokio::test]
    async fn no_condition_passes_seed_through() {
        let registry = ServiceRegistry::new();
        let token = CancellationToken::new();
        let mut r = rule(Vec::new());
        r.condition = None;
        let outcome = ConditionEvaluator::new(&registry, &token).evaluate(&r, &seed()).await;
        assert_eq!(outcome.resolved, vec![seed()]);
    }
}
