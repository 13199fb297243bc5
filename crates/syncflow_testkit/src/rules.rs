//! Fluent construction of compiled rules.

use serde_json::Value;
use syncflow_engine::{
    Comparison, CompiledRule, ConditionPlan, ConditionStep, Delivery, FieldConstraint, QueryStep,
    Term, ThenTemplate, VariantMatch, WhenPattern, WriteTarget,
};

/// Shorthand for [`Term::var`].
pub fn var(name: &str) -> Term {
    Term::var(name)
}

/// Shorthand for [`Term::lit`].
pub fn lit(value: impl Into<Value>) -> Term {
    Term::lit(value)
}

/// Builds a [`CompiledRule`].
///
/// `variant`, `input` and `output` refine the most recent `when` pattern;
/// `field` and `write` refine the most recent `then` template.
///
/// ```rust,ignore
/// let rule = RuleBuilder::new("Notify")
///     .when("Cart", "checkout").variant("ok").output("order", var("o"))
///     .then("Mail", "send").field("order", var("o"))
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct RuleBuilder {
    rule: CompiledRule,
}

impl RuleBuilder {
    /// Starts a rule.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            rule: CompiledRule {
                name: name.into(),
                when: Vec::new(),
                condition: None,
                then: Vec::new(),
                delivery: Delivery::Immediate,
            },
        }
    }

    /// Adds a pattern accepting any variant.
    #[must_use]
    pub fn when(mut self, service: &str, action: &str) -> Self {
        self.rule.when.push(WhenPattern {
            service: service.into(),
            action: action.into(),
            variant: VariantMatch::Any,
            input: Vec::new(),
            output: Vec::new(),
        });
        self
    }

    /// Restricts the last pattern to one variant.
    #[must_use]
    pub fn variant(mut self, variant: &str) -> Self {
        if let Some(pattern) = self.rule.when.last_mut() {
            pattern.variant = VariantMatch::Is(variant.into());
        }
        self
    }

    /// Constrains an input field of the last pattern.
    #[must_use]
    pub fn input(mut self, field: &str, term: Term) -> Self {
        if let Some(pattern) = self.rule.when.last_mut() {
            pattern.input.push(FieldConstraint::new(field, term));
        }
        self
    }

    /// Constrains an output field of the last pattern.
    #[must_use]
    pub fn output(mut self, field: &str, term: Term) -> Self {
        if let Some(pattern) = self.rule.when.last_mut() {
            pattern.output.push(FieldConstraint::new(field, term));
        }
        self
    }

    /// Adds a query step.
    #[must_use]
    pub fn query(
        self,
        service: &str,
        relation: &str,
        args: &[(&str, Term)],
        bind: &[(&str, Term)],
    ) -> Self {
        self.step(ConditionStep::Query(QueryStep {
            service: service.into(),
            relation: relation.into(),
            args: constraints(args),
            bind: constraints(bind),
        }))
    }

    /// Adds a bind step.
    #[must_use]
    pub fn bind(self, var: &str, term: Term) -> Self {
        self.step(ConditionStep::Bind {
            var: var.into(),
            term,
        })
    }

    /// Adds a guard step.
    #[must_use]
    pub fn guard(self, left: Term, op: Comparison, right: Term) -> Self {
        self.step(ConditionStep::Guard { left, op, right })
    }

    /// Adds a template.
    #[must_use]
    pub fn then(mut self, service: &str, action: &str) -> Self {
        self.rule.then.push(ThenTemplate {
            service: service.into(),
            action: action.into(),
            fields: Vec::new(),
            write: None,
        });
        self
    }

    /// Sets a field of the last template.
    #[must_use]
    pub fn field(mut self, field: &str, term: Term) -> Self {
        if let Some(template) = self.rule.then.last_mut() {
            template.fields.push(FieldConstraint::new(field, term));
        }
        self
    }

    /// Declares the last template a keyed write on `relation`.
    ///
    /// The version column defaults to `_ts`; `timestamp` is the term holding
    /// the incoming write's timestamp.
    #[must_use]
    pub fn write(mut self, relation: &str, key_field: &str, key: Term, timestamp: Option<Term>) -> Self {
        if let Some(template) = self.rule.then.last_mut() {
            template.write = Some(WriteTarget {
                relation: relation.into(),
                key_field: key_field.into(),
                key,
                version_field: "_ts".into(),
                timestamp,
            });
        }
        self
    }

    /// Sets the delivery annotation.
    #[must_use]
    pub fn delivery(mut self, delivery: Delivery) -> Self {
        self.rule.delivery = delivery;
        self
    }

    /// Marks the rule deferred.
    #[must_use]
    pub fn deferred(self) -> Self {
        self.delivery(Delivery::Deferred)
    }

    /// Marks the rule locally scoped.
    #[must_use]
    pub fn local(self) -> Self {
        self.delivery(Delivery::Local)
    }

    /// Returns the rule.
    pub fn build(self) -> CompiledRule {
        self.rule
    }

    fn step(mut self, step: ConditionStep) -> Self {
        self.rule
            .condition
            .get_or_insert_with(ConditionPlan::default)
            .steps
            .push(step);
        self
    }
}

fn constraints(pairs: &[(&str, Term)]) -> Vec<FieldConstraint> {
    pairs
        .iter()
        .map(|(field, term)| FieldConstraint::new(*field, term.clone()))
        .collect()
}
