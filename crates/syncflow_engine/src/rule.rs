//! Compiled rule model.
//!
//! Rules arrive already compiled, usually as JSON produced by an external
//! compiler. The engine never parses rule source; it only validates that a
//! compiled rule is self-consistent.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use crate::binding::Values;
use crate::error::{RuleError, RuleResult};

/// A field value in a pattern, condition or template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Term {
    /// A fixed value.
    Literal(Value),
    /// A named variable, bound on first use and compared afterwards.
    Variable(String),
    /// Matches anything and binds nothing.
    Wildcard,
}

impl Term {
    /// Creates a variable term.
    pub fn var(name: impl Into<String>) -> Self {
        Self::Variable(name.into())
    }

    /// Creates a literal term.
    pub fn lit(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    /// Returns the variable name, if this is a variable.
    #[must_use]
    pub fn as_variable(&self) -> Option<&str> {
        match self {
            Self::Variable(name) => Some(name),
            _ => None,
        }
    }

    /// Resolves the term against bound values.
    ///
    /// Literals resolve to themselves, variables to their bound value, and
    /// wildcards (or unbound variables) to `None`.
    #[must_use]
    pub fn resolve(&self, values: &Values) -> Option<Value> {
        match self {
            Self::Literal(value) => Some(value.clone()),
            Self::Variable(name) => values.get(name).cloned(),
            Self::Wildcard => None,
        }
    }
}

/// A `field: term` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConstraint {
    /// Field or column name.
    pub field: String,
    /// Expected value.
    pub term: Term,
}

impl FieldConstraint {
    /// Creates a constraint.
    pub fn new(field: impl Into<String>, term: Term) -> Self {
        Self {
            field: field.into(),
            term,
        }
    }
}

/// Which completion variants a pattern accepts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariantMatch {
    /// Any variant.
    #[default]
    Any,
    /// Exactly this variant.
    Is(String),
}

impl VariantMatch {
    /// Returns true if `variant` is accepted.
    #[must_use]
    pub fn matches(&self, variant: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Is(expected) => expected == variant,
        }
    }
}

/// Action name that matches every action of a service.
pub const ANY_ACTION: &str = "*";

/// One when-clause pattern: a completion of `service/action`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhenPattern {
    /// Service name.
    pub service: String,
    /// Action name, or [`ANY_ACTION`].
    pub action: String,
    /// Accepted variants.
    #[serde(default)]
    pub variant: VariantMatch,
    /// Constraints on the completion's input.
    #[serde(default)]
    pub input: Vec<FieldConstraint>,
    /// Constraints on the completion's output.
    #[serde(default)]
    pub output: Vec<FieldConstraint>,
}

impl WhenPattern {
    /// Returns `service/action`, plus the variant when constrained.
    #[must_use]
    pub fn label(&self) -> String {
        match &self.variant {
            VariantMatch::Any => format!("{}/{}", self.service, self.action),
            VariantMatch::Is(v) => format!("{}/{} -> {}", self.service, self.action, v),
        }
    }

    /// Returns true if the pattern accepts completions of `action`.
    #[must_use]
    pub fn matches_action(&self, action: &str) -> bool {
        self.action == ANY_ACTION || self.action == action
    }

    /// Returns variable names in constraint order, input before output.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.input
            .iter()
            .chain(self.output.iter())
            .filter_map(|c| c.term.as_variable())
    }
}

/// Comparison operator of a guard step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
}

impl Comparison {
    /// Evaluates `left op right`.
    ///
    /// Numbers compare numerically and strings lexicographically; ordering
    /// comparisons between any other values are false.
    #[must_use]
    pub fn holds(self, left: &Value, right: &Value) -> bool {
        use std::cmp::Ordering;
        let ordering = match (left, right) {
            (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => None,
        };
        match self {
            Self::Eq => ordering.map_or(left == right, |o| o == Ordering::Equal),
            Self::Ne => ordering.map_or(left != right, |o| o != Ordering::Equal),
            Self::Lt => ordering == Some(Ordering::Less),
            Self::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
            Self::Gt => ordering == Some(Ordering::Greater),
            Self::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        }
    }
}

/// A query against one relation of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryStep {
    /// Service answering the query.
    pub service: String,
    /// Relation name.
    pub relation: String,
    /// Query arguments; wildcard arguments are omitted from the request.
    #[serde(default)]
    pub args: Vec<FieldConstraint>,
    /// Column constraints applied to each result row.
    #[serde(default)]
    pub bind: Vec<FieldConstraint>,
}

/// One step of a condition plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionStep {
    /// Query a service relation and join its rows.
    Query(QueryStep),
    /// Bind a variable to a term.
    Bind {
        /// Variable to bind.
        var: String,
        /// Value to bind it to.
        term: Term,
    },
    /// Keep only bindings where the comparison holds.
    Guard {
        /// Left operand.
        left: Term,
        /// Operator.
        op: Comparison,
        /// Right operand.
        right: Term,
    },
}

/// Ordered condition steps evaluated after matching.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionPlan {
    /// Steps in evaluation order.
    pub steps: Vec<ConditionStep>,
}

fn default_version_field() -> String {
    "_ts".to_string()
}

/// A keyed write, checked for conflicts when a deferred firing drains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteTarget {
    /// Relation holding the current state of the key.
    pub relation: String,
    /// Column that identifies the key.
    pub key_field: String,
    /// Key value.
    pub key: Term,
    /// Column holding the write timestamp.
    #[serde(default = "default_version_field")]
    pub version_field: String,
    /// Timestamp of the incoming write; defaults to the capture time.
    #[serde(default)]
    pub timestamp: Option<Term>,
}

/// One then-clause template: an invocation to emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThenTemplate {
    /// Target service.
    pub service: String,
    /// Target action.
    pub action: String,
    /// Input fields.
    #[serde(default)]
    pub fields: Vec<FieldConstraint>,
    /// Keyed write described by this invocation.
    #[serde(default)]
    pub write: Option<WriteTarget>,
}

/// What to do when a service a rule needs is unavailable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// Discard the firing and mark the flow partial.
    #[default]
    Immediate,
    /// Queue the firing until the service comes back.
    Deferred,
    /// Evaluate only against locally registered services; never queue or forward.
    Local,
}

/// A compiled synchronization rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledRule {
    /// Unique rule name.
    pub name: String,
    /// Completion patterns that must all match.
    pub when: Vec<WhenPattern>,
    /// Side conditions evaluated after matching.
    #[serde(default)]
    pub condition: Option<ConditionPlan>,
    /// Invocations emitted for each resolved binding.
    pub then: Vec<ThenTemplate>,
    /// Delivery annotation.
    #[serde(default)]
    pub delivery: Delivery,
}

impl CompiledRule {
    /// Returns the condition steps, empty when there is no condition.
    #[must_use]
    pub fn condition_steps(&self) -> &[ConditionStep] {
        match &self.condition {
            Some(plan) => &plan.steps,
            None => &[],
        }
    }

    /// Returns the distinct `(service, action)` keys of the when clause.
    #[must_use]
    pub fn trigger_keys(&self) -> Vec<(String, String)> {
        let mut keys: Vec<(String, String)> = Vec::new();
        for pattern in &self.when {
            let key = (pattern.service.clone(), pattern.action.clone());
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    /// Returns every service the rule touches: patterns, queries and templates.
    #[must_use]
    pub fn services(&self) -> BTreeSet<&str> {
        let mut services: BTreeSet<&str> = self.when.iter().map(|p| p.service.as_str()).collect();
        for step in self.condition_steps() {
            if let ConditionStep::Query(query) = step {
                services.insert(&query.service);
            }
        }
        services.extend(self.then.iter().map(|t| t.service.as_str()));
        services
    }

    /// Checks that the rule can be evaluated.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule has no name, patterns or templates, uses a
    /// wildcard as a template value, or reads a variable that neither a
    /// pattern nor an earlier condition step binds.
    pub fn validate(&self) -> RuleResult<()> {
        if self.name.trim().is_empty() {
            return Err(RuleError::EmptyName);
        }
        if self.when.is_empty() {
            return Err(RuleError::EmptyWhen {
                rule: self.name.clone(),
            });
        }
        if self.then.is_empty() {
            return Err(RuleError::EmptyThen {
                rule: self.name.clone(),
            });
        }

        let mut bound: BTreeSet<&str> = self.when.iter().flat_map(WhenPattern::variables).collect();

        for step in self.condition_steps() {
            match step {
                ConditionStep::Query(query) => {
                    for arg in &query.args {
                        self.require(&bound, &arg.term)?;
                    }
                    bound.extend(query.bind.iter().filter_map(|c| c.term.as_variable()));
                }
                ConditionStep::Bind { var, term } => {
                    self.require(&bound, term)?;
                    bound.insert(var);
                }
                ConditionStep::Guard { left, right, .. } => {
                    self.require(&bound, left)?;
                    self.require(&bound, right)?;
                }
            }
        }

        for template in &self.then {
            if template.action == ANY_ACTION {
                return Err(RuleError::WildcardAction {
                    rule: self.name.clone(),
                    service: template.service.clone(),
                });
            }
            for field in &template.fields {
                if field.term == Term::Wildcard {
                    return Err(RuleError::WildcardInTemplate {
                        rule: self.name.clone(),
                        field: field.field.clone(),
                    });
                }
                self.require(&bound, &field.term)?;
            }
            if let Some(write) = &template.write {
                self.require(&bound, &write.key)?;
                if let Some(ts) = &write.timestamp {
                    self.require(&bound, ts)?;
                }
            }
        }
        Ok(())
    }

    fn require(&self, bound: &BTreeSet<&str>, term: &Term) -> RuleResult<()> {
        match term.as_variable() {
            Some(var) if !bound.contains(var) => Err(RuleError::UnboundVariable {
                rule: self.name.clone(),
                variable: var.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pattern(service: &str, output: Vec<FieldConstraint>) -> WhenPattern {
        WhenPattern {
            service: service.into(),
            action: "run".into(),
            variant: VariantMatch::Is("ok".into()),
            input: Vec::new(),
            output,
        }
    }

    fn template(fields: Vec<FieldConstraint>) -> ThenTemplate {
        ThenTemplate {
            service: "C".into(),
            action: "go".into(),
            fields,
            write: None,
        }
    }

    fn rule() -> CompiledRule {
        CompiledRule {
            name: "Join".into(),
            when: vec![
                pattern("A", vec![FieldConstraint::new("x", Term::var("x"))]),
                pattern("B", vec![FieldConstraint::new("x", Term::var("x"))]),
            ],
            condition: None,
            then: vec![template(vec![FieldConstraint::new("x", Term::var("x"))])],
            delivery: Delivery::Immediate,
        }
    }

    #[test]
    fn valid_rule_passes() {
        assert_eq!(rule().validate(), Ok(()));
    }

    #[test]
    fn rejects_unbound_then_variable() {
        let mut r = rule();
        r.then[0].fields.push(FieldConstraint::new("y", Term::var("y")));
        assert_eq!(
            r.validate(),
            Err(RuleError::UnboundVariable {
                rule: "Join".into(),
                variable: "y".into()
            })
        );
    }

    #[test]
    fn condition_binds_for_later_steps() {
        let mut r = rule();
        r.condition = Some(ConditionPlan {
            steps: vec![
                ConditionStep::Query(QueryStep {
                    service: "Inventory".into(),
                    relation: "stock".into(),
                    args: vec![FieldConstraint::new("item", Term::var("x"))],
                    bind: vec![FieldConstraint::new("qty", Term::var("qty"))],
                }),
                ConditionStep::Guard {
                    left: Term::var("qty"),
                    op: Comparison::Gt,
                    right: Term::lit(0),
                },
                ConditionStep::Bind {
                    var: "label".into(),
                    term: Term::lit("restock"),
                },
            ],
        });
        r.then[0].fields.push(FieldConstraint::new("qty", Term::var("qty")));
        r.then[0].fields.push(FieldConstraint::new("label", Term::var("label")));
        assert_eq!(r.validate(), Ok(()));
        assert!(r.services().contains("Inventory"));
    }

    #[test]
    fn guard_before_binding_is_rejected() {
        let mut r = rule();
        r.condition = Some(ConditionPlan {
            steps: vec![ConditionStep::Guard {
                left: Term::var("qty"),
                op: Comparison::Gt,
                right: Term::lit(0),
            }],
        });
        assert!(matches!(r.validate(), Err(RuleError::UnboundVariable { .. })));
    }

    #[test]
    fn rejects_wildcard_and_empty_clauses() {
        let mut r = rule();
        r.then[0].fields.push(FieldConstraint::new("z", Term::Wildcard));
        assert!(matches!(r.validate(), Err(RuleError::WildcardInTemplate { .. })));

        let mut r = rule();
        r.when.clear();
        assert!(matches!(r.validate(), Err(RuleError::EmptyWhen { .. })));

        let mut r = rule();
        r.then.clear();
        assert!(matches!(r.validate(), Err(RuleError::EmptyThen { .. })));

        let mut r = rule();
        r.name = "  ".into();
        assert_eq!(r.validate(), Err(RuleError::EmptyName));
    }

    #[test]
    fn wildcard_action_only_in_when_patterns() {
        let mut r = rule();
        r.when[0].action = ANY_ACTION.into();
        assert_eq!(r.validate(), Ok(()));
        assert!(r.when[0].matches_action("anything"));
        assert!(!r.when[1].matches_action("anything"));

        r.then[0].action = ANY_ACTION.into();
        assert_eq!(
            r.validate(),
            Err(RuleError::WildcardAction {
                rule: "Join".into(),
                service: "C".into(),
            })
        );
    }

    #[test]
    fn trigger_keys_are_distinct() {
        let mut r = rule();
        r.when.push(pattern("A", Vec::new()));
        assert_eq!(
            r.trigger_keys(),
            vec![("A".into(), "run".into()), ("B".into(), "run".into())]
        );
    }

    #[test]
    fn comparison_semantics() {
        assert!(Comparison::Gt.holds(&json!(3), &json!(2.5)));
        assert!(Comparison::Le.holds(&json!("a"), &json!("b")));
        assert!(Comparison::Eq.holds(&json!(1), &json!(1.0)));
        assert!(Comparison::Ne.holds(&json!(true), &json!(false)));
        assert!(!Comparison::Lt.holds(&json!(true), &json!(1)));
    }

    #[test]
    fn deserializes_compiler_output() {
        let json = json!({
            "name": "Notify",
            "when": [{
                "service": "Order",
                "action": "place",
                "variant": {"is": "ok"},
                "output": [{"field": "order", "term": {"variable": "o"}}]
            }],
            "then": [{
                "service": "Mail",
                "action": "send",
                "fields": [
                    {"field": "order", "term": {"variable": "o"}},
                    {"field": "template", "term": {"literal": "placed"}}
                ]
            }],
            "delivery": "deferred"
        });
        let rule: CompiledRule = serde_json::from_value(json).unwrap();
        assert_eq!(rule.delivery, Delivery::Deferred);
        assert_eq!(rule.when[0].variant, VariantMatch::Is("ok".into()));
        assert!(rule.condition.is_none());
        assert_eq!(rule.validate(), Ok(()));
    }
}
