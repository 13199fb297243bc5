//! Variable bindings produced by matching.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use syncflow_log::{Fields, RecordId};

use crate::rule::{FieldConstraint, Term};

/// Variable name to value.
pub type Values = BTreeMap<String, Value>;

/// Variable values plus the completions that produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    values: Values,
    matched: Vec<RecordId>,
}

impl Binding {
    /// Creates a binding; `matched` is in pattern order.
    #[must_use]
    pub fn new(values: Values, matched: Vec<RecordId>) -> Self {
        Self { values, matched }
    }

    /// Returns the bound values.
    #[must_use]
    pub fn values(&self) -> &Values {
        &self.values
    }

    /// Returns the matched completions in pattern order.
    #[must_use]
    pub fn matched(&self) -> &[RecordId] {
        &self.matched
    }

    /// Returns one bound value.
    #[must_use]
    pub fn get(&self, var: &str) -> Option<&Value> {
        self.values.get(var)
    }

    /// Returns the order-insensitive identity of the matched set.
    #[must_use]
    pub fn key(&self) -> MatchKey {
        MatchKey::new(&self.matched)
    }
}

/// Sorted matched-set ids; two bindings with equal keys are the same firing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MatchKey(Vec<RecordId>);

impl MatchKey {
    /// Creates a key from ids in any order.
    #[must_use]
    pub fn new(ids: &[RecordId]) -> Self {
        let mut ids = ids.to_vec();
        ids.sort_unstable();
        Self(ids)
    }

    /// Returns the sorted ids.
    #[must_use]
    pub fn ids(&self) -> &[RecordId] {
        &self.0
    }
}

/// Binds `var` to `value`, or checks consistency if already bound.
pub fn unify(values: &mut Values, var: &str, value: &Value) -> bool {
    match values.get(var) {
        Some(existing) => existing == value,
        None => {
            values.insert(var.to_string(), value.clone());
            true
        }
    }
}

/// Merges `other` into `values`; false on the first disagreeing variable.
pub fn merge(values: &mut Values, other: &Values) -> bool {
    other.iter().all(|(var, value)| unify(values, var, value))
}

/// Applies one constraint to a field map.
///
/// A literal must equal the field, a variable unifies with it, a wildcard
/// accepts anything (even a missing field).
pub fn constrain(fields: &Fields, constraint: &FieldConstraint, values: &mut Values) -> bool {
    match &constraint.term {
        Term::Wildcard => true,
        Term::Literal(expected) => fields.get(&constraint.field) == Some(expected),
        Term::Variable(var) => match fields.get(&constraint.field) {
            Some(value) => unify(values, var, value),
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unify_binds_then_checks() {
        let mut values = Values::new();
        assert!(unify(&mut values, "x", &json!(1)));
        assert!(unify(&mut values, "x", &json!(1)));
        assert!(!unify(&mut values, "x", &json!(2)));
        assert_eq!(values["x"], json!(1));
    }

    #[test]
    fn constrain_terms() {
        let mut fields = Fields::new();
        fields.insert("item".into(), json!("apple"));
        let mut values = Values::new();

        assert!(constrain(&fields, &FieldConstraint::new("item", Term::lit("apple")), &mut values));
        assert!(!constrain(&fields, &FieldConstraint::new("item", Term::lit("pear")), &mut values));
        assert!(constrain(&fields, &FieldConstraint::new("missing", Term::Wildcard), &mut values));
        assert!(!constrain(&fields, &FieldConstraint::new("missing", Term::var("m")), &mut values));
        assert!(constrain(&fields, &FieldConstraint::new("item", Term::var("i")), &mut values));
        assert_eq!(values["i"], json!("apple"));
    }

    #[test]
    fn match_key_ignores_order() {
        let a = RecordId::from_u128(1);
        let b = RecordId::from_u128(2);
        assert_eq!(
            Binding::new(Values::new(), vec![a, b]).key(),
            Binding::new(Values::new(), vec![b, a]).key()
        );
    }
}
