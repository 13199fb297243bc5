//! Rule index keyed by trigger `(service, action)`.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::error::{RuleError, RuleResult};
use crate::rule::{CompiledRule, ANY_ACTION};

/// Immutable view of the registered rules.
///
/// Readers hold a snapshot for the whole evaluation of one completion, so a
/// concurrent reload never changes the rule set mid-evaluation.
#[derive(Debug, Default)]
pub struct IndexSnapshot {
    rules: Vec<Arc<CompiledRule>>,
    by_name: HashMap<String, usize>,
    by_key: HashMap<(String, String), Vec<usize>>,
    generation: u64,
}

impl IndexSnapshot {
    fn build(rules: Vec<Arc<CompiledRule>>, generation: u64) -> RuleResult<Self> {
        let mut by_name = HashMap::with_capacity(rules.len());
        let mut by_key: HashMap<(String, String), Vec<usize>> = HashMap::new();
        for (idx, rule) in rules.iter().enumerate() {
            if by_name.insert(rule.name.clone(), idx).is_some() {
                return Err(RuleError::DuplicateRule {
                    name: rule.name.clone(),
                });
            }
            for key in rule.trigger_keys() {
                by_key.entry(key).or_default().push(idx);
            }
        }
        Ok(Self {
            rules,
            by_name,
            by_key,
            generation,
        })
    }

    /// Returns rules triggered by `service/action`, including rules on
    /// `service/*`, in registration order.
    #[must_use]
    pub fn candidates_for(&self, service: &str, action: &str) -> Vec<Arc<CompiledRule>> {
        let exact = self.by_key.get(&(service.to_string(), action.to_string()));
        let any = if action == ANY_ACTION {
            None
        } else {
            self.by_key.get(&(service.to_string(), ANY_ACTION.to_string()))
        };
        let mut hits: Vec<usize> = exact.into_iter().chain(any).flatten().copied().collect();
        hits.sort_unstable();
        hits.dedup();
        hits.into_iter()
            .map(|idx| Arc::clone(&self.rules[idx]))
            .collect()
    }

    /// Returns true if any rule is triggered by `service/action`.
    #[must_use]
    pub fn has_candidates(&self, service: &str, action: &str) -> bool {
        self.by_key
            .contains_key(&(service.to_string(), action.to_string()))
            || self
                .by_key
                .contains_key(&(service.to_string(), ANY_ACTION.to_string()))
    }

    /// Looks up a rule by name.
    #[must_use]
    pub fn rule(&self, name: &str) -> Option<Arc<CompiledRule>> {
        self.by_name.get(name).map(|&idx| Arc::clone(&self.rules[idx]))
    }

    /// Returns all rules in registration order.
    #[must_use]
    pub fn rules(&self) -> &[Arc<CompiledRule>] {
        &self.rules
    }

    /// Returns the number of rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns true if no rules are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Returns the generation, bumped by every register and reload.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Copy-on-write rule index.
///
/// Updates build a new [`IndexSnapshot`] and swap it in under a short write
/// lock; the previous snapshot stays valid for readers that already hold it.
#[derive(Debug, Default)]
pub struct RuleIndex {
    current: RwLock<Arc<IndexSnapshot>>,
}

impl RuleIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and adds one rule.
    ///
    /// # Errors
    ///
    /// Returns the validation error, or [`RuleError::DuplicateRule`] if the
    /// name is taken.
    pub fn register(&self, rule: CompiledRule) -> RuleResult<u64> {
        rule.validate()?;
        let mut current = self.current.write();
        if current.by_name.contains_key(&rule.name) {
            return Err(RuleError::DuplicateRule { name: rule.name });
        }
        let name = rule.name.clone();
        let mut rules = current.rules.clone();
        rules.push(Arc::new(rule));
        let next = IndexSnapshot::build(rules, current.generation + 1)?;
        let generation = next.generation;
        *current = Arc::new(next);
        info!(rule = %name, generation, "registered rule");
        Ok(generation)
    }

    /// Replaces the whole rule set atomically.
    ///
    /// # Errors
    ///
    /// Returns the first validation or duplicate-name error; the current
    /// index is left untouched in that case.
    pub fn reload(&self, rules: Vec<CompiledRule>) -> RuleResult<u64> {
        for rule in &rules {
            rule.validate()?;
        }
        let rules: Vec<Arc<CompiledRule>> = rules.into_iter().map(Arc::new).collect();
        let mut current = self.current.write();
        let next = IndexSnapshot::build(rules, current.generation + 1)?;
        let generation = next.generation;
        let count = next.len();
        *current = Arc::new(next);
        info!(rules = count, generation, "reloaded rule index");
        Ok(generation)
    }

    /// Returns the current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Returns rules triggered by `service/action` in the current snapshot.
    #[must_use]
    pub fn candidates_for(&self, service: &str, action: &str) -> Vec<Arc<CompiledRule>> {
        self.snapshot().candidates_for(service, action)
    }

    /// Returns true if the current snapshot has candidates for `service/action`.
    #[must_use]
    pub fn has_candidates(&self, service: &str, action: &str) -> bool {
        self.current.read().has_candidates(service, action)
    }

    /// Looks up a rule by name in the current snapshot.
    #[must_use]
    pub fn rule(&self, name: &str) -> Option<Arc<CompiledRule>> {
        self.current.read().rule(name)
    }

    /// Returns the current generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.current.read().generation
    }

    /// Returns the number of registered rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.current.read().len()
    }

    /// Returns true if no rules are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.current.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{Delivery, ThenTemplate, VariantMatch, WhenPattern};

    fn rule(name: &str, triggers: &[(&str, &str)]) -> CompiledRule {
        CompiledRule {
            name: name.into(),
            when: triggers
                .iter()
                .map(|(s, a)| WhenPattern {
                    service: (*s).into(),
                    action: (*a).into(),
                    variant: VariantMatch::Any,
                    input: Vec::new(),
                    output: Vec::new(),
                })
                .collect(),
            condition: None,
            then: vec![ThenTemplate {
                service: "Out".into(),
                action: "emit".into(),
                fields: Vec::new(),
                write: None,
            }],
            delivery: Delivery::Immediate,
        }
    }

    #[test]
    fn candidates_in_registration_order() {
        let index = RuleIndex::new();
        index.register(rule("First", &[("A", "a")])).unwrap();
        index.register(rule("Second", &[("B", "b"), ("A", "a")])).unwrap();
        index.register(rule("Third", &[("A", "a"), ("A", "a")])).unwrap();

        let names: Vec<_> = index
            .candidates_for("A", "a")
            .iter()
            .map(|r| r.name.clone())
            .collect();
        assert_eq!(names, ["First", "Second", "Third"]);
        assert_eq!(index.candidates_for("B", "b").len(), 1);
        assert!(index.candidates_for("C", "c").is_empty());
        assert!(index.has_candidates("B", "b"));
    }

    #[test]
    fn service_wide_rules_merge_in_registration_order() {
        let index = RuleIndex::new();
        index.register(rule("AnyFirst", &[("A", "*")])).unwrap();
        index.register(rule("Exact", &[("A", "a")])).unwrap();
        index.register(rule("Both", &[("A", "a"), ("A", "*")])).unwrap();
        index.register(rule("Other", &[("B", "*")])).unwrap();

        let names: Vec<_> = index
            .candidates_for("A", "a")
            .iter()
            .map(|r| r.name.clone())
            .collect();
        assert_eq!(names, ["AnyFirst", "Exact", "Both"]);

        let names: Vec<_> = index
            .candidates_for("A", "z")
            .iter()
            .map(|r| r.name.clone())
            .collect();
        assert_eq!(names, ["AnyFirst", "Both"]);
        assert!(index.has_candidates("B", "anything"));
        assert!(!index.has_candidates("C", "a"));
    }

    #[test]
    fn duplicate_names_rejected() {
        let index = RuleIndex::new();
        index.register(rule("R", &[("A", "a")])).unwrap();
        assert_eq!(
            index.register(rule("R", &[("B", "b")])),
            Err(RuleError::DuplicateRule { name: "R".into() })
        );
        assert!(index
            .reload(vec![rule("X", &[("A", "a")]), rule("X", &[("A", "a")])])
            .is_err());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn reload_swaps_without_disturbing_readers() {
        let index = RuleIndex::new();
        index.register(rule("Old", &[("A", "a")])).unwrap();
        let before = index.snapshot();

        let generation = index.reload(vec![rule("New", &[("B", "b")])]).unwrap();
        assert_eq!(generation, before.generation() + 1);

        assert_eq!(before.candidates_for("A", "a")[0].name, "Old");
        assert!(index.candidates_for("A", "a").is_empty());
        assert!(index.rule("New").is_some());
        assert!(index.rule("Old").is_none());
    }

    #[test]
    fn invalid_rule_leaves_index_unchanged() {
        let index = RuleIndex::new();
        let mut bad = rule("Bad", &[("A", "a")]);
        bad.then.clear();
        assert!(index.register(bad.clone()).is_err());
        assert!(index.reload(vec![rule("Ok", &[("A", "a")]), bad]).is_err());
        assert!(index.is_empty());
        assert_eq!(index.generation(), 0);
    }
}
