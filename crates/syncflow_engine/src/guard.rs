//! Exactly-once firing.

use syncflow_log::{ActionLog, ActionRecord, FiringCommit, LogResult};

use crate::binding::Binding;
use crate::rule::CompiledRule;

/// Consults and records provenance edges so a rule fires at most once per
/// matched set.
///
/// The check before condition evaluation is an optimisation; the commit is
/// the authority, since it re-checks under the log's write lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct FiringGuard;

impl FiringGuard {
    /// Returns true if `rule` already fired for the binding's matched set.
    #[must_use]
    pub fn already_fired(log: &ActionLog, rule: &CompiledRule, binding: &Binding) -> bool {
        log.has_edge(binding.matched(), &rule.name)
    }

    /// Splits bindings into those still to fire and the number filtered out.
    #[must_use]
    pub fn retain_unfired(
        log: &ActionLog,
        rule: &CompiledRule,
        bindings: Vec<Binding>,
    ) -> (Vec<Binding>, usize) {
        let total = bindings.len();
        let fresh: Vec<Binding> = bindings
            .into_iter()
            .filter(|b| !Self::already_fired(log, rule, b))
            .collect();
        let filtered = total - fresh.len();
        (fresh, filtered)
    }

    /// Records the invocations of one firing together with their edges.
    ///
    /// # Errors
    ///
    /// Propagates log failures; nothing is recorded in that case.
    pub fn commit(
        log: &ActionLog,
        rule: &CompiledRule,
        binding: &Binding,
        invocations: Vec<ActionRecord>,
    ) -> LogResult<FiringCommit> {
        log.commit_firing(&rule.name, binding.matched(), invocations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::Values;
    use crate::rule::{Delivery, ThenTemplate};
    use syncflow_log::{Fields, FlowId};

    fn rule(name: &str) -> CompiledRule {
        CompiledRule {
            name: name.into(),
            when: Vec::new(),
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

    #[test]
    fn replay_is_filtered() {
        let log = ActionLog::new();
        let flow = FlowId::new();
        let done = ActionRecord::completion("A", "a", Fields::new(), "ok", Fields::new(), flow);
        log.append(done.clone()).unwrap();
        let binding = Binding::new(Values::new(), vec![done.id]);
        let r = rule("R");

        assert!(!FiringGuard::already_fired(&log, &r, &binding));
        let inv = ActionRecord::invocation("C", "go", Fields::new(), flow);
        assert!(FiringGuard::commit(&log, &r, &binding, vec![inv]).unwrap().is_committed());
        assert!(FiringGuard::already_fired(&log, &r, &binding));
        assert!(!FiringGuard::already_fired(&log, &rule("Other"), &binding));

        let (fresh, filtered) = FiringGuard::retain_unfired(&log, &r, vec![binding.clone()]);
        assert!(fresh.is_empty());
        assert_eq!(filtered, 1);

        let inv = ActionRecord::invocation("C", "go", Fields::new(), flow);
        assert_eq!(
            FiringGuard::commit(&log, &r, &binding, vec![inv]).unwrap(),
            FiringCommit::AlreadyFired
        );
    }
}
