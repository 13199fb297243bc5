//! Turning resolved bindings into invocations.

use syncflow_log::{ActionRecord, Fields, RecordId, RecordKind};

use crate::binding::Values;
use crate::error::{RuleError, RuleResult};
use crate::rule::{CompiledRule, Term, ThenTemplate};

/// Builds invocations from then-templates.
#[derive(Debug, Clone, Copy, Default)]
pub struct InvocationBuilder;

impl InvocationBuilder {
    /// Builds the invocation for one template.
    ///
    /// The invocation gets a fresh id, the trigger's flow, the trigger as
    /// parent, and the rule name.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::UnboundVariable`] or
    /// [`RuleError::WildcardInTemplate`] if a field cannot be filled.
    pub fn instantiate(
        rule: &CompiledRule,
        template: &ThenTemplate,
        values: &Values,
        trigger: &ActionRecord,
        timestamp: u64,
    ) -> RuleResult<ActionRecord> {
        let mut input = Fields::new();
        for field in &template.fields {
            let value = match &field.term {
                Term::Wildcard => {
                    return Err(RuleError::WildcardInTemplate {
                        rule: rule.name.clone(),
                        field: field.field.clone(),
                    })
                }
                term => term.resolve(values).ok_or_else(|| RuleError::UnboundVariable {
                    rule: rule.name.clone(),
                    variable: term.as_variable().unwrap_or_default().to_string(),
                })?,
            };
            input.insert(field.field.clone(), value);
        }

        Ok(ActionRecord {
            id: RecordId::new(),
            kind: RecordKind::Invocation,
            service: template.service.clone(),
            action: template.action.clone(),
            input,
            flow: trigger.flow,
            rule: Some(rule.name.clone()),
            parent: Some(trigger.id),
            timestamp,
        })
    }

    /// Builds one invocation per template, in template order.
    ///
    /// # Errors
    ///
    /// As for [`Self::instantiate`].
    pub fn build(
        rule: &CompiledRule,
        values: &Values,
        trigger: &ActionRecord,
        timestamp: u64,
    ) -> RuleResult<Vec<ActionRecord>> {
        rule.then
            .iter()
            .map(|template| Self::instantiate(rule, template, values, trigger, timestamp))
            .collect()
    }
}
