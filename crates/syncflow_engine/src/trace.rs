//! Evaluation journal and flow traces.
//!
//! The engine records, for every completion it processes, what happened to
//! each candidate rule. [`FlowTrace`] joins that journal with the action log
//! and the delivery queue so an operator can see why a flow is where it is.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::{self, Write as _};
use std::sync::Arc;
use syncflow_log::{ActionRecord, FlowId, RecordId};

use crate::conflict::ConflictRecord;
use crate::delivery::{PendingId, PendingRule};

/// Why a candidate rule did not fire for a completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Skip {
    /// No combination of the flow's completions satisfies the when clause.
    NoSatisfyingBinding {
        /// Patterns nothing in the flow can fill yet.
        missing: Vec<String>,
    },
    /// The matched set already has a firing.
    AlreadyFired,
    /// The condition resolved to no bindings.
    ConditionEmpty,
    /// Every branch of the condition failed.
    ConditionUnresolved {
        /// First failure.
        reason: String,
    },
    /// Queued until a service comes back.
    Deferred {
        /// Service waited on.
        service: String,
        /// Queue entry.
        pending: PendingId,
    },
    /// A needed service was unavailable and the rule does not defer.
    TargetUnavailable {
        /// Unavailable service.
        service: String,
    },
    /// A locally scoped rule needs a service this engine cannot reach.
    Unreachable {
        /// Unreachable service.
        service: String,
    },
    /// Left to the upstream engine.
    Forwarded {
        /// Upstream engine name.
        upstream: String,
    },
    /// A drained write conflicted and was escalated.
    ConflictEscalated,
}

impl fmt::Display for Skip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSatisfyingBinding { missing } if missing.is_empty() => {
                write!(f, "no satisfying binding")
            }
            Self::NoSatisfyingBinding { missing } => {
                write!(f, "no satisfying binding (missing {})", missing.join(", "))
            }
            Self::AlreadyFired => write!(f, "already fired"),
            Self::ConditionEmpty => write!(f, "condition returned no rows"),
            Self::ConditionUnresolved { reason } => write!(f, "condition unresolved: {reason}"),
            Self::Deferred { service, pending } => {
                write!(f, "deferred on {service} ({pending})")
            }
            Self::TargetUnavailable { service } => write!(f, "{service} unavailable"),
            Self::Unreachable { service } => write!(f, "{service} not reachable locally"),
            Self::Forwarded { upstream } => write!(f, "forwarded to {upstream}"),
            Self::ConflictEscalated => write!(f, "write conflict escalated"),
        }
    }
}

/// What happened to one candidate rule for one completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOutcome {
    /// The rule fired.
    Fired {
        /// Rule name.
        rule: String,
        /// Invocations it produced.
        produced: Vec<RecordId>,
    },
    /// The rule did not fire.
    NotFired {
        /// Rule name.
        rule: String,
        /// Why.
        reason: Skip,
    },
}

impl RuleOutcome {
    /// Returns the rule name.
    #[must_use]
    pub fn rule(&self) -> &str {
        match self {
            Self::Fired { rule, .. } | Self::NotFired { rule, .. } => rule,
        }
    }

    /// Returns true for [`RuleOutcome::Fired`].
    #[must_use]
    pub fn is_fired(&self) -> bool {
        matches!(self, Self::Fired { .. })
    }

    /// Returns the skip reason, if the rule did not fire.
    #[must_use]
    pub fn skip(&self) -> Option<&Skip> {
        match self {
            Self::NotFired { reason, .. } => Some(reason),
            Self::Fired { .. } => None,
        }
    }
}

/// Coarse state of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    /// Nothing outstanding and nothing lost.
    Quiescent,
    /// Waiting on deferred firings or undelivered invocations.
    Pending,
    /// Some firing was discarded or some invocation failed.
    Partial,
    /// Invocations are in flight.
    Running,
}

impl fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Quiescent => "quiescent",
            Self::Pending => "pending",
            Self::Partial => "partial",
            Self::Running => "running",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Default)]
struct FlowJournal {
    outcomes: HashMap<RecordId, Vec<RuleOutcome>>,
    partial: bool,
    failed: HashSet<RecordId>,
    conflicts: Vec<ConflictRecord>,
    retired: bool,
}

#[derive(Debug, Default)]
struct Flows {
    map: HashMap<FlowId, FlowJournal>,
    retired: VecDeque<FlowId>,
}

impl Flows {
    /// Returns the flow's journal, bringing a retired flow back to life.
    fn touch(&mut self, flow: FlowId) -> &mut FlowJournal {
        let journal = self.map.entry(flow).or_default();
        journal.retired = false;
        journal
    }
}

/// Per-flow record of rule outcomes, partial marks and conflicts.
///
/// Quiescent flows are retired; once more than `retain` are retired the
/// oldest are evicted. A flow that becomes active again leaves the
/// retired set until it next settles.
#[derive(Debug)]
pub struct EvaluationJournal {
    enabled: bool,
    retain: usize,
    flows: RwLock<Flows>,
    undrained: Mutex<Vec<ConflictRecord>>,
}

impl EvaluationJournal {
    /// Creates a journal keeping at most `retain` quiescent flows. When
    /// disabled, rule outcomes are dropped but partial marks and conflicts
    /// are still kept.
    #[must_use]
    pub fn new(enabled: bool, retain: usize) -> Self {
        Self {
            enabled,
            retain,
            flows: RwLock::new(Flows::default()),
            undrained: Mutex::new(Vec::new()),
        }
    }

    /// Records an outcome against the completion that triggered it.
    pub fn record(&self, flow: FlowId, record: RecordId, outcome: RuleOutcome) {
        if !self.enabled {
            return;
        }
        self.flows
            .write()
            .touch(flow)
            .outcomes
            .entry(record)
            .or_default()
            .push(outcome);
    }

    /// Marks a flow partial.
    pub fn mark_partial(&self, flow: FlowId) {
        self.flows.write().touch(flow).partial = true;
    }

    /// Marks an invocation as failed for good, which also makes its flow
    /// partial.
    pub fn mark_failed(&self, flow: FlowId, invocation: RecordId) {
        let mut flows = self.flows.write();
        let journal = flows.touch(flow);
        journal.partial = true;
        journal.failed.insert(invocation);
    }

    /// Returns true if the flow was marked partial.
    #[must_use]
    pub fn is_partial(&self, flow: FlowId) -> bool {
        self.flows.read().map.get(&flow).is_some_and(|j| j.partial)
    }

    /// Returns the flow's failed invocations.
    #[must_use]
    pub fn failed(&self, flow: FlowId) -> HashSet<RecordId> {
        self.flows
            .read()
            .map
            .get(&flow)
            .map(|j| j.failed.clone())
            .unwrap_or_default()
    }

    /// Appends to the conflict journal.
    pub fn record_conflict(&self, record: ConflictRecord) {
        self.undrained.lock().push(record.clone());
        self.flows.write().touch(record.flow).conflicts.push(record);
    }

    /// Marks a quiescent flow as evictable and evicts the oldest retired
    /// flows beyond the retention limit.
    pub fn retire(&self, flow: FlowId) {
        let mut flows = self.flows.write();
        match flows.map.get_mut(&flow) {
            Some(journal) if !journal.retired => journal.retired = true,
            _ => return,
        }
        flows.retired.push_back(flow);
        while flows.retired.len() > self.retain {
            let Some(oldest) = flows.retired.pop_front() else {
                break;
            };
            if flows.map.get(&oldest).is_some_and(|j| j.retired) {
                flows.map.remove(&oldest);
            }
        }
    }

    /// Returns the number of flows with journal state.
    #[must_use]
    pub fn len(&self) -> usize {
        self.flows.read().map.len()
    }

    /// Returns true if no flow has journal state.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the outcomes recorded for one completion.
    #[must_use]
    pub fn outcomes(&self, flow: FlowId, record: RecordId) -> Vec<RuleOutcome> {
        self.flows
            .read()
            .map
            .get(&flow)
            .and_then(|j| j.outcomes.get(&record))
            .cloned()
            .unwrap_or_default()
    }

    /// Returns a flow's conflicts in the order they were decided.
    #[must_use]
    pub fn conflicts(&self, flow: FlowId) -> Vec<ConflictRecord> {
        self.flows
            .read()
            .map
            .get(&flow)
            .map(|j| j.conflicts.clone())
            .unwrap_or_default()
    }

    /// Returns every conflict across flows.
    #[must_use]
    pub fn all_conflicts(&self) -> Vec<ConflictRecord> {
        self.flows
            .read()
            .map
            .values()
            .flat_map(|j| j.conflicts.iter().cloned())
            .collect()
    }

    /// Hands out the conflicts recorded since the last call, oldest first.
    /// Flow traces keep them.
    pub fn drain_conflicts(&self) -> Vec<ConflictRecord> {
        std::mem::take(&mut *self.undrained.lock())
    }
}

/// One record of a flow with the outcomes it triggered.
#[derive(Debug, Clone)]
pub struct TraceEntry {
    /// The record.
    pub record: Arc<ActionRecord>,
    /// Rule outcomes, empty for invocations.
    pub outcomes: Vec<RuleOutcome>,
}

/// Operator view of one flow.
#[derive(Debug, Clone)]
pub struct FlowTrace {
    /// Flow id.
    pub flow: FlowId,
    /// Current status.
    pub status: FlowStatus,
    /// Records in arrival order.
    pub entries: Vec<TraceEntry>,
    /// Queue entries of the flow.
    pub pending: Vec<PendingRule>,
    /// Conflicts decided for the flow.
    pub conflicts: Vec<ConflictRecord>,
}

impl FlowTrace {
    /// Returns true if the flow is quiescent.
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        self.status == FlowStatus::Quiescent
    }

    /// Returns every outcome recorded for `rule`, in arrival order of the
    /// triggering completions.
    #[must_use]
    pub fn outcomes_for(&self, rule: &str) -> Vec<&RuleOutcome> {
        self.entries
            .iter()
            .flat_map(|e| e.outcomes.iter())
            .filter(|o| o.rule() == rule)
            .collect()
    }

    /// Returns rule names in the order they fired.
    #[must_use]
    pub fn fired_rules(&self) -> Vec<&str> {
        self.entries
            .iter()
            .flat_map(|e| e.outcomes.iter())
            .filter(|o| o.is_fired())
            .map(RuleOutcome::rule)
            .collect()
    }

    /// Returns the flow's invocations produced by `rule`.
    #[must_use]
    pub fn invocations_of(&self, rule: &str) -> Vec<&Arc<ActionRecord>> {
        self.entries
            .iter()
            .map(|e| &e.record)
            .filter(|r| r.is_invocation() && r.rule.as_deref() == Some(rule))
            .collect()
    }

    /// Draws the flow as a tree following parent links.
    #[must_use]
    pub fn render(&self) -> String {
        let ids: HashSet<RecordId> = self.entries.iter().map(|e| e.record.id).collect();
        let mut children: HashMap<RecordId, Vec<usize>> = HashMap::new();
        let mut roots = Vec::new();
        for (idx, entry) in self.entries.iter().enumerate() {
            match entry.record.parent {
                Some(parent) if ids.contains(&parent) => children.entry(parent).or_default().push(idx),
                _ => roots.push(idx),
            }
        }

        let mut out = String::new();
        let _ = writeln!(out, "flow {} [{}]", self.flow, self.status);
        for idx in roots {
            self.render_entry(idx, 1, &children, &mut out);
        }
        for pending in &self.pending {
            let _ = writeln!(
                out,
                "  pending {} {} on {} ({:?}, {} attempts)",
                pending.id, pending.rule.name, pending.target, pending.state, pending.attempts
            );
        }
        for conflict in &self.conflicts {
            let _ = writeln!(
                out,
                "  conflict {} key {} -> {:?}",
                conflict.rule, conflict.conflict.key, conflict.resolution
            );
        }
        out
    }

    fn render_entry(
        &self,
        idx: usize,
        depth: usize,
        children: &HashMap<RecordId, Vec<usize>>,
        out: &mut String,
    ) {
        let entry = &self.entries[idx];
        let indent = "  ".repeat(depth);
        let record = &entry.record;
        match (&record.rule, record.is_invocation()) {
            (Some(rule), true) => {
                let _ = writeln!(out, "{indent}{} [{}] <- {rule}", record.label(), record.id);
            }
            _ => {
                let _ = writeln!(out, "{indent}{} [{}]", record.label(), record.id);
            }
        }
        for outcome in &entry.outcomes {
            match outcome {
                RuleOutcome::Fired { rule, produced } => {
                    let _ = writeln!(out, "{indent}  + {rule} fired ({} invocations)", produced.len());
                }
                RuleOutcome::NotFired { rule, reason } => {
                    let _ = writeln!(out, "{indent}  - {rule}: {reason}");
                }
            }
        }
        if let Some(kids) = children.get(&record.id) {
            for &child in kids {
                self.render_entry(child, depth + 1, children, out);
            }
        }
    }
}
