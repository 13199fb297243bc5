//! Deferred delivery of firings blocked on unavailable services.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use syncflow_log::{FlowId, RecordId};
use tracing::{debug, info};

use crate::binding::Binding;
use crate::error::{EngineError, EngineResult};
use crate::rule::{CompiledRule, Delivery};

/// Identifier of a queued firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PendingId(pub u64);

impl fmt::Display for PendingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pending-{}", self.0)
    }
}

/// Lifecycle of a pending rule.
///
/// ```text
/// Queued -> Draining -> Delivered
///    ^         |    \-> Cancelled
///    +---------+
/// ```
/// `Queued` may also go straight to `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingState {
    /// Waiting for its target service.
    Queued,
    /// Being re-evaluated after an availability change.
    Draining,
    /// Fired (or found already fired); removed from the queue.
    Delivered,
    /// Removed without firing.
    Cancelled,
}

impl PendingState {
    /// Returns true if `next` is a legal successor.
    #[must_use]
    pub fn can_transition_to(self, next: PendingState) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Draining)
                | (Self::Queued, Self::Cancelled)
                | (Self::Draining, Self::Delivered)
                | (Self::Draining, Self::Queued)
                | (Self::Draining, Self::Cancelled)
        )
    }

    /// Returns true for `Delivered` and `Cancelled`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Cancelled)
    }
}

/// A firing waiting for a service to come back.
#[derive(Debug, Clone)]
pub struct PendingRule {
    /// Queue id.
    pub id: PendingId,
    /// The rule as it was when the firing was captured.
    pub rule: Arc<CompiledRule>,
    /// Matcher output; condition evaluation restarts from its first step.
    pub binding: Binding,
    /// Owning flow.
    pub flow: FlowId,
    /// Completion that triggered the evaluation.
    pub trigger: RecordId,
    /// Service whose availability will drain this entry.
    pub target: String,
    /// Current state.
    pub state: PendingState,
    /// Number of drain attempts so far.
    pub attempts: u32,
    /// Log timestamp when the firing was captured.
    pub captured_at: u64,
    /// Why the last attempt did not deliver.
    pub last_error: Option<String>,
}

/// Where an unavailable-service failure goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureRoute {
    /// Queue until the service is available.
    Queue,
    /// Drop the firing and mark the flow partial.
    Discard,
    /// Fail immediately; local rules never defer or forward.
    FailLocal,
}

/// Maps a rule's delivery annotation and a failure to its route.
///
/// Only unavailability is ever queued; other failures are discarded.
#[must_use]
pub fn classify(delivery: Delivery, unavailable: bool) -> FailureRoute {
    match (delivery, unavailable) {
        (Delivery::Local, true) => FailureRoute::FailLocal,
        (Delivery::Deferred, true) => FailureRoute::Queue,
        _ => FailureRoute::Discard,
    }
}

/// Queue of pending rules.
#[derive(Debug, Default)]
pub struct DeliveryQueue {
    entries: Mutex<BTreeMap<PendingId, PendingRule>>,
    next_id: AtomicU64,
}

impl DeliveryQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a firing for `target`.
    pub fn enqueue(
        &self,
        rule: Arc<CompiledRule>,
        binding: Binding,
        flow: FlowId,
        trigger: RecordId,
        target: impl Into<String>,
        captured_at: u64,
    ) -> PendingId {
        let id = PendingId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let target = target.into();
        info!(%id, rule = %rule.name, %flow, service = %target, "queued deferred firing");
        let entry = PendingRule {
            id,
            rule,
            binding,
            flow,
            trigger,
            target,
            state: PendingState::Queued,
            attempts: 0,
            captured_at,
            last_error: None,
        };
        self.entries.lock().insert(id, entry);
        id
    }

    /// Moves every queued entry targeting `service` to `Draining` and returns
    /// copies of them in queue order.
    pub fn begin_drain(&self, service: &str) -> Vec<PendingRule> {
        let mut entries = self.entries.lock();
        let drained: Vec<PendingRule> = entries
            .values_mut()
            .filter(|e| e.state == PendingState::Queued && e.target == service)
            .map(|e| {
                e.state = PendingState::Draining;
                e.attempts += 1;
                e.clone()
            })
            .collect();
        if !drained.is_empty() {
            info!(service, count = drained.len(), "draining deferred firings");
        }
        drained
    }

    fn transition(&self, id: PendingId, next: PendingState) -> EngineResult<PendingRule> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&id)
            .ok_or(EngineError::PendingNotFound(id))?;
        if !entry.state.can_transition_to(next) {
            return Err(EngineError::InvalidStateTransition {
                from: format!("{:?}", entry.state),
                to: format!("{next:?}"),
            });
        }
        entry.state = next;
        debug!(%id, state = ?next, "pending rule transition");
        if next.is_terminal() {
            entries.remove(&id).ok_or(EngineError::PendingNotFound(id))
        } else {
            Ok(entry.clone())
        }
    }

    /// Marks a draining entry delivered and removes it.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry is missing or not draining.
    pub fn mark_delivered(&self, id: PendingId) -> EngineResult<PendingRule> {
        self.transition(id, PendingState::Delivered)
    }

    /// Returns a draining entry to the queue, possibly for another service.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry is missing or not draining.
    pub fn requeue(
        &self,
        id: PendingId,
        target: impl Into<String>,
        error: Option<String>,
    ) -> EngineResult<PendingRule> {
        let target = target.into();
        self.transition(id, PendingState::Queued)?;
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(&id)
            .ok_or(EngineError::PendingNotFound(id))?;
        entry.target = target;
        entry.last_error = error;
        Ok(entry.clone())
    }

    /// Cancels an entry and removes it.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry is missing.
    pub fn cancel(&self, id: PendingId) -> EngineResult<PendingRule> {
        self.transition(id, PendingState::Cancelled)
    }

    /// Cancels every queued entry of a flow. Entries being drained are left
    /// to finish.
    pub fn cancel_flow(&self, flow: FlowId) -> Vec<PendingId> {
        let mut entries = self.entries.lock();
        let ids: Vec<PendingId> = entries
            .values()
            .filter(|e| e.flow == flow && e.state == PendingState::Queued)
            .map(|e| e.id)
            .collect();
        for id in &ids {
            entries.remove(id);
        }
        if !ids.is_empty() {
            info!(%flow, count = ids.len(), "cancelled deferred firings");
        }
        ids
    }

    /// Returns copies of a flow's entries in queue order.
    #[must_use]
    pub fn pending_for_flow(&self, flow: FlowId) -> Vec<PendingRule> {
        self.entries
            .lock()
            .values()
            .filter(|e| e.flow == flow)
            .cloned()
            .collect()
    }

    /// Returns a copy of one entry.
    #[must_use]
    pub fn get(&self, id: PendingId) -> Option<PendingRule> {
        self.entries.lock().get(&id).cloned()
    }

    /// Returns the number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::Values;
    use crate::rule::ThenTemplate;

    fn rule() -> Arc<CompiledRule> {
        Arc::new(CompiledRule {
            name: "Notify".into(),
            when: Vec::new(),
            condition: None,
            then: vec![ThenTemplate {
                service: "Mail".into(),
                action: "send".into(),
                fields: Vec::new(),
                write: None,
            }],
            delivery: Delivery::Deferred,
        })
    }

    fn enqueue(queue: &DeliveryQueue, flow: FlowId, target: &str) -> PendingId {
        let binding = Binding::new(Values::new(), vec![RecordId::new()]);
        queue.enqueue(rule(), binding, flow, RecordId::new(), target, 10)
    }

    #[test]
    fn classify_routes() {
        assert_eq!(classify(Delivery::Deferred, true), FailureRoute::Queue);
        assert_eq!(classify(Delivery::Immediate, true), FailureRoute::Discard);
        assert_eq!(classify(Delivery::Local, true), FailureRoute::FailLocal);
        assert_eq!(classify(Delivery::Deferred, false), FailureRoute::Discard);
    }

    #[test]
    fn drain_then_deliver() {
        let queue = DeliveryQueue::new();
        let flow = FlowId::new();
        let id = enqueue(&queue, flow, "Mail");
        enqueue(&queue, flow, "Sms");

        assert!(queue.begin_drain("Other").is_empty());
        let drained = queue.begin_drain("Mail");
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].state, PendingState::Draining);
        assert_eq!(drained[0].attempts, 1);
        assert!(queue.begin_drain("Mail").is_empty());

        let delivered = queue.mark_delivered(id).unwrap();
        assert_eq!(delivered.state, PendingState::Delivered);
        assert!(queue.get(id).is_none());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn failed_drain_requeues() {
        let queue = DeliveryQueue::new();
        let id = enqueue(&queue, FlowId::new(), "Mail");
        queue.begin_drain("Mail");
        let entry = queue.requeue(id, "Directory", Some("still down".into())).unwrap();
        assert_eq!(entry.state, PendingState::Queued);
        assert_eq!(entry.target, "Directory");
        assert!(queue.begin_drain("Mail").is_empty());
        assert_eq!(queue.begin_drain("Directory")[0].attempts, 2);
    }

    #[test]
    fn invalid_transitions_rejected() {
        let queue = DeliveryQueue::new();
        let id = enqueue(&queue, FlowId::new(), "Mail");
        assert!(matches!(
            queue.mark_delivered(id),
            Err(EngineError::InvalidStateTransition { .. })
        ));
        assert!(matches!(
            queue.requeue(id, "Mail", None),
            Err(EngineError::InvalidStateTransition { .. })
        ));
        queue.cancel(id).unwrap();
        assert!(matches!(queue.cancel(id), Err(EngineError::PendingNotFound(_))));
    }

    #[test]
    fn cancel_flow_leaves_other_flows() {
        let queue = DeliveryQueue::new();
        let flow = FlowId::new();
        let other = FlowId::new();
        enqueue(&queue, flow, "Mail");
        enqueue(&queue, flow, "Mail");
        enqueue(&queue, other, "Mail");

        assert_eq!(queue.cancel_flow(flow).len(), 2);
        assert!(queue.pending_for_flow(flow).is_empty());
        assert_eq!(queue.pending_for_flow(other).len(), 1);
    }
}
