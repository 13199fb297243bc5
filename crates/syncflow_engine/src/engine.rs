//! The engine context.
//!
//! An [`Engine`] owns one shard: an action log, a rule index, a service
//! registry, a delivery queue and the evaluation journal. Several engines are
//! simply several values; [`crate::EngineHierarchy`] wires them together.
//!
//! Processing of one flow is serialized by a per-flow async mutex and runs
//! breadth-first in waves: every invocation of a wave is dispatched, then
//! every completion that came back is admitted and evaluated, and the
//! invocations those evaluations produce form the next wave.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use syncflow_log::{
    ActionLog, ActionRecord, Fields, FiringCommit, FlowId, InvocationEnvelope, ProvenanceGraph,
    RecordId,
};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::binding::{Binding, Values};
use crate::builder::InvocationBuilder;
use crate::condition::ConditionEvaluator;
use crate::config::EngineConfig;
use crate::conflict::{
    Conflict, ConflictHook, ConflictRecord, ConflictResolver, Resolution, Write,
    CONFLICT_VARIANT, SUPERSEDED_VARIANT,
};
use crate::delivery::{classify, DeliveryQueue, FailureRoute, PendingId, PendingRule};
use crate::error::{EngineError, EngineResult, TransportError, TransportResult};
use crate::guard::FiringGuard;
use crate::index::RuleIndex;
use crate::matcher::Matcher;
use crate::registry::{Dispatched, ServiceRegistry};
use crate::rule::{CompiledRule, ConditionStep, Delivery, ThenTemplate, WriteTarget};
use crate::trace::{EvaluationJournal, FlowStatus, FlowTrace, RuleOutcome, Skip, TraceEntry};
use crate::transport::{CompletionStream, QueryRequest, Transport};

/// Counters kept by an engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Completions admitted.
    pub completions: u64,
    /// Firings committed.
    pub firings: u64,
    /// Invocations answered by a service.
    pub dispatched: u64,
    /// Dispatch attempts that gave up.
    pub dispatch_failures: u64,
    /// Dispatch retries.
    pub retries: u64,
    /// Firings queued for later delivery.
    pub deferred: u64,
    /// Completions forwarded upstream.
    pub forwarded: u64,
    /// Write conflicts decided.
    pub conflicts: u64,
}

/// Summary of one processing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowReport {
    /// Flow processed.
    pub flow: FlowId,
    /// Completions admitted by this call.
    pub completions: usize,
    /// Firings committed by this call.
    pub fired: usize,
    /// Invocations dispatched by this call.
    pub dispatched: usize,
    /// Firings queued by this call.
    pub deferred: usize,
    /// Completions forwarded upstream by this call.
    pub forwarded: usize,
    /// Flow status once the call returned.
    pub status: FlowStatus,
}

/// Summary of one availability change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Service whose availability changed.
    pub service: String,
    /// Queue entries taken for draining.
    pub drained: usize,
    /// Entries that fired or were found already fired.
    pub delivered: usize,
    /// Entries returned to the queue.
    pub requeued: usize,
    /// Entries dropped because their condition no longer resolves.
    pub cancelled: usize,
    /// Held invocations sent again.
    pub redispatched: usize,
}

impl DrainReport {
    fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Clone)]
struct FlowHandle {
    lock: Arc<AsyncMutex<()>>,
    token: CancellationToken,
}

/// State of one processing call.
struct Pass {
    flow: FlowId,
    steps: usize,
    completions: usize,
    fired: usize,
    dispatched: usize,
    deferred: usize,
    forwards: Vec<Arc<ActionRecord>>,
}

impl Pass {
    fn new(flow: FlowId) -> Self {
        Self {
            flow,
            steps: 0,
            completions: 0,
            fired: 0,
            dispatched: 0,
            deferred: 0,
            forwards: Vec::new(),
        }
    }
}

#[derive(Default)]
struct Wave {
    dispatch: Vec<Arc<ActionRecord>>,
    arrivals: Vec<ActionRecord>,
}

struct Fired {
    produced: Vec<RecordId>,
    dispatch: Vec<Arc<ActionRecord>>,
    settled: Vec<ActionRecord>,
    escalated: bool,
}

enum Fire {
    Fired(Fired),
    Skipped(Skip),
    Blocked(String),
}

/// One engine instance.
pub struct Engine {
    config: EngineConfig,
    log: Arc<ActionLog>,
    index: RuleIndex,
    registry: ServiceRegistry,
    queue: DeliveryQueue,
    resolver: RwLock<ConflictResolver>,
    journal: EvaluationJournal,
    flows: Mutex<HashMap<FlowId, FlowHandle>>,
    token: CancellationToken,
    upstream: RwLock<Option<Arc<Engine>>>,
    stats: Mutex<EngineStats>,
    undelivered: Mutex<HashMap<String, Vec<(FlowId, RecordId)>>>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.config.name)
            .field("rules", &self.index.len())
            .field("services", &self.registry)
            .field("records", &self.log.len())
            .field("pending", &self.queue.len())
            .finish()
    }
}

impl Engine {
    /// Creates an engine with an in-memory log.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self::with_log(config, Arc::new(ActionLog::new()))
    }

    /// Creates an engine over an existing log, e.g. one recovered from a
    /// journal.
    #[must_use]
    pub fn with_log(config: EngineConfig, log: Arc<ActionLog>) -> Self {
        let journal =
            EvaluationJournal::new(config.journal_evaluations, config.max_retained_flows);
        Self {
            config,
            log,
            index: RuleIndex::new(),
            registry: ServiceRegistry::new(),
            queue: DeliveryQueue::new(),
            resolver: RwLock::new(ConflictResolver::last_writer_wins()),
            journal,
            flows: Mutex::new(HashMap::new()),
            token: CancellationToken::new(),
            upstream: RwLock::new(None),
            stats: Mutex::new(EngineStats::default()),
            undelivered: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the engine name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the action log.
    #[must_use]
    pub fn log(&self) -> &Arc<ActionLog> {
        &self.log
    }

    /// Returns the rule index.
    #[must_use]
    pub fn rules(&self) -> &RuleIndex {
        &self.index
    }

    /// Returns the service registry.
    #[must_use]
    pub fn services(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Returns the delivery queue.
    #[must_use]
    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    /// Returns a lineage view over the log.
    #[must_use]
    pub fn provenance(&self) -> ProvenanceGraph {
        ProvenanceGraph::new(Arc::clone(&self.log))
    }

    /// Streams records appended to this engine's log from now on, buffered
    /// by [`EngineConfig::subscription_buffer`].
    #[must_use]
    pub fn watch(&self) -> mpsc::Receiver<Arc<ActionRecord>> {
        self.log.subscribe(self.config.subscription_buffer)
    }

    /// Returns the number of flows holding a processing lock entry.
    #[must_use]
    pub fn active_flows(&self) -> usize {
        self.flows.lock().len()
    }

    /// Returns a copy of the counters.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        *self.stats.lock()
    }

    /// Returns the upstream engine, if linked.
    #[must_use]
    pub fn upstream(&self) -> Option<Arc<Engine>> {
        self.upstream.read().clone()
    }

    pub(crate) fn set_upstream(&self, upstream: Option<Arc<Engine>>) {
        *self.upstream.write() = upstream;
    }

    /// Validates and registers a rule.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rule`] if the rule is invalid or its name is taken.
    pub fn register_rule(&self, rule: CompiledRule) -> EngineResult<u64> {
        Ok(self.index.register(rule)?)
    }

    /// Replaces the rule set atomically.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Rule`] if any rule is invalid; the current rules
    /// stay in place then.
    pub fn reload_rules(&self, rules: Vec<CompiledRule>) -> EngineResult<u64> {
        Ok(self.index.reload(rules)?)
    }

    /// Registers a service reached through a local transport.
    pub fn register_service(&self, name: impl Into<String>, transport: Arc<dyn Transport>) {
        self.registry.register(name, transport);
    }

    /// Installs a conflict hook consulted before last-writer-wins.
    pub fn set_conflict_hook(&self, hook: impl ConflictHook + 'static) {
        *self.resolver.write() = ConflictResolver::with_hook(hook);
    }

    /// Returns every conflict decided by this engine.
    #[must_use]
    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.journal.all_conflicts()
    }

    /// Returns the conflicts decided since the last drain, for an operator
    /// to review. Traces still report them afterwards.
    pub fn drain_conflicts(&self) -> Vec<ConflictRecord> {
        self.journal.drain_conflicts()
    }

    /// Cancels in-flight queries and dispatches of every flow.
    pub fn shutdown(&self) {
        info!(engine = %self.name(), "shutting down");
        self.token.cancel();
    }

    /// Removes one deferred firing.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry does not exist or is being drained.
    pub fn cancel_pending(&self, id: PendingId) -> EngineResult<PendingRule> {
        self.queue.cancel(id)
    }

    /// Removes every queued firing of a flow.
    pub fn cancel_deferred(&self, flow: FlowId) -> Vec<PendingId> {
        self.queue.cancel_flow(flow)
    }

    /// Returns the current status of a flow.
    #[must_use]
    pub fn flow_status(&self, flow: FlowId) -> FlowStatus {
        if !self.queue.pending_for_flow(flow).is_empty() {
            return FlowStatus::Pending;
        }
        let outstanding = self.log.outstanding_invocations(&flow);
        let held: HashSet<RecordId> = self
            .undelivered
            .lock()
            .values()
            .flatten()
            .filter(|(f, _)| *f == flow)
            .map(|(_, id)| *id)
            .collect();
        if outstanding.iter().any(|inv| held.contains(&inv.id)) {
            return FlowStatus::Pending;
        }
        let in_flight = {
            let failed = self.journal.failed(flow);
            outstanding.iter().any(|inv| !failed.contains(&inv.id))
        };
        if in_flight {
            FlowStatus::Running
        } else if self.journal.is_partial(flow) || !outstanding.is_empty() {
            FlowStatus::Partial
        } else {
            FlowStatus::Quiescent
        }
    }

    /// Returns the operator view of a flow.
    #[must_use]
    pub fn trace(&self, flow: FlowId) -> FlowTrace {
        let entries = self
            .log
            .records_for_flow(&flow)
            .into_iter()
            .map(|record| TraceEntry {
                outcomes: self.journal.outcomes(flow, record.id),
                record,
            })
            .collect();
        FlowTrace {
            flow,
            status: self.flow_status(flow),
            entries,
            pending: self.queue.pending_for_flow(flow),
            conflicts: self.journal.conflicts(flow),
        }
    }

    /// Starts a flow with an external stimulus and processes it until no
    /// more work can be done.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Log`] on storage faults and
    /// [`EngineError::StepBudgetExceeded`] if rules keep firing.
    pub async fn start_flow(
        &self,
        service: &str,
        action: &str,
        input: Fields,
    ) -> EngineResult<FlowReport> {
        let flow = FlowId::new();
        let stimulus =
            ActionRecord::invocation(service, action, input, flow).with_timestamp(self.log.now());
        let handle = self.flow_handle(flow);
        let guard = handle.lock.lock().await;
        self.log.append(stimulus.clone())?;
        info!(engine = %self.name(), %flow, service, action, "started flow");

        let mut pass = Pass::new(flow);
        let result = self
            .drive(&mut pass, &handle.token, vec![Arc::new(stimulus)], Vec::new())
            .await;
        drop(guard);
        drop(handle);
        self.finish(pass, result).await
    }

    /// Processes a completion that arrived from outside, e.g. pushed by a
    /// service or forwarded by a downstream engine.
    ///
    /// Redelivering a completion is harmless: the log ignores the duplicate
    /// and every firing it could cause is already recorded.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidRecord`] for invocations, plus the
    /// errors of [`Self::start_flow`].
    pub async fn on_completion(
        &self,
        completion: impl Into<ActionRecord>,
    ) -> EngineResult<FlowReport> {
        let record: ActionRecord = completion.into();
        if !record.is_completion() {
            return Err(EngineError::InvalidRecord(format!(
                "{} is not a completion",
                record.id
            )));
        }
        let flow = record.flow;
        let handle = self.flow_handle(flow);
        let guard = handle.lock.lock().await;
        debug!(engine = %self.name(), %flow, record = %record.id, "completion arrived");

        let mut pass = Pass::new(flow);
        let result = self
            .drive(&mut pass, &handle.token, Vec::new(), vec![record])
            .await;
        drop(guard);
        drop(handle);
        self.finish(pass, result).await
    }

    /// Records a service's availability. When it becomes available, drains
    /// the firings queued for it and redispatches invocations it never
    /// answered, then tells the upstream engine.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownService`] if the service is not
    /// registered, or the first error raised while draining. Entries that hit
    /// an error go back to the queue.
    pub async fn on_availability_change(
        &self,
        service: &str,
        available: bool,
    ) -> EngineResult<DrainReport> {
        let previous = self
            .registry
            .set_available(service, available)
            .ok_or_else(|| EngineError::UnknownService(service.to_string()))?;
        info!(engine = %self.name(), service, available, previous, "service availability changed");

        let mut report = DrainReport::new(service);
        let mut first_error = None;
        if available {
            for entry in self.queue.begin_drain(service) {
                report.drained += 1;
                if let Err(err) = self.drain_entry(entry, &mut report).await {
                    first_error.get_or_insert(err);
                }
            }
            if let Err(err) = self.redispatch(service, &mut report).await {
                first_error.get_or_insert(err);
            }
        }

        if let Some(upstream) = self.upstream() {
            if upstream.services().contains(service) {
                if let Err(err) = propagate_availability(upstream, service.to_string(), available).await {
                    warn!(engine = %self.name(), service, error = %err, "upstream drain failed");
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Probes every local service and handles the ones whose availability
    /// changed.
    ///
    /// # Errors
    ///
    /// As for [`Self::on_availability_change`].
    pub async fn probe_services(&self) -> EngineResult<Vec<DrainReport>> {
        let mut reports = Vec::new();
        for name in self.registry.local_names() {
            let was_available = self.registry.is_available(&name);
            let health = self.registry.probe(&name).await?;
            if health.available != was_available {
                reports.push(self.on_availability_change(&name, health.available).await?);
            }
        }
        Ok(reports)
    }

    /// Feeds a completion stream into the engine until it closes or either
    /// `token` or the engine is cancelled. Returns the number of completions
    /// processed.
    pub async fn pump(&self, mut stream: CompletionStream, token: CancellationToken) -> usize {
        let mut processed = 0;
        loop {
            let next = tokio::select! {
                biased;
                () = token.cancelled() => None,
                () = self.token.cancelled() => None,
                next = stream.recv() => next,
            };
            let Some(envelope) = next else {
                break;
            };
            let id = envelope.id;
            match self.on_completion(envelope).await {
                Ok(report) => {
                    processed += 1;
                    debug!(engine = %self.name(), record = %id, fired = report.fired, "streamed completion processed");
                }
                Err(err) => {
                    warn!(engine = %self.name(), record = %id, error = %err, "streamed completion dropped");
                }
            }
        }
        info!(engine = %self.name(), processed, "completion stream ended");
        processed
    }

    /// Subscribes to a local service's completion stream and pumps it on a
    /// background task.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownService`] for services without a local
    /// transport, or the transport's subscribe error.
    pub async fn attach(
        self: &Arc<Self>,
        service: &str,
        channel: &str,
        token: CancellationToken,
    ) -> EngineResult<JoinHandle<usize>> {
        let transport = self
            .registry
            .local_transport(service)
            .ok_or_else(|| EngineError::UnknownService(service.to_string()))?;
        let stream = transport
            .subscribe(channel, self.config.subscription_buffer)
            .await?;
        info!(engine = %self.name(), service, channel, "attached completion stream");
        let engine = Arc::clone(self);
        Ok(tokio::spawn(async move { engine.pump(stream, token).await }))
    }

    /// Runs an invocation routed down from the upstream engine.
    ///
    /// The invocation is logged here, sent to the local transport, and its
    /// completion is processed by this engine's rules. Completions the
    /// upstream cares about are returned instead of forwarded, since the
    /// upstream is waiting on this call.
    pub(crate) async fn execute_routed(
        &self,
        envelope: InvocationEnvelope,
    ) -> TransportResult<Dispatched> {
        let service = envelope.service.clone();
        let transport = self
            .registry
            .local_transport(&service)
            .ok_or_else(|| TransportError::unavailable(&service))?;
        if !self.registry.is_available(&service) {
            return Err(TransportError::unavailable(&service));
        }

        let flow = envelope.flow;
        let handle = self.flow_handle(flow);
        let guard = handle.lock.lock().await;
        let result = self.run_routed(envelope, transport, &handle).await;
        drop(guard);
        drop(handle);
        self.settle(flow);
        result
    }

    async fn run_routed(
        &self,
        envelope: InvocationEnvelope,
        transport: Arc<dyn Transport>,
        handle: &FlowHandle,
    ) -> TransportResult<Dispatched> {
        let service = envelope.service.clone();
        self.log
            .append(ActionRecord::from(envelope.clone()))
            .map_err(|err| TransportError::fatal(err.to_string()))?;
        debug!(engine = %self.name(), %service, invocation = %envelope.id, "executing routed invocation");

        let result = tokio::select! {
            biased;
            () = handle.token.cancelled() => Err(TransportError::Cancelled),
            result = transport.invoke(envelope.clone()) => result,
        };
        let mut completion = match result {
            Ok(completion) => completion,
            Err(err) => {
                if err.is_unavailable() {
                    self.registry.set_available(&service, false);
                }
                return Err(err);
            }
        };
        completion.parent.get_or_insert(envelope.id);
        completion.flow = envelope.flow;
        self.stats.lock().dispatched += 1;

        let mut pass = Pass::new(envelope.flow);
        let result = self
            .drive(
                &mut pass,
                &handle.token,
                Vec::new(),
                vec![ActionRecord::from(completion.clone())],
            )
            .await;
        if let Err(err) = result {
            warn!(engine = %self.name(), flow = %envelope.flow, error = %err, "routed completion processing failed");
        }
        let forwarded = pass
            .forwards
            .iter()
            .filter(|record| record.id != completion.id)
            .map(|record| ActionRecord::clone(record))
            .collect();
        Ok(Dispatched {
            completion,
            forwarded,
        })
    }

    fn flow_handle(&self, flow: FlowId) -> FlowHandle {
        self.flows
            .lock()
            .entry(flow)
            .or_insert_with(|| FlowHandle {
                lock: Arc::new(AsyncMutex::new(())),
                token: self.token.child_token(),
            })
            .clone()
    }

    async fn finish(&self, pass: Pass, result: EngineResult<()>) -> EngineResult<FlowReport> {
        let forwarded = pass.forwards.len();
        if forwarded > 0 {
            if let Some(upstream) = self.upstream() {
                forward_up(upstream, pass.forwards).await;
            }
        }
        result?;
        Ok(FlowReport {
            flow: pass.flow,
            completions: pass.completions,
            fired: pass.fired,
            dispatched: pass.dispatched,
            deferred: pass.deferred,
            forwarded,
            status: self.settle(pass.flow),
        })
    }

    /// Drops the flow's lock entry when nobody holds it and, once the flow
    /// is quiescent, lets the journal evict it.
    fn settle(&self, flow: FlowId) -> FlowStatus {
        {
            let mut flows = self.flows.lock();
            if flows
                .get(&flow)
                .is_some_and(|handle| Arc::strong_count(&handle.lock) == 1)
            {
                flows.remove(&flow);
            }
        }
        let status = self.flow_status(flow);
        if status == FlowStatus::Quiescent {
            self.journal.retire(flow);
        }
        status
    }

    async fn drive(
        &self,
        pass: &mut Pass,
        token: &CancellationToken,
        mut dispatch: Vec<Arc<ActionRecord>>,
        mut arrivals: Vec<ActionRecord>,
    ) -> EngineResult<()> {
        loop {
            for invocation in std::mem::take(&mut dispatch) {
                let answered = self.dispatch(pass, token, &invocation).await;
                arrivals.extend(answered);
            }
            if arrivals.is_empty() {
                return Ok(());
            }
            for record in std::mem::take(&mut arrivals) {
                pass.steps += 1;
                if pass.steps > self.config.max_flow_steps {
                    warn!(engine = %self.name(), flow = %pass.flow, limit = self.config.max_flow_steps, "step budget exceeded");
                    return Err(EngineError::StepBudgetExceeded {
                        flow: pass.flow,
                        limit: self.config.max_flow_steps,
                    });
                }
                let wave = self.admit(pass, token, record).await?;
                dispatch.extend(wave.dispatch);
                arrivals.extend(wave.arrivals);
            }
        }
    }

    async fn dispatch(
        &self,
        pass: &mut Pass,
        token: &CancellationToken,
        invocation: &ActionRecord,
    ) -> Vec<ActionRecord> {
        let Some(envelope) = invocation.to_invocation_envelope() else {
            return Vec::new();
        };
        if self.log.completion_for(&invocation.id).is_some() {
            return Vec::new();
        }
        let service = invocation.service.as_str();
        let retry = &self.config.retry;
        let mut attempts = 1;
        let result = loop {
            let result = tokio::select! {
                biased;
                () = token.cancelled() => Err(TransportError::Cancelled),
                result = self.registry.invoke(service, envelope.clone()) => result,
            };
            let err = match result {
                Ok(dispatched) => break Ok(dispatched),
                Err(err) => err,
            };
            let Some(delay) = retry.next_delay(&err, attempts, invocation.id) else {
                break Err(err);
            };
            self.stats.lock().retries += 1;
            debug!(service, attempts, ?delay, error = %err, "retrying dispatch");
            attempts += 1;
            tokio::select! {
                biased;
                () = token.cancelled() => break Err(TransportError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        };

        match result {
            Ok(dispatched) => {
                pass.dispatched += 1;
                self.stats.lock().dispatched += 1;
                let mut completion = ActionRecord::from(dispatched.completion);
                completion.parent.get_or_insert(invocation.id);
                if completion.flow != invocation.flow {
                    warn!(service, invocation = %invocation.id, "completion reported for another flow, reassigned");
                    completion.flow = invocation.flow;
                }
                let mut answered = vec![completion];
                answered.extend(dispatched.forwarded);
                answered
            }
            Err(err) => {
                self.dispatch_failed(invocation, &err);
                Vec::new()
            }
        }
    }

    fn dispatch_failed(&self, invocation: &ActionRecord, err: &TransportError) {
        self.stats.lock().dispatch_failures += 1;
        if err.is_unavailable() {
            self.registry.set_available(&invocation.service, false);
        }
        if err.is_unavailable() && self.holds_on_unavailable(invocation) {
            warn!(
                engine = %self.name(),
                service = %invocation.service,
                invocation = %invocation.id,
                "service unavailable, invocation held for redispatch"
            );
            self.undelivered
                .lock()
                .entry(invocation.service.clone())
                .or_default()
                .push((invocation.flow, invocation.id));
        } else {
            warn!(
                engine = %self.name(),
                service = %invocation.service,
                invocation = %invocation.id,
                error = %err,
                "dispatch failed"
            );
            self.journal.mark_failed(invocation.flow, invocation.id);
        }
    }

    /// Stimuli and invocations of deferred rules wait for their service;
    /// immediate and local firings fail the branch instead.
    fn holds_on_unavailable(&self, invocation: &ActionRecord) -> bool {
        match &invocation.rule {
            None => true,
            Some(name) => self
                .index
                .rule(name)
                .is_some_and(|rule| rule.delivery == Delivery::Deferred),
        }
    }

    async fn redispatch(&self, service: &str, report: &mut DrainReport) -> EngineResult<()> {
        let held = self.undelivered.lock().remove(service).unwrap_or_default();
        for (flow, id) in held {
            let Some(invocation) = self.log.get(&id) else {
                continue;
            };
            let handle = self.flow_handle(flow);
            let guard = handle.lock.lock().await;
            if self.log.completion_for(&id).is_some() {
                drop(guard);
                drop(handle);
                self.settle(flow);
                continue;
            }
            report.redispatched += 1;
            let mut pass = Pass::new(flow);
            let result = self
                .drive(&mut pass, &handle.token, vec![invocation], Vec::new())
                .await;
            drop(guard);
            drop(handle);
            self.finish(pass, result).await?;
        }
        Ok(())
    }

    async fn admit(
        &self,
        pass: &mut Pass,
        token: &CancellationToken,
        record: ActionRecord,
    ) -> EngineResult<Wave> {
        if !record.is_completion() {
            return Err(EngineError::InvalidRecord(format!(
                "{} is not a completion",
                record.id
            )));
        }
        let id = self.log.append(record)?;
        let record = self
            .log
            .get(&id)
            .ok_or_else(|| EngineError::InvalidRecord(format!("{id} vanished after append")))?;
        pass.completions += 1;
        self.stats.lock().completions += 1;

        let forwarded_to = self
            .upstream()
            .filter(|up| up.rules().has_candidates(&record.service, &record.action))
            .map(|up| up.name().to_string());
        if forwarded_to.is_some() {
            pass.forwards.push(Arc::clone(&record));
            self.stats.lock().forwarded += 1;
        }

        let mut wave = Wave::default();
        let candidates = self.index.candidates_for(&record.service, &record.action);
        if candidates.is_empty() {
            debug!(engine = %self.name(), record = %record.id, label = %record.label(), "no candidate rules");
            return Ok(wave);
        }
        let history = self.log.completions_for_flow(&record.flow);
        for rule in &candidates {
            self.evaluate(pass, token, rule, &record, &history, forwarded_to.as_deref(), &mut wave)
                .await?;
        }
        Ok(wave)
    }

    #[allow(clippy::too_many_arguments)]
    async fn evaluate(
        &self,
        pass: &mut Pass,
        token: &CancellationToken,
        rule: &Arc<CompiledRule>,
        trigger: &ActionRecord,
        history: &[Arc<ActionRecord>],
        forwarded_to: Option<&str>,
        wave: &mut Wave,
    ) -> EngineResult<()> {
        let local = rule.delivery == Delivery::Local;
        let unreachable = reached_services(rule)
            .find(|service| {
                if local {
                    !self.registry.is_local(service)
                } else {
                    !self.registry.contains(service)
                }
            })
            .map(str::to_string);
        if let Some(service) = unreachable {
            if local {
                warn!(engine = %self.name(), rule = %rule.name, %service, "local rule cannot reach service");
                self.journal.mark_partial(trigger.flow);
                self.skip(trigger, rule, Skip::Unreachable { service });
                return Ok(());
            }
            if let Some(upstream) = forwarded_to {
                self.skip(
                    trigger,
                    rule,
                    Skip::Forwarded {
                        upstream: upstream.to_string(),
                    },
                );
                return Ok(());
            }
        }

        let bindings = Matcher::match_rule(rule, trigger, history);
        if bindings.is_empty() {
            let missing = Matcher::missing_patterns(rule, trigger, history);
            self.skip(trigger, rule, Skip::NoSatisfyingBinding { missing });
            return Ok(());
        }

        for binding in bindings {
            if FiringGuard::already_fired(&self.log, rule, &binding) {
                self.skip(trigger, rule, Skip::AlreadyFired);
                continue;
            }
            match self.fire(token, rule, &binding, trigger, None).await? {
                Fire::Fired(fired) => self.fired(pass, rule, trigger, fired, wave),
                Fire::Skipped(reason) => self.skip(trigger, rule, reason),
                Fire::Blocked(service) => self.blocked(pass, rule, binding, trigger, service),
            }
        }
        Ok(())
    }

    /// Evaluates the condition, builds invocations and commits the firing.
    ///
    /// `captured_at` is set when a queued firing drains; only then are keyed
    /// writes checked for conflicts.
    async fn fire(
        &self,
        token: &CancellationToken,
        rule: &Arc<CompiledRule>,
        binding: &Binding,
        trigger: &ActionRecord,
        captured_at: Option<u64>,
    ) -> EngineResult<Fire> {
        let local = rule.delivery == Delivery::Local;
        let outcome = ConditionEvaluator::new(&self.registry, token)
            .local_only(local)
            .evaluate(rule, binding.values())
            .await;
        if let Some(service) = outcome.blocking_service() {
            return Ok(Fire::Blocked(service.to_string()));
        }
        if outcome.resolved.is_empty() {
            let reason = match outcome.failures.into_iter().next() {
                Some(failure) => Skip::ConditionUnresolved {
                    reason: failure.reason,
                },
                None => Skip::ConditionEmpty,
            };
            return Ok(Fire::Skipped(reason));
        }
        if let Some(template) = rule.then.iter().find(|t| !self.reachable(&t.service, local)) {
            return Ok(Fire::Blocked(template.service.clone()));
        }

        let timestamp = self.log.now();
        let mut invocations = Vec::new();
        let mut settle: HashMap<RecordId, (&'static str, Fields)> = HashMap::new();
        let mut conflicts = Vec::new();
        let mut escalated = false;
        for values in &outcome.resolved {
            for template in &rule.then {
                let mut invocation =
                    InvocationBuilder::instantiate(rule, template, values, trigger, timestamp)?;
                if let (Some(captured_at), Some(write)) = (captured_at, &template.write) {
                    let detected = self
                        .detect_conflict(token, template, write, values, &invocation, captured_at)
                        .await;
                    match detected {
                        Ok(Some(conflict)) => {
                            let resolution = self.resolver.read().resolve(&conflict);
                            info!(
                                engine = %self.name(),
                                rule = %rule.name,
                                key = %conflict.key,
                                ?resolution,
                                "write conflict"
                            );
                            match &resolution {
                                Resolution::AcceptIncoming => {}
                                Resolution::Merge(fields) => invocation.input = fields.clone(),
                                Resolution::KeepExisting => {
                                    settle.insert(invocation.id, (SUPERSEDED_VARIANT, Fields::new()));
                                }
                                Resolution::Escalate => {
                                    settle.insert(invocation.id, (CONFLICT_VARIANT, conflict.to_output()));
                                    escalated = true;
                                }
                            }
                            conflicts.push((conflict, resolution));
                        }
                        Ok(None) => {}
                        Err(err) if err.is_unavailable() => {
                            return Ok(Fire::Blocked(template.service.clone()));
                        }
                        Err(err) => {
                            warn!(rule = %rule.name, service = %template.service, error = %err, "conflict check failed, write accepted");
                        }
                    }
                }
                invocations.push(invocation);
            }
        }

        let produced = match FiringGuard::commit(&self.log, rule, binding, invocations)? {
            FiringCommit::AlreadyFired => return Ok(Fire::Skipped(Skip::AlreadyFired)),
            FiringCommit::Committed { invocations } => invocations,
        };
        for (conflict, resolution) in conflicts {
            self.stats.lock().conflicts += 1;
            self.journal.record_conflict(ConflictRecord {
                flow: trigger.flow,
                rule: rule.name.clone(),
                conflict,
                resolution,
                recorded_at: self.log.now(),
            });
        }

        let mut dispatch = Vec::new();
        let mut settled = Vec::new();
        for id in &produced {
            let Some(invocation) = self.log.get(id) else {
                continue;
            };
            match settle.remove(id) {
                Some((variant, output)) => settled.push(
                    ActionRecord::completes(&invocation, variant, output)
                        .with_timestamp(self.log.now()),
                ),
                None => dispatch.push(invocation),
            }
        }
        Ok(Fire::Fired(Fired {
            produced,
            dispatch,
            settled,
            escalated,
        }))
    }

    async fn detect_conflict(
        &self,
        token: &CancellationToken,
        template: &ThenTemplate,
        write: &WriteTarget,
        values: &Values,
        invocation: &ActionRecord,
        captured_at: u64,
    ) -> TransportResult<Option<Conflict>> {
        let Some(key) = write.key.resolve(values) else {
            return Ok(None);
        };
        let mut args = Fields::new();
        args.insert(write.key_field.clone(), key.clone());
        let request = QueryRequest::new(write.relation.clone(), args);
        let rows = tokio::select! {
            biased;
            () = token.cancelled() => Err(TransportError::Cancelled),
            rows = self.registry.query(&template.service, request) => rows,
        }?;

        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };
        let Some(existing_ts) = row.get(&write.version_field).and_then(Value::as_u64) else {
            return Ok(None);
        };
        // Timestamps carried by the write are compared on the service's own
        // clock; without one, the capture time on the log clock stands in.
        let carried = write
            .timestamp
            .as_ref()
            .and_then(|term| term.resolve(values))
            .and_then(|value| value.as_u64());
        let incoming_ts = match carried {
            Some(ts) if existing_ts >= ts => ts,
            Some(_) => return Ok(None),
            None if existing_ts > captured_at => captured_at,
            None => return Ok(None),
        };
        Ok(Some(Conflict {
            key: key.clone(),
            existing: Write::new(key.clone(), row, existing_ts),
            incoming: Write::new(key, invocation.input.clone(), incoming_ts),
            service: template.service.clone(),
            action: template.action.clone(),
        }))
    }

    fn reachable(&self, service: &str, local: bool) -> bool {
        self.registry.is_available(service) && (!local || self.registry.is_local(service))
    }

    fn fired(
        &self,
        pass: &mut Pass,
        rule: &CompiledRule,
        trigger: &ActionRecord,
        fired: Fired,
        wave: &mut Wave,
    ) {
        pass.fired += 1;
        self.stats.lock().firings += 1;
        debug!(
            engine = %self.name(),
            rule = %rule.name,
            flow = %trigger.flow,
            record = %trigger.id,
            produced = fired.produced.len(),
            "rule fired"
        );
        let outcome = if fired.escalated {
            RuleOutcome::NotFired {
                rule: rule.name.clone(),
                reason: Skip::ConflictEscalated,
            }
        } else {
            RuleOutcome::Fired {
                rule: rule.name.clone(),
                produced: fired.produced,
            }
        };
        self.journal.record(trigger.flow, trigger.id, outcome);
        wave.dispatch.extend(fired.dispatch);
        wave.arrivals.extend(fired.settled);
    }

    fn blocked(
        &self,
        pass: &mut Pass,
        rule: &Arc<CompiledRule>,
        binding: Binding,
        trigger: &ActionRecord,
        service: String,
    ) {
        match classify(rule.delivery, true) {
            FailureRoute::Queue => {
                let pending = self.queue.enqueue(
                    Arc::clone(rule),
                    binding,
                    trigger.flow,
                    trigger.id,
                    service.clone(),
                    self.log.now(),
                );
                pass.deferred += 1;
                self.stats.lock().deferred += 1;
                self.skip(trigger, rule, Skip::Deferred { service, pending });
            }
            FailureRoute::Discard => {
                warn!(engine = %self.name(), rule = %rule.name, flow = %trigger.flow, %service, "service unavailable, firing discarded");
                self.journal.mark_partial(trigger.flow);
                self.skip(trigger, rule, Skip::TargetUnavailable { service });
            }
            FailureRoute::FailLocal => {
                warn!(engine = %self.name(), rule = %rule.name, flow = %trigger.flow, %service, "local rule cannot reach service");
                self.journal.mark_partial(trigger.flow);
                self.skip(trigger, rule, Skip::Unreachable { service });
            }
        }
    }

    fn skip(&self, trigger: &ActionRecord, rule: &CompiledRule, reason: Skip) {
        debug!(engine = %self.name(), rule = %rule.name, record = %trigger.id, %reason, "rule not fired");
        self.journal.record(
            trigger.flow,
            trigger.id,
            RuleOutcome::NotFired {
                rule: rule.name.clone(),
                reason,
            },
        );
    }

    async fn drain_entry(&self, entry: PendingRule, report: &mut DrainReport) -> EngineResult<()> {
        let handle = self.flow_handle(entry.flow);
        let guard = handle.lock.lock().await;
        let Some(trigger) = self.log.get(&entry.trigger) else {
            self.queue.cancel(entry.id)?;
            report.cancelled += 1;
            drop(guard);
            drop(handle);
            self.settle(entry.flow);
            return Ok(());
        };
        if FiringGuard::already_fired(&self.log, &entry.rule, &entry.binding) {
            self.queue.mark_delivered(entry.id)?;
            report.delivered += 1;
            self.skip(&trigger, &entry.rule, Skip::AlreadyFired);
            drop(guard);
            drop(handle);
            self.settle(entry.flow);
            return Ok(());
        }

        let fire = self
            .fire(
                &handle.token,
                &entry.rule,
                &entry.binding,
                &trigger,
                Some(entry.captured_at),
            )
            .await;
        let fire = match fire {
            Ok(fire) => fire,
            Err(err) => {
                self.queue
                    .requeue(entry.id, entry.target.clone(), Some(err.to_string()))?;
                report.requeued += 1;
                return Err(err);
            }
        };

        let mut pass = Pass::new(entry.flow);
        let result = match fire {
            Fire::Fired(fired) => {
                self.queue.mark_delivered(entry.id)?;
                report.delivered += 1;
                info!(engine = %self.name(), pending = %entry.id, rule = %entry.rule.name, "deferred firing delivered");
                let mut wave = Wave::default();
                self.fired(&mut pass, &entry.rule, &trigger, fired, &mut wave);
                self.drive(&mut pass, &handle.token, wave.dispatch, wave.arrivals)
                    .await
            }
            Fire::Skipped(Skip::AlreadyFired) => {
                self.queue.mark_delivered(entry.id)?;
                report.delivered += 1;
                self.skip(&trigger, &entry.rule, Skip::AlreadyFired);
                Ok(())
            }
            Fire::Skipped(reason) => {
                self.queue.cancel(entry.id)?;
                report.cancelled += 1;
                self.skip(&trigger, &entry.rule, reason);
                Ok(())
            }
            Fire::Blocked(service) => {
                let message = format!("{service} unavailable");
                self.queue.requeue(entry.id, service, Some(message))?;
                report.requeued += 1;
                Ok(())
            }
        };
        drop(guard);
        drop(handle);
        self.finish(pass, result).await.map(|_| ())
    }
}

/// Services a rule queries or invokes.
fn reached_services(rule: &CompiledRule) -> impl Iterator<Item = &str> {
    rule.condition_steps()
        .iter()
        .filter_map(|step| match step {
            ConditionStep::Query(query) => Some(query.service.as_str()),
            _ => None,
        })
        .chain(rule.then.iter().map(|t| t.service.as_str()))
}

fn forward_up(
    upstream: Arc<Engine>,
    records: Vec<Arc<ActionRecord>>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        for record in records {
            let id = record.id;
            if let Err(err) = upstream.on_completion(ActionRecord::clone(&record)).await {
                warn!(engine = %upstream.name(), record = %id, error = %err, "forwarded completion rejected");
            }
        }
    })
}

fn propagate_availability(
    upstream: Arc<Engine>,
    service: String,
    available: bool,
) -> Pin<Box<dyn Future<Output = EngineResult<DrainReport>> + Send>> {
    Box::pin(async move { upstream.on_availability_change(&service, available).await })
}
