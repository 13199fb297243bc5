//! In-memory services.
//!
//! [`MemoryService`] is a scriptable stand-in for a real service: actions
//! answer through registered handlers (or echo their input), relations are
//! plain row lists, and availability can be toggled at any point.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use syncflow_engine::{
    CompletionStream, Health, QueryRequest, Transport, TransportError, TransportResult,
};
use syncflow_log::{CompletionEnvelope, Fields, InvocationEnvelope};
use tokio::sync::mpsc;

/// The completion a handler produces.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// Completion variant.
    pub variant: String,
    /// Completion output.
    pub output: Fields,
}

impl Reply {
    /// Creates a reply.
    pub fn new(variant: impl Into<String>, output: Fields) -> Self {
        Self {
            variant: variant.into(),
            output,
        }
    }

    /// An `ok` reply.
    pub fn ok(output: Fields) -> Self {
        Self::new("ok", output)
    }
}

/// Computes the reply to one invocation.
pub type Handler = Arc<dyn Fn(&InvocationEnvelope) -> Reply + Send + Sync>;

/// A scriptable in-memory service.
pub struct MemoryService {
    name: String,
    available: AtomicBool,
    handlers: RwLock<HashMap<String, Handler>>,
    relations: RwLock<HashMap<String, Vec<Fields>>>,
    failures: Mutex<HashMap<String, TransportError>>,
    invocations: Mutex<Vec<InvocationEnvelope>>,
    queries: AtomicUsize,
    subscribers: Mutex<Vec<mpsc::Sender<CompletionEnvelope>>>,
}

impl std::fmt::Debug for MemoryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryService")
            .field("name", &self.name)
            .field("available", &self.is_available())
            .field("invocations", &self.invocations.lock().len())
            .finish()
    }
}

impl MemoryService {
    /// Creates an available service whose actions echo their input as `ok`.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            available: AtomicBool::new(true),
            handlers: RwLock::new(HashMap::new()),
            relations: RwLock::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            invocations: Mutex::new(Vec::new()),
            queries: AtomicUsize::new(0),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Returns the service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Installs the handler of an action.
    pub fn handle<F>(&self, action: impl Into<String>, handler: F)
    where
        F: Fn(&InvocationEnvelope) -> Reply + Send + Sync + 'static,
    {
        self.handlers.write().insert(action.into(), Arc::new(handler));
    }

    /// Makes an action always complete with `variant` and `output`.
    pub fn respond(&self, action: impl Into<String>, variant: impl Into<String>, output: Fields) {
        let reply = Reply::new(variant, output);
        self.handle(action, move |_| reply.clone());
    }

    /// Makes an action, or queries of a relation, fail with `error` until
    /// cleared with `None`.
    pub fn fail(&self, name: impl Into<String>, error: Option<TransportError>) {
        let name = name.into();
        let mut failures = self.failures.lock();
        match error {
            Some(error) => {
                failures.insert(name, error);
            }
            None => {
                failures.remove(&name);
            }
        }
    }

    /// Appends a row to a relation.
    pub fn insert_row(&self, relation: impl Into<String>, row: Fields) {
        self.relations
            .write()
            .entry(relation.into())
            .or_default()
            .push(row);
    }

    /// Replaces the rows of a relation.
    pub fn set_rows(&self, relation: impl Into<String>, rows: Vec<Fields>) {
        self.relations.write().insert(relation.into(), rows);
    }

    /// Returns the rows of a relation.
    pub fn rows(&self, relation: &str) -> Vec<Fields> {
        self.relations.read().get(relation).cloned().unwrap_or_default()
    }

    /// Sets availability. The engine learns about it on dispatch failure or
    /// through `Engine::on_availability_change`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Returns the current availability.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Returns every invocation received, in order.
    pub fn invocations(&self) -> Vec<InvocationEnvelope> {
        self.invocations.lock().clone()
    }

    /// Returns the invocations of one action.
    pub fn invocations_of(&self, action: &str) -> Vec<InvocationEnvelope> {
        self.invocations
            .lock()
            .iter()
            .filter(|inv| inv.action == action)
            .cloned()
            .collect()
    }

    /// Returns the number of queries answered.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Pushes a completion to every open subscription. Returns the number of
    /// subscribers reached.
    pub async fn publish(&self, completion: CompletionEnvelope) -> usize {
        let senders = self.subscribers.lock().clone();
        let mut reached = 0;
        for sender in senders {
            if sender.send(completion.clone()).await.is_ok() {
                reached += 1;
            }
        }
        self.subscribers.lock().retain(|sender| !sender.is_closed());
        reached
    }

    /// Drops every subscription, ending the streams.
    pub fn close_subscriptions(&self) {
        self.subscribers.lock().clear();
    }

    fn check(&self, name: Option<&str>) -> TransportResult<()> {
        if !self.is_available() {
            return Err(TransportError::unavailable(self.name.clone()));
        }
        match name.and_then(|name| self.failures.lock().get(name).cloned()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for MemoryService {
    async fn invoke(&self, invocation: InvocationEnvelope) -> TransportResult<CompletionEnvelope> {
        self.check(Some(&invocation.action))?;
        self.invocations.lock().push(invocation.clone());
        let handler = self.handlers.read().get(&invocation.action).cloned();
        let reply = match handler {
            Some(handler) => handler(&invocation),
            None => Reply::ok(invocation.input.clone()),
        };
        Ok(invocation.complete(reply.variant, reply.output))
    }

    async fn query(&self, request: QueryRequest) -> TransportResult<Vec<Fields>> {
        self.check(Some(&request.relation))?;
        self.queries.fetch_add(1, Ordering::SeqCst);
        let relations = self.relations.read();
        Ok(relations
            .get(&request.relation)
            .into_iter()
            .flatten()
            .filter(|row| {
                request
                    .args
                    .iter()
                    .all(|(field, value)| row.get(field) == Some(value))
            })
            .cloned()
            .collect())
    }

    async fn subscribe(&self, channel: &str, buffer: usize) -> TransportResult<CompletionStream> {
        self.check(None)?;
        tracing::debug!(service = %self.name, channel, buffer, "subscription opened");
        let (tx, rx) = mpsc::channel(buffer.max(1));
        self.subscribers.lock().push(tx);
        Ok(rx)
    }

    async fn health(&self) -> TransportResult<Health> {
        if self.is_available() {
            Ok(Health::available(Duration::from_micros(1)))
        } else {
            Ok(Health::unavailable())
        }
    }
}
