//! Transport contract between the engine and services.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use syncflow_log::{CompletionEnvelope, Fields, InvocationEnvelope};
use tokio::sync::mpsc;

use crate::error::{TransportError, TransportResult};

/// A read against one relation of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Relation name.
    pub relation: String,
    /// Filter arguments; every row returned must agree with them.
    #[serde(default)]
    pub args: Fields,
}

impl QueryRequest {
    /// Creates a request.
    pub fn new(relation: impl Into<String>, args: Fields) -> Self {
        Self {
            relation: relation.into(),
            args,
        }
    }
}

/// Result of a health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Health {
    /// Whether the service accepts calls.
    pub available: bool,
    /// Observed round-trip latency.
    pub latency: Duration,
}

impl Health {
    /// A healthy service.
    #[must_use]
    pub fn available(latency: Duration) -> Self {
        Self {
            available: true,
            latency,
        }
    }

    /// An unreachable service.
    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            available: false,
            latency: Duration::ZERO,
        }
    }
}

/// Stream of completions pushed by a service.
pub type CompletionStream = mpsc::Receiver<CompletionEnvelope>;

/// How the engine reaches one service.
///
/// Services answer `query` however they like: a relational store and a
/// minimal key/filter service are both valid as long as every returned row
/// agrees with the request's args.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Runs an action and returns its completion.
    async fn invoke(&self, invocation: InvocationEnvelope) -> TransportResult<CompletionEnvelope>;

    /// Reads rows of a relation.
    async fn query(&self, request: QueryRequest) -> TransportResult<Vec<Fields>>;

    /// Opens a stream of completions the service produces on its own,
    /// buffering up to `buffer` completions.
    async fn subscribe(&self, channel: &str, buffer: usize) -> TransportResult<CompletionStream> {
        let _ = (channel, buffer);
        Err(TransportError::unsupported("subscribe"))
    }

    /// Probes the service.
    async fn health(&self) -> TransportResult<Health>;
}

/// A scripted transport for unit tests.
///
/// Every invocation completes with the configured variant and output; queries
/// return the stored rows of a relation filtered by the request args.
#[derive(Debug)]
pub struct MockTransport {
    service: String,
    available: AtomicBool,
    response: Mutex<(String, Fields)>,
    rows: Mutex<HashMap<String, Vec<Fields>>>,
    invocations: Mutex<Vec<InvocationEnvelope>>,
    queries: Mutex<Vec<QueryRequest>>,
    failure: Mutex<Option<TransportError>>,
}

impl MockTransport {
    /// Creates a mock answering `ok` with an empty output.
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            available: AtomicBool::new(true),
            response: Mutex::new(("ok".to_string(), Fields::new())),
            rows: Mutex::new(HashMap::new()),
            invocations: Mutex::new(Vec::new()),
            queries: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
        }
    }

    /// Sets the completion returned by `invoke`.
    pub fn respond_with(&self, variant: impl Into<String>, output: Fields) {
        *self.response.lock() = (variant.into(), output);
    }

    /// Sets the rows of a relation.
    pub fn set_rows(&self, relation: impl Into<String>, rows: Vec<Fields>) {
        self.rows.lock().insert(relation.into(), rows);
    }

    /// Makes every call fail with `error` until cleared with `None`.
    pub fn fail_with(&self, error: Option<TransportError>) {
        *self.failure.lock() = error;
    }

    /// Sets availability.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Returns every invocation received.
    #[must_use]
    pub fn invocations(&self) -> Vec<InvocationEnvelope> {
        self.invocations.lock().clone()
    }

    /// Returns every query received.
    #[must_use]
    pub fn queries(&self) -> Vec<QueryRequest> {
        self.queries.lock().clone()
    }

    fn check(&self) -> TransportResult<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(TransportError::unavailable(self.service.clone()));
        }
        match self.failure.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn invoke(&self, invocation: InvocationEnvelope) -> TransportResult<CompletionEnvelope> {
        self.check()?;
        self.invocations.lock().push(invocation.clone());
        let (variant, output) = self.response.lock().clone();
        Ok(invocation.complete(variant, output))
    }

    async fn query(&self, request: QueryRequest) -> TransportResult<Vec<Fields>> {
        self.check()?;
        self.queries.lock().push(request.clone());
        let rows = self.rows.lock();
        Ok(rows
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

    async fn health(&self) -> TransportResult<Health> {
        if self.available.load(Ordering::SeqCst) {
            Ok(Health::available(Duration::ZERO))
        } else {
            Ok(Health::unavailable())
        }
    }
}
