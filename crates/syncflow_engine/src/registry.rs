//! Service registry: name to endpoint, with cached availability.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use syncflow_log::{ActionRecord, CompletionEnvelope, Fields, InvocationEnvelope};
use tracing::{debug, info};

use crate::engine::Engine;
use crate::error::{TransportError, TransportResult};
use crate::hierarchy;
use crate::transport::{Health, QueryRequest, Transport};

/// How a registered service is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reach {
    /// Through a transport owned by this engine.
    Local,
    /// Through a downstream engine of the hierarchy.
    Routed,
}

/// Completion of a dispatched invocation, plus completions a downstream
/// engine produced while handling it that this engine's rules care about.
#[derive(Debug, Clone)]
pub struct Dispatched {
    /// The completion answering the invocation.
    pub completion: CompletionEnvelope,
    /// Further completions forwarded from a downstream engine.
    pub forwarded: Vec<ActionRecord>,
}

impl From<CompletionEnvelope> for Dispatched {
    fn from(completion: CompletionEnvelope) -> Self {
        Self {
            completion,
            forwarded: Vec::new(),
        }
    }
}

enum Endpoint {
    Transport(Arc<dyn Transport>),
    Routed(Weak<Engine>),
}

struct ServiceEntry {
    endpoint: Endpoint,
    available: AtomicBool,
}

impl ServiceEntry {
    fn reach(&self) -> Reach {
        match self.endpoint {
            Endpoint::Transport(_) => Reach::Local,
            Endpoint::Routed(_) => Reach::Routed,
        }
    }
}

/// Registered services of one engine.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<ServiceEntry>>>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &self.names())
            .finish()
    }
}

impl ServiceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a local service, replacing any previous endpoint.
    pub fn register(&self, name: impl Into<String>, transport: Arc<dyn Transport>) {
        let name = name.into();
        info!(service = %name, "registered local service");
        self.insert(name, Endpoint::Transport(transport));
    }

    /// Registers a service reached through a downstream engine.
    pub fn register_routed(&self, name: impl Into<String>, downstream: Weak<Engine>) {
        let name = name.into();
        info!(service = %name, "registered routed service");
        self.insert(name, Endpoint::Routed(downstream));
    }

    fn insert(&self, name: String, endpoint: Endpoint) {
        let entry = Arc::new(ServiceEntry {
            endpoint,
            available: AtomicBool::new(true),
        });
        self.services.write().insert(name, entry);
    }

    /// Removes a service. Returns true if it was registered.
    pub fn unregister(&self, name: &str) -> bool {
        self.services.write().remove(name).is_some()
    }

    fn entry(&self, name: &str) -> Option<Arc<ServiceEntry>> {
        self.services.read().get(name).cloned()
    }

    /// Returns true if the service is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.services.read().contains_key(name)
    }

    /// Returns how the service is reached.
    #[must_use]
    pub fn reach(&self, name: &str) -> Option<Reach> {
        self.entry(name).map(|e| e.reach())
    }

    /// Returns true if the service is registered with a local transport.
    #[must_use]
    pub fn is_local(&self, name: &str) -> bool {
        self.reach(name) == Some(Reach::Local)
    }

    /// Returns the local transport of a service.
    #[must_use]
    pub fn local_transport(&self, name: &str) -> Option<Arc<dyn Transport>> {
        match &self.entry(name)?.endpoint {
            Endpoint::Transport(transport) => Some(Arc::clone(transport)),
            Endpoint::Routed(_) => None,
        }
    }

    /// Returns true if the service is registered and believed reachable.
    ///
    /// Routed services are available when the downstream engine is alive and
    /// reports the service available.
    #[must_use]
    pub fn is_available(&self, name: &str) -> bool {
        let Some(entry) = self.entry(name) else {
            return false;
        };
        if !entry.available.load(Ordering::Acquire) {
            return false;
        }
        match &entry.endpoint {
            Endpoint::Transport(_) => true,
            Endpoint::Routed(downstream) => downstream
                .upgrade()
                .is_some_and(|engine| engine.services().is_available(name)),
        }
    }

    /// Records a service's availability. Returns the previous flag, or `None`
    /// if the service is not registered.
    pub fn set_available(&self, name: &str, available: bool) -> Option<bool> {
        let entry = self.entry(name)?;
        let previous = entry.available.swap(available, Ordering::AcqRel);
        if previous != available {
            debug!(service = name, available, "service availability changed");
        }
        Some(previous)
    }

    /// Returns all registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns the names of locally reached services, sorted.
    #[must_use]
    pub fn local_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .read()
            .iter()
            .filter(|(_, entry)| entry.reach() == Reach::Local)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Sends an invocation to its service.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Unavailable`] for unknown services or a
    /// dropped downstream engine, or whatever the transport returns.
    pub async fn invoke(
        &self,
        service: &str,
        invocation: InvocationEnvelope,
    ) -> TransportResult<Dispatched> {
        let entry = self
            .entry(service)
            .ok_or_else(|| TransportError::unavailable(service))?;
        match &entry.endpoint {
            Endpoint::Transport(transport) => Ok(transport.invoke(invocation).await?.into()),
            Endpoint::Routed(downstream) => {
                let engine = downstream
                    .upgrade()
                    .ok_or_else(|| TransportError::unavailable(service))?;
                hierarchy::route_invoke(engine, invocation).await
            }
        }
    }

    /// Queries a relation of a service.
    ///
    /// # Errors
    ///
    /// As for [`Self::invoke`].
    pub async fn query(&self, service: &str, request: QueryRequest) -> TransportResult<Vec<Fields>> {
        let entry = self
            .entry(service)
            .ok_or_else(|| TransportError::unavailable(service))?;
        match &entry.endpoint {
            Endpoint::Transport(transport) => transport.query(request).await,
            Endpoint::Routed(downstream) => {
                let engine = downstream
                    .upgrade()
                    .ok_or_else(|| TransportError::unavailable(service))?;
                hierarchy::route_query(engine, service.to_string(), request).await
            }
        }
    }

    /// Probes a service and records the result.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Unavailable`] for unknown services.
    pub async fn probe(&self, service: &str) -> TransportResult<Health> {
        let entry = self
            .entry(service)
            .ok_or_else(|| TransportError::unavailable(service))?;
        let health = match &entry.endpoint {
            Endpoint::Transport(transport) => {
                transport.health().await.unwrap_or_else(|_| Health::unavailable())
            }
            Endpoint::Routed(downstream) => {
                let available = downstream
                    .upgrade()
                    .is_some_and(|engine| engine.services().is_available(service));
                if available {
                    Health::available(std::time::Duration::ZERO)
                } else {
                    Health::unavailable()
                }
            }
        };
        entry.available.store(health.available, Ordering::Release);
        Ok(health)
    }
}
