//! Multi-engine deployments.
//!
//! Each engine owns its shard of log, rules and services. A downstream engine
//! forwards completions its upstream has rules for; the upstream reaches the
//! downstream's services through routed registry entries, so invocations it
//! produces for them are executed (and logged) on the downstream.

use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use syncflow_log::{Fields, InvocationEnvelope};
use tracing::info;

use crate::engine::Engine;
use crate::error::{EngineResult, TransportResult};
use crate::registry::Dispatched;
use crate::rule::CompiledRule;
use crate::transport::QueryRequest;

/// Where a rule should be installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// One downstream engine reaches every service the rule touches.
    Downstream(String),
    /// The services span engines; the upstream evaluates the rule.
    Upstream,
    /// No engine of the hierarchy registers these services.
    Unplaceable {
        /// Services nobody registers.
        missing: Vec<String>,
    },
}

/// An upstream engine and the downstream engines linked to it.
#[derive(Debug)]
pub struct EngineHierarchy {
    upstream: Arc<Engine>,
    downstreams: RwLock<Vec<Arc<Engine>>>,
}

impl EngineHierarchy {
    /// Creates a hierarchy rooted at `upstream`.
    #[must_use]
    pub fn new(upstream: Arc<Engine>) -> Self {
        Self {
            upstream,
            downstreams: RwLock::new(Vec::new()),
        }
    }

    /// Returns the upstream engine.
    #[must_use]
    pub fn upstream(&self) -> &Arc<Engine> {
        &self.upstream
    }

    /// Returns the linked downstream engines in link order.
    #[must_use]
    pub fn downstreams(&self) -> Vec<Arc<Engine>> {
        self.downstreams.read().clone()
    }

    /// Returns a downstream engine by name.
    #[must_use]
    pub fn downstream(&self, name: &str) -> Option<Arc<Engine>> {
        self.downstreams
            .read()
            .iter()
            .find(|engine| engine.name() == name)
            .cloned()
    }

    /// Links a downstream engine.
    ///
    /// The downstream starts forwarding to the upstream, and each service it
    /// has registered locally becomes a routed service of the upstream.
    /// Services registered on the downstream later need another `link`.
    pub fn link(&self, downstream: Arc<Engine>) {
        downstream.set_upstream(Some(Arc::clone(&self.upstream)));
        let services = downstream.services().local_names();
        for service in &services {
            self.upstream
                .services()
                .register_routed(service.clone(), Arc::downgrade(&downstream));
        }
        info!(
            upstream = %self.upstream.name(),
            downstream = %downstream.name(),
            services = services.len(),
            "linked engine"
        );
        let mut downstreams = self.downstreams.write();
        downstreams.retain(|engine| !Arc::ptr_eq(engine, &downstream));
        downstreams.push(downstream);
    }

    /// Detaches a downstream engine and drops its routes. Returns false if no
    /// engine with that name was linked.
    pub fn unlink(&self, name: &str) -> bool {
        let engine = {
            let mut downstreams = self.downstreams.write();
            match downstreams.iter().position(|engine| engine.name() == name) {
                Some(idx) => downstreams.remove(idx),
                None => return false,
            }
        };
        engine.set_upstream(None);
        for service in engine.services().local_names() {
            self.upstream.services().unregister(&service);
        }
        info!(upstream = %self.upstream.name(), downstream = name, "unlinked engine");
        true
    }

    /// Decides where a rule belongs.
    ///
    /// Rules whose services one downstream reaches locally stay on that
    /// downstream, so they keep working while the upstream is away. Anything
    /// else goes upstream.
    #[must_use]
    pub fn place_rule(&self, rule: &CompiledRule) -> Placement {
        let services = rule.services();
        for engine in self.downstreams.read().iter() {
            let registry = engine.services();
            if services.iter().all(|service| registry.is_local(service)) {
                return Placement::Downstream(engine.name().to_string());
            }
        }
        let missing: Vec<String> = services
            .iter()
            .filter(|service| !self.upstream.services().contains(service))
            .map(|service| (*service).to_string())
            .collect();
        if missing.is_empty() {
            Placement::Upstream
        } else {
            Placement::Unplaceable { missing }
        }
    }

    /// Places a rule and registers it on the chosen engine.
    ///
    /// Unplaceable rules are registered upstream; they block until their
    /// services appear.
    ///
    /// # Errors
    ///
    /// Returns the registration error.
    pub fn install(&self, rule: CompiledRule) -> EngineResult<Placement> {
        let placement = self.place_rule(&rule);
        let engine = match &placement {
            Placement::Downstream(name) => self
                .downstream(name)
                .unwrap_or_else(|| Arc::clone(&self.upstream)),
            Placement::Upstream | Placement::Unplaceable { .. } => Arc::clone(&self.upstream),
        };
        info!(rule = %rule.name, engine = %engine.name(), ?placement, "installing rule");
        engine.register_rule(rule)?;
        Ok(placement)
    }

    /// Returns every service reachable from the upstream, sorted.
    #[must_use]
    pub fn services(&self) -> BTreeSet<String> {
        self.upstream.services().names().into_iter().collect()
    }
}

/// Sends an invocation to the downstream engine that owns its service.
pub(crate) fn route_invoke(
    engine: Arc<Engine>,
    invocation: InvocationEnvelope,
) -> Pin<Box<dyn Future<Output = TransportResult<Dispatched>> + Send>> {
    Box::pin(async move { engine.execute_routed(invocation).await })
}

/// Runs a query through the downstream engine that owns the service.
pub(crate) fn route_query(
    engine: Arc<Engine>,
    service: String,
    request: QueryRequest,
) -> Pin<Box<dyn Future<Output = TransportResult<Vec<Fields>>> + Send>> {
    Box::pin(async move { engine.services().query(&service, request).await })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::registry::Reach;
    use crate::rule::{Delivery, FieldConstraint, Term, ThenTemplate, VariantMatch, WhenPattern};
    use crate::transport::MockTransport;

    fn rule(name: &str, from: &str, to: &str) -> CompiledRule {
        CompiledRule {
            name: name.into(),
            when: vec![WhenPattern {
                service: from.into(),
                action: "run".into(),
                variant: VariantMatch::Any,
                input: Vec::new(),
                output: Vec::new(),
            }],
            condition: None,
            then: vec![ThenTemplate {
                service: to.into(),
                action: "run".into(),
                fields: vec![FieldConstraint::new("from", Term::lit(from))],
                write: None,
            }],
            delivery: Delivery::Immediate,
        }
    }

    fn hierarchy() -> EngineHierarchy {
        let hub = Arc::new(Engine::new(EngineConfig::new("hub")));
        let hierarchy = EngineHierarchy::new(hub);
        for (name, services) in [("east", ["Cart", "Stock"]), ("west", ["Mail", "Sms"])] {
            let edge = Arc::new(Engine::new(EngineConfig::new(name)));
            for service in services {
                edge.register_service(service, Arc::new(MockTransport::new(service)));
            }
            hierarchy.link(edge);
        }
        hierarchy
    }

    #[test]
    fn link_registers_routes() {
        let h = hierarchy();
        assert_eq!(h.upstream().services().reach("Cart"), Some(Reach::Routed));
        assert!(h.upstream().services().is_available("Mail"));
        assert_eq!(h.services().len(), 4);
        let east = h.downstream("east").unwrap();
        assert_eq!(east.upstream().unwrap().name(), "hub");
    }

    #[test]
    fn placement_prefers_a_single_downstream() {
        let h = hierarchy();
        assert_eq!(
            h.place_rule(&rule("Reserve", "Cart", "Stock")),
            Placement::Downstream("east".into())
        );
        assert_eq!(h.place_rule(&rule("Confirm", "Cart", "Mail")), Placement::Upstream);
        assert_eq!(
            h.place_rule(&rule("Page", "Cart", "Pager")),
            Placement::Unplaceable {
                missing: vec!["Pager".into()]
            }
        );
    }

    #[test]
    fn install_and_unlink() {
        let h = hierarchy();
        assert_eq!(
            h.install(rule("Confirm", "Cart", "Mail")).unwrap(),
            Placement::Upstream
        );
        assert!(h.upstream().rules().rule("Confirm").is_some());

        assert!(h.unlink("west"));
        assert!(!h.unlink("west"));
        assert!(!h.upstream().services().contains("Mail"));
        assert_eq!(h.downstreams().len(), 1);
    }
}
