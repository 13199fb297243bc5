//! # SyncFlow Engine
//!
//! Rule-driven coordination of independent services.
//!
//! Services never call each other. They complete actions, and compiled
//! rules ("synchronizations") react to those completions by emitting new
//! invocations. This crate decides which rules fire, with which bindings, and
//! exactly once.
//!
//! This crate provides:
//! - The compiled rule model ([`CompiledRule`]) and a copy-on-write [`RuleIndex`]
//! - A relational [`Matcher`] over a flow's completions
//! - The exactly-once [`FiringGuard`] built on provenance edges
//! - Side-condition evaluation through the [`Transport`] contract
//! - Deferred delivery ([`DeliveryQueue`]) and conflict resolution ([`ConflictResolver`])
//! - The [`Engine`] context, its [`FlowTrace`]s, and multi-engine [`EngineHierarchy`]s
//!
//! ## Control flow
//!
//! ```text
//! completion -> ActionLog::append -> RuleIndex::candidates_for -> Matcher
//!            -> FiringGuard -> ConditionEvaluator -> InvocationBuilder
//!            -> ActionLog::commit_firing -> Transport::invoke -> completion ...
//! ```
//!
//! ## Key Invariants
//!
//! - A rule fires at most once per matched set of completions
//! - Every binding returned for a trigger contains the trigger
//! - Within a flow, processing is serialized and breadth-first
//! - Only condition queries and dispatch ever wait on a service
//! - A conflict is never resolved without a journal entry

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod binding;
mod builder;
mod condition;
mod config;
mod conflict;
mod delivery;
mod engine;
mod error;
mod guard;
mod hierarchy;
mod index;
mod matcher;
mod registry;
mod rule;
mod trace;
mod transport;

pub use binding::{constrain, merge, unify, Binding, MatchKey, Values};
pub use builder::InvocationBuilder;
pub use condition::{Blocked, ConditionEvaluator, ConditionOutcome, StepFailure};
pub use config::{EngineConfig, RetryConfig};
pub use conflict::{
    Conflict, ConflictHook, ConflictRecord, ConflictResolver, Resolution, Write,
    CONFLICT_VARIANT, SUPERSEDED_VARIANT,
};
pub use delivery::{classify, DeliveryQueue, FailureRoute, PendingId, PendingRule, PendingState};
pub use engine::{DrainReport, Engine, EngineStats, FlowReport};
pub use error::{
    EngineError, EngineResult, RuleError, RuleResult, TransportError, TransportResult,
};
pub use guard::FiringGuard;
pub use hierarchy::{EngineHierarchy, Placement};
pub use index::{IndexSnapshot, RuleIndex};
pub use matcher::Matcher;
pub use registry::{Dispatched, Reach, ServiceRegistry};
pub use rule::{
    Comparison, CompiledRule, ConditionPlan, ConditionStep, Delivery, FieldConstraint,
    QueryStep, Term, ThenTemplate, VariantMatch, WhenPattern, WriteTarget, ANY_ACTION,
};
pub use trace::{EvaluationJournal, FlowStatus, FlowTrace, RuleOutcome, Skip, TraceEntry};
pub use transport::{CompletionStream, Health, MockTransport, QueryRequest, Transport};

pub use syncflow_log::{
    ActionLog, ActionRecord, CompletionEnvelope, Fields, FlowId, InvocationEnvelope,
    ProvenanceGraph, RecordId,
};
