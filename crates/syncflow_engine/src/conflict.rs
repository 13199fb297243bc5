//! Conflict detection and resolution for deferred keyed writes.
//!
//! A deferred firing captures its binding at one time and may drain much
//! later. If the key it writes has been written since, the two writes
//! conflict and a policy decides which survives.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use syncflow_log::{Fields, FlowId};

/// Completion variant appended when a conflict is escalated.
pub const CONFLICT_VARIANT: &str = "conflict";

/// Completion variant appended when an incoming write loses to an existing one.
pub const SUPERSEDED_VARIANT: &str = "superseded";

/// One side of a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Write {
    /// Key written.
    pub key: Value,
    /// Written value.
    pub value: Fields,
    /// Write timestamp in milliseconds.
    pub timestamp: u64,
}

impl Write {
    /// Creates a write.
    pub fn new(key: impl Into<Value>, value: Fields, timestamp: u64) -> Self {
        Self {
            key: key.into(),
            value,
            timestamp,
        }
    }
}

/// Two writes to the same key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Key both writes target.
    pub key: Value,
    /// Write already visible at the service.
    pub existing: Write,
    /// Write the drained firing wants to make.
    pub incoming: Write,
    /// Service owning the key.
    pub service: String,
    /// Action of the incoming write.
    pub action: String,
}

impl Conflict {
    /// Returns the output carried by an escalation completion.
    #[must_use]
    pub fn to_output(&self) -> Fields {
        let mut output = Fields::new();
        output.insert("key".into(), self.key.clone());
        output.insert("existing".into(), Value::Object(self.existing.value.clone().into_iter().collect()));
        output.insert("incoming".into(), Value::Object(self.incoming.value.clone().into_iter().collect()));
        output.insert("existing_ts".into(), Value::from(self.existing.timestamp));
        output.insert("incoming_ts".into(), Value::from(self.incoming.timestamp));
        output
    }
}

/// How a conflict was settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// The existing write stands; the incoming invocation is not sent.
    KeepExisting,
    /// The incoming invocation is sent unchanged.
    AcceptIncoming,
    /// The incoming invocation is sent with these fields instead.
    Merge(Fields),
    /// Neither wins; a `conflict` completion is appended for rules to handle.
    Escalate,
}

impl Resolution {
    /// Returns true if the incoming invocation is dispatched.
    #[must_use]
    pub fn dispatches(&self) -> bool {
        matches!(self, Self::AcceptIncoming | Self::Merge(_))
    }
}

/// A pluggable conflict policy.
///
/// Returning `None` falls back to last-writer-wins.
pub trait ConflictHook: Send + Sync {
    /// Decides a conflict.
    fn on_conflict(&self, conflict: &Conflict) -> Option<Resolution>;
}

impl<F> ConflictHook for F
where
    F: Fn(&Conflict) -> Option<Resolution> + Send + Sync,
{
    fn on_conflict(&self, conflict: &Conflict) -> Option<Resolution> {
        self(conflict)
    }
}

/// Applies the configured policy to conflicts.
#[derive(Clone, Default)]
pub struct ConflictResolver {
    hook: Option<Arc<dyn ConflictHook>>,
}

impl fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("hook", &self.hook.is_some())
            .finish()
    }
}

impl ConflictResolver {
    /// Creates a resolver using only last-writer-wins.
    #[must_use]
    pub fn last_writer_wins() -> Self {
        Self::default()
    }

    /// Creates a resolver that consults `hook` first.
    pub fn with_hook(hook: impl ConflictHook + 'static) -> Self {
        Self {
            hook: Some(Arc::new(hook)),
        }
    }

    /// Returns true if a hook is installed.
    #[must_use]
    pub fn has_hook(&self) -> bool {
        self.hook.is_some()
    }

    /// Decides a conflict.
    #[must_use]
    pub fn resolve(&self, conflict: &Conflict) -> Resolution {
        self.hook
            .as_ref()
            .and_then(|hook| hook.on_conflict(conflict))
            .unwrap_or_else(|| Self::default_policy(&conflict.existing, &conflict.incoming))
    }

    /// Last-writer-wins by timestamp; equal timestamps escalate.
    #[must_use]
    pub fn default_policy(existing: &Write, incoming: &Write) -> Resolution {
        match incoming.timestamp.cmp(&existing.timestamp) {
            std::cmp::Ordering::Greater => Resolution::AcceptIncoming,
            std::cmp::Ordering::Less => Resolution::KeepExisting,
            std::cmp::Ordering::Equal => Resolution::Escalate,
        }
    }
}

/// A conflict as kept in the engine's conflict journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Flow of the drained firing.
    pub flow: FlowId,
    /// Rule that produced the incoming write.
    pub rule: String,
    /// The conflict.
    pub conflict: Conflict,
    /// How it was settled.
    pub resolution: Resolution,
    /// Log time of the decision.
    pub recorded_at: u64,
}
