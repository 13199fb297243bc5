//! Action records and the envelopes exchanged with services.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::clock::now_millis;

/// Ordered field map used for action inputs, outputs and query rows.
pub type Fields = BTreeMap<String, Value>;

/// Unique identifier of an [`ActionRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Generates a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an id from a raw 128-bit value.
    #[must_use]
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// The all-zero id.
    #[must_use]
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier shared by every record of one flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(Uuid);

impl FlowId {
    /// Generates a fresh random flow id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a flow id from a raw 128-bit value.
    #[must_use]
    pub const fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for FlowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a record is a request or an outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// A request to run an action.
    Invocation,
    /// The outcome of an action.
    Completion {
        /// Outcome tag, e.g. `ok` or `error`.
        variant: String,
        /// Output fields.
        output: Fields,
    },
}

/// An immutable invocation or completion.
///
/// Records refer to each other only through [`RecordId`]s. Build them with
/// the constructors below and hand them to [`crate::ActionLog::append`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    /// Unique id.
    pub id: RecordId,
    /// Invocation or completion payload.
    pub kind: RecordKind,
    /// Target service.
    pub service: String,
    /// Action name within the service.
    pub action: String,
    /// Input fields.
    pub input: Fields,
    /// Flow this record belongs to.
    pub flow: FlowId,
    /// Rule that produced this invocation, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    /// Causal parent: the triggering completion of an invocation, or the
    /// invocation a completion answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<RecordId>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl ActionRecord {
    /// Creates a root invocation for `flow`.
    pub fn invocation(
        service: impl Into<String>,
        action: impl Into<String>,
        input: Fields,
        flow: FlowId,
    ) -> Self {
        Self {
            id: RecordId::new(),
            kind: RecordKind::Invocation,
            service: service.into(),
            action: action.into(),
            input,
            flow,
            rule: None,
            parent: None,
            timestamp: now_millis(),
        }
    }

    /// Creates a completion that did not come from a logged invocation.
    pub fn completion(
        service: impl Into<String>,
        action: impl Into<String>,
        input: Fields,
        variant: impl Into<String>,
        output: Fields,
        flow: FlowId,
    ) -> Self {
        Self {
            id: RecordId::new(),
            kind: RecordKind::Completion {
                variant: variant.into(),
                output,
            },
            service: service.into(),
            action: action.into(),
            input,
            flow,
            rule: None,
            parent: None,
            timestamp: now_millis(),
        }
    }

    /// Creates the completion answering `invocation`.
    pub fn completes(invocation: &ActionRecord, variant: impl Into<String>, output: Fields) -> Self {
        Self {
            id: RecordId::new(),
            kind: RecordKind::Completion {
                variant: variant.into(),
                output,
            },
            service: invocation.service.clone(),
            action: invocation.action.clone(),
            input: invocation.input.clone(),
            flow: invocation.flow,
            rule: None,
            parent: Some(invocation.id),
            timestamp: now_millis(),
        }
    }

    /// Overrides the id.
    #[must_use]
    pub fn with_id(mut self, id: RecordId) -> Self {
        self.id = id;
        self
    }

    /// Sets the causal parent.
    #[must_use]
    pub fn with_parent(mut self, parent: RecordId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Records the producing rule.
    #[must_use]
    pub fn with_rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = Some(rule.into());
        self
    }

    /// Overrides the timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Returns true for completions.
    #[must_use]
    pub fn is_completion(&self) -> bool {
        matches!(self.kind, RecordKind::Completion { .. })
    }

    /// Returns true for invocations.
    #[must_use]
    pub fn is_invocation(&self) -> bool {
        matches!(self.kind, RecordKind::Invocation)
    }

    /// Returns the variant tag of a completion.
    #[must_use]
    pub fn variant(&self) -> Option<&str> {
        match &self.kind {
            RecordKind::Completion { variant, .. } => Some(variant),
            RecordKind::Invocation => None,
        }
    }

    /// Returns the output of a completion.
    #[must_use]
    pub fn output(&self) -> Option<&Fields> {
        match &self.kind {
            RecordKind::Completion { output, .. } => Some(output),
            RecordKind::Invocation => None,
        }
    }

    /// Returns `service/action`, with `/variant` appended for completions.
    #[must_use]
    pub fn label(&self) -> String {
        match self.variant() {
            Some(variant) => format!("{}/{} -> {}", self.service, self.action, variant),
            None => format!("{}/{}", self.service, self.action),
        }
    }

    /// Converts an invocation into its wire envelope.
    #[must_use]
    pub fn to_invocation_envelope(&self) -> Option<InvocationEnvelope> {
        if !self.is_invocation() {
            return None;
        }
        Some(InvocationEnvelope {
            id: self.id,
            service: self.service.clone(),
            action: self.action.clone(),
            input: self.input.clone(),
            flow: self.flow,
            rule: self.rule.clone(),
            timestamp: self.timestamp,
        })
    }

    /// Converts a completion into its wire envelope.
    #[must_use]
    pub fn to_completion_envelope(&self) -> Option<CompletionEnvelope> {
        let RecordKind::Completion { variant, output } = &self.kind else {
            return None;
        };
        Some(CompletionEnvelope {
            id: self.id,
            service: self.service.clone(),
            action: self.action.clone(),
            input: self.input.clone(),
            variant: variant.clone(),
            output: output.clone(),
            flow: self.flow,
            timestamp: self.timestamp,
            parent: self.parent,
        })
    }
}

/// Invocation as sent to a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationEnvelope {
    /// Invocation id; the service echoes it as the completion's parent.
    pub id: RecordId,
    /// Target service.
    pub service: String,
    /// Action name.
    pub action: String,
    /// Input fields.
    pub input: Fields,
    /// Owning flow.
    pub flow: FlowId,
    /// Producing rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl InvocationEnvelope {
    /// Builds the completion a service returns for this invocation.
    pub fn complete(&self, variant: impl Into<String>, output: Fields) -> CompletionEnvelope {
        CompletionEnvelope {
            id: RecordId::new(),
            service: self.service.clone(),
            action: self.action.clone(),
            input: self.input.clone(),
            variant: variant.into(),
            output,
            flow: self.flow,
            timestamp: now_millis(),
            parent: Some(self.id),
        }
    }
}

impl From<InvocationEnvelope> for ActionRecord {
    fn from(envelope: InvocationEnvelope) -> Self {
        Self {
            id: envelope.id,
            kind: RecordKind::Invocation,
            service: envelope.service,
            action: envelope.action,
            input: envelope.input,
            flow: envelope.flow,
            rule: envelope.rule,
            parent: None,
            timestamp: envelope.timestamp,
        }
    }
}

/// Completion as reported by a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionEnvelope {
    /// Completion id.
    pub id: RecordId,
    /// Reporting service.
    pub service: String,
    /// Action name.
    pub action: String,
    /// Input the action ran with.
    pub input: Fields,
    /// Outcome tag.
    pub variant: String,
    /// Output fields.
    pub output: Fields,
    /// Owning flow.
    pub flow: FlowId,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Invocation this completion answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<RecordId>,
}

impl From<CompletionEnvelope> for ActionRecord {
    fn from(envelope: CompletionEnvelope) -> Self {
        Self {
            id: envelope.id,
            kind: RecordKind::Completion {
                variant: envelope.variant,
                output: envelope.output,
            },
            service: envelope.service,
            action: envelope.action,
            input: envelope.input,
            flow: envelope.flow,
            rule: None,
            parent: envelope.parent,
            timestamp: envelope.timestamp,
        }
    }
}
