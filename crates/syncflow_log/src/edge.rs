//! Provenance edges and firing commits.

use serde::{Deserialize, Serialize};

use crate::record::RecordId;

/// A causal edge from a matched completion to an invocation a rule produced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProvenanceEdge {
    /// Matched completion.
    pub source: RecordId,
    /// Produced invocation.
    pub produced: RecordId,
    /// Rule that fired.
    pub rule: String,
}

impl ProvenanceEdge {
    /// Creates a new edge.
    pub fn new(source: RecordId, produced: RecordId, rule: impl Into<String>) -> Self {
        Self {
            source,
            produced,
            rule: rule.into(),
        }
    }
}

/// Outcome of [`crate::ActionLog::commit_firing`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FiringCommit {
    /// The invocations and their edges were appended.
    Committed {
        /// Ids of the appended invocations, in order.
        invocations: Vec<RecordId>,
    },
    /// An edge set for the rule and matched set already existed; nothing was appended.
    AlreadyFired,
}

impl FiringCommit {
    /// Returns true if the firing was recorded by this call.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Committed { .. })
    }
}
