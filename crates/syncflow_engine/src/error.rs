//! Error types for the engine.

use syncflow_log::{FlowId, LogError};
use thiserror::Error;

use crate::delivery::PendingId;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Result type for rule validation and registration.
pub type RuleResult<T> = Result<T, RuleError>;

/// Result type for transport calls.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors raised while validating or registering compiled rules.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleError {
    /// The rule has an empty name.
    #[error("rule name must not be empty")]
    EmptyName,

    /// The rule has no when-patterns.
    #[error("rule {rule} has no when patterns")]
    EmptyWhen {
        /// Rule name.
        rule: String,
    },

    /// The rule has no then-templates.
    #[error("rule {rule} has no then templates")]
    EmptyThen {
        /// Rule name.
        rule: String,
    },

    /// A variable is used before anything binds it.
    #[error("rule {rule} references unbound variable ?{variable}")]
    UnboundVariable {
        /// Rule name.
        rule: String,
        /// Variable name.
        variable: String,
    },

    /// A then-template field is a wildcard.
    #[error("rule {rule} assigns a wildcard to then field {field}")]
    WildcardInTemplate {
        /// Rule name.
        rule: String,
        /// Field name.
        field: String,
    },

    /// A then-template targets the `*` action.
    #[error("rule {rule} invokes wildcard action on {service}")]
    WildcardAction {
        /// Rule name.
        rule: String,
        /// Target service.
        service: String,
    },

    /// A rule with this name is already registered.
    #[error("rule {name} is already registered")]
    DuplicateRule {
        /// Rule name.
        name: String,
    },
}

/// Errors returned by a [`crate::Transport`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The service cannot be reached right now.
    #[error("service {service} is unavailable")]
    Unavailable {
        /// Service name.
        service: String,
    },

    /// The call failed.
    #[error("transport error: {message}")]
    Failed {
        /// Error message.
        message: String,
        /// Whether the call can be retried.
        retryable: bool,
    },

    /// The transport does not implement this operation.
    #[error("{operation} is not supported by this transport")]
    Unsupported {
        /// Operation name.
        operation: String,
    },

    /// The call was cancelled.
    #[error("call cancelled")]
    Cancelled,
}

impl TransportError {
    /// Creates an unavailability error.
    pub fn unavailable(service: impl Into<String>) -> Self {
        Self::Unavailable {
            service: service.into(),
        }
    }

    /// Creates a retryable failure.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable failure.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates an unsupported-operation error.
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    /// Returns true if the service is unreachable rather than failing.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Returns true if this error can be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Failed { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

/// Errors returned by engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The action log failed; the triggering request must be retried.
    #[error("log error: {0}")]
    Log(#[from] LogError),

    /// A rule was rejected.
    #[error("rule error: {0}")]
    Rule(#[from] RuleError),

    /// A transport call failed where the caller needs the result.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Invalid pending-rule state transition.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// No pending rule with this id.
    #[error("pending rule {0} not found")]
    PendingNotFound(PendingId),

    /// No service registered under this name.
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// A single call processed more completions than allowed.
    #[error("flow {flow} exceeded its step budget of {limit} completions")]
    StepBudgetExceeded {
        /// Flow being processed.
        flow: FlowId,
        /// Configured budget.
        limit: usize,
    },

    /// A record handed to the engine has the wrong shape.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// Processing was cancelled by engine shutdown.
    #[error("engine shut down")]
    Cancelled,
}

impl EngineError {
    /// Returns true if the caller should retry the request unchanged.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Log(err) => err.is_storage_fault(),
            Self::Transport(err) => err.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_classification() {
        assert!(TransportError::unavailable("Cart").is_unavailable());
        assert!(!TransportError::unavailable("Cart").is_retryable());
        assert!(TransportError::retryable("connection reset").is_retryable());
        assert!(!TransportError::fatal("bad request").is_retryable());
        assert!(!TransportError::Cancelled.is_retryable());
    }

    #[test]
    fn engine_retryable() {
        assert!(EngineError::Log(LogError::storage("disk full")).is_retryable());
        assert!(!EngineError::UnknownService("X".into()).is_retryable());
        assert!(EngineError::from(TransportError::retryable("reset")).is_retryable());
    }

    #[test]
    fn error_display() {
        let err = RuleError::UnboundVariable {
            rule: "Checkout".into(),
            variable: "cart".into(),
        };
        assert_eq!(err.to_string(), "rule Checkout references unbound variable ?cart");

        let err = EngineError::InvalidStateTransition {
            from: "Delivered".into(),
            to: "Queued".into(),
        };
        assert!(err.to_string().contains("Delivered"));
    }
}
