//! Engine configuration.

use std::time::Duration;
use syncflow_log::RecordId;

use crate::error::TransportError;

/// Configuration for one engine instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Engine name, used in logs and hierarchy placement.
    pub name: String,
    /// Retry policy for invocation dispatch.
    pub retry: RetryConfig,
    /// Maximum completions processed by a single call before it stops with
    /// [`crate::EngineError::StepBudgetExceeded`].
    pub max_flow_steps: usize,
    /// Whether rule outcomes are recorded for [`crate::Engine::trace`].
    pub journal_evaluations: bool,
    /// Buffer size for log watchers and service completion streams.
    pub subscription_buffer: usize,
    /// Quiescent flows whose evaluation journal is kept for tracing; older
    /// ones are evicted first.
    pub max_retained_flows: usize,
}

impl EngineConfig {
    /// Creates a configuration with defaults and the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retry: RetryConfig::default(),
            max_flow_steps: 10_000,
            journal_evaluations: true,
            subscription_buffer: 1024,
            max_retained_flows: 10_000,
        }
    }

    /// Sets the dispatch retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the per-call step budget.
    #[must_use]
    pub fn with_max_flow_steps(mut self, steps: usize) -> Self {
        self.max_flow_steps = steps;
        self
    }

    /// Enables or disables the evaluation journal.
    #[must_use]
    pub fn with_journal_evaluations(mut self, enabled: bool) -> Self {
        self.journal_evaluations = enabled;
        self
    }

    /// Sets the subscription buffer size.
    #[must_use]
    pub fn with_subscription_buffer(mut self, buffer: usize) -> Self {
        self.subscription_buffer = buffer;
        self
    }

    /// Sets how many quiescent flows keep their evaluation journal.
    #[must_use]
    pub fn with_max_retained_flows(mut self, flows: usize) -> Self {
        self.max_retained_flows = flows;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new("engine")
    }
}

/// How a failed dispatch is retried before the failure is routed.
///
/// Only transient failures are retried: `Failed` errors marked retryable,
/// and `Unavailable` when `retry_unavailable` is set so a short flap does
/// not hold or fail the invocation. Cancellation and unsupported calls are
/// never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Attempts per invocation, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles after each one.
    pub initial_delay: Duration,
    /// Cap on a single delay.
    pub max_delay: Duration,
    /// Whether `Unavailable` is retried before giving up on the service.
    pub retry_unavailable: bool,
    /// Whether delays are stretched by up to a quarter. The stretch is
    /// derived from the invocation id, so a given retry always waits the
    /// same time while concurrent invocations spread out.
    pub jitter: bool,
}

impl RetryConfig {
    /// Creates a configuration allowing `max_attempts` attempts.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            retry_unavailable: false,
            jitter: true,
        }
    }

    /// Creates a configuration with a single attempt.
    pub fn no_retry() -> Self {
        Self::new(1).with_jitter(false)
    }

    /// Sets the delay before the first retry.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Retries `Unavailable` too.
    #[must_use]
    pub fn with_retry_unavailable(mut self, retry: bool) -> Self {
        self.retry_unavailable = retry;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Returns true if errors of this class are worth another attempt.
    #[must_use]
    pub fn retries(&self, err: &TransportError) -> bool {
        match err {
            TransportError::Unavailable { .. } => self.retry_unavailable,
            other => other.is_retryable(),
        }
    }

    /// Returns the wait before the next attempt at `invocation`, given the
    /// attempts made so far, or `None` once the error is final.
    #[must_use]
    pub fn next_delay(
        &self,
        err: &TransportError,
        attempts: u32,
        invocation: RecordId,
    ) -> Option<Duration> {
        if attempts >= self.max_attempts || !self.retries(err) {
            return None;
        }
        let factor = 1u32.checked_shl(attempts.saturating_sub(1)).unwrap_or(u32::MAX);
        let delay = self.initial_delay.saturating_mul(factor).min(self.max_delay);
        if !self.jitter {
            return Some(delay);
        }
        let bits = invocation.as_uuid().as_u128();
        let spread = ((bits >> 64) as u64 ^ bits as u64).rotate_left(attempts) % 1000;
        Some(delay + delay.mul_f64(0.25 * spread as f64 / 1000.0))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_builder() {
        let config = EngineConfig::new("edge-1")
            .with_max_flow_steps(50)
            .with_journal_evaluations(false)
            .with_subscription_buffer(8)
            .with_max_retained_flows(3)
            .with_retry(RetryConfig::no_retry());

        assert_eq!(config.name, "edge-1");
        assert_eq!(config.max_flow_steps, 50);
        assert!(!config.journal_evaluations);
        assert_eq!(config.subscription_buffer, 8);
        assert_eq!(config.max_retained_flows, 3);
        assert_eq!(config.retry.max_attempts, 1);
    }

    #[test]
    fn only_transient_errors_are_retried() {
        let retry = RetryConfig::new(3).with_jitter(false);
        let id = RecordId::new();
        assert!(retry.next_delay(&TransportError::retryable("busy"), 1, id).is_some());
        assert!(retry.next_delay(&TransportError::fatal("bad"), 1, id).is_none());
        assert!(retry.next_delay(&TransportError::Cancelled, 1, id).is_none());
        assert!(retry.next_delay(&TransportError::unsupported("query"), 1, id).is_none());
        assert!(retry.next_delay(&TransportError::unavailable("B"), 1, id).is_none());

        let retry = retry.with_retry_unavailable(true);
        assert!(retry.next_delay(&TransportError::unavailable("B"), 1, id).is_some());
        assert!(retry.next_delay(&TransportError::unavailable("B"), 3, id).is_none());
        assert!(RetryConfig::no_retry()
            .next_delay(&TransportError::retryable("busy"), 1, id)
            .is_none());
    }

    #[test]
    fn delays_double_up_to_the_cap() {
        let retry = RetryConfig::new(10)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(500))
            .with_jitter(false);
        let err = TransportError::retryable("busy");
        let id = RecordId::new();
        let delays: Vec<_> = (1..6).filter_map(|n| retry.next_delay(&err, n, id)).collect();
        assert_eq!(
            delays,
            [100, 200, 400, 500, 500].map(Duration::from_millis).to_vec()
        );
        assert_eq!(retry.next_delay(&err, 40, id), None);
        assert_eq!(
            RetryConfig::new(100)
                .with_max_delay(Duration::from_secs(1))
                .with_jitter(false)
                .next_delay(&err, 60, id),
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn jitter_is_stable_per_invocation_and_bounded() {
        let retry = RetryConfig::new(5).with_initial_delay(Duration::from_millis(100));
        let err = TransportError::retryable("busy");
        for _ in 0..32 {
            let id = RecordId::new();
            let first = retry.next_delay(&err, 1, id).unwrap();
            assert_eq!(retry.next_delay(&err, 1, id), Some(first));
            assert!(first >= Duration::from_millis(100));
            assert!(first <= Duration::from_millis(125));
        }
    }
}
