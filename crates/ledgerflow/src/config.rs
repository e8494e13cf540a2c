//! Engine configuration.

use std::time::Duration;

/// Configuration for the state machine manager and its flows.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use ledgerflow::{FlowTimeoutConfig, StateMachineConfig};
///
/// let config = StateMachineConfig {
///     flow_timeout: FlowTimeoutConfig {
///         timeout: Duration::from_secs(10),
///         ..Default::default()
///     },
///     ..Default::default()
/// };
/// assert_eq!(config.flow_timeout.timeout, Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct StateMachineConfig {
    /// Timed-retry behavior for flows that opt into flow timeouts.
    pub flow_timeout: FlowTimeoutConfig,

    /// Reload every checkpoint from storage after each suspension.
    ///
    /// Surfaces checkpoint serialization bugs immediately instead of at the
    /// next restart. A checkpoint that fails to reload under this mode is a
    /// hard failure for the affected flow.
    pub reload_checkpoint_after_suspend: bool,

    /// How many times the hospital discharges the same constraint-violation
    /// error at the same suspension point before letting it propagate.
    pub duplicate_discharge_limit: u32,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            flow_timeout: FlowTimeoutConfig::default(),
            reload_checkpoint_after_suspend: false,
            duplicate_discharge_limit: 3,
        }
    }
}

/// Timed-flow retry configuration.
///
/// A timed flow that has not progressed within `timeout` receives a
/// timeout error, which the hospital treats as a retry from the last safe
/// checkpoint. Each retry backs off exponentially with jitter:
///
/// `delay = max(1, (1 + rand) * timeout * backoff_base^min(retries, max_restart_count) / 2)`
#[derive(Debug, Clone)]
pub struct FlowTimeoutConfig {
    /// Base timeout before the first retry.
    pub timeout: Duration,

    /// Exponent cap for the backoff. Retries beyond this count keep the
    /// maximum delay rather than growing further.
    pub max_restart_count: u32,

    /// Exponential backoff base.
    pub backoff_base: f64,
}

impl Default for FlowTimeoutConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_restart_count: 6,
            backoff_base: 1.8,
        }
    }
}
