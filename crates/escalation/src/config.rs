//! Escalation engine configuration.

use std::time::Duration;

use crate::registry::DuplicatePolicy;

/// If nobody acts on a case within this window it is forwarded automatically.
pub const DEFAULT_ESCALATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Escalation configuration.
#[derive(Debug, Clone)]
pub struct EscalationConfig {
    /// Time without action before a case auto-forwards
    pub escalation_timeout: Duration,
    /// Treatment of firings for an already-tracked correlation ID
    pub duplicate_policy: DuplicatePolicy,
    /// Capacity of the dispatch queue
    pub queue_capacity: usize,
    /// How long resolved cases are kept for late events
    pub resolved_retention: Duration,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            escalation_timeout: DEFAULT_ESCALATION_TIMEOUT,
            duplicate_policy: DuplicatePolicy::FirstFiringWins,
            queue_capacity: 500,
            resolved_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}
