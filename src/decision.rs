use std::time::{Duration, Instant};

/// Outcome of a single admission check.
///
/// Both backends return this; a denial is a normal value, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    /// Requests still admissible right now
    pub remaining: u64,
    /// Capacity of the policy that produced this decision
    pub limit: u64,
    /// When quota is next available (denied) or fully restored (allowed)
    pub reset_at: Instant,
}

impl Decision {
    pub fn allowed(remaining: u64, limit: u64, reset_at: Instant) -> Self {
        Self {
            allowed: true,
            remaining,
            limit,
            reset_at,
        }
    }

    pub fn denied(limit: u64, reset_at: Instant) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            limit,
            reset_at,
        }
    }

    /// Time left until `reset_at`, zero if already passed
    pub fn retry_after(&self, now: Instant) -> Duration {
        self.reset_at.saturating_duration_since(now)
    }
}
