use std::time::Duration;

use crate::error::{GatekeeperError, Result};

/// Token-bucket policy for the in-process registry.
///
/// Immutable once built; `new` rejects values that would make the bucket
/// meaningless.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketPolicy {
    rate_per_second: f64,
    burst: u32,
    idle_ttl: Duration,
}

impl TokenBucketPolicy {
    pub fn new(rate_per_second: f64, burst: u32, idle_ttl: Duration) -> Result<Self> {
        if !rate_per_second.is_finite() || rate_per_second <= 0.0 {
            return Err(GatekeeperError::InvalidPolicy(format!(
                "rate_per_second must be a positive number, got {}",
                rate_per_second
            )));
        }
        if burst < 1 {
            return Err(GatekeeperError::InvalidPolicy(
                "burst must be at least 1".to_string(),
            ));
        }
        if idle_ttl.is_zero() {
            return Err(GatekeeperError::InvalidPolicy(
                "idle_ttl must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            rate_per_second,
            burst,
            idle_ttl,
        })
    }

    /// Token bucket that sustains the same average rate as a fixed window.
    ///
    /// Used when a route only declares a window and no shared store is reachable.
    pub fn from_window(window: &FixedWindowPolicy, idle_ttl: Duration) -> Result<Self> {
        let rate = window.limit() as f64 / window.window().as_secs_f64();
        Self::new(rate, window.limit(), idle_ttl)
    }

    pub fn rate_per_second(&self) -> f64 {
        self.rate_per_second
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    pub fn idle_ttl(&self) -> Duration {
        self.idle_ttl
    }
}

/// Longest window a fixed-window policy accepts
pub const MAX_WINDOW: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Fixed-window counter policy for the shared store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindowPolicy {
    limit: u32,
    window: Duration,
}

impl FixedWindowPolicy {
    pub fn new(limit: u32, window: Duration) -> Result<Self> {
        if limit < 1 {
            return Err(GatekeeperError::InvalidPolicy(
                "limit must be at least 1".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(GatekeeperError::InvalidPolicy(
                "window must be greater than zero".to_string(),
            ));
        }
        if window > MAX_WINDOW {
            return Err(GatekeeperError::InvalidPolicy(format!(
                "window must be at most {}s, got {}s",
                MAX_WINDOW.as_secs(),
                window.as_secs()
            )));
        }

        Ok(Self { limit, window })
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Idle timeout for buckets derived from a fixed window
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(30 * 60);

/// Policies bound to one route; at least one is present
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoutePolicy {
    token_bucket: Option<TokenBucketPolicy>,
    fixed_window: Option<FixedWindowPolicy>,
}

impl RoutePolicy {
    pub fn new(
        token_bucket: Option<TokenBucketPolicy>,
        fixed_window: Option<FixedWindowPolicy>,
    ) -> Result<Self> {
        if token_bucket.is_none() && fixed_window.is_none() {
            return Err(GatekeeperError::InvalidPolicy(
                "route declares neither a token bucket nor a fixed window".to_string(),
            ));
        }

        Ok(Self {
            token_bucket,
            fixed_window,
        })
    }

    pub fn token_bucket(&self) -> Option<TokenBucketPolicy> {
        self.token_bucket
    }

    pub fn fixed_window(&self) -> Option<FixedWindowPolicy> {
        self.fixed_window
    }
}
