//! Fixed-window counting over a shared [`CounterStore`].
//!
//! The window is the counter's TTL, not a calendar-aligned bucket: a client can
//! get up to twice the limit through when bursts straddle an expiry.

use async_trait::async_trait;
use moka::{future::Cache, Expiry};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, trace};

use crate::{
    clock::Clock,
    decision::Decision,
    error::{GatekeeperError, Result},
    limiter::Limiter,
    metrics::Metrics,
    policy::FixedWindowPolicy,
    store::CounterStore,
};

pub const DEFAULT_KEY_PREFIX: &str = "rate_limit:";
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(100);

/// An identity already over its limit until `reset_at`
#[derive(Debug, Clone, Copy)]
struct DeniedWindow {
    reset_at: Instant,
    ttl: Duration,
}

struct DeniedWindowExpiry;

impl Expiry<String, DeniedWindow> for DeniedWindowExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &DeniedWindow,
        _current_time: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Stateless fixed-window limiter; all counting happens in the store
pub struct SharedCounterLimiter {
    store: Arc<dyn CounterStore>,
    policy: FixedWindowPolicy,
    clock: Arc<dyn Clock>,
    key_prefix: String,
    timeout: Duration,
    deny_cache: Option<Cache<String, DeniedWindow>>,
    metrics: Option<Metrics>,
}

impl SharedCounterLimiter {
    pub fn new(store: Arc<dyn CounterStore>, policy: FixedWindowPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            policy,
            clock,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            timeout: DEFAULT_STORE_TIMEOUT,
            deny_cache: None,
            metrics: None,
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Upper bound on one store round trip; exceeding it is a store failure
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Remember denied identities locally until their window resets.
    ///
    /// A capacity of zero leaves the cache off.
    pub fn with_deny_cache(mut self, capacity: u64) -> Self {
        self.deny_cache = (capacity > 0).then(|| {
            Cache::builder()
                .max_capacity(capacity)
                .expire_after(DeniedWindowExpiry)
                .build()
        });
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn policy(&self) -> &FixedWindowPolicy {
        &self.policy
    }

    /// Storage key for an identity
    pub fn storage_key(&self, identity: &str) -> String {
        format!("{}{}", self.key_prefix, identity)
    }

    /// Count one request for `identity` against the current window.
    ///
    /// Store errors and timeouts are returned, never turned into a decision.
    pub async fn check(&self, identity: &str) -> Result<Decision> {
        let key = self.storage_key(identity);
        let limit = self.policy.limit() as u64;

        if let Some(cache) = &self.deny_cache {
            if let Some(denied) = cache.get(&key).await {
                if denied.reset_at > self.clock.now() {
                    trace!(key = %key, "Denied from local cache");
                    if let Some(metrics) = &self.metrics {
                        metrics.record_deny_cache_hit();
                    }
                    return Ok(Decision::denied(limit, denied.reset_at));
                }
                // Window already reset by our clock; ask the store again
                cache.invalidate(&key).await;
            }
        }

        let window = {
            let _timer = self.metrics.as_ref().map(Metrics::start_store_timer);
            tokio::time::timeout(
                self.timeout,
                self.store.increment_with_expiry(&key, self.policy.window()),
            )
            .await
            .map_err(|_| GatekeeperError::StoreTimeout(self.timeout))??
        };

        let now = self.clock.now();
        let ttl = window.ttl.unwrap_or_else(|| self.policy.window());
        let reset_at = now.checked_add(ttl).unwrap_or(now);

        let count = u64::try_from(window.count).unwrap_or(0);
        if count <= limit {
            return Ok(Decision::allowed(limit - count, limit, reset_at));
        }

        debug!(key = %key, count, limit, "Fixed window exhausted");
        if let Some(cache) = &self.deny_cache {
            cache.insert(key, DeniedWindow { reset_at, ttl }).await;
        }
        Ok(Decision::denied(limit, reset_at))
    }

    pub async fn health_check(&self) -> Result<()> {
        self.store.health_check().await
    }
}

#[async_trait]
impl Limiter for SharedCounterLimiter {
    async fn allow(&self, key: &str) -> Result<Decision> {
        self.check(key).await
    }

    fn capacity(&self) -> u64 {
        self.policy.limit() as u64
    }

    fn backend(&self) -> &'static str {
        "shared"
    }
}
