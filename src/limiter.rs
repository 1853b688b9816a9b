use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tracing::info;

use crate::{
    clock::Clock,
    decision::Decision,
    error::{GatekeeperError, Result},
    local::LocalLimiterRegistry,
    metrics::Metrics,
    policy::{RoutePolicy, TokenBucketPolicy, DEFAULT_IDLE_TTL},
    shared::{SharedCounterLimiter, DEFAULT_KEY_PREFIX, DEFAULT_STORE_TIMEOUT},
    store::CounterStore,
};

/// Common interface of the local and shared backends
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Admit or deny one request for the identity `key`
    async fn allow(&self, key: &str) -> Result<Decision>;

    /// Capacity advertised to callers
    fn capacity(&self) -> u64;

    /// Backend label for logs and metrics
    fn backend(&self) -> &'static str;
}

/// Everything a limiter needs besides its policy
#[derive(Clone)]
pub struct LimiterOptions {
    pub clock: Arc<dyn Clock>,
    pub key_prefix: String,
    pub store_timeout: Duration,
    pub deny_cache_size: u64,
    pub metrics: Option<Metrics>,
}

impl LimiterOptions {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            deny_cache_size: 0,
            metrics: None,
        }
    }
}

/// Limiter chosen for a route at startup
#[derive(Clone)]
pub enum SelectedLimiter {
    Local(Arc<LocalLimiterRegistry>),
    Shared(Arc<SharedCounterLimiter>),
}

impl SelectedLimiter {
    pub fn limiter(&self) -> Arc<dyn Limiter> {
        match self {
            SelectedLimiter::Local(registry) => registry.clone(),
            SelectedLimiter::Shared(shared) => shared.clone(),
        }
    }

    /// The local registry, which the sweeper must own
    pub fn local_registry(&self) -> Option<Arc<LocalLimiterRegistry>> {
        match self {
            SelectedLimiter::Local(registry) => Some(registry.clone()),
            SelectedLimiter::Shared(_) => None,
        }
    }
}

/// Pick the backend for a route.
///
/// A reachable shared store wins whenever the route has a fixed window, so all
/// instances enforce one limit. Otherwise the route gets a local token bucket,
/// derived from its window if it declared no bucket of its own.
pub fn select_limiter(
    policy: &RoutePolicy,
    store: Option<&Arc<dyn CounterStore>>,
    options: &LimiterOptions,
) -> Result<SelectedLimiter> {
    if let (Some(store), Some(window)) = (store, policy.fixed_window()) {
        let mut shared = SharedCounterLimiter::new(store.clone(), window, options.clock.clone())
            .with_key_prefix(options.key_prefix.clone())
            .with_timeout(options.store_timeout)
            .with_deny_cache(options.deny_cache_size);
        if let Some(metrics) = &options.metrics {
            shared = shared.with_metrics(metrics.clone());
        }
        return Ok(SelectedLimiter::Shared(Arc::new(shared)));
    }

    let bucket = match (policy.token_bucket(), policy.fixed_window()) {
        (Some(bucket), _) => bucket,
        (None, Some(window)) => {
            info!(
                limit = window.limit(),
                window = ?window.window(),
                "No shared store; deriving a token bucket from the fixed window"
            );
            TokenBucketPolicy::from_window(&window, DEFAULT_IDLE_TTL)?
        }
        (None, None) => {
            return Err(GatekeeperError::InvalidPolicy(
                "route declares neither a token bucket nor a fixed window".to_string(),
            ))
        }
    };

    Ok(SelectedLimiter::Local(Arc::new(LocalLimiterRegistry::new(
        bucket,
        options.clock.clone(),
    ))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        policy::FixedWindowPolicy,
        store::MemoryCounterStore,
    };

    fn options() -> LimiterOptions {
        LimiterOptions::new(Arc::new(ManualClock::new()))
    }

    fn window() -> FixedWindowPolicy {
        FixedWindowPolicy::new(5, Duration::from_secs(60)).unwrap()
    }

    fn bucket() -> TokenBucketPolicy {
        TokenBucketPolicy::new(2.0, 4, Duration::from_secs(1800)).unwrap()
    }

    #[test]
    fn test_prefers_shared_store() {
        let options = options();
        let store: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new(options.clock.clone()));
        let policy = RoutePolicy::new(Some(bucket()), Some(window())).unwrap();

        let selected = select_limiter(&policy, Some(&store), &options).unwrap();
        assert_eq!(selected.limiter().backend(), "shared");
        assert_eq!(selected.limiter().capacity(), 5);
        assert!(selected.local_registry().is_none());
    }

    #[test]
    fn test_falls_back_to_local_bucket() {
        let policy = RoutePolicy::new(Some(bucket()), Some(window())).unwrap();

        let selected = select_limiter(&policy, None, &options()).unwrap();
        assert_eq!(selected.limiter().backend(), "local");
        assert_eq!(selected.limiter().capacity(), 4);
        assert!(selected.local_registry().is_some());
    }

    #[test]
    fn test_bucket_only_route_stays_local_with_store() {
        let options = options();
        let store: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new(options.clock.clone()));
        let policy = RoutePolicy::new(Some(bucket()), None).unwrap();

        let selected = select_limiter(&policy, Some(&store), &options).unwrap();
        assert_eq!(selected.limiter().backend(), "local");
    }

    #[test]
    fn test_window_only_route_derives_bucket() {
        let policy = RoutePolicy::new(None, Some(window())).unwrap();

        let selected = select_limiter(&policy, None, &options()).unwrap();
        let registry = selected.local_registry().unwrap();
        assert_eq!(registry.policy().burst(), 5);
        assert_eq!(registry.policy().idle_ttl(), DEFAULT_IDLE_TTL);
    }
}
