//! In-process token buckets, one per identity.
//!
//! Entries live in a sharded [`DashMap`]: a request for one identity only locks
//! the shard holding that identity, and only for the refill arithmetic.

use async_trait::async_trait;
use dashmap::DashMap;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, trace};

use crate::{
    clock::Clock,
    decision::Decision,
    error::Result,
    limiter::Limiter,
    policy::TokenBucketPolicy,
};

/// Longest reset hint handed out; keeps `Instant` arithmetic in range for tiny rates
const MAX_RESET_HINT_SECS: f64 = 86_400.0;

/// Token-bucket state for a single identity
#[derive(Debug, Clone)]
struct BucketEntry {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl BucketEntry {
    fn new(burst: u32, now: Instant) -> Self {
        Self {
            tokens: burst as f64,
            last_refill: now,
            last_seen: now,
        }
    }

    /// Refill for the time elapsed since the last call, then try to take one token.
    fn try_acquire(&mut self, policy: &TokenBucketPolicy, now: Instant) -> Decision {
        let rate = policy.rate_per_second();
        let burst = policy.burst() as f64;

        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        self.last_refill = self.last_refill.max(now);
        self.last_seen = self.last_seen.max(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            let until_full = (burst - self.tokens) / rate;
            Decision::allowed(
                self.tokens.floor() as u64,
                policy.burst() as u64,
                instant_after(now, until_full),
            )
        } else {
            let until_token = (1.0 - self.tokens) / rate;
            Decision::denied(policy.burst() as u64, instant_after(now, until_token))
        }
    }

    fn is_idle(&self, now: Instant, idle_ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > idle_ttl
    }
}

fn instant_after(now: Instant, secs: f64) -> Instant {
    Duration::try_from_secs_f64(secs.min(MAX_RESET_HINT_SECS))
        .ok()
        .and_then(|d| now.checked_add(d))
        .unwrap_or(now)
}

/// Registry of per-identity token buckets sharing one policy
pub struct LocalLimiterRegistry {
    entries: DashMap<String, BucketEntry>,
    policy: TokenBucketPolicy,
    clock: Arc<dyn Clock>,
}

impl LocalLimiterRegistry {
    pub fn new(policy: TokenBucketPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> &TokenBucketPolicy {
        &self.policy
    }

    /// Admit or deny one request for `key`.
    ///
    /// Creates the bucket on first use. Refill and decrement happen under the
    /// shard lock, so concurrent calls for the same key never spend the same token.
    pub fn check(&self, key: &str) -> Decision {
        let now = self.clock.now();

        if let Some(mut entry) = self.entries.get_mut(key) {
            let decision = entry.try_acquire(&self.policy, now);
            trace!(key, allowed = decision.allowed, remaining = decision.remaining, "Local bucket checked");
            return decision;
        }

        let mut entry = self.entries.entry(key.to_owned()).or_insert_with(|| {
            debug!(key, burst = self.policy.burst(), "Creating token bucket");
            BucketEntry::new(self.policy.burst(), now)
        });
        entry.try_acquire(&self.policy, now)
    }

    /// Evict identities idle for longer than the policy's `idle_ttl`.
    ///
    /// Scans shard by shard under read locks, then removes the collected keys one
    /// at a time. Removal re-checks idleness, so a key touched after the scan stays.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let idle = self.idle_keys(now);
        self.evict(idle, now)
    }

    fn idle_keys(&self, now: Instant) -> Vec<String> {
        let idle_ttl = self.policy.idle_ttl();
        self.entries
            .iter()
            .filter(|entry| entry.value().is_idle(now, idle_ttl))
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn evict(&self, keys: Vec<String>, now: Instant) -> usize {
        let idle_ttl = self.policy.idle_ttl();
        keys.into_iter()
            .filter(|key| {
                self.entries
                    .remove_if(key, |_, entry| entry.is_idle(now, idle_ttl))
                    .is_some()
            })
            .count()
    }

    /// Number of identities currently tracked
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

#[async_trait]
impl Limiter for LocalLimiterRegistry {
    async fn allow(&self, key: &str) -> Result<Decision> {
        Ok(self.check(key))
    }

    fn capacity(&self) -> u64 {
        self.policy.burst() as u64
    }

    fn backend(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn registry(rate: f64, burst: u32, idle_ttl: Duration) -> (Arc<LocalLimiterRegistry>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let policy = TokenBucketPolicy::new(rate, burst, idle_ttl).unwrap();
        (Arc::new(LocalLimiterRegistry::new(policy, clock.clone())), clock)
    }

    #[test]
    fn test_burst_then_deny() {
        let (registry, _clock) = registry(2.0, 2, Duration::from_secs(60));

        let outcomes: Vec<bool> = (0..5).map(|_| registry.check("ip:127.0.0.1").allowed).collect();
        assert_eq!(outcomes, vec![true, true, false, false, false]);
    }

    #[test]
    fn test_partial_refill_after_denial() {
        let (registry, clock) = registry(2.0, 2, Duration::from_secs(60));

        for _ in 0..5 {
            registry.check("user:7");
        }

        clock.advance(Duration::from_millis(500));
        assert!(registry.check("user:7").allowed);
        assert!(!registry.check("user:7").allowed);
    }

    #[test]
    fn test_remaining_counts_down() {
        let (registry, _clock) = registry(1.0, 3, Duration::from_secs(60));

        assert_eq!(registry.check("k").remaining, 2);
        assert_eq!(registry.check("k").remaining, 1);
        assert_eq!(registry.check("k").remaining, 0);

        let denied = registry.check("k");
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.limit, 3);
    }

    #[test]
    fn test_reset_hints() {
        let (registry, clock) = registry(2.0, 2, Duration::from_secs(60));
        let now = clock.now();

        let first = registry.check("k");
        assert_eq!(first.retry_after(now), Duration::from_millis(500));

        registry.check("k");
        let denied = registry.check("k");
        assert_eq!(denied.retry_after(now), Duration::from_millis(500));

        clock.advance(Duration::from_millis(250));
        let still_denied = registry.check("k");
        assert!(!still_denied.allowed);
        assert_eq!(still_denied.retry_after(clock.now()), Duration::from_millis(250));
    }

    #[test]
    fn test_refill_caps_at_burst() {
        let (registry, clock) = registry(10.0, 2, Duration::from_secs(3600));

        registry.check("k");
        clock.advance(Duration::from_secs(60));

        let outcomes: Vec<bool> = (0..3).map(|_| registry.check("k").allowed).collect();
        assert_eq!(outcomes, vec![true, true, false]);
    }

    #[test]
    fn test_keys_are_independent() {
        let (registry, _clock) = registry(1.0, 1, Duration::from_secs(60));

        assert!(registry.check("ip:10.0.0.1").allowed);
        assert!(!registry.check("ip:10.0.0.1").allowed);
        assert!(registry.check("ip:10.0.0.2").allowed);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_sweep_evicts_idle_entries() {
        let (registry, clock) = registry(1.0, 2, Duration::from_secs(30));

        registry.check("stale");
        registry.check("stale");
        assert!(!registry.check("stale").allowed);

        clock.advance(Duration::from_secs(20));
        registry.check("fresh");

        clock.advance(Duration::from_secs(11));
        assert_eq!(registry.sweep(), 1);
        assert!(!registry.contains("stale"));
        assert!(registry.contains("fresh"));

        // A returning identity starts over with a full bucket
        let decision = registry.check("stale");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
    }

    #[test]
    fn test_sweep_keeps_entries_at_exact_ttl() {
        let (registry, clock) = registry(1.0, 1, Duration::from_secs(30));

        registry.check("k");
        clock.advance(Duration::from_secs(30));
        assert_eq!(registry.sweep(), 0);
        assert!(registry.contains("k"));
    }

    #[test]
    fn test_entry_touched_after_scan_survives() {
        let (registry, clock) = registry(1.0, 1, Duration::from_secs(30));

        registry.check("k");
        registry.check("other");
        clock.advance(Duration::from_secs(31));

        let scanned_at = clock.now();
        let mut idle = registry.idle_keys(scanned_at);
        idle.sort();
        assert_eq!(idle, vec!["k".to_string(), "other".to_string()]);

        // Request lands between the scan and the delete
        clock.advance(Duration::from_millis(10));
        assert!(registry.check("k").allowed);

        assert_eq!(registry.evict(idle, scanned_at), 1);
        assert!(registry.contains("k"));
        assert!(!registry.contains("other"));
    }

    #[test]
    fn test_denied_requests_keep_entry_alive() {
        let (registry, clock) = registry(0.01, 1, Duration::from_secs(30));

        registry.check("k");
        clock.advance(Duration::from_secs(25));
        assert!(!registry.check("k").allowed);
        clock.advance(Duration::from_secs(25));

        assert_eq!(registry.sweep(), 0);
        assert!(registry.contains("k"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_never_exceed_burst() {
        let (registry, _clock) = registry(1.0, 10, Duration::from_secs(60));

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.check("user:42").allowed })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_keys_do_not_interfere() {
        let (registry, _clock) = registry(1.0, 5, Duration::from_secs(60));

        let handles: Vec<_> = (0..200)
            .map(|i| {
                let registry = registry.clone();
                let key = format!("user:{}", i % 4);
                tokio::spawn(async move { (key.clone(), registry.check(&key).allowed) })
            })
            .collect();

        let mut admitted = std::collections::HashMap::new();
        for handle in handles {
            let (key, allowed) = handle.await.unwrap();
            if allowed {
                *admitted.entry(key).or_insert(0) += 1;
            }
        }

        assert_eq!(admitted.len(), 4);
        assert!(admitted.values().all(|&count| count == 5));
    }

    #[tokio::test]
    async fn test_limiter_trait_never_errors() {
        let (registry, _clock) = registry(1.0, 1, Duration::from_secs(60));
        let limiter: Arc<dyn Limiter> = registry;

        tokio_test::assert_ok!(limiter.allow("k").await);
        let denied = tokio_test::assert_ok!(limiter.allow("k").await);
        assert!(!denied.allowed);
        assert_eq!(limiter.backend(), "local");
        assert_eq!(limiter.capacity(), 1);
    }
}
