//! Shared counter store seam.
//!
//! The fixed-window limiter only needs one primitive from its store: bump a
//! counter and make sure it expires. Redis provides it in production; the
//! in-memory store serves tests and single-instance deployments.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{clock::Clock, error::Result};

/// Counter value after an increment, plus the time left on its expiry if known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    pub count: i64,
    pub ttl: Option<Duration>,
}

/// Atomic increment-with-expiry store
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key` and set its expiry to `window` if it has none.
    ///
    /// The increment is atomic per key. The expiry is best effort and not
    /// atomic with the increment.
    async fn increment_with_expiry(&self, key: &str, window: Duration) -> Result<WindowCount>;

    /// Health check for the store
    async fn health_check(&self) -> Result<()>;
}

#[derive(Debug)]
struct MemoryWindow {
    count: i64,
    expires_at: Instant,
}

/// Process-local [`CounterStore`] driven by a [`Clock`]
#[derive(Debug)]
pub struct MemoryCounterStore {
    windows: Mutex<HashMap<String, MemoryWindow>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Current count for `key`, `None` once expired
    pub fn count(&self, key: &str) -> Option<i64> {
        let now = self.clock.now();
        self.windows
            .lock()
            .get(key)
            .filter(|window| window.expires_at > now)
            .map(|window| window.count)
    }

    /// Counters held, expired or not
    pub fn len(&self) -> usize {
        self.windows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.lock().is_empty()
    }

    /// Drop expired counters, returning how many were removed.
    ///
    /// Nothing else removes entries; long-lived stores should be handed to a
    /// [`SweeperHandle`](crate::sweeper::SweeperHandle).
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, window| window.expires_at > now);
        before - windows.len()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment_with_expiry(&self, key: &str, window: Duration) -> Result<WindowCount> {
        let now = self.clock.now();
        let mut windows = self.windows.lock();

        let expires_at = now.checked_add(window).unwrap_or(now);
        let entry = windows
            .entry(key.to_owned())
            .or_insert(MemoryWindow { count: 0, expires_at });
        if entry.expires_at <= now {
            *entry = MemoryWindow { count: 0, expires_at };
        }
        entry.count += 1;

        Ok(WindowCount {
            count: entry.count,
            ttl: Some(entry.expires_at.saturating_duration_since(now)),
        })
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn test_counts_within_window() {
        let clock = Arc::new(ManualClock::new());
        let store = MemoryCounterStore::new(clock.clone());
        let window = Duration::from_secs(60);

        let first = store.increment_with_expiry("rate_limit:a", window).await.unwrap();
        assert_eq!(first.count, 1);
        assert_eq!(first.ttl, Some(window));

        clock.advance(Duration::from_secs(10));
        let second = store.increment_with_expiry("rate_limit:a", window).await.unwrap();
        assert_eq!(second.count, 2);
        assert_eq!(second.ttl, Some(Duration::from_secs(50)));
    }

    #[tokio::test]
    async fn test_expiry_is_not_extended() {
        let clock = Arc::new(ManualClock::new());
        let store = MemoryCounterStore::new(clock.clone());
        let window = Duration::from_secs(60);

        store.increment_with_expiry("k", window).await.unwrap();
        clock.advance(Duration::from_secs(59));
        store.increment_with_expiry("k", window).await.unwrap();
        clock.advance(Duration::from_secs(1));

        assert_eq!(store.count("k"), None);
        let fresh = store.increment_with_expiry("k", window).await.unwrap();
        assert_eq!(fresh.count, 1);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let clock = Arc::new(ManualClock::new());
        let store = MemoryCounterStore::new(clock.clone());

        store.increment_with_expiry("short", Duration::from_secs(1)).await.unwrap();
        store.increment_with_expiry("long", Duration::from_secs(60)).await.unwrap();
        clock.advance(Duration::from_secs(2));

        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.count("long"), Some(1));
    }
}
