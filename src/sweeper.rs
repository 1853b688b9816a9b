//! Background eviction of idle local buckets and expired in-memory counters.

use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info};

use crate::{local::LocalLimiterRegistry, metrics::Metrics, store::MemoryCounterStore};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// In-process state the sweeper trims on every tick
pub trait Sweep: Send + Sync {
    /// Drop idle or expired entries, returning how many went
    fn sweep_expired(&self) -> usize;

    /// Entries still held
    fn tracked(&self) -> usize;
}

impl Sweep for LocalLimiterRegistry {
    fn sweep_expired(&self) -> usize {
        self.sweep()
    }

    fn tracked(&self) -> usize {
        self.len()
    }
}

impl Sweep for MemoryCounterStore {
    fn sweep_expired(&self) -> usize {
        self.purge_expired()
    }

    fn tracked(&self) -> usize {
        self.len()
    }
}

/// Owns the sweep task; stop it with [`SweeperHandle::shutdown`]
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Start sweeping `registries` every `interval` on the current runtime
    pub fn spawn(
        registries: Vec<Arc<dyn Sweep>>,
        interval: Duration,
        metrics: Metrics,
    ) -> Self {
        let (shutdown, mut stop) = watch::channel(false);

        let task = tokio::spawn(async move {
            info!(registries = registries.len(), ?interval, "Starting idle bucket sweeper");

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted: usize = registries.iter().map(|r| r.sweep_expired()).sum();
                        let live: usize = registries.iter().map(|r| r.tracked()).sum();

                        metrics.record_evicted(evicted);
                        metrics.set_local_entries(live);
                        debug!(evicted, live, "Swept idle buckets");
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Idle bucket sweeper stopped");
        });

        Self { shutdown, task }
    }

    /// Signal the task to stop and wait for it
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
