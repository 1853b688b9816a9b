use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Metrics collector for admission decisions
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Decision metrics
    decisions: IntCounterVec,
    fail_open: IntCounterVec,

    // Shared store metrics
    store_duration: Histogram,
    deny_cache_hits: IntCounter,

    // Local registry metrics
    local_entries: IntGauge,
    evicted: IntCounter,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let decisions = IntCounterVec::new(
            Opts::new(
                "gatekeeper_decisions_total",
                "Admission decisions by backend and outcome",
            ),
            &["backend", "outcome"],
        )?;

        let fail_open = IntCounterVec::new(
            Opts::new(
                "gatekeeper_fail_open_total",
                "Requests forwarded because the limiter backend failed",
            ),
            &["backend"],
        )?;

        let store_duration = Histogram::with_opts(HistogramOpts::new(
            "gatekeeper_store_duration_seconds",
            "Duration of shared store round trips in seconds",
        ))?;

        let deny_cache_hits = IntCounter::new(
            "gatekeeper_deny_cache_hits_total",
            "Denials answered from the local deny cache",
        )?;

        let local_entries = IntGauge::new(
            "gatekeeper_local_entries",
            "Identities currently tracked by local registries",
        )?;

        let evicted = IntCounter::new(
            "gatekeeper_evicted_total",
            "Idle identities evicted from local registries",
        )?;

        registry.register(Box::new(decisions.clone()))?;
        registry.register(Box::new(fail_open.clone()))?;
        registry.register(Box::new(store_duration.clone()))?;
        registry.register(Box::new(deny_cache_hits.clone()))?;
        registry.register(Box::new(local_entries.clone()))?;
        registry.register(Box::new(evicted.clone()))?;

        Ok(Self {
            registry,
            decisions,
            fail_open,
            store_duration,
            deny_cache_hits,
            local_entries,
            evicted,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record an allow/deny decision
    pub fn record_decision(&self, backend: &str, allowed: bool) {
        let outcome = if allowed { "allowed" } else { "denied" };
        self.decisions.with_label_values(&[backend, outcome]).inc();
    }

    /// Record a request forwarded after a backend failure
    pub fn record_fail_open(&self, backend: &str) {
        self.fail_open.with_label_values(&[backend]).inc();
    }

    /// Create a timer for a shared store round trip
    pub fn start_store_timer(&self) -> prometheus::HistogramTimer {
        self.store_duration.start_timer()
    }

    pub fn record_deny_cache_hit(&self) {
        self.deny_cache_hits.inc();
    }

    pub fn set_local_entries(&self, count: usize) {
        self.local_entries.set(count as i64);
    }

    pub fn record_evicted(&self, count: usize) {
        self.evicted.inc_by(count as u64);
    }

    pub fn decision_count(&self, backend: &str, allowed: bool) -> u64 {
        let outcome = if allowed { "allowed" } else { "denied" };
        self.decisions.with_label_values(&[backend, outcome]).get()
    }

    pub fn fail_open_count(&self, backend: &str) -> u64 {
        self.fail_open.with_label_values(&[backend]).get()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}
