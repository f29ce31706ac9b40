use prometheus::{Counter, CounterVec, Histogram, HistogramOpts, Opts, Registry};
use std::sync::Arc;

/// Metrics collector for the admission layer
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Decision metrics
    admissions: CounterVec,
    credential_failures: CounterVec,

    // Tier metrics
    tier_lookups: CounterVec,
    resolved_tiers: CounterVec,
    tier_cache_hits: Counter,
    tier_cache_misses: Counter,

    // Ledger metrics
    store_errors: CounterVec,
    rollbacks: Counter,
    check_duration: Histogram,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let admissions = CounterVec::new(
            Opts::new(
                "admission_decisions_total",
                "Admission decisions by endpoint class and outcome",
            ),
            &["class", "outcome"],
        )?;

        let credential_failures = CounterVec::new(
            Opts::new(
                "admission_credential_failures_total",
                "Rejected credentials by failure kind",
            ),
            &["kind"],
        )?;

        let tier_lookups = CounterVec::new(
            Opts::new(
                "admission_tier_lookups_total",
                "Account tier lookups by result",
            ),
            &["result"],
        )?;

        let resolved_tiers = CounterVec::new(
            Opts::new(
                "admission_resolved_tiers_total",
                "Requests by resolved tier",
            ),
            &["tier"],
        )?;

        let tier_cache_hits = Counter::new(
            "admission_tier_cache_hits",
            "Number of tier cache hits",
        )?;

        let tier_cache_misses = Counter::new(
            "admission_tier_cache_misses",
            "Number of tier cache misses",
        )?;

        let store_errors = CounterVec::new(
            Opts::new(
                "admission_store_errors_total",
                "Counter store failures by operation",
            ),
            &["operation"],
        )?;

        let rollbacks = Counter::new(
            "admission_rollbacks_total",
            "Counted requests released after a successful outcome",
        )?;

        let check_duration = Histogram::with_opts(HistogramOpts::new(
            "admission_check_duration_seconds",
            "Duration of admission checks in seconds",
        ))?;

        // Register all metrics
        registry.register(Box::new(admissions.clone()))?;
        registry.register(Box::new(credential_failures.clone()))?;
        registry.register(Box::new(tier_lookups.clone()))?;
        registry.register(Box::new(resolved_tiers.clone()))?;
        registry.register(Box::new(tier_cache_hits.clone()))?;
        registry.register(Box::new(tier_cache_misses.clone()))?;
        registry.register(Box::new(store_errors.clone()))?;
        registry.register(Box::new(rollbacks.clone()))?;
        registry.register(Box::new(check_duration.clone()))?;

        Ok(Self {
            registry,
            admissions,
            credential_failures,
            tier_lookups,
            resolved_tiers,
            tier_cache_hits,
            tier_cache_misses,
            store_errors,
            rollbacks,
            check_duration,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_admission(&self, class: &str, outcome: &str) {
        self.admissions.with_label_values(&[class, outcome]).inc();
    }

    pub fn record_credential_failure(&self, kind: &str) {
        self.credential_failures.with_label_values(&[kind]).inc();
    }

    pub fn record_tier_lookup(&self, result: &str) {
        self.tier_lookups.with_label_values(&[result]).inc();
    }

    pub fn record_resolved_tier(&self, tier: &str) {
        self.resolved_tiers.with_label_values(&[tier]).inc();
    }

    pub fn record_tier_cache_hit(&self) {
        self.tier_cache_hits.inc();
    }

    pub fn record_tier_cache_miss(&self) {
        self.tier_cache_misses.inc();
    }

    pub fn record_store_error(&self, operation: &str) {
        self.store_errors.with_label_values(&[operation]).inc();
    }

    pub fn record_rollback(&self) {
        self.rollbacks.inc();
    }

    /// Create a timer for measuring check duration
    pub fn start_check_timer(&self) -> prometheus::HistogramTimer {
        self.check_duration.start_timer()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}
