// Private module declaration
mod server;

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

// Re-export for public API
pub use server::{start_metrics_server, Readiness};

// ============================================================================
// Metrics Module - Prometheus metrics for the order engine
// ============================================================================
//
// Provides metrics for:
// - Order creation and line-item composition
// - Pipeline transitions (accepted and rejected, per transition)
// - Tracking numbers handed out
// - Optimistic-concurrency conflicts on order writes
// - Payment settlement latency
//
// All metrics are registered with Prometheus and can be scraped via /metrics
// ============================================================================

pub struct Metrics {
    registry: Registry,

    // Composition
    pub orders_created: IntCounter,
    pub line_items_added: IntCounter,
    pub line_items_removed: IntCounter,

    // Pipeline
    pub transitions: IntCounterVec,
    pub transition_rejections: IntCounterVec,
    pub settlement_duration: Histogram,

    // Infrastructure
    pub tracking_numbers_issued: IntCounter,
    pub write_conflicts: IntCounter,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let orders_created = IntCounter::new("orders_created_total", "Total orders created")?;
        registry.register(Box::new(orders_created.clone()))?;

        let line_items_added =
            IntCounter::new("line_items_added_total", "Total line items added to orders")?;
        registry.register(Box::new(line_items_added.clone()))?;

        let line_items_removed =
            IntCounter::new("line_items_removed_total", "Total line items removed from orders")?;
        registry.register(Box::new(line_items_removed.clone()))?;

        let transitions = IntCounterVec::new(
            Opts::new("order_transitions_total", "Order status transitions applied"),
            &["transition"],
        )?;
        registry.register(Box::new(transitions.clone()))?;

        let transition_rejections = IntCounterVec::new(
            Opts::new(
                "order_transition_rejections_total",
                "Order status transitions rejected by a precondition",
            ),
            &["transition"],
        )?;
        registry.register(Box::new(transition_rejections.clone()))?;

        let settlement_duration = Histogram::with_opts(
            HistogramOpts::new(
                "settlement_duration_seconds",
                "Time from payment request to confirmed",
            )
            .buckets(vec![0.01, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;
        registry.register(Box::new(settlement_duration.clone()))?;

        let tracking_numbers_issued =
            IntCounter::new("tracking_numbers_issued_total", "Tracking numbers drawn from the sequence")?;
        registry.register(Box::new(tracking_numbers_issued.clone()))?;

        let write_conflicts = IntCounter::new(
            "order_write_conflicts_total",
            "Order writes rejected because of a stale revision",
        )?;
        registry.register(Box::new(write_conflicts.clone()))?;

        Ok(Self {
            registry,
            orders_created,
            line_items_added,
            line_items_removed,
            transitions,
            transition_rejections,
            settlement_duration,
            tracking_numbers_issued,
            write_conflicts,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Helper to record a transition outcome
    pub fn record_transition(&self, transition: &str, applied: bool) {
        if applied {
            self.transitions.with_label_values(&[transition]).inc();
        } else {
            self.transition_rejections.with_label_values(&[transition]).inc();
        }
    }

    pub fn record_settlement(&self, duration_secs: f64) {
        self.settlement_duration.observe(duration_secs);
    }

    pub fn record_write_conflict(&self) {
        self.write_conflicts.inc();
    }
}
