use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for the [super::Dispatcher].
#[derive(Default)]
pub struct Metrics {
    /// Number of operations submitted to the transport
    pub issued: Counter,
    /// Number of operations observed as done
    pub completed: Counter,
    /// Number of operations that were rejected or failed
    pub failed: Counter,
    /// Number of operations submitted but not yet observed
    pub in_flight: Gauge,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: E) -> Self {
        let metrics = Self::default();
        context.register(
            "issued",
            "Number of operations submitted to the transport",
            metrics.issued.clone(),
        );
        context.register(
            "completed",
            "Number of operations observed as done",
            metrics.completed.clone(),
        );
        context.register(
            "failed",
            "Number of operations that were rejected or failed",
            metrics.failed.clone(),
        );
        context.register(
            "in_flight",
            "Number of operations submitted but not yet observed",
            metrics.in_flight.clone(),
        );
        metrics
    }
}
