use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for the [super::Readahead] policy.
#[derive(Default)]
pub struct Metrics {
    /// Number of cache hits on entries that were read ahead
    pub readahead_hits: Counter,
    /// Number of windows computed
    pub windows: Counter,
    /// Width of the last computed window
    pub window: Gauge,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: E) -> Self {
        let metrics = Self::default();
        context.register(
            "readahead_hits",
            "Number of cache hits on entries that were read ahead",
            metrics.readahead_hits.clone(),
        );
        context.register(
            "windows",
            "Number of windows computed",
            metrics.windows.clone(),
        );
        context.register(
            "window",
            "Width of the last computed window",
            metrics.window.clone(),
        );
        metrics
    }
}
