use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::counter::Counter;

/// Metrics for the [super::Coordinator].
#[derive(Default)]
pub struct Metrics {
    /// Number of fetches issued on behalf of a fault
    pub demand_fetches: Counter,
    /// Number of fetches issued on behalf of readahead
    pub prefetch_fetches: Counter,
    /// Number of reservation attempts that found the slot already reserved
    pub races_lost: Counter,
    /// Number of early-issued reads that were drained and discarded
    pub speculation_wasted: Counter,
    /// Number of fetches rolled back after a failure
    pub rollbacks: Counter,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: E) -> Self {
        let metrics = Self::default();
        context.register(
            "demand_fetches",
            "Number of fetches issued on behalf of a fault",
            metrics.demand_fetches.clone(),
        );
        context.register(
            "prefetch_fetches",
            "Number of fetches issued on behalf of readahead",
            metrics.prefetch_fetches.clone(),
        );
        context.register(
            "races_lost",
            "Number of reservation attempts that found the slot already reserved",
            metrics.races_lost.clone(),
        );
        context.register(
            "speculation_wasted",
            "Number of early-issued reads that were drained and discarded",
            metrics.speculation_wasted.clone(),
        );
        context.register(
            "rollbacks",
            "Number of fetches rolled back after a failure",
            metrics.rollbacks.clone(),
        );
        metrics
    }
}
