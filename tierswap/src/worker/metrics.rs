use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::counter::Counter;

/// Metrics for the [super::Actor].
#[derive(Default)]
pub struct Metrics {
    /// Number of requests accepted
    pub requests: Counter,
    /// Number of passes over a request
    pub passes: Counter,
    /// Number of pages prefetched and inserted
    pub prefetched: Counter,
    /// Number of entries skipped
    pub skipped: Counter,
    /// Number of batch charges that failed
    pub charge_failures: Counter,
    /// Number of requests dropped because the mailbox was full
    pub dropped: Counter,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: E) -> Self {
        let metrics = Self::default();
        context.register(
            "requests",
            "Number of requests accepted",
            metrics.requests.clone(),
        );
        context.register(
            "passes",
            "Number of passes over a request",
            metrics.passes.clone(),
        );
        context.register(
            "prefetched",
            "Number of pages prefetched and inserted",
            metrics.prefetched.clone(),
        );
        context.register(
            "skipped",
            "Number of entries skipped",
            metrics.skipped.clone(),
        );
        context.register(
            "charge_failures",
            "Number of batch charges that failed",
            metrics.charge_failures.clone(),
        );
        context.register(
            "dropped",
            "Number of requests dropped because the mailbox was full",
            metrics.dropped.clone(),
        );
        metrics
    }
}
