use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for the [super::SlotCache].
#[derive(Default)]
pub struct Metrics {
    /// Number of entries currently resident
    pub entries: Gauge,
    /// Number of entries inserted
    pub inserts: Counter,
    /// Number of entries removed
    pub removes: Counter,
    /// Number of lookups
    pub lookups: Counter,
    /// Number of lookups that found an entry
    pub hits: Counter,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: E) -> Self {
        let metrics = Self::default();
        context.register(
            "entries",
            "Number of entries currently resident",
            metrics.entries.clone(),
        );
        context.register(
            "inserts",
            "Number of entries inserted",
            metrics.inserts.clone(),
        );
        context.register("removes", "Number of entries removed", metrics.removes.clone());
        context.register("lookups", "Number of lookups", metrics.lookups.clone());
        context.register(
            "hits",
            "Number of lookups that found an entry",
            metrics.hits.clone(),
        );
        metrics
    }
}
