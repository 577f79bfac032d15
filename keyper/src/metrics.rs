use keysim_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for the [`Coordinator`](super::Coordinator)
#[derive(Default)]
pub struct Metrics {
    /// Block currently being worked on
    pub block: Gauge,
    /// Number of blocks finished
    pub finished: Counter,
    /// Number of secret shares recorded
    pub shares: Counter,
    /// Number of witnesses recorded
    pub witnesses: Counter,
    /// Number of nonces recorded
    pub nonces: Counter,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: E) -> Self {
        let metrics = Metrics::default();
        context.register(
            "block",
            "Block currently being worked on",
            metrics.block.clone(),
        );
        context.register(
            "finished",
            "Number of blocks finished",
            metrics.finished.clone(),
        );
        context.register(
            "shares",
            "Number of secret shares recorded",
            metrics.shares.clone(),
        );
        context.register(
            "witnesses",
            "Number of witnesses recorded",
            metrics.witnesses.clone(),
        );
        context.register("nonces", "Number of nonces recorded", metrics.nonces.clone());
        metrics
    }
}
