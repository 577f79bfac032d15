use keysim_runtime::Metrics as RuntimeMetrics;
use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
};

/// Whether a received item was already held.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Status {
    New,
    Duplicate,
}

/// Label for received item metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusLabel {
    pub status: Status,
}

impl StatusLabel {
    pub const NEW: Self = Self {
        status: Status::New,
    };
    pub const DUPLICATE: Self = Self {
        status: Status::Duplicate,
    };
}

/// Metrics for the [`Engine`](super::Engine)
#[derive(Default)]
pub struct Metrics {
    /// Number of announcements sent
    pub announcements: Counter,
    /// Number of requests sent
    pub requests: Counter,
    /// Number of replies sent
    pub replies: Counter,
    /// Number of rounds skipped because the link to the neighbor was busy
    pub busy: Counter,
    /// Number of items received by status
    pub received: Family<StatusLabel, Counter>,
    /// Number of pending requests from local services
    pub waiters: Gauge,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: E) -> Self {
        let metrics = Metrics::default();
        context.register(
            "announcements",
            "Number of announcements sent",
            metrics.announcements.clone(),
        );
        context.register(
            "requests",
            "Number of requests sent",
            metrics.requests.clone(),
        );
        context.register("replies", "Number of replies sent", metrics.replies.clone());
        context.register(
            "busy",
            "Number of rounds skipped because the link to the neighbor was busy",
            metrics.busy.clone(),
        );
        context.register(
            "received",
            "Number of items received by status",
            metrics.received.clone(),
        );
        context.register(
            "waiters",
            "Number of pending requests from local services",
            metrics.waiters.clone(),
        );
        metrics
    }
}
