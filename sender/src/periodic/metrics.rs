use crate::Metrics as RuntimeMetrics;
use prometheus_client::metrics::counter::Counter;

/// Metrics for the [`Sender`](super::Sender)
#[derive(Default)]
pub struct Metrics {
    /// Number of payloads handed to the transmitter
    pub sent: Counter,
    /// Number of bytes handed to the transmitter
    pub sent_bytes: Counter,
    /// Number of positive schedule offsets applied
    pub offsets_applied: Counter,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: &E) -> Self {
        let metrics = Metrics::default();
        context.register(
            "sent",
            "Number of payloads handed to the transmitter",
            metrics.sent.clone(),
        );
        context.register(
            "sent_bytes",
            "Number of bytes handed to the transmitter",
            metrics.sent_bytes.clone(),
        );
        context.register(
            "offsets_applied",
            "Number of positive schedule offsets applied",
            metrics.offsets_applied.clone(),
        );
        metrics
    }
}
