use crate::size::SizeChooser;
use std::time::Duration;

/// Configuration for the [`Sender`](super::Sender).
#[derive(Debug)]
pub struct Config {
    /// Time between consecutive send cycles (before any schedule offset is added).
    ///
    /// A zero interval with a zero offset reschedules the next cycle at the current
    /// instant, so virtual time stops advancing.
    pub interval: Duration,

    /// Time between [`Sender::start`](super::Sender::start) and the first send cycle.
    pub initial_delay: Duration,

    /// Base payload size (in bytes).
    pub packet_size: u8,

    /// Additional bytes drawn on every send cycle.
    pub size: SizeChooser,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            initial_delay: Duration::from_secs(1),
            packet_size: 10,
            size: SizeChooser::None,
        }
    }
}
