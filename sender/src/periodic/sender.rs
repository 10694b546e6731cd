use super::{metrics::Metrics, Config};
use crate::{
    offset::{self, Store},
    size::SizeChooser,
    Clock, Error, Metrics as RuntimeMetrics, Node, Transmitter,
};
use bytes::Bytes;
use futures::channel::mpsc;
use std::{
    mem::replace,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};
use tracing::{debug, error};

/// A payload produced by a send cycle.
#[derive(Clone, Debug)]
pub struct Notification {
    /// Node that produced the payload.
    pub node: u32,
    /// Virtual time of the send cycle.
    pub at: Duration,
    /// The payload handed to the transmitter.
    pub payload: Bytes,
}

enum State<H> {
    Stopped,
    Running(H),
}

struct Inner<E: Clock, N: Node, S: Store> {
    me: Weak<Mutex<Self>>,
    context: E,
    node: N,
    id: u32,
    store: S,

    interval: Duration,
    initial_delay: Duration,
    packet_size: u8,
    size: SizeChooser,

    transmitter: Option<N::Transmitter>,
    state: State<E::Handle>,
    subscribers: Vec<mpsc::UnboundedSender<Notification>>,
    metrics: Metrics,
}

impl<E: Clock, N: Node, S: Store> Inner<E, N, S> {
    /// Schedule a send cycle `delay` from now.
    fn schedule(&self, delay: Duration) -> E::Handle {
        let me = self.me.clone();
        self.context.schedule(delay, move || {
            // Nothing to do if the sender was dropped
            let Some(sender) = me.upgrade() else {
                return;
            };
            let mut inner = sender.lock().unwrap();
            if let Err(err) = inner.send_cycle() {
                // Release the lock first so the sender stays usable after the panic
                inner.state = State::Stopped;
                let id = inner.id;
                drop(inner);
                error!(node = id, ?err, "send cycle failed");
                panic!("send cycle failed: {err}");
            }
        })
    }

    /// Cancel the pending send cycle, if any.
    fn cancel(&mut self) -> bool {
        match replace(&mut self.state, State::Stopped) {
            State::Running(handle) => self.context.cancel(handle),
            State::Stopped => false,
        }
    }

    fn send_cycle(&mut self) -> Result<(), Error> {
        // Create and send a new payload
        let size = usize::from(self.packet_size) + self.size.next() as usize;
        let payload = Bytes::from(vec![0; size]);
        let transmitter = self
            .transmitter
            .as_mut()
            .ok_or(Error::TransmitterMissing(self.id))?;
        transmitter.transmit(payload.clone());
        self.metrics.sent.inc();
        self.metrics.sent_bytes.inc_by(size as u64);
        self.notify(payload);

        // Consume the schedule offset (the next cycle uses the value read here,
        // not the value left in the store)
        let raw = match self.store.read(self.id)? {
            Some(raw) => raw,
            None => {
                self.store.init(self.id)?;
                offset::ZERO.to_string()
            }
        };
        debug!(node = self.id, offset = raw.as_str(), "read offset");
        if raw != offset::ZERO {
            self.store.init(self.id)?;
        }
        let offset =
            offset::parse(&raw).ok_or_else(|| Error::OffsetMalformed(self.id, raw.clone()))?;
        if offset > Duration::ZERO {
            self.metrics.offsets_applied.inc();
        }

        // Schedule the next cycle
        let delay = offset.saturating_add(self.interval);
        let handle = self.schedule(delay);
        self.state = State::Running(handle);
        debug!(node = self.id, size, ?offset, next = ?delay, "sent packet");
        Ok(())
    }

    fn notify(&mut self, payload: Bytes) {
        let notification = Notification {
            node: self.id,
            at: self.context.current(),
            payload,
        };
        self.subscribers
            .retain(|subscriber| subscriber.unbounded_send(notification.clone()).is_ok());
    }
}

/// Periodically hands payloads from a [Node] to its [Transmitter].
///
/// Clones refer to the same sender. A [Transmitter] (or any other callback) must not call back
/// into the sender while it is being handed a payload.
///
/// Dropping every clone of a running sender leaves its pending cycle on the clock, where it
/// fires as a no-op.
///
/// A send cycle that fails stops the sender before it panics. If the panic is caught, the
/// sender can be inspected and started again.
pub struct Sender<E: Clock, N: Node, S: Store> {
    inner: Arc<Mutex<Inner<E, N, S>>>,
}

impl<E: Clock, N: Node, S: Store> Clone for Sender<E, N, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: Clock + RuntimeMetrics, N: Node, S: Store> Sender<E, N, S> {
    /// Create a new (stopped) sender for `node`.
    ///
    /// Metrics are registered under the label of `context`.
    pub fn new(context: E, node: N, store: S, cfg: Config) -> Self {
        let metrics = Metrics::init(&context);
        let id = node.id();
        let inner = Arc::new_cyclic(|me| {
            Mutex::new(Inner {
                me: me.clone(),
                context,
                node,
                id,
                store,
                interval: cfg.interval,
                initial_delay: cfg.initial_delay,
                packet_size: cfg.packet_size,
                size: cfg.size,
                transmitter: None,
                state: State::Stopped,
                subscribers: Vec::new(),
                metrics,
            })
        });
        Self { inner }
    }
}

impl<E: Clock, N: Node, S: Store> Sender<E, N, S> {
    /// Identifier of the node this sender belongs to.
    pub fn id(&self) -> u32 {
        self.inner.lock().unwrap().id
    }

    /// Time between send cycles.
    pub fn interval(&self) -> Duration {
        self.inner.lock().unwrap().interval
    }

    /// Set the time between send cycles.
    ///
    /// Takes effect when the next cycle is scheduled (the pending cycle is not moved).
    pub fn set_interval(&self, interval: Duration) {
        let mut inner = self.inner.lock().unwrap();
        debug!(node = inner.id, ?interval, "set interval");
        inner.interval = interval;
    }

    /// Set the time between [Sender::start] and the first send cycle.
    pub fn set_initial_delay(&self, delay: Duration) {
        let mut inner = self.inner.lock().unwrap();
        debug!(node = inner.id, ?delay, "set initial delay");
        inner.initial_delay = delay;
    }

    /// Set the base payload size.
    pub fn set_packet_size(&self, size: u8) {
        let mut inner = self.inner.lock().unwrap();
        debug!(node = inner.id, size, "set packet size");
        inner.packet_size = size;
    }

    /// Set the source of additional payload bytes.
    pub fn set_packet_size_source(&self, size: SizeChooser) {
        let mut inner = self.inner.lock().unwrap();
        debug!(node = inner.id, ?size, "set packet size source");
        inner.size = size;
    }

    /// Bind a transmitter explicitly (skipping the lookup on the node at start).
    pub fn bind(&self, transmitter: N::Transmitter) {
        self.inner.lock().unwrap().transmitter = Some(transmitter);
    }

    /// Receive a [Notification] for every payload produced from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Notification> {
        let (sender, receiver) = mpsc::unbounded();
        self.inner.lock().unwrap().subscribers.push(sender);
        receiver
    }

    /// Whether a send cycle is pending.
    pub fn is_running(&self) -> bool {
        matches!(self.inner.lock().unwrap().state, State::Running(_))
    }

    /// Schedule the first send cycle after the initial delay.
    ///
    /// If no transmitter is bound yet, it is located on the node. If the sender is already
    /// running, the pending cycle is cancelled and the schedule restarts from now.
    pub fn start(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();

        // Make sure we have a transmitter
        if inner.transmitter.is_none() {
            let transmitter = inner
                .node
                .transmitter()
                .ok_or(Error::TransmitterMissing(inner.id))?;
            inner.transmitter = Some(transmitter);
        }

        // Replace any pending cycle
        inner.cancel();
        let delay = inner.initial_delay;
        let handle = inner.schedule(delay);
        inner.state = State::Running(handle);
        debug!(node = inner.id, ?delay, "started");
        Ok(())
    }

    /// Cancel the pending send cycle (if any).
    pub fn stop(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.cancel() {
            debug!(node = inner.id, "stopped");
        }
    }
}
