//! Mock implementations for testing.

use bytes::Bytes;
use std::sync::{Arc, Mutex};

/// A transmitter that records every payload it is handed.
///
/// Clones share the same record.
#[derive(Clone, Default)]
pub struct Transmitter {
    sent: Arc<Mutex<Vec<Bytes>>>,
}

impl Transmitter {
    /// Payloads transmitted so far, in order.
    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().unwrap().clone()
    }
}

impl crate::Transmitter for Transmitter {
    fn transmit(&mut self, payload: Bytes) {
        self.sent.lock().unwrap().push(payload);
    }
}

/// A node with (optionally) a single [Transmitter].
#[derive(Clone)]
pub struct Node {
    id: u32,
    transmitter: Option<Transmitter>,
}

impl Node {
    /// Create a node that exposes `transmitter`.
    pub fn new(id: u32, transmitter: Transmitter) -> Self {
        Self {
            id,
            transmitter: Some(transmitter),
        }
    }

    /// Create a node without any transmit capability.
    pub fn detached(id: u32) -> Self {
        Self {
            id,
            transmitter: None,
        }
    }
}

impl crate::Node for Node {
    type Transmitter = Transmitter;

    fn id(&self) -> u32 {
        self.id
    }

    fn transmitter(&self) -> Option<Transmitter> {
        self.transmitter.clone()
    }
}
