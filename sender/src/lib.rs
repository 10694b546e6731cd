//! Drive periodic end-device transmissions from a deterministic discrete-event clock.
//!
//! The core of this crate is the [periodic::Sender]: a start/stop state machine that, once
//! started, fires a send cycle after an initial delay and then keeps rescheduling itself. Each
//! cycle hands a payload to the node's [Transmitter], consumes the node's schedule offset from an
//! [offset::Store], and schedules the next cycle `offset + interval` later.
//!
//! Everything the sender depends on is expressed as a trait so it can be swapped out:
//! - [Clock] schedules and cancels callbacks in virtual time ([deterministic] provides one)
//! - [Node] exposes the owning device's identifier and its transmit capability
//! - [offset::Store] persists the per-node schedule offset ([offset::Memory], [offset::Directory])
//! - [size::SizeSource] perturbs the payload size of each cycle
//!
//! # Status
//!
//! `periodic-sender` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

use bytes::Bytes;
use prometheus_client::registry::Metric;
use std::{fmt::Debug, io::Error as IoError, time::Duration};
use thiserror::Error;

pub mod deterministic;
#[cfg(test)]
pub mod mocks;
pub mod offset;
pub mod periodic;
pub mod size;

/// Errors that can occur when operating a [periodic::Sender].
///
/// None of these are retried: they indicate a misconfigured node or corrupt persisted state.
#[derive(Error, Debug)]
pub enum Error {
    #[error("transmitter missing: node {0}")]
    TransmitterMissing(u32),
    #[error("offset malformed: node {0} value {1:?}")]
    OffsetMalformed(u32, String),
    #[error("offset read failed: node {0} error: {1}")]
    OffsetReadFailed(u32, IoError),
    #[error("offset write failed: node {0} error: {1}")]
    OffsetWriteFailed(u32, IoError),
}

/// Interface that any discrete-event clock must implement.
///
/// Callbacks run in nondecreasing virtual time. Callbacks due at the same instant run in the
/// order they were scheduled.
pub trait Clock: Clone + Send + Sync + 'static {
    /// Opaque reference to a scheduled callback.
    type Handle: Copy + Debug + Eq + Send + 'static;

    /// Returns the current virtual time (measured from the start of the simulation).
    fn current(&self) -> Duration;

    /// Schedule `callback` to run `delay` after the current virtual time.
    ///
    /// A zero `delay` schedules the callback at the current instant, after every callback already
    /// due at that instant.
    fn schedule<F>(&self, delay: Duration, callback: F) -> Self::Handle
    where
        F: FnOnce() + Send + 'static;

    /// Cancel a previously scheduled callback.
    ///
    /// Returns `true` if the callback was pending. Once this returns, the callback will never run.
    fn cancel(&self, handle: Self::Handle) -> bool;
}

/// Interface to register and export metrics.
pub trait Metrics: Clone + Send + Sync + 'static {
    /// Get the current label of the context.
    fn label(&self) -> String;

    /// Create a new instance of `Metrics` with the given label appended to the end
    /// of the current `Metrics` label.
    ///
    /// This is commonly used to create a nested context for `register`.
    fn with_label(&self, label: &str) -> Self;

    /// Register a metric with the runtime.
    ///
    /// Any registered metric will include (as a prefix) the label of the current context.
    fn register<N: Into<String>, H: Into<String>>(&self, name: N, help: H, metric: impl Metric);

    /// Encode all metrics into a buffer.
    fn encode(&self) -> String;
}

/// The lower-layer capability that accepts a payload for transmission.
///
/// Transmission is fire-and-forget: the caller never observes an outcome.
pub trait Transmitter: Send + 'static {
    /// Transmit `payload`.
    fn transmit(&mut self, payload: Bytes);
}

/// The device that owns a [periodic::Sender].
pub trait Node: Send + 'static {
    /// The transmit capability exposed by the node.
    type Transmitter: Transmitter;

    /// Identifier of the node (keys the node's schedule offset).
    fn id(&self) -> u32;

    /// Locate the node's transmit capability, if it has one.
    fn transmitter(&self) -> Option<Self::Transmitter>;
}
