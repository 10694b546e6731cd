//! Persist the schedule offset of each node.
//!
//! A schedule offset is a non-negative number of seconds, stored as decimal text and keyed by node
//! identifier. Each send cycle reads the offset of its node, resets any non-zero value back to
//! [ZERO], and delays the next cycle by the value it read. Anything outside the sender (a test, an
//! orchestrator, another run of the simulation) may write an offset between cycles.

use crate::Error;
use std::time::Duration;

mod directory;
pub use directory::{Config, Directory};
mod memory;
pub use memory::Memory;

/// Text of a consumed (or never set) offset.
pub const ZERO: &str = "0";

/// Interface to the persisted schedule offsets of a set of nodes.
pub trait Store: Send + 'static {
    /// Read the stored offset text for node `id`.
    ///
    /// Returns `None` if no record has ever been written for `id`.
    fn read(&mut self, id: u32) -> Result<Option<String>, Error>;

    /// (Re)write the record for node `id` to [ZERO], overwriting any previous value.
    fn init(&mut self, id: u32) -> Result<(), Error>;
}

/// Parse offset text as a non-negative, finite number of seconds.
///
/// Surrounding whitespace is ignored. Returns `None` for anything else.
pub fn parse(raw: &str) -> Option<Duration> {
    let seconds: f64 = raw.trim().parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(seconds).ok()
}
