//! Choose how many bytes to add to the base payload size of each send cycle.
//!
//! A [SizeChooser] is either [SizeChooser::None] (always contributes zero) or wraps a
//! [SizeSource] that is sampled fresh on every cycle. Sources return `u32`, so a contribution
//! can never be negative: [Sampled] clamps negative draws from a real-valued distribution to zero.

use rand::{
    distributions::{Distribution, Uniform as UniformRange},
    rngs::StdRng,
    SeedableRng,
};
use std::fmt;

/// A probabilistic source of non-negative payload size contributions.
pub trait SizeSource: Send + 'static {
    /// Draw the next contribution (in bytes).
    fn sample(&mut self) -> u32;
}

/// The (optional) size source of a sender.
#[derive(Default)]
pub enum SizeChooser {
    /// No source configured: every cycle sends exactly the base size.
    #[default]
    None,
    /// Add a fresh sample from the source to every cycle.
    Random(Box<dyn SizeSource>),
}

impl SizeChooser {
    /// Wrap `source`.
    pub fn random(source: impl SizeSource) -> Self {
        Self::Random(Box::new(source))
    }

    /// Draw the contribution for the next cycle.
    pub fn next(&mut self) -> u32 {
        match self {
            Self::None => 0,
            Self::Random(source) => source.sample(),
        }
    }
}

impl fmt::Debug for SizeChooser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Random(_) => f.write_str("Random"),
        }
    }
}

/// Always contributes the same number of bytes.
#[derive(Clone, Copy, Debug)]
pub struct Constant(pub u32);

impl SizeSource for Constant {
    fn sample(&mut self) -> u32 {
        self.0
    }
}

/// Contributes a uniformly distributed number of bytes in `[min, max]`.
pub struct Uniform {
    rng: StdRng,
    range: UniformRange<u32>,
}

impl Uniform {
    /// Create a new source seeded with `seed`.
    ///
    /// # Panics
    ///
    /// Panics if `min > max`.
    pub fn new(min: u32, max: u32, seed: u64) -> Self {
        assert!(min <= max, "min must not exceed max");
        Self {
            rng: StdRng::seed_from_u64(seed),
            range: UniformRange::new_inclusive(min, max),
        }
    }
}

impl SizeSource for Uniform {
    fn sample(&mut self) -> u32 {
        self.range.sample(&mut self.rng)
    }
}

/// Adapts any real-valued distribution (e.g. `rand_distr::Normal`).
///
/// Draws are rounded to the nearest integer. Negative (or NaN) draws contribute zero and
/// draws above `u32::MAX` saturate.
pub struct Sampled<D> {
    rng: StdRng,
    distribution: D,
}

impl<D: Distribution<f64>> Sampled<D> {
    /// Create a new source seeded with `seed`.
    pub fn new(distribution: D, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            distribution,
        }
    }
}

impl<D: Distribution<f64> + Send + 'static> SizeSource for Sampled<D> {
    fn sample(&mut self) -> u32 {
        let draw = self.distribution.sample(&mut self.rng).round();
        if draw.is_nan() || draw <= 0.0 {
            return 0;
        }
        // Float to int casts saturate
        draw as u32
    }
}
