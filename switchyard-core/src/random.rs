//! Random number generation provider abstraction.
//!
//! Connection selection draws from this provider so pools can be tested with
//! a fixed sequence instead of thread-local entropy.

use rand::distr::uniform::SampleUniform;
use rand::prelude::*;
use std::cell::RefCell;
use std::ops::Range;

/// Provider trait for random number generation.
pub trait RandomProvider: Clone + Send + Sync + 'static {
    /// Generate a random value within a specified range.
    ///
    /// The range is exclusive of the upper bound (start..end).
    fn random_range<T>(&self, range: Range<T>) -> T
    where
        T: SampleUniform + PartialOrd;
}

/// Production random provider using thread-local RNG.
///
/// # Example
///
/// ```rust
/// use switchyard_core::{RandomProvider, TokioRandomProvider};
///
/// let random = TokioRandomProvider::new();
/// let in_range = random.random_range(1..100);
/// assert!((1..100).contains(&in_range));
/// ```
#[derive(Clone, Default, Debug)]
pub struct TokioRandomProvider;

impl TokioRandomProvider {
    /// Create a new production random provider.
    pub fn new() -> Self {
        Self
    }
}

thread_local! {
    static RNG: RefCell<rand::rngs::ThreadRng> = RefCell::new(rand::rng());
}

impl RandomProvider for TokioRandomProvider {
    fn random_range<T>(&self, range: Range<T>) -> T
    where
        T: SampleUniform + PartialOrd,
    {
        RNG.with(|rng| rng.borrow_mut().random_range(range))
    }
}
