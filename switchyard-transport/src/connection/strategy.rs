//! Connection selection within a pool.

use std::sync::Arc;

use switchyard_core::RandomProvider;

use super::Connection;

/// Picks one connection out of a pool snapshot.
pub trait ConnectionSelectStrategy: Send + Sync {
    /// Choose among `candidates`, all of which were open when sampled.
    fn select(&self, candidates: &[Arc<Connection>]) -> Option<Arc<Connection>>;
}

/// Uniform random choice.
///
/// A single candidate is returned without drawing.
#[derive(Clone, Debug)]
pub struct RandomSelectStrategy<R: RandomProvider> {
    random: R,
}

impl<R: RandomProvider> RandomSelectStrategy<R> {
    /// Strategy drawing from `random`.
    pub fn new(random: R) -> Self {
        Self { random }
    }
}

impl<R: RandomProvider> ConnectionSelectStrategy for RandomSelectStrategy<R> {
    fn select(&self, candidates: &[Arc<Connection>]) -> Option<Arc<Connection>> {
        match candidates.len() {
            0 => None,
            1 => candidates.first().cloned(),
            n => candidates.get(self.random.random_range(0..n)).cloned(),
        }
    }
}
