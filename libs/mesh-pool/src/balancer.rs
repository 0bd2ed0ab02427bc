//! Weighted random selection.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Anything with a selection weight.
pub trait Weighted {
    fn weight(&self) -> u32;
}

impl<T: Weighted + ?Sized> Weighted for Arc<T> {
    fn weight(&self) -> u32 {
        (**self).weight()
    }
}

/// Picks an item with probability `weight / total`.
///
/// Zero-weight items are never picked. One generator is shared by every pick
/// so draws from concurrent callers stay independent.
#[derive(Debug)]
pub struct WeightedRandom {
    rng: Mutex<StdRng>,
}

impl Default for WeightedRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl WeightedRandom {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// `None` when `items` is empty or all weights are zero.
    #[must_use]
    pub fn pick<'a, T: Weighted>(&self, items: &'a [T]) -> Option<&'a T> {
        let total: u64 = items.iter().map(|item| u64::from(item.weight())).sum();
        if total == 0 {
            return None;
        }

        let mut point = self.rng.lock().random_range(0..total);
        for item in items {
            let weight = u64::from(item.weight());
            if point < weight {
                return Some(item);
            }
            point -= weight;
        }
        None
    }
}
