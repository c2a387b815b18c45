//! Seeded action selection.
//!
//! Every run draws from its own generator derived from the base seed and the
//! run index, so run `n` of seed `s` makes the same choices no matter how
//! many runs came before it.

use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use rand_chacha::ChaCha8Rng;
use rand_chacha::rand_core::SeedableRng;

/// Generator for run `run_index` under `base_seed`.
pub fn run_rng(base_seed: u64, run_index: u64) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(base_seed.wrapping_add(run_index))
}

/// Picks one of the eligible actions. Returns an index into `eligible`, or
/// `None` when nothing is eligible.
pub trait SelectionStrategy {
    fn select(&mut self, rng: &mut ChaCha8Rng, eligible: &[&str]) -> Option<usize>;
}

/// Every eligible action is equally likely.
#[derive(Debug, Default, Clone, Copy)]
pub struct Uniform;

impl SelectionStrategy for Uniform {
    fn select(&mut self, rng: &mut ChaCha8Rng, eligible: &[&str]) -> Option<usize> {
        if eligible.is_empty() {
            None
        } else {
            Some(rng.gen_range(0..eligible.len()))
        }
    }
}

/// Actions weighted by name. Unlisted actions get `default_weight`.
#[derive(Debug, Clone)]
pub struct Weighted {
    weights: Vec<(String, u32)>,
    default_weight: u32,
}

impl Weighted {
    pub fn new(default_weight: u32) -> Self {
        Self {
            weights: Vec::new(),
            default_weight,
        }
    }

    pub fn weight(mut self, action: impl Into<String>, weight: u32) -> Self {
        self.weights.push((action.into(), weight));
        self
    }

    fn weight_of(&self, action: &str) -> u32 {
        self.weights
            .iter()
            .find(|(name, _)| name == action)
            .map_or(self.default_weight, |(_, weight)| *weight)
    }
}

impl SelectionStrategy for Weighted {
    fn select(&mut self, rng: &mut ChaCha8Rng, eligible: &[&str]) -> Option<usize> {
        let weights: Vec<u32> = eligible.iter().map(|name| self.weight_of(name)).collect();
        // All-zero weights fall back to a uniform draw.
        match WeightedIndex::new(&weights) {
            Ok(dist) => Some(dist.sample(rng)),
            Err(_) => Uniform.select(rng, eligible),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draws(strategy: &mut dyn SelectionStrategy, seed: u64, n: usize) -> Vec<usize> {
        let mut rng = run_rng(seed, 0);
        let eligible = ["a", "b", "c", "d"];
        (0..n)
            .map(|_| strategy.select(&mut rng, &eligible).expect("eligible"))
            .collect()
    }

    #[test]
    fn same_seed_same_choices() {
        assert_eq!(draws(&mut Uniform, 7, 32), draws(&mut Uniform, 7, 32));
    }

    #[test]
    fn run_generators_are_independent_of_previous_runs() {
        let mut a = run_rng(100, 3);
        let mut b = run_rng(101, 2);
        let left: Vec<u32> = (0..8).map(|_| a.gen_range(0..1000)).collect();
        let right: Vec<u32> = (0..8).map(|_| b.gen_range(0..1000)).collect();
        assert_eq!(left, right);
    }

    #[test]
    fn empty_eligible_set_selects_nothing() {
        let mut rng = run_rng(1, 0);
        assert_eq!(Uniform.select(&mut rng, &[]), None);
        assert_eq!(Weighted::new(1).select(&mut rng, &[]), None);
    }

    #[test]
    fn zero_weight_actions_are_never_chosen() {
        let mut strategy = Weighted::new(1).weight("b", 0).weight("d", 0);
        for index in draws(&mut strategy, 9, 64) {
            assert!(index == 0 || index == 2, "picked {index}");
        }
    }
}
