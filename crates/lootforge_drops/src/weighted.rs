//! # Weighted Selection
//!
//! The selection primitive shared by drop pools and quality tiers.
//!
//! A pool of `(key, weight)` entries is turned into a cumulative weight table
//! once. Each draw picks a uniform value in `[0, total)` and returns the first
//! entry whose cumulative weight exceeds it, so a key is chosen with
//! probability `weight / total`.
//!
//! ```text
//! entries:     A(90)      B(10)
//! cumulative:  [   90   |  100 ]
//! draw 42  ->  A       draw 95  ->  B
//! ```

use rand::RngCore;

use crate::error::{LootError, LootResult};
use crate::roll;

/// An immutable weighted pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WeightedPool<K> {
    /// Keys in insertion order.
    keys: Vec<K>,
    /// Running weight total up to and including each key.
    cumulative: Vec<u64>,
}

impl<K> WeightedPool<K> {
    /// Builds a pool from `(key, weight)` pairs.
    ///
    /// # Errors
    ///
    /// Returns `InvalidWeightConfiguration` if the pool is empty, if any
    /// weight is zero, or if the total overflows.
    pub fn new(entries: impl IntoIterator<Item = (K, u64)>) -> LootResult<Self> {
        let mut keys = Vec::new();
        let mut cumulative = Vec::new();
        let mut total = 0u64;

        for (key, weight) in entries {
            if weight == 0 {
                return Err(LootError::InvalidWeightConfiguration(format!(
                    "entry {} has zero weight",
                    keys.len()
                )));
            }
            total = total.checked_add(weight).ok_or_else(|| {
                LootError::InvalidWeightConfiguration("weight total overflows".to_string())
            })?;
            keys.push(key);
            cumulative.push(total);
        }

        if keys.is_empty() {
            return Err(LootError::InvalidWeightConfiguration(
                "weighted pool is empty".to_string(),
            ));
        }

        Ok(Self { keys, cumulative })
    }

    /// Sum of all weights.
    #[inline]
    #[must_use]
    pub fn total_weight(&self) -> u64 {
        // Non-empty by construction.
        self.cumulative.last().copied().unwrap_or(0)
    }

    /// Number of entries.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Always false; empty pools are rejected by [`WeightedPool::new`].
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Weight of the entry at `index`.
    #[must_use]
    pub fn weight_at(&self, index: usize) -> Option<u64> {
        let upper = *self.cumulative.get(index)?;
        let lower = if index == 0 { 0 } else { self.cumulative[index - 1] };
        Some(upper - lower)
    }

    /// Iterates over the keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.keys.iter()
    }

    /// Maps a draw in `[0, total)` to an entry index.
    #[inline]
    #[must_use]
    pub fn index_for_draw(&self, draw: u64) -> usize {
        // First cumulative weight strictly greater than the draw.
        self.cumulative.partition_point(|&c| c <= draw)
    }

    /// Picks an entry index.
    ///
    /// # Errors
    ///
    /// Returns `RandomSource` if the generator fails.
    pub fn pick_index<R: RngCore + ?Sized>(&self, rng: &mut R) -> LootResult<usize> {
        if self.keys.len() == 1 {
            return Ok(0);
        }
        let draw = roll::below(rng, self.total_weight())?;
        Ok(self.index_for_draw(draw))
    }

    /// Picks a key.
    ///
    /// # Errors
    ///
    /// Returns `RandomSource` if the generator fails.
    pub fn pick<R: RngCore + ?Sized>(&self, rng: &mut R) -> LootResult<&K> {
        let index = self.pick_index(rng)?;
        Ok(&self.keys[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_empty_pool_rejected() {
        let pool = WeightedPool::<u32>::new(Vec::new());
        assert!(matches!(pool, Err(LootError::InvalidWeightConfiguration(_))));
    }

    #[test]
    fn test_zero_weight_rejected() {
        let pool = WeightedPool::new(vec![("a", 5), ("b", 0)]);
        assert!(matches!(pool, Err(LootError::InvalidWeightConfiguration(_))));
    }

    #[test]
    fn test_single_entry_always_wins() {
        let pool = WeightedPool::new(vec![("only", 3)]).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        for _ in 0..100 {
            assert_eq!(*pool.pick(&mut rng).unwrap(), "only");
        }
    }

    #[test]
    fn test_draw_boundaries() {
        let pool = WeightedPool::new(vec![('a', 90), ('b', 10)]).unwrap();
        assert_eq!(pool.total_weight(), 100);
        assert_eq!(pool.index_for_draw(0), 0);
        assert_eq!(pool.index_for_draw(89), 0);
        assert_eq!(pool.index_for_draw(90), 1);
        assert_eq!(pool.index_for_draw(99), 1);
        assert_eq!(pool.weight_at(1), Some(10));
        assert_eq!(pool.weight_at(2), None);
    }

    #[test]
    fn test_seeded_draws_are_reproducible() {
        let pool = WeightedPool::new(vec![(1u32, 5), (2, 7), (3, 11)]).unwrap();
        let mut a = ChaCha8Rng::seed_from_u64(1234);
        let mut b = ChaCha8Rng::seed_from_u64(1234);
        for _ in 0..500 {
            assert_eq!(pool.pick(&mut a).unwrap(), pool.pick(&mut b).unwrap());
        }
    }

    #[test]
    fn test_frequencies_converge_to_weights() {
        let weights = [(0usize, 50u64), (1, 30), (2, 15), (3, 5)];
        let pool = WeightedPool::new(weights).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(0x5EED);
        let draws = 100_000u32;
        let mut counts = [0u32; 4];
        for _ in 0..draws {
            counts[*pool.pick(&mut rng).unwrap()] += 1;
        }
        for (index, weight) in weights {
            let expected = f64::from(draws) * weight as f64 / 100.0;
            let observed = f64::from(counts[index]);
            let tolerance = expected * 0.05 + 50.0;
            assert!(
                (observed - expected).abs() < tolerance,
                "entry {index}: expected ~{expected}, got {observed}"
            );
        }
    }
}
