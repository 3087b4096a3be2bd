//! Random source helpers.
//!
//! All randomness flows through [`rand::RngCore::try_fill_bytes`] so that a
//! failing source surfaces as [`LootError::RandomSource`] instead of a panic.
//! Integer draws use rejection sampling: no modulo bias, and a fixed seed
//! always yields the same sequence.

use rand::RngCore;

use crate::error::{LootError, LootResult};

/// Draws a full 64-bit value.
///
/// # Errors
///
/// Returns `RandomSource` if the generator fails.
#[inline]
pub fn next_u64<R: RngCore + ?Sized>(rng: &mut R) -> LootResult<u64> {
    let mut bytes = [0u8; 8];
    rng.try_fill_bytes(&mut bytes)
        .map_err(|e| LootError::RandomSource(e.to_string()))?;
    Ok(u64::from_le_bytes(bytes))
}

/// Draws uniformly from `[0, bound)`.
///
/// # Errors
///
/// Returns `RandomSource` if the generator fails, or
/// `InvalidWeightConfiguration` for an empty range.
pub fn below<R: RngCore + ?Sized>(rng: &mut R, bound: u64) -> LootResult<u64> {
    if bound == 0 {
        return Err(LootError::InvalidWeightConfiguration(
            "cannot draw from an empty range".to_string(),
        ));
    }
    // Largest multiple of `bound` that fits; values above it are redrawn.
    let zone = u64::MAX - (u64::MAX % bound);
    loop {
        let value = next_u64(rng)?;
        if value < zone {
            return Ok(value % bound);
        }
    }
}

/// Draws uniformly from `[low, high]`. Returns `low` when `high <= low`.
///
/// # Errors
///
/// Returns `RandomSource` if the generator fails.
pub fn inclusive<R: RngCore + ?Sized>(rng: &mut R, low: u32, high: u32) -> LootResult<u32> {
    if high <= low {
        return Ok(low);
    }
    let span = u64::from(high - low) + 1;
    let offset = below(rng, span)?;
    #[allow(clippy::cast_possible_truncation)]
    let offset = offset as u32;
    Ok(low + offset)
}


#[cfg(test)]
mod tests {
    use super::testing::BrokenRng;
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_below_stays_in_range() {
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        for bound in [1u64, 2, 3, 7, 1000, u64::MAX] {
            for _ in 0..200 {
                assert!(below(&mut rng, bound).unwrap() < bound);
            }
        }
    }

    #[test]
    fn test_inclusive_covers_both_ends() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut seen = [false; 3];
        for _ in 0..500 {
            let v = inclusive(&mut rng, 1, 3).unwrap();
            seen[(v - 1) as usize] = true;
        }
        assert_eq!(seen, [true; 3]);
        assert_eq!(inclusive(&mut rng, 5, 5).unwrap(), 5);
        assert_eq!(inclusive(&mut rng, 5, 2).unwrap(), 5);
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let mut a = ChaCha8Rng::seed_from_u64(77);
        let mut b = ChaCha8Rng::seed_from_u64(77);
        for _ in 0..100 {
            assert_eq!(below(&mut a, 97).unwrap(), below(&mut b, 97).unwrap());
        }
    }

    #[test]
    fn test_broken_source_is_an_error() {
        let err = below(&mut BrokenRng, 10).unwrap_err();
        assert!(matches!(err, LootError::RandomSource(_)));
    }

    #[test]
    fn test_empty_range_rejected() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(matches!(
            below(&mut rng, 0),
            Err(LootError::InvalidWeightConfiguration(_))
        ));
    }
}
