//! # Fixed-Point Probabilities
//!
//! **NO FLOATING POINT AT ROLL TIME**
//!
//! Every probability in the loot system is stored as parts-per-million.
//! Configuration files use decimals (`0.25`), which are converted exactly
//! once when the catalog is loaded. After that, rolls, bonuses and
//! multipliers are integer arithmetic.
//!
//! ## Why Fixed-Point?
//!
//! - Deterministic: the same seed yields the same drops on every machine
//! - No accumulation drift when stacking several bonuses
//! - Auditable: an effective rate can be logged and replayed exactly

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{LootError, LootResult};
use crate::roll;

/// Number of decimal places kept for probabilities.
const DECIMAL_PLACES: u32 = 6;

/// The raw value representing 100%.
pub const PPM_SCALE: u32 = 10u32.pow(DECIMAL_PLACES);

/// Converts a decimal into parts-per-million, rounding to nearest.
fn decimal_to_ppm(value: f64) -> i64 {
    #[allow(clippy::cast_possible_truncation)]
    let ppm = (value * f64::from(PPM_SCALE)).round() as i64;
    ppm
}

// =============================================================================
// Probability - a chance in [0, 1]
// =============================================================================

/// A probability in `[0, 1]` with 6 decimal places.
///
/// Internally stores `p * 1_000_000` as a `u32`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Probability(u32);

impl Probability {
    /// Never happens.
    pub const ZERO: Self = Self(0);
    /// Always happens.
    pub const ONE: Self = Self(PPM_SCALE);

    /// Creates a probability from parts-per-million, saturating at 100%.
    #[inline]
    #[must_use]
    pub const fn from_ppm(ppm: u32) -> Self {
        if ppm > PPM_SCALE {
            Self(PPM_SCALE)
        } else {
            Self(ppm)
        }
    }

    /// Creates a probability from a decimal in `[0, 1]`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for NaN or values outside `[0, 1]`.
    pub fn from_decimal(value: f64) -> LootResult<Self> {
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(LootError::InvalidConfig(format!(
                "probability must be within [0, 1], got {value}"
            )));
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let ppm = decimal_to_ppm(value) as u32;
        Ok(Self::from_ppm(ppm))
    }

    /// Returns the raw parts-per-million value.
    #[inline]
    #[must_use]
    pub const fn ppm(self) -> u32 {
        self.0
    }

    /// Returns true for a probability of exactly zero.
    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Returns true if the probability lies in `(0, 1]`.
    #[inline]
    #[must_use]
    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Applies a signed delta, clamping the result into `[0, 1]`.
    #[inline]
    #[must_use]
    pub fn offset(self, delta: RateDelta) -> Self {
        let raw = i64::from(self.0) + delta.ppm();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let clamped = raw.clamp(0, i64::from(PPM_SCALE)) as u32;
        Self(clamped)
    }

    /// Scales by a multiplier, clamping the result into `[0, 1]`.
    #[inline]
    #[must_use]
    pub fn scale(self, multiplier: Multiplier) -> Self {
        // u64 keeps 1_000_000 * 1_000_000 * k well clear of overflow
        let raw = u64::from(self.0) * u64::from(multiplier.ppm()) / u64::from(PPM_SCALE);
        #[allow(clippy::cast_possible_truncation)]
        let clamped = raw.min(u64::from(PPM_SCALE)) as u32;
        Self(clamped)
    }

    /// Rolls a Bernoulli trial with this probability.
    ///
    /// # Errors
    ///
    /// Returns `RandomSource` if the generator fails.
    pub fn roll<R: RngCore + ?Sized>(self, rng: &mut R) -> LootResult<bool> {
        if self.0 == 0 {
            return Ok(false);
        }
        if self.0 >= PPM_SCALE {
            return Ok(true);
        }
        Ok(self.admits(Self::draw(rng)?))
    }

    /// Draws a uniform value for [`Probability::admits`], so the random
    /// source can be consulted before a lock is taken.
    ///
    /// # Errors
    ///
    /// Returns `RandomSource` if the generator fails.
    pub fn draw<R: RngCore + ?Sized>(rng: &mut R) -> LootResult<u32> {
        let draw = roll::below(rng, u64::from(PPM_SCALE))?;
        #[allow(clippy::cast_possible_truncation)]
        let draw = draw as u32;
        Ok(draw)
    }

    /// True if a draw from [`Probability::draw`] falls inside this probability.
    #[inline]
    #[must_use]
    pub const fn admits(self, draw: u32) -> bool {
        draw < self.0
    }
}

impl TryFrom<f64> for Probability {
    type Error = LootError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::from_decimal(value)
    }
}

impl From<Probability> for f64 {
    fn from(p: Probability) -> Self {
        f64::from(p.0) / f64::from(PPM_SCALE)
    }
}

impl fmt::Debug for Probability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Probability({self})")
    }
}

impl fmt::Display for Probability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.0 / PPM_SCALE, self.0 % PPM_SCALE)
    }
}

// =============================================================================
// RateDelta - a signed additive bonus
// =============================================================================

/// A signed probability delta in parts-per-million (`0.01` = `+10_000`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "f64")]
pub struct RateDelta(i64);

impl RateDelta {
    /// No change.
    pub const ZERO: Self = Self(0);

    /// Creates a delta from raw parts-per-million.
    #[inline]
    #[must_use]
    pub const fn from_ppm(ppm: i64) -> Self {
        Self(ppm)
    }

    /// Returns the raw parts-per-million value.
    #[inline]
    #[must_use]
    pub const fn ppm(self) -> i64 {
        self.0
    }

    /// Multiplies the delta by a count (levels, party members, luck points).
    #[inline]
    #[must_use]
    pub const fn times(self, count: u32) -> Self {
        Self(self.0.saturating_mul(count as i64))
    }

    /// Adds two deltas.
    #[inline]
    #[must_use]
    pub const fn plus(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl TryFrom<f64> for RateDelta {
    type Error = LootError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if !value.is_finite() || !(-1.0..=1.0).contains(&value) {
            return Err(LootError::InvalidConfig(format!(
                "rate bonus must be within [-1, 1], got {value}"
            )));
        }
        Ok(Self(decimal_to_ppm(value)))
    }
}

// =============================================================================
// Multiplier - a non-negative scale factor
// =============================================================================

/// A non-negative multiplier with 6 decimal places (`1.5` = `1_500_000`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "f64")]
pub struct Multiplier(u32);

impl Multiplier {
    /// Leaves the rate unchanged.
    pub const IDENTITY: Self = Self(PPM_SCALE);

    /// Largest accepted multiplier.
    const MAX: f64 = 1000.0;

    /// Creates a multiplier from raw parts-per-million.
    #[inline]
    #[must_use]
    pub const fn from_ppm(ppm: u32) -> Self {
        Self(ppm)
    }

    /// Returns the raw parts-per-million value.
    #[inline]
    #[must_use]
    pub const fn ppm(self) -> u32 {
        self.0
    }
}

impl Default for Multiplier {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl TryFrom<f64> for Multiplier {
    type Error = LootError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if !value.is_finite() || !(0.0..=Self::MAX).contains(&value) {
            return Err(LootError::InvalidConfig(format!(
                "multiplier must be within [0, {}], got {value}",
                Self::MAX
            )));
        }
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let ppm = decimal_to_ppm(value) as u32;
        Ok(Self(ppm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_decimal_conversion_is_exact_to_six_places() {
        let p = Probability::from_decimal(0.000_123).unwrap();
        assert_eq!(p.ppm(), 123);
        assert_eq!(p.to_string(), "0.000123");
        assert_eq!(Probability::from_decimal(1.0).unwrap(), Probability::ONE);
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(Probability::from_decimal(1.01).is_err());
        assert!(Probability::from_decimal(-0.1).is_err());
        assert!(Probability::from_decimal(f64::NAN).is_err());
        assert!(Multiplier::try_from(-1.0).is_err());
        assert!(RateDelta::try_from(2.0).is_err());
    }

    #[test]
    fn test_offset_clamps() {
        let p = Probability::from_ppm(900_000);
        assert_eq!(p.offset(RateDelta::from_ppm(500_000)), Probability::ONE);
        assert_eq!(p.offset(RateDelta::from_ppm(-2_000_000)), Probability::ZERO);
        assert_eq!(p.offset(RateDelta::from_ppm(50_000)).ppm(), 950_000);
    }

    #[test]
    fn test_scale() {
        let p = Probability::from_ppm(200_000);
        assert_eq!(p.scale(Multiplier::from_ppm(1_500_000)).ppm(), 300_000);
        assert_eq!(p.scale(Multiplier::from_ppm(10_000_000)), Probability::ONE);
        assert_eq!(p.scale(Multiplier::IDENTITY), p);
    }

    #[test]
    fn test_roll_edges_never_draw_wrong() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..1000 {
            assert!(!Probability::ZERO.roll(&mut rng).unwrap());
            assert!(Probability::ONE.roll(&mut rng).unwrap());
        }
    }

    #[test]
    fn test_roll_frequency_tracks_rate() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let p = Probability::from_decimal(0.25).unwrap();
        let hits = (0..20_000).filter(|_| p.roll(&mut rng).unwrap()).count();
        // 25% of 20k = 5000, 3 sigma ~ 184
        assert!((4700..=5300).contains(&hits), "got {hits}");
    }

    #[test]
    fn test_serde_from_decimal() {
        #[derive(Deserialize)]
        struct Doc {
            rate: Probability,
            bonus: RateDelta,
            mult: Multiplier,
        }
        let doc: Doc = toml::from_str("rate = 0.05\nbonus = -0.01\nmult = 2.0").unwrap();
        assert_eq!(doc.rate.ppm(), 50_000);
        assert_eq!(doc.bonus.ppm(), -10_000);
        assert_eq!(doc.mult.ppm(), 2_000_000);
    }
}
