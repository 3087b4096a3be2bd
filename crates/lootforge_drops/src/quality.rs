//! # Quality Tiers
//!
//! A granted item gets its quality from a second weighted roll over a
//! per-item tier map. Items without a map keep their catalog quality.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{LootError, LootResult};
use crate::weighted::WeightedPool;

/// Fractional tier weights are kept at this resolution (`1.5` -> `15_000`).
const QUALITY_WEIGHT_SCALE: f64 = 10_000.0;

/// Quality tier of a granted item.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Quality {
    /// Grey junk.
    Poor = 0,
    /// Plain white.
    #[default]
    Normal = 1,
    /// Fine.
    Fine = 2,
    /// Excellent.
    Excellent = 3,
    /// Superb.
    Superb = 4,
    /// Master-crafted.
    Master = 5,
    /// Epic.
    Epic = 6,
    /// Legendary.
    Legendary = 7,
    /// Mythic.
    Mythic = 8,
}

impl Quality {
    /// All tiers, lowest first.
    pub const ALL: [Self; 9] = [
        Self::Poor,
        Self::Normal,
        Self::Fine,
        Self::Excellent,
        Self::Superb,
        Self::Master,
        Self::Epic,
        Self::Legendary,
        Self::Mythic,
    ];

    /// Converts from the on-disk tag.
    #[inline]
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Poor),
            1 => Some(Self::Normal),
            2 => Some(Self::Fine),
            3 => Some(Self::Excellent),
            4 => Some(Self::Superb),
            5 => Some(Self::Master),
            6 => Some(Self::Epic),
            7 => Some(Self::Legendary),
            8 => Some(Self::Mythic),
            _ => None,
        }
    }

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Poor => "poor",
            Self::Normal => "normal",
            Self::Fine => "fine",
            Self::Excellent => "excellent",
            Self::Superb => "superb",
            Self::Master => "master",
            Self::Epic => "epic",
            Self::Legendary => "legendary",
            Self::Mythic => "mythic",
        }
    }
}

impl FromStr for Quality {
    type Err = LootError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| LootError::InvalidConfig(format!("unknown quality tier '{s}'")))
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A validated tier weight map, prebuilt into a weighted pool.
///
/// Deserializes from a table such as `{ normal = 60, fine = 30, superb = 1.5 }`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "BTreeMap<String, f64>")]
pub struct QualityWeights {
    pool: WeightedPool<Quality>,
}

impl QualityWeights {
    /// Builds from integer weights.
    ///
    /// # Errors
    ///
    /// Returns `InvalidWeightConfiguration` if the map is empty or any weight is zero.
    pub fn from_weights(weights: impl IntoIterator<Item = (Quality, u64)>) -> LootResult<Self> {
        Ok(Self {
            pool: WeightedPool::new(weights)?,
        })
    }

    /// Number of tiers in the map.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pool.len()
    }

    /// Always false once constructed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// Rolls one tier.
    ///
    /// # Errors
    ///
    /// Returns `RandomSource` if the generator fails.
    pub fn roll<R: RngCore + ?Sized>(&self, rng: &mut R) -> LootResult<Quality> {
        self.pool.pick(rng).copied()
    }
}

impl TryFrom<BTreeMap<String, f64>> for QualityWeights {
    type Error = LootError;

    fn try_from(raw: BTreeMap<String, f64>) -> Result<Self, Self::Error> {
        let mut weights = Vec::with_capacity(raw.len());
        for (tier, weight) in raw {
            let quality: Quality = tier.parse()?;
            if !weight.is_finite() || weight <= 0.0 {
                return Err(LootError::InvalidConfig(format!(
                    "quality weight for {quality} must be > 0, got {weight}"
                )));
            }
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let scaled = (weight * QUALITY_WEIGHT_SCALE).round() as u64;
            weights.push((quality, scaled.max(1)));
        }
        Self::from_weights(weights)
    }
}

/// Picks the quality of a granted item.
pub struct QualityResolver;

impl QualityResolver {
    /// Rolls from `weights` when present, otherwise returns `fallback` without
    /// touching the random source.
    ///
    /// # Errors
    ///
    /// Returns `RandomSource` if the generator fails.
    pub fn resolve<R: RngCore + ?Sized>(
        weights: Option<&QualityWeights>,
        fallback: Quality,
        rng: &mut R,
    ) -> LootResult<Quality> {
        match weights {
            Some(weights) if !weights.is_empty() => weights.roll(rng),
            _ => Ok(fallback),
        }
    }
}
