//! # Drop Pool Resolution
//!
//! Turns one pool roll into zero or more item grants.
//!
//! ## Slot model
//!
//! A resolution fills a number of slots drawn uniformly from
//! `[min_drops, max_drops]`:
//!
//! 1. **Guaranteed slots** (`guaranteed_drops`) always yield an item while
//!    eligible items remain. Items flagged `guaranteed` fill them first,
//!    heaviest first; the rest are rolled.
//! 2. **Variable slots** are only attempted if the binding's gate rate
//!    passes. Each attempt gives rate-only items an independent Bernoulli
//!    trial, in pool order, before falling back to a weighted roll over the
//!    weighted items. An attempt may yield nothing when the pool has no
//!    weighted items left.
//!
//! `drop_weight` is authoritative when an item has both a weight and a rate.
//! Without `allow_duplicates`, a chosen item leaves the candidate set.
//!
//! The engine is a pure function of configuration and the random source. It
//! holds no mutable state and needs no locking.

use std::cmp::Reverse;
use std::collections::HashMap;

use rand::RngCore;
use tracing::debug;

use crate::catalog::{DropConfigSource, DropPool, DropPoolItem, ItemDef};
use crate::context::{DropContext, ItemId};
use crate::error::{LootError, LootResult};
use crate::quality::{Quality, QualityResolver};
use crate::rate::Probability;
use crate::roll;
use crate::weighted::WeightedPool;

/// One resolved item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ItemGrant {
    /// Item granted.
    pub item_id: ItemId,
    /// Units granted.
    pub quantity: u32,
    /// Rolled or catalog quality.
    pub quality: Quality,
}

/// Resolves drop pools against a configuration source.
pub struct DropPoolEngine<'a, C: DropConfigSource + ?Sized> {
    config: &'a C,
}

impl<'a, C: DropConfigSource + ?Sized> DropPoolEngine<'a, C> {
    /// Creates an engine over a configuration source.
    #[must_use]
    pub const fn new(config: &'a C) -> Self {
        Self { config }
    }

    /// Resolves a pool with its variable slots always attempted.
    ///
    /// # Errors
    ///
    /// See [`DropPoolEngine::resolve_gated`].
    pub fn resolve_pool<R: RngCore + ?Sized>(
        &self,
        pool: &DropPool,
        ctx: &DropContext,
        rng: &mut R,
    ) -> LootResult<Vec<ItemGrant>> {
        self.resolve_gated(pool, Probability::ONE, ctx, rng)
    }

    /// Resolves a pool, attempting the variable slots only if `gate` passes.
    ///
    /// Returns an empty list when no item is eligible at the context's level.
    ///
    /// # Errors
    ///
    /// - `ConfigNotFound` if an eligible item has no catalog definition
    /// - `InvalidWeightConfiguration` if an eligible item has neither a
    ///   positive weight nor a positive rate
    /// - `RandomSource` if the generator fails
    pub fn resolve_gated<R: RngCore + ?Sized>(
        &self,
        pool: &DropPool,
        gate: Probability,
        ctx: &DropContext,
        rng: &mut R,
    ) -> LootResult<Vec<ItemGrant>> {
        let mut candidates: Vec<Candidate<'_>> = Vec::new();
        for item in pool.items.iter().filter(|i| i.accepts_level(ctx.player_level)) {
            self.definition(item.item_id)?;
            candidates.push(Candidate::new(item)?);
        }

        if candidates.is_empty() {
            debug!(pool_id = pool.id, level = ctx.player_level, "no eligible items");
            return Ok(Vec::new());
        }

        let drawn = roll::inclusive(rng, u32::from(pool.min_drops), u32::from(pool.max_drops))?;
        let target = usize::try_from(drawn).unwrap_or(usize::from(pool.max_drops));
        let guaranteed = usize::from(pool.guaranteed_drops).min(target);
        let mut chosen: Vec<&DropPoolItem> = Vec::with_capacity(target);

        // Popped from the back: heaviest first, pool order among equals.
        let mut flagged: Vec<(u64, Reverse<usize>, ItemId)> = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| c.item.guaranteed)
            .map(|(pos, c)| (c.weight.unwrap_or(0), Reverse(pos), c.item.item_id))
            .collect();
        flagged.sort_unstable();

        while chosen.len() < guaranteed && !candidates.is_empty() {
            let index = match next_flagged(&mut flagged, &candidates) {
                Some(index) => index,
                None => match roll_slot(&candidates, rng)? {
                    Some(index) => index,
                    None => roll_by_rate(&candidates, rng)?,
                },
            };
            chosen.push(take(&mut candidates, index, pool.allow_duplicates));
        }

        if chosen.len() < target && gate.roll(rng)? {
            for _ in chosen.len()..target {
                if candidates.is_empty() {
                    break;
                }
                if let Some(index) = roll_slot(&candidates, rng)? {
                    chosen.push(take(&mut candidates, index, pool.allow_duplicates));
                }
            }
        }

        let mut grants = Vec::with_capacity(chosen.len());
        for item in chosen {
            let quantity = roll::inclusive(rng, item.min_quantity, item.max_quantity)?;
            let fallback = self.definition(item.item_id)?.quality;
            let quality = QualityResolver::resolve(item.quality_weights.as_ref(), fallback, rng)?;
            grants.push(ItemGrant { item_id: item.item_id, quantity, quality });
        }

        debug!(
            pool_id = pool.id,
            target,
            granted = grants.len(),
            "pool resolved"
        );
        Ok(grants)
    }

    /// Resolves a pool `iterations` times and tallies the results.
    ///
    /// # Errors
    ///
    /// Fails on the first resolution error.
    pub fn simulate<R: RngCore + ?Sized>(
        &self,
        pool: &DropPool,
        ctx: &DropContext,
        rng: &mut R,
        iterations: u32,
    ) -> LootResult<PoolStatistics> {
        let mut stats = PoolStatistics::new();
        for _ in 0..iterations {
            let grants = self.resolve_pool(pool, ctx, rng)?;
            stats.resolutions += 1;
            if grants.is_empty() {
                stats.empty_resolutions += 1;
            }
            for grant in grants {
                stats.total_grants += 1;
                *stats.item_counts.entry(grant.item_id).or_insert(0) += 1;
                *stats.item_quantities.entry(grant.item_id).or_insert(0) += u64::from(grant.quantity);
                *stats.quality_counts.entry(grant.quality).or_insert(0) += 1;
            }
        }
        Ok(stats)
    }

    fn definition(&self, item_id: ItemId) -> LootResult<&'a ItemDef> {
        self.config.item(item_id).ok_or(LootError::ConfigNotFound {
            kind: "item",
            id: u64::from(item_id),
        })
    }
}

/// An eligible pool item with its resolved selection mechanism.
struct Candidate<'p> {
    item: &'p DropPoolItem,
    /// Set when the item takes part in weighted rolls.
    weight: Option<u64>,
    /// Set for rate-only items.
    rate: Option<Probability>,
}

impl<'p> Candidate<'p> {
    fn new(item: &'p DropPoolItem) -> LootResult<Self> {
        match (item.drop_weight, item.drop_rate) {
            (Some(weight), _) if weight > 0 => Ok(Self {
                item,
                weight: Some(u64::from(weight)),
                rate: None,
            }),
            (None, Some(rate)) if rate.is_positive() => Ok(Self { item, weight: None, rate: Some(rate) }),
            _ => Err(LootError::InvalidWeightConfiguration(format!(
                "item {} has no positive drop_weight or drop_rate",
                item.item_id
            ))),
        }
    }
}

/// Pops flagged items until one is still a candidate.
fn next_flagged(
    flagged: &mut Vec<(u64, Reverse<usize>, ItemId)>,
    candidates: &[Candidate<'_>],
) -> Option<usize> {
    while let Some((_, _, item_id)) = flagged.pop() {
        if let Some(index) = candidates.iter().position(|c| c.item.item_id == item_id) {
            return Some(index);
        }
    }
    None
}

/// One slot attempt: rate-only items roll first, then a weighted roll.
fn roll_slot<R: RngCore + ?Sized>(
    candidates: &[Candidate<'_>],
    rng: &mut R,
) -> LootResult<Option<usize>> {
    for (index, candidate) in candidates.iter().enumerate() {
        if let Some(rate) = candidate.rate {
            if rate.roll(rng)? {
                return Ok(Some(index));
            }
        }
    }

    let weighted: Vec<(usize, u64)> = candidates
        .iter()
        .enumerate()
        .filter_map(|(index, c)| c.weight.map(|w| (index, w)))
        .collect();
    if weighted.is_empty() {
        return Ok(None);
    }
    let pool = WeightedPool::new(weighted)?;
    Ok(Some(*pool.pick(rng)?))
}

/// Guaranteed-slot fallback over rate-only items, weighted by their rates.
fn roll_by_rate<R: RngCore + ?Sized>(candidates: &[Candidate<'_>], rng: &mut R) -> LootResult<usize> {
    let by_rate = candidates
        .iter()
        .enumerate()
        .filter_map(|(index, c)| c.rate.map(|r| (index, u64::from(r.ppm()))));
    let pool = WeightedPool::new(by_rate)?;
    Ok(*pool.pick(rng)?)
}

fn take<'p>(candidates: &mut Vec<Candidate<'p>>, index: usize, allow_duplicates: bool) -> &'p DropPoolItem {
    if allow_duplicates {
        candidates[index].item
    } else {
        candidates.remove(index).item
    }
}

/// Tallies from [`DropPoolEngine::simulate`].
#[derive(Clone, Debug, Default)]
pub struct PoolStatistics {
    /// Resolutions performed.
    pub resolutions: u64,
    /// Resolutions that granted nothing.
    pub empty_resolutions: u64,
    /// Grants across all resolutions.
    pub total_grants: u64,
    /// Times each item was granted.
    pub item_counts: HashMap<ItemId, u64>,
    /// Units granted per item.
    pub item_quantities: HashMap<ItemId, u64>,
    /// Grants per quality tier.
    pub quality_counts: HashMap<Quality, u64>,
}

impl PoolStatistics {
    /// Creates empty statistics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Average grants per resolution.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn grants_per_resolution(&self) -> f64 {
        if self.resolutions == 0 {
            0.0
        } else {
            self.total_grants as f64 / self.resolutions as f64
        }
    }

    /// Share of grants that were `item_id`, in percent.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn item_share_percent(&self, item_id: ItemId) -> f64 {
        if self.total_grants == 0 {
            return 0.0;
        }
        let count = self.item_counts.get(&item_id).copied().unwrap_or(0);
        count as f64 / self.total_grants as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DropCatalog, ItemDef};
    use crate::context::DropSource;
    use crate::quality::QualityWeights;
    use crate::roll::testing::BrokenRng;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn item(id: ItemId) -> ItemDef {
        ItemDef {
            id,
            code: format!("item_{id}"),
            name: format!("Item {id}"),
            quality: Quality::Normal,
        }
    }

    fn catalog(ids: &[ItemId]) -> DropCatalog {
        DropCatalog::from_parts(ids.iter().map(|&id| item(id)).collect(), vec![], vec![], vec![])
            .unwrap()
    }

    fn ctx(level: u16) -> DropContext {
        DropContext::new(1, 1, DropSource::monster(1), level)
    }

    #[test]
    fn test_no_eligible_items_is_empty_not_error() {
        let config = catalog(&[1]);
        let mut gated = DropPoolItem::weighted(1, 10);
        gated.min_level = Some(50);
        let pool = DropPool::new(1, "p", 1, 1).guaranteed(1).with_item(gated);

        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let grants = DropPoolEngine::new(&config).resolve_pool(&pool, &ctx(10), &mut rng).unwrap();
        assert!(grants.is_empty());
    }

    #[test]
    fn test_guaranteed_slots_always_fill() {
        let config = catalog(&[1, 2, 3]);
        let pool = DropPool::new(1, "p", 2, 2)
            .guaranteed(2)
            .with_item(DropPoolItem::with_rate(1, Probability::from_ppm(1)))
            .with_item(DropPoolItem::with_rate(2, Probability::from_ppm(1)))
            .with_item(DropPoolItem::with_rate(3, Probability::from_ppm(1)));
        let engine = DropPoolEngine::new(&config);
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..200 {
            let grants = engine.resolve_pool(&pool, &ctx(1), &mut rng).unwrap();
            assert_eq!(grants.len(), 2);
            assert_ne!(grants[0].item_id, grants[1].item_id);
        }
    }

    #[test]
    fn test_flagged_items_take_guaranteed_slots_first() {
        let config = catalog(&[1, 2, 3]);
        let mut light = DropPoolItem::weighted(2, 1);
        light.guaranteed = true;
        let mut heavy = DropPoolItem::weighted(3, 5);
        heavy.guaranteed = true;
        let pool = DropPool::new(1, "p", 1, 1)
            .guaranteed(1)
            .with_item(DropPoolItem::weighted(1, 1000))
            .with_item(light)
            .with_item(heavy);

        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for _ in 0..50 {
            let grants = DropPoolEngine::new(&config).resolve_pool(&pool, &ctx(1), &mut rng).unwrap();
            assert_eq!(grants.len(), 1);
            assert_eq!(grants[0].item_id, 3);
        }
    }

    #[test]
    fn test_closed_gate_skips_variable_slots() {
        let config = catalog(&[1, 2]);
        let pool = DropPool::new(1, "p", 2, 2)
            .guaranteed(1)
            .with_item(DropPoolItem::weighted(1, 1))
            .with_item(DropPoolItem::weighted(2, 1));
        let engine = DropPoolEngine::new(&config);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for _ in 0..100 {
            let grants = engine.resolve_gated(&pool, Probability::ZERO, &ctx(1), &mut rng).unwrap();
            assert_eq!(grants.len(), 1);
        }
    }

    #[test]
    fn test_duplicates_only_when_allowed() {
        let config = catalog(&[1]);
        let mut pool = DropPool::new(1, "p", 3, 3).with_item(DropPoolItem::weighted(1, 1));
        let engine = DropPoolEngine::new(&config);
        let mut rng = ChaCha8Rng::seed_from_u64(3);

        assert_eq!(engine.resolve_pool(&pool, &ctx(1), &mut rng).unwrap().len(), 1);
        pool.allow_duplicates = true;
        assert_eq!(engine.resolve_pool(&pool, &ctx(1), &mut rng).unwrap().len(), 3);
    }

    #[test]
    fn test_weight_wins_over_rate() {
        let config = catalog(&[1, 2]);
        let mut both = DropPoolItem::weighted(1, 1);
        both.drop_rate = Some(Probability::ONE);
        let pool = DropPool::new(1, "p", 1, 1)
            .with_item(both)
            .with_item(DropPoolItem::weighted(2, 999));
        let stats = DropPoolEngine::new(&config)
            .simulate(&pool, &ctx(1), &mut ChaCha8Rng::seed_from_u64(1), 2_000)
            .unwrap();
        // A certain rate would pick item 1 every time; as weight 1 of 1000 it is rare.
        assert!(stats.item_counts.get(&1).copied().unwrap_or(0) < 20);
    }

    #[test]
    fn test_quantity_and_quality() {
        let config = catalog(&[1]);
        let mut stack = DropPoolItem::weighted(1, 1);
        stack.min_quantity = 2;
        stack.max_quantity = 4;
        stack.quality_weights = Some(QualityWeights::from_weights([(Quality::Epic, 1)]).unwrap());
        let pool = DropPool::new(1, "p", 1, 1).with_item(stack);

        let stats = DropPoolEngine::new(&config)
            .simulate(&pool, &ctx(1), &mut ChaCha8Rng::seed_from_u64(2), 500)
            .unwrap();
        assert_eq!(stats.quality_counts.get(&Quality::Epic), Some(&500));
        let units = stats.item_quantities[&1];
        assert!((1_000..=2_000).contains(&units), "got {units}");
    }

    #[test]
    fn test_missing_item_definition() {
        let config = catalog(&[]);
        let pool = DropPool::new(1, "p", 1, 1).with_item(DropPoolItem::weighted(9, 1));
        let err = DropPoolEngine::new(&config)
            .resolve_pool(&pool, &ctx(1), &mut ChaCha8Rng::seed_from_u64(0))
            .unwrap_err();
        assert_eq!(err, LootError::ConfigNotFound { kind: "item", id: 9 });
    }

    #[test]
    fn test_item_without_mechanism_is_weight_error() {
        let config = catalog(&[1]);
        let mut bare = DropPoolItem::weighted(1, 1);
        bare.drop_weight = None;
        let pool = DropPool::new(1, "p", 1, 1).with_item(bare);
        let err = DropPoolEngine::new(&config)
            .resolve_pool(&pool, &ctx(1), &mut ChaCha8Rng::seed_from_u64(0))
            .unwrap_err();
        assert!(matches!(err, LootError::InvalidWeightConfiguration(_)));
    }

    #[test]
    fn test_random_failure_propagates() {
        let config = catalog(&[1, 2]);
        let pool = DropPool::new(1, "p", 1, 2)
            .with_item(DropPoolItem::weighted(1, 1))
            .with_item(DropPoolItem::weighted(2, 1));
        let err = DropPoolEngine::new(&config)
            .resolve_pool(&pool, &ctx(1), &mut BrokenRng)
            .unwrap_err();
        assert!(err.is_fatal_to_event());
    }
}
