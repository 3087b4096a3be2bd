//! # Loot Grant Coordinator
//!
//! The single entry point combat and event systems call. One call resolves
//! one drop event end to end:
//!
//! 1. every pool bound to the event's source, in `display_order`
//! 2. every active world drop config, through the [`WorldDropLimiter`]
//! 3. one [`DropRecord`] per grant, written to the [`AuditSink`]
//!
//! ## Two phases
//!
//! ```text
//! plan    pools rolled, world drop quantity/quality/draw taken   (no writes)
//!   |
//! commit  world drop rows locked, checks run, one audit batch,   (all or
//!         counters kept only if the batch was stored              nothing)
//! ```
//!
//! Every random draw happens in the plan phase, so a failing random source
//! leaves nothing behind. The commit phase writes pool and world drop
//! records as a single batch inside the world drop row locks, so a failing
//! audit sink leaves neither records nor counter changes.
//!
//! ## Failure semantics
//!
//! - A missing pool or item, or a pool with broken weights, skips that pool
//!   or world drop only. The rest of the event still resolves.
//! - Random source and persistence failures abort the event.
//! - Lock contention, or a concurrent attempt recording the event first,
//!   aborts with a retryable error.
//!
//! ## Retries
//!
//! Records are keyed by `(event_id, slot, item_id, sequence)`. Before a slot
//! is resolved, the coordinator looks for records already stored for it and
//! reuses them, so retrying an event never grants a slot twice. The audit
//! sink refuses a batch touching a slot that is already recorded, which
//! turns a lost race into `SlotClaimed`.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::RngCore;
use tracing::{debug, info, warn};

use crate::audit::{AuditSink, DropRecord, GrantKey, SlotRef};
use crate::catalog::{DropConfigSource, PoolBinding, WorldDropConfig};
use crate::context::{Clock, ConfigId, DropContext, EventId, PoolId, SystemClock};
use crate::error::{LootError, LootResult};
use crate::limiter::{ConsumeOutcome, DenyReason, PendingAttempt, WorldDropLimiter};
use crate::pool::{DropPoolEngine, ItemGrant};
use crate::quality::QualityResolver;
use crate::rate::Probability;
use crate::roll;

/// Result of one drop event.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DropOutcome {
    /// The event.
    pub event_id: EventId,
    /// Every grant, pools first, then world drops.
    pub grants: Vec<ItemGrant>,
    /// The audit record behind each grant, in the same order.
    pub records: Vec<DropRecord>,
    /// Pools skipped because of a configuration defect.
    pub skipped_pools: Vec<(PoolId, LootError)>,
    /// World drops skipped because of a configuration defect.
    pub skipped_world_drops: Vec<(ConfigId, LootError)>,
    /// World drops that did not grant, and why.
    pub world_denials: Vec<(ConfigId, DenyReason)>,
    /// Slots whose grants were reused from an earlier attempt.
    pub replayed_slots: usize,
}

impl DropOutcome {
    fn new(event_id: EventId) -> Self {
        Self { event_id, ..Self::default() }
    }

    fn absorb(&mut self, records: Vec<DropRecord>) {
        self.grants.extend(records.iter().map(DropRecord::grant));
        self.records.extend(records);
    }
}

/// A world drop slot after the plan phase.
enum WorldSlot<'a> {
    /// Recorded by an earlier attempt.
    Replayed(Vec<DropRecord>),
    /// Rolled; granted only if the limiter agrees at commit.
    Pending {
        config: &'a WorldDropConfig,
        draw: u32,
        record: DropRecord,
    },
}

/// Everything one event will write, before anything is written.
struct Plan<'a> {
    /// Pool records per slot in display order, replayed or fresh.
    pools: Vec<Vec<DropRecord>>,
    /// Fresh pool records, the first part of the commit batch.
    fresh: Vec<DropRecord>,
    world: Vec<WorldSlot<'a>>,
}

/// Orchestrates pools, world drops and the audit trail for drop events.
pub struct LootGrantCoordinator<C: ?Sized, A: ?Sized, K = SystemClock> {
    config: Arc<C>,
    limiter: Arc<WorldDropLimiter>,
    audit: Arc<A>,
    clock: K,
}

impl<C, A> LootGrantCoordinator<C, A, SystemClock>
where
    C: DropConfigSource + ?Sized,
    A: AuditSink + ?Sized,
{
    /// A coordinator on the system clock.
    #[must_use]
    pub const fn new(config: Arc<C>, limiter: Arc<WorldDropLimiter>, audit: Arc<A>) -> Self {
        Self::with_clock(config, limiter, audit, SystemClock)
    }
}

impl<C, A, K> LootGrantCoordinator<C, A, K>
where
    C: DropConfigSource + ?Sized,
    A: AuditSink + ?Sized,
    K: Clock,
{
    /// A coordinator on a custom clock.
    #[must_use]
    pub const fn with_clock(
        config: Arc<C>,
        limiter: Arc<WorldDropLimiter>,
        audit: Arc<A>,
        clock: K,
    ) -> Self {
        Self { config, limiter, audit, clock }
    }

    /// The limiter.
    #[must_use]
    pub fn limiter(&self) -> &WorldDropLimiter {
        &self.limiter
    }

    /// The audit sink.
    #[must_use]
    pub fn audit(&self) -> &A {
        &self.audit
    }

    /// Resolves one drop event.
    ///
    /// # Errors
    ///
    /// - `RandomSource` or `PersistenceFailure`: nothing was recorded or
    ///   counted for this call
    /// - `ConcurrencyConflict` or `SlotClaimed`: retry the whole call; slots
    ///   recorded by the other attempt are reused
    pub fn resolve_drop<R: RngCore + ?Sized>(
        &self,
        ctx: &DropContext,
        rng: &mut R,
    ) -> LootResult<DropOutcome> {
        let now = self.clock.now();
        let mut outcome = DropOutcome::new(ctx.event_id);

        let plan = self.plan(ctx, rng, now, &mut outcome)?;
        self.commit(plan, ctx, now, &mut outcome)?;

        if !outcome.grants.is_empty() {
            info!(
                event_id = ctx.event_id,
                receiver_id = ctx.receiver_id,
                source = %ctx.source,
                grants = outcome.grants.len(),
                replayed = outcome.replayed_slots,
                "drop event resolved"
            );
        }
        Ok(outcome)
    }

    /// Resets every elapsed daily and hourly window. Returns the number of
    /// windows reset.
    ///
    /// # Errors
    ///
    /// See [`WorldDropLimiter::sweep_expired_windows`].
    pub fn sweep_expired_windows(&self) -> LootResult<usize> {
        self.limiter.sweep_expired_windows(self.clock.now())
    }

    // =========================================================================
    // Plan - every draw, no writes
    // =========================================================================

    fn plan<'c, R: RngCore + ?Sized>(
        &'c self,
        ctx: &DropContext,
        rng: &mut R,
        now: DateTime<Utc>,
        outcome: &mut DropOutcome,
    ) -> LootResult<Plan<'c>> {
        let mut plan = Plan { pools: Vec::new(), fresh: Vec::new(), world: Vec::new() };

        let mut seen = HashSet::new();
        for binding in self.config.bindings_for(&ctx.source) {
            // One slot per pool.
            if !seen.insert(binding.pool_id) {
                continue;
            }
            let slot = SlotRef::Pool(binding.pool_id);
            if let Some(existing) = self.replayed(ctx.event_id, slot, outcome) {
                plan.pools.push(existing);
            } else if let Some(records) = self.plan_binding(binding, ctx, rng, now, outcome)? {
                plan.fresh.extend(records.iter().cloned());
                plan.pools.push(records);
            }
        }
        for config in self.config.world_drops() {
            let slot = SlotRef::World(config.id);
            if let Some(existing) = self.replayed(ctx.event_id, slot, outcome) {
                plan.world.push(WorldSlot::Replayed(existing));
            } else if let Some(pending) = self.plan_world_drop(config, ctx, rng, now, outcome)? {
                plan.world.push(pending);
            }
        }
        Ok(plan)
    }

    fn replayed(
        &self,
        event_id: EventId,
        slot: SlotRef,
        outcome: &mut DropOutcome,
    ) -> Option<Vec<DropRecord>> {
        let existing = self.audit.records_for_slot(event_id, slot);
        if existing.is_empty() {
            return None;
        }
        debug!(event_id, ?slot, records = existing.len(), "reusing recorded grants");
        outcome.replayed_slots += 1;
        Some(existing)
    }

    /// Records for a pool slot, or `None` if it grants nothing.
    fn plan_binding<R: RngCore + ?Sized>(
        &self,
        binding: &PoolBinding,
        ctx: &DropContext,
        rng: &mut R,
        now: DateTime<Utc>,
        outcome: &mut DropOutcome,
    ) -> LootResult<Option<Vec<DropRecord>>> {
        let resolved = self
            .config
            .pool(binding.pool_id)
            .ok_or(LootError::ConfigNotFound {
                kind: "pool",
                id: u64::from(binding.pool_id),
            })
            .and_then(|pool| {
                DropPoolEngine::new(&*self.config).resolve_gated(pool, binding.drop_rate, ctx, rng)
            });
        let grants = match resolved {
            Ok(grants) => grants,
            Err(e) if e.is_fatal_to_event() => return Err(e),
            Err(e) => {
                warn!(pool_id = binding.pool_id, source = %ctx.source, error = %e, "skipping pool");
                outcome.skipped_pools.push((binding.pool_id, e));
                return Ok(None);
            }
        };
        if grants.is_empty() {
            return Ok(None);
        }
        let slot = SlotRef::Pool(binding.pool_id);
        Ok(Some(
            grants
                .iter()
                .zip(0u16..)
                .map(|(grant, sequence)| record_for(ctx, slot, grant, sequence, now))
                .collect(),
        ))
    }

    fn plan_world_drop<'c, R: RngCore + ?Sized>(
        &self,
        config: &'c WorldDropConfig,
        ctx: &DropContext,
        rng: &mut R,
        now: DateTime<Utc>,
        outcome: &mut DropOutcome,
    ) -> LootResult<Option<WorldSlot<'c>>> {
        let Some(item) = self.config.item(config.item_id) else {
            warn!(
                config_id = config.id,
                item_id = config.item_id,
                "skipping world drop, item missing"
            );
            outcome.skipped_world_drops.push((
                config.id,
                LootError::ConfigNotFound { kind: "item", id: u64::from(config.item_id) },
            ));
            return Ok(None);
        };

        let grant = ItemGrant {
            item_id: config.item_id,
            quantity: roll::inclusive(rng, config.min_quantity, config.max_quantity)?,
            quality: QualityResolver::resolve(config.quality_weights.as_ref(), item.quality, rng)?,
        };
        let draw = Probability::draw(rng)?;
        Ok(Some(WorldSlot::Pending {
            config,
            draw,
            record: record_for(ctx, SlotRef::World(config.id), &grant, 0, now),
        }))
    }

    // =========================================================================
    // Commit - one audit batch, counters kept only if it is stored
    // =========================================================================

    fn commit(
        &self,
        plan: Plan<'_>,
        ctx: &DropContext,
        now: DateTime<Utc>,
        outcome: &mut DropOutcome,
    ) -> LootResult<()> {
        let Plan { pools, fresh, world } = plan;
        let pending: Vec<(PendingAttempt<'_>, &DropRecord)> = world
            .iter()
            .filter_map(|slot| match slot {
                WorldSlot::Pending { config, draw, record } => {
                    Some((PendingAttempt { config: *config, draw: *draw }, record))
                }
                WorldSlot::Replayed(_) => None,
            })
            .collect();

        let decisions = if pending.is_empty() {
            self.store(ctx.event_id, &fresh)?;
            Vec::new()
        } else {
            let attempts: Vec<PendingAttempt<'_>> = pending.iter().map(|(a, _)| *a).collect();
            self.limiter.try_consume_event(&attempts, ctx, now, |granted| {
                let mut batch = fresh.clone();
                batch.extend(
                    pending
                        .iter()
                        .zip(granted)
                        .filter(|(_, kept)| **kept)
                        .map(|((_, record), _)| DropRecord::clone(record)),
                );
                self.store(ctx.event_id, &batch)
            })?
        };

        for records in pools {
            outcome.absorb(records);
        }
        let mut decisions = decisions.into_iter();
        for slot in world {
            match slot {
                WorldSlot::Replayed(records) => outcome.absorb(records),
                WorldSlot::Pending { config, record, .. } => match decisions.next() {
                    Some(ConsumeOutcome::Granted { .. }) => outcome.absorb(vec![record]),
                    Some(ConsumeOutcome::Denied(reason)) => {
                        outcome.world_denials.push((config.id, reason));
                    }
                    None => {}
                },
            }
        }
        Ok(())
    }

    fn store(&self, event_id: EventId, batch: &[DropRecord]) -> LootResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if self.audit.append(batch)? < batch.len() {
            debug!(event_id, "event recorded by a concurrent attempt");
            return Err(LootError::SlotClaimed { event_id });
        }
        Ok(())
    }
}

fn record_for(
    ctx: &DropContext,
    slot: SlotRef,
    grant: &ItemGrant,
    sequence: u16,
    now: DateTime<Utc>,
) -> DropRecord {
    DropRecord {
        key: GrantKey { event_id: ctx.event_id, slot, item_id: grant.item_id, sequence },
        receiver_id: ctx.receiver_id,
        team_id: ctx.team_id,
        item_id: grant.item_id,
        quantity: grant.quantity,
        quality: grant.quality,
        source: ctx.source,
        player_level: ctx.player_level,
        recorded_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditQuery, MemoryAuditLog};
    use crate::catalog::{DropCatalog, DropPool, DropPoolItem, ItemDef};
    use crate::context::{DropSource, ItemId, ManualClock};
    use crate::quality::Quality;
    use crate::rate::Probability;
    use crate::roll::testing::BrokenRng;
    use chrono::{Duration, TimeZone};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::time::Duration as StdDuration;

    fn items() -> Vec<ItemDef> {
        (1..=4)
            .map(|id| ItemDef {
                id,
                code: format!("item_{id}"),
                name: format!("Item {id}"),
                quality: Quality::Fine,
            })
            .collect()
    }

    fn binding(monster: u32, pool_id: PoolId, order: i32) -> PoolBinding {
        PoolBinding {
            source: DropSource::monster(monster),
            pool_id,
            drop_rate: Probability::ONE,
            display_order: order,
        }
    }

    fn catalog(world: Vec<WorldDropConfig>) -> Arc<DropCatalog> {
        let pools = vec![
            DropPool::new(1, "first", 1, 1).with_item(DropPoolItem::weighted(1, 1)),
            DropPool::new(2, "second", 1, 1).with_item(DropPoolItem::weighted(2, 1)),
            // References an item with no definition.
            DropPool::new(3, "broken", 1, 1).with_item(DropPoolItem::weighted(99, 1)),
        ];
        let bindings = vec![binding(7, 2, 2), binding(7, 1, 1), binding(7, 3, 3), binding(7, 404, 4)];
        Arc::new(DropCatalog::from_parts(items(), pools, bindings, world).unwrap())
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap()
    }

    type TestCoordinator = LootGrantCoordinator<DropCatalog, MemoryAuditLog, Arc<ManualClock>>;

    fn coordinator(world: Vec<WorldDropConfig>) -> (TestCoordinator, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(t0()));
        let coordinator = LootGrantCoordinator::with_clock(
            catalog(world),
            Arc::new(WorldDropLimiter::new(StdDuration::from_millis(20))),
            Arc::new(MemoryAuditLog::new()),
            Arc::clone(&clock),
        );
        (coordinator, clock)
    }

    fn kill(event_id: EventId) -> DropContext {
        DropContext::new(event_id, 42, DropSource::monster(7), 20)
    }

    #[test]
    fn test_pools_in_display_order_and_broken_pools_skipped() {
        let (coordinator, _) = coordinator(vec![]);
        let outcome = coordinator
            .resolve_drop(&kill(1), &mut ChaCha8Rng::seed_from_u64(1))
            .unwrap();

        let items: Vec<ItemId> = outcome.grants.iter().map(|g| g.item_id).collect();
        assert_eq!(items, vec![1, 2]);
        let skipped: Vec<PoolId> = outcome.skipped_pools.iter().map(|(id, _)| *id).collect();
        assert_eq!(skipped, vec![3, 404]);
        assert_eq!(coordinator.audit().len(), 2);
    }

    #[test]
    fn test_records_match_grants() {
        let (coordinator, _) = coordinator(vec![]);
        let outcome = coordinator
            .resolve_drop(&kill(5), &mut ChaCha8Rng::seed_from_u64(5))
            .unwrap();
        let stored = coordinator.audit().query(&AuditQuery::new().receiver(42));
        assert_eq!(stored.len(), outcome.grants.len());
        for (record, grant) in outcome.records.iter().zip(&outcome.grants) {
            assert_eq!(record.grant(), *grant);
            assert_eq!(record.recorded_at, t0());
        }
    }

    #[test]
    fn test_retry_reuses_recorded_grants() {
        let mut world = WorldDropConfig::new(10, 4, Probability::ONE);
        world.total_drop_limit = Some(100);
        let (coordinator, _) = coordinator(vec![world]);

        let first = coordinator
            .resolve_drop(&kill(9), &mut ChaCha8Rng::seed_from_u64(1))
            .unwrap();
        let again = coordinator
            .resolve_drop(&kill(9), &mut ChaCha8Rng::seed_from_u64(2))
            .unwrap();

        assert_eq!(first.grants, again.grants);
        assert_eq!(again.replayed_slots, 3);
        assert_eq!(coordinator.audit().len(), 3);
        assert_eq!(coordinator.limiter().stats(10).unwrap().total_dropped, 1);
    }

    #[test]
    fn test_world_drop_window_is_reset_and_retried() {
        let mut world = WorldDropConfig::new(10, 4, Probability::ONE);
        world.daily_drop_limit = Some(1);
        let (coordinator, clock) = coordinator(vec![world]);
        let mut rng = ChaCha8Rng::seed_from_u64(3);

        coordinator.resolve_drop(&kill(1), &mut rng).unwrap();
        let capped = coordinator.resolve_drop(&kill(2), &mut rng).unwrap();
        assert_eq!(capped.world_denials, vec![(10, DenyReason::DailyExhausted)]);

        clock.advance(Duration::hours(24));
        let next_day = coordinator.resolve_drop(&kill(3), &mut rng).unwrap();
        assert!(next_day.world_denials.is_empty());
        assert!(next_day.grants.iter().any(|g| g.item_id == 4));
        assert_eq!(coordinator.limiter().stats(10).unwrap().daily_dropped, 1);
    }

    #[test]
    fn test_persistence_failure_leaves_counters() {
        struct FailingSink;
        impl AuditSink for FailingSink {
            fn append(&self, _: &[DropRecord]) -> LootResult<usize> {
                Err(LootError::PersistenceFailure("disk gone".into()))
            }
            fn records_for_slot(&self, _: EventId, _: SlotRef) -> Vec<DropRecord> {
                Vec::new()
            }
            fn query(&self, _: &AuditQuery) -> Vec<DropRecord> {
                Vec::new()
            }
        }

        let world = WorldDropConfig::new(10, 4, Probability::ONE);
        let limiter = Arc::new(WorldDropLimiter::new(StdDuration::from_millis(20)));
        let coordinator = LootGrantCoordinator::with_clock(
            Arc::new(DropCatalog::from_parts(items(), vec![], vec![], vec![world]).unwrap()),
            Arc::clone(&limiter),
            Arc::new(FailingSink),
            ManualClock::new(t0()),
        );
        let err = coordinator
            .resolve_drop(&kill(1), &mut ChaCha8Rng::seed_from_u64(1))
            .unwrap_err();
        assert!(matches!(err, LootError::PersistenceFailure(_)));
        assert_eq!(limiter.stats(10).unwrap().total_dropped, 0);
    }

    #[test]
    fn test_random_failure_aborts_event() {
        // Single-item pools resolve without drawing; the world drop roll fails.
        let (coordinator, _) = coordinator(vec![WorldDropConfig::new(10, 4, Probability::ONE)]);
        let err = coordinator.resolve_drop(&kill(1), &mut BrokenRng).unwrap_err();
        assert!(matches!(err, LootError::RandomSource(_)));
        assert!(!err.is_retryable());
        assert!(coordinator.limiter().stats(10).is_none());
        // The pools rolled fine, but none of their grants were kept.
        assert_eq!(coordinator.audit().len(), 0);
    }

    #[test]
    fn test_failed_batch_records_nothing() {
        /// Stores pool records but refuses anything from a world drop.
        struct WorldlessSink(MemoryAuditLog);
        impl AuditSink for WorldlessSink {
            fn append(&self, records: &[DropRecord]) -> LootResult<usize> {
                if records.iter().any(|r| matches!(r.key.slot, SlotRef::World(_))) {
                    return Err(LootError::PersistenceFailure("world shard offline".into()));
                }
                self.0.append(records)
            }
            fn records_for_slot(&self, event_id: EventId, slot: SlotRef) -> Vec<DropRecord> {
                self.0.records_for_slot(event_id, slot)
            }
            fn query(&self, query: &AuditQuery) -> Vec<DropRecord> {
                self.0.query(query)
            }
        }

        let limiter = Arc::new(WorldDropLimiter::new(StdDuration::from_millis(20)));
        let coordinator = LootGrantCoordinator::with_clock(
            catalog(vec![WorldDropConfig::new(10, 4, Probability::ONE)]),
            Arc::clone(&limiter),
            Arc::new(WorldlessSink(MemoryAuditLog::new())),
            ManualClock::new(t0()),
        );
        let err = coordinator
            .resolve_drop(&kill(1), &mut ChaCha8Rng::seed_from_u64(1))
            .unwrap_err();
        assert!(matches!(err, LootError::PersistenceFailure(_)));
        assert!(coordinator.audit().0.is_empty());
        assert_eq!(limiter.stats(10).unwrap().total_dropped, 0);
    }

    #[test]
    fn test_pool_bound_to_boss_and_monster_grants_once() {
        let pools = vec![DropPool::new(1, "shared", 1, 1).with_item(DropPoolItem::weighted(1, 1))];
        let bindings = vec![
            binding(8, 1, 1),
            PoolBinding { source: DropSource::boss(8), ..binding(8, 1, 2) },
        ];
        let coordinator = LootGrantCoordinator::with_clock(
            Arc::new(DropCatalog::from_parts(items(), pools, bindings, vec![]).unwrap()),
            Arc::new(WorldDropLimiter::new(StdDuration::from_millis(20))),
            Arc::new(MemoryAuditLog::new()),
            ManualClock::new(t0()),
        );

        let ctx = DropContext::new(3, 42, DropSource::boss(8), 20);
        let outcome = coordinator.resolve_drop(&ctx, &mut ChaCha8Rng::seed_from_u64(4)).unwrap();
        assert_eq!(outcome.grants.len(), 1);
        assert_eq!(outcome.replayed_slots, 0);
        assert_eq!(coordinator.audit().len(), 1);
        assert_eq!(coordinator.audit().snapshot(), outcome.records);
    }

    #[test]
    fn test_world_drop_with_missing_item_is_reported() {
        /// A catalog whose item lookups miss one id.
        struct Hiding {
            inner: Arc<DropCatalog>,
            hidden: ItemId,
        }
        impl DropConfigSource for Hiding {
            fn item(&self, id: ItemId) -> Option<&ItemDef> {
                (id != self.hidden).then(|| self.inner.item(id)).flatten()
            }
            fn pool(&self, id: PoolId) -> Option<&DropPool> {
                self.inner.pool(id)
            }
            fn pool_by_code(&self, code: &str) -> Option<&DropPool> {
                self.inner.pool_by_code(code)
            }
            fn bindings_for(&self, source: &DropSource) -> Vec<&PoolBinding> {
                self.inner.bindings_for(source)
            }
            fn world_drops(&self) -> Vec<&WorldDropConfig> {
                self.inner.world_drops()
            }
            fn world_drop(&self, id: ConfigId) -> Option<&WorldDropConfig> {
                self.inner.world_drop(id)
            }
        }

        let source = Hiding {
            inner: catalog(vec![
                WorldDropConfig::new(10, 4, Probability::ONE),
                WorldDropConfig::new(11, 3, Probability::ONE),
            ]),
            hidden: 4,
        };
        let coordinator = LootGrantCoordinator::with_clock(
            Arc::new(source),
            Arc::new(WorldDropLimiter::new(StdDuration::from_millis(20))),
            Arc::new(MemoryAuditLog::new()),
            ManualClock::new(t0()),
        );
        let outcome = coordinator
            .resolve_drop(&kill(1), &mut ChaCha8Rng::seed_from_u64(6))
            .unwrap();
        assert_eq!(
            outcome.skipped_world_drops,
            vec![(10, LootError::ConfigNotFound { kind: "item", id: 4 })]
        );
        assert!(outcome.grants.iter().any(|g| g.item_id == 3));
        assert!(coordinator.limiter().stats(10).is_none());
    }

    #[test]
    fn test_sweep_uses_clock() {
        let mut world = WorldDropConfig::new(10, 4, Probability::ONE);
        world.hourly_drop_limit = Some(5);
        let (coordinator, clock) = coordinator(vec![world]);
        coordinator
            .resolve_drop(&kill(1), &mut ChaCha8Rng::seed_from_u64(1))
            .unwrap();
        assert_eq!(coordinator.sweep_expired_windows().unwrap(), 0);
        clock.advance(Duration::hours(2));
        assert_eq!(coordinator.sweep_expired_windows().unwrap(), 1);
    }
}
