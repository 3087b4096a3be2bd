//! Synthetic kill stream for soak runs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use lootforge_drops::{DropContext, DropOutcome, DropSource, LootError, SlotRef};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::settings::SimulationSettings;
use crate::Coordinator;

const MAX_ATTEMPTS: u32 = 3;
const REPORT_EVERY: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct Totals {
    events: u64,
    grants: u64,
    world_grants: u64,
    failures: u64,
}

/// Feeds random kills into the coordinator until the task is aborted.
pub async fn run(coordinator: Arc<Coordinator>, settings: SimulationSettings) {
    let mut rng = ChaCha20Rng::from_entropy();
    // Later runs start above any id an earlier run could have used.
    let mut event_id = u64::try_from(Utc::now().timestamp_micros()).unwrap_or_default();
    let mut ticker = interval(Duration::from_secs(1) / settings.kills_per_second);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut totals = Totals::default();
    let mut last_report = Instant::now();

    info!(
        monsters = settings.monster_ids.len(),
        players = settings.players,
        rate = settings.kills_per_second,
        "kill simulation started"
    );

    loop {
        ticker.tick().await;
        event_id += 1;
        let ctx = random_kill(&settings, event_id, &mut rng);

        match tokio::task::block_in_place(|| resolve_with_retry(&coordinator, &ctx, &mut rng)) {
            Ok(outcome) => {
                totals.events += 1;
                totals.grants += outcome.grants.len() as u64;
                totals.world_grants += outcome
                    .records
                    .iter()
                    .filter(|r| matches!(r.key.slot, SlotRef::World(_)))
                    .count() as u64;
            }
            Err(e) => {
                totals.failures += 1;
                warn!(event_id, error = %e, "simulated kill failed");
            }
        }

        if last_report.elapsed() >= REPORT_EVERY {
            info!(
                events = totals.events,
                grants = totals.grants,
                world_grants = totals.world_grants,
                failures = totals.failures,
                "kill simulation progress"
            );
            last_report = Instant::now();
        }
    }
}

fn resolve_with_retry(
    coordinator: &Coordinator,
    ctx: &DropContext,
    rng: &mut ChaCha20Rng,
) -> Result<DropOutcome, LootError> {
    let mut attempt = 1;
    loop {
        match coordinator.resolve_drop(ctx, rng) {
            Err(e) if e.is_retryable() && attempt < MAX_ATTEMPTS => attempt += 1,
            result => return result,
        }
    }
}

fn random_kill(settings: &SimulationSettings, event_id: u64, rng: &mut ChaCha20Rng) -> DropContext {
    let monster = settings.monster_ids[rng.gen_range(0..settings.monster_ids.len())];
    let player = rng.gen_range(1..=settings.players);
    let (low, high) = settings.level_range;

    let mut ctx = DropContext::new(event_id, player, DropSource::monster(monster), rng.gen_range(low..=high))
        .with_luck(rng.gen_range(0..=20))
        .with_first_kill(rng.gen_bool(0.01));
    if rng.gen_bool(0.25) {
        ctx = ctx.with_party(player, rng.gen_range(2..=5));
    }
    ctx
}
