//! Integration test for the WAL-backed audit trail.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use lootforge_drops::{
    AuditQuery, AuditSink, DenyReason, DropCatalog, DropContext, DropSource, LootGrantCoordinator,
    ManualClock, WalAuditLog, WorldDropLedger, WorldDropLimiter,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

const CATALOG: &str = r#"
    [[item]]
    id = 1
    code = "bone"
    name = "Bone"

    [[item]]
    id = 2
    code = "soul_gem"
    name = "Soul Gem"
    quality = "epic"

    [[pool]]
    id = 1
    code = "skeleton"
    pool_type = "monster"
    min_drops = 1
    max_drops = 2
    guaranteed_drops = 1

    [[pool.items]]
    item_id = 1
    drop_weight = 1
    max_quantity = 4

    [[monster_drop]]
    monster_id = 3
    pool_id = 1

    [[world_drop]]
    id = 50
    item_id = 2
    base_drop_rate = 1.0
    total_drop_limit = 3
"#;

fn temp_wal_path() -> std::path::PathBuf {
    let id = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("test_wal_audit_{id}.wal"))
}

#[test]
fn test_restart_restores_audit_and_caps() {
    let path = temp_wal_path();
    let catalog = Arc::new(DropCatalog::from_toml_str(CATALOG).unwrap());
    let start = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(99);

    let before = {
        let audit = Arc::new(WalAuditLog::open(&path).unwrap());
        let coordinator = LootGrantCoordinator::with_clock(
            Arc::clone(&catalog),
            Arc::new(WorldDropLimiter::default()),
            Arc::clone(&audit),
            ManualClock::new(start),
        );
        for event in 0..2 {
            let ctx = DropContext::new(event, 8, DropSource::monster(3), 15);
            coordinator.resolve_drop(&ctx, &mut rng).unwrap();
        }
        audit.snapshot()
    };
    assert!(!before.is_empty());

    // Restart: the log is the only state that survives.
    let audit = Arc::new(WalAuditLog::open(&path).unwrap());
    assert_eq!(audit.snapshot(), before);

    let now = start + Duration::minutes(5);
    let ledger = WorldDropLedger::rebuild_from_records(&audit.snapshot(), now);
    let limiter = Arc::new(WorldDropLimiter::with_ledger(
        ledger,
        std::time::Duration::from_millis(250),
    ));
    assert_eq!(limiter.stats(50).unwrap().total_dropped, 2);

    let coordinator = LootGrantCoordinator::with_clock(
        catalog,
        Arc::clone(&limiter),
        Arc::clone(&audit),
        ManualClock::new(now),
    );

    // Event 1 is a retry of work that already happened.
    let replay = coordinator
        .resolve_drop(&DropContext::new(1, 8, DropSource::monster(3), 15), &mut rng)
        .unwrap();
    assert_eq!(replay.replayed_slots, 2);

    let third = coordinator
        .resolve_drop(&DropContext::new(2, 8, DropSource::monster(3), 15), &mut rng)
        .unwrap();
    assert!(third.grants.iter().any(|g| g.item_id == 2));

    let fourth = coordinator
        .resolve_drop(&DropContext::new(3, 8, DropSource::monster(3), 15), &mut rng)
        .unwrap();
    assert_eq!(fourth.world_denials, vec![(50, DenyReason::TotalExhausted)]);

    assert_eq!(audit.count(&AuditQuery::new().item(2)), 3);
    assert_eq!(audit.recent(1)[0].key.event_id, 3);

    drop(coordinator);
    drop(audit);
    std::fs::remove_file(&path).ok();
}

#[test]
fn test_compaction_keeps_every_record() {
    let path = temp_wal_path();
    let catalog = Arc::new(DropCatalog::from_toml_str(CATALOG).unwrap());
    let audit = Arc::new(WalAuditLog::open(&path).unwrap());
    let coordinator = LootGrantCoordinator::with_clock(
        catalog,
        Arc::new(WorldDropLimiter::default()),
        Arc::clone(&audit),
        ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()),
    );
    let mut rng = ChaCha8Rng::seed_from_u64(4);
    for event in 0..25 {
        let ctx = DropContext::new(event, 8, DropSource::monster(3), 15);
        coordinator.resolve_drop(&ctx, &mut rng).unwrap();
    }
    let records = audit.snapshot();

    audit.compact().unwrap();
    drop(coordinator);
    drop(audit);

    let reopened = WalAuditLog::open(&path).unwrap();
    assert_eq!(reopened.snapshot(), records);
    drop(reopened);
    std::fs::remove_file(&path).ok();
}
