//! # LOOTFORGE Drops
//!
//! Loot resolution for the LOOTFORGE game server.
//!
//! ## Design Principles
//!
//! 1. **Zero floating point at roll time** - probabilities are parts-per-million
//! 2. **Pure pool resolution** - config + random source in, grants out
//! 3. **Row-locked supply caps** - world drop counters change under their lock only
//! 4. **Exactly one audit record per grant** - retries reuse recorded grants
//! 5. **External configuration** - all pools and caps live in TOML files
//!
//! ## Flow
//!
//! ```text
//! DropContext ──► LootGrantCoordinator
//!                   ├─ bound pools ──► DropPoolEngine ──► grants
//!                   ├─ world drops ──► WorldDropLimiter ──► grants
//!                   └─ every grant ──► AuditSink (memory or WAL)
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use lootforge_drops::{DropCatalog, DropContext, DropSource, LootGrantCoordinator};
//!
//! let catalog = Arc::new(DropCatalog::from_toml_file("data/catalog.toml")?);
//! let coordinator = LootGrantCoordinator::new(catalog, limiter, audit);
//!
//! let ctx = DropContext::new(event_id, player_id, DropSource::monster(1001), 25);
//! let outcome = coordinator.resolve_drop(&ctx, &mut rng)?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod audit;
pub mod catalog;
pub mod conditions;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod limiter;
pub mod pool;
pub mod quality;
pub mod rate;
pub mod roll;
pub mod wal;
pub mod weighted;

pub use audit::{AuditQuery, AuditSink, DropRecord, GrantKey, MemoryAuditLog, SlotRef};
pub use catalog::{
    DropCatalog, DropConfigSource, DropPool, DropPoolItem, ItemDef, PoolBinding, PoolType,
    WorldDropConfig,
};
pub use conditions::{RateModifier, TriggerCondition};
pub use context::{
    Clock, ConfigId, DropContext, DropSource, DropSourceKind, DungeonType, EventId, ItemId,
    ManualClock, PlayerId, PoolId, QuestId, SystemClock,
};
pub use coordinator::{DropOutcome, LootGrantCoordinator};
pub use error::{LootError, LootResult};
pub use limiter::{
    ConsumeOutcome, DenyReason, PendingAttempt, ResetDue, Verdict, Window, WorldDropLedger, WorldDropLimiter,
    WorldDropStat,
};
pub use pool::{DropPoolEngine, ItemGrant, PoolStatistics};
pub use quality::{Quality, QualityResolver, QualityWeights};
pub use rate::{Multiplier, Probability, RateDelta};
pub use wal::{WalAuditLog, WriteAheadLog};
pub use weighted::WeightedPool;
