//! # Drop Context
//!
//! Everything the combat or event system knows about one drop opportunity:
//! who gets the loot, what was killed or cleared, and the circumstances that
//! trigger conditions and rate modifiers read.
//!
//! Time is injected through [`Clock`] so that windows and intervals can be
//! tested without sleeping.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Item definition identifier.
pub type ItemId = u32;
/// Drop pool identifier.
pub type PoolId = u32;
/// World drop config identifier.
pub type ConfigId = u32;
/// Quest identifier.
pub type QuestId = u32;
/// Player identifier.
pub type PlayerId = u64;
/// Identifier of the combat or event occurrence that produced a drop.
pub type EventId = u64;

/// What produced a drop opportunity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DropSourceKind {
    /// A monster kill.
    Monster = 0,
    /// A dungeon clear or dungeon event.
    Dungeon = 1,
    /// A quest reward.
    Quest = 2,
    /// A timed activity.
    Activity = 3,
    /// A boss kill.
    Boss = 4,
    /// A world-wide opportunity with no pool behind it.
    World = 5,
    /// Anything else.
    Other = 6,
}

impl DropSourceKind {
    /// Converts from the on-disk tag.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Monster),
            1 => Some(Self::Dungeon),
            2 => Some(Self::Quest),
            3 => Some(Self::Activity),
            4 => Some(Self::Boss),
            5 => Some(Self::World),
            6 => Some(Self::Other),
            _ => None,
        }
    }

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Monster => "monster",
            Self::Dungeon => "dungeon",
            Self::Quest => "quest",
            Self::Activity => "activity",
            Self::Boss => "boss",
            Self::World => "world",
            Self::Other => "other",
        }
    }
}

/// A concrete drop source: kind plus the monster/dungeon/quest id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DropSource {
    /// Source kind.
    pub kind: DropSourceKind,
    /// Id within that kind.
    pub id: u32,
}

impl DropSource {
    /// A monster kill.
    #[must_use]
    pub const fn monster(id: u32) -> Self {
        Self { kind: DropSourceKind::Monster, id }
    }

    /// A dungeon clear.
    #[must_use]
    pub const fn dungeon(id: u32) -> Self {
        Self { kind: DropSourceKind::Dungeon, id }
    }

    /// A boss kill.
    #[must_use]
    pub const fn boss(id: u32) -> Self {
        Self { kind: DropSourceKind::Boss, id }
    }
}

impl fmt::Display for DropSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// Dungeon difficulty class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DungeonType {
    /// Regular dungeon.
    Normal,
    /// Elite dungeon.
    Elite,
    /// Boss dungeon.
    Boss,
}

/// Input to one drop resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DropContext {
    /// Unique id of the kill or event. Part of every idempotency key.
    pub event_id: EventId,
    /// Player receiving the loot.
    pub receiver_id: PlayerId,
    /// Party or team, if any.
    pub team_id: Option<u64>,
    /// What produced the drop.
    pub source: DropSource,
    /// Receiver's level, used for level bands and trigger conditions.
    pub player_level: u16,
    /// Party size including the receiver.
    pub party_size: u16,
    /// Zone the event happened in.
    pub zone: Option<String>,
    /// Quests the receiver has completed.
    pub completed_quests: BTreeSet<QuestId>,
    /// Dungeon class when the source is a dungeon.
    pub dungeon_type: Option<DungeonType>,
    /// Dungeon level when the source is a dungeon.
    pub dungeon_level: u16,
    /// Receiver's luck stat.
    pub luck: u32,
    /// First time this receiver defeated this source.
    pub is_first_kill: bool,
}

impl DropContext {
    /// A solo, zone-less context. Use the `with_*` builders for the rest.
    #[must_use]
    pub fn new(event_id: EventId, receiver_id: PlayerId, source: DropSource, player_level: u16) -> Self {
        Self {
            event_id,
            receiver_id,
            team_id: None,
            source,
            player_level,
            party_size: 1,
            zone: None,
            completed_quests: BTreeSet::new(),
            dungeon_type: None,
            dungeon_level: 0,
            luck: 0,
            is_first_kill: false,
        }
    }

    /// Sets the party.
    #[must_use]
    pub fn with_party(mut self, team_id: u64, party_size: u16) -> Self {
        self.team_id = Some(team_id);
        self.party_size = party_size.max(1);
        self
    }

    /// Sets the zone.
    #[must_use]
    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    /// Marks a quest as completed.
    #[must_use]
    pub fn with_completed_quest(mut self, quest_id: QuestId) -> Self {
        self.completed_quests.insert(quest_id);
        self
    }

    /// Sets dungeon class and level.
    #[must_use]
    pub fn with_dungeon(mut self, dungeon_type: DungeonType, dungeon_level: u16) -> Self {
        self.dungeon_type = Some(dungeon_type);
        self.dungeon_level = dungeon_level;
        self
    }

    /// Sets the luck stat.
    #[must_use]
    pub fn with_luck(mut self, luck: u32) -> Self {
        self.luck = luck;
        self
    }

    /// Flags a first kill.
    #[must_use]
    pub fn with_first_kill(mut self, is_first_kill: bool) -> Self {
        self.is_first_kill = is_first_kill;
        self
    }
}

// =============================================================================
// Clock
// =============================================================================

/// Wall-clock source for interval and window checks.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// The real clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Starts at `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    /// Jumps to `now`.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    /// Moves forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}
