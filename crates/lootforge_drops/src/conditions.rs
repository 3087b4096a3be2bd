//! # Trigger Conditions and Rate Modifiers
//!
//! World drop configs carry two typed lists:
//!
//! - `trigger_conditions`: predicates over the [`DropContext`]. Every
//!   condition must hold or the drop is denied with `condition_unmet`.
//! - `drop_rate_modifiers`: adjustments to the base rate. Additive bonuses
//!   are summed first, multipliers applied after, and the result is clamped
//!   into `[0, 1]`.
//!
//! Both are tagged enums, so an unknown `type` fails when the catalog loads.
//!
//! ```toml
//! trigger_conditions = [
//!     { type = "level_range", min_level = 30, max_level = 60 },
//!     { type = "zone", zones = ["frostmarch"] },
//! ]
//! drop_rate_modifiers = [
//!     { type = "party_size_bonus", per_member = 0.001 },
//!     { type = "time_of_day", start_hour = 22, end_hour = 4, multiplier = 1.5 },
//! ]
//! ```

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::context::{DropContext, DungeonType, QuestId};
use crate::error::{LootError, LootResult};
use crate::rate::{Multiplier, Probability, RateDelta};

/// A predicate a drop context must satisfy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum TriggerCondition {
    /// Player level within an inclusive band. Either bound may be omitted.
    LevelRange {
        /// Lowest level allowed.
        #[serde(default)]
        min_level: Option<u16>,
        /// Highest level allowed.
        #[serde(default)]
        max_level: Option<u16>,
    },
    /// The event happened in a dungeon of one of these classes.
    DungeonType {
        /// Accepted classes.
        dungeon_types: Vec<DungeonType>,
    },
    /// The event happened in one of these zones.
    Zone {
        /// Accepted zone names.
        zones: Vec<String>,
    },
    /// The receiver has completed a quest.
    RequiredQuest {
        /// The quest.
        quest_id: QuestId,
    },
    /// Only on a first kill.
    FirstKill,
}

impl TriggerCondition {
    /// Checks the condition against a context.
    #[must_use]
    pub fn is_met(&self, ctx: &DropContext) -> bool {
        match self {
            Self::LevelRange { min_level, max_level } => {
                min_level.map_or(true, |min| ctx.player_level >= min)
                    && max_level.map_or(true, |max| ctx.player_level <= max)
            }
            Self::DungeonType { dungeon_types } => ctx
                .dungeon_type
                .is_some_and(|t| dungeon_types.contains(&t)),
            Self::Zone { zones } => ctx
                .zone
                .as_deref()
                .is_some_and(|zone| zones.iter().any(|z| z == zone)),
            Self::RequiredQuest { quest_id } => ctx.completed_quests.contains(quest_id),
            Self::FirstKill => ctx.is_first_kill,
        }
    }

    /// Load-time sanity check.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for inverted level bands or empty lists.
    pub fn validate(&self) -> LootResult<()> {
        match self {
            Self::LevelRange { min_level: Some(min), max_level: Some(max) } if min > max => {
                Err(LootError::InvalidConfig(format!(
                    "level_range min_level {min} exceeds max_level {max}"
                )))
            }
            Self::DungeonType { dungeon_types } if dungeon_types.is_empty() => Err(
                LootError::InvalidConfig("dungeon_type condition lists no types".to_string()),
            ),
            Self::Zone { zones } if zones.is_empty() => Err(LootError::InvalidConfig(
                "zone condition lists no zones".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Returns true when every condition holds. An empty list always holds.
#[must_use]
pub fn all_met(conditions: &[TriggerCondition], ctx: &DropContext) -> bool {
    conditions.iter().all(|c| c.is_met(ctx))
}

/// A contextual adjustment to a world drop's base rate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum RateModifier {
    /// `+per_level` for each dungeon level.
    DungeonLevelBonus {
        /// Bonus per level.
        per_level: RateDelta,
    },
    /// `+per_member` for each party member.
    PartySizeBonus {
        /// Bonus per member.
        per_member: RateDelta,
    },
    /// Flat bonus on a first kill.
    FirstKillBonus {
        /// The bonus.
        bonus: RateDelta,
    },
    /// `+per_point` for each point of luck.
    LuckBonus {
        /// Bonus per luck point.
        per_point: RateDelta,
    },
    /// Scales the rate inside a UTC hour window. `start_hour > end_hour`
    /// wraps past midnight.
    TimeOfDay {
        /// First hour inside the window.
        start_hour: u8,
        /// First hour after the window.
        end_hour: u8,
        /// Scale applied inside the window.
        multiplier: Multiplier,
    },
}

impl RateModifier {
    /// Additive contribution for this context; zero for multipliers.
    #[must_use]
    pub fn delta(&self, ctx: &DropContext) -> RateDelta {
        match self {
            Self::DungeonLevelBonus { per_level } => per_level.times(u32::from(ctx.dungeon_level)),
            Self::PartySizeBonus { per_member } => per_member.times(u32::from(ctx.party_size)),
            Self::FirstKillBonus { bonus } if ctx.is_first_kill => *bonus,
            Self::LuckBonus { per_point } => per_point.times(ctx.luck),
            _ => RateDelta::ZERO,
        }
    }

    /// Multiplicative contribution at `now`; identity for additive bonuses.
    #[must_use]
    pub fn multiplier(&self, now: DateTime<Utc>) -> Multiplier {
        match self {
            Self::TimeOfDay { start_hour, end_hour, multiplier } => {
                if hour_in_window(now.hour(), u32::from(*start_hour), u32::from(*end_hour)) {
                    *multiplier
                } else {
                    Multiplier::IDENTITY
                }
            }
            _ => Multiplier::IDENTITY,
        }
    }

    /// Load-time sanity check.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for hours outside `0..24`.
    pub fn validate(&self) -> LootResult<()> {
        match self {
            Self::TimeOfDay { start_hour, end_hour, .. } if *start_hour > 23 || *end_hour > 23 => {
                Err(LootError::InvalidConfig(format!(
                    "time_of_day hours must be within 0..=23, got {start_hour}..{end_hour}"
                )))
            }
            _ => Ok(()),
        }
    }
}

fn hour_in_window(hour: u32, start: u32, end: u32) -> bool {
    match start.cmp(&end) {
        std::cmp::Ordering::Less => (start..end).contains(&hour),
        std::cmp::Ordering::Greater => hour >= start || hour < end,
        // Equal bounds mean the whole day.
        std::cmp::Ordering::Equal => true,
    }
}

/// Applies modifiers to a base rate: bonuses summed, then multipliers, then clamped.
#[must_use]
pub fn effective_rate(
    base: Probability,
    modifiers: &[RateModifier],
    ctx: &DropContext,
    now: DateTime<Utc>,
) -> Probability {
    let bonus = modifiers
        .iter()
        .fold(RateDelta::ZERO, |acc, m| acc.plus(m.delta(ctx)));
    modifiers
        .iter()
        .fold(base.offset(bonus), |rate, m| rate.scale(m.multiplier(now)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::DropSource;
    use chrono::TimeZone;

    fn ctx() -> DropContext {
        DropContext::new(1, 1, DropSource::monster(1), 40)
    }

    fn at_hour(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, hour, 30, 0).unwrap()
    }

    #[test]
    fn test_level_range_bounds_are_inclusive() {
        let cond = TriggerCondition::LevelRange { min_level: Some(40), max_level: Some(50) };
        assert!(cond.is_met(&ctx()));
        let mut high = ctx();
        high.player_level = 51;
        assert!(!cond.is_met(&high));
        let open = TriggerCondition::LevelRange { min_level: None, max_level: Some(40) };
        assert!(open.is_met(&ctx()));
    }

    #[test]
    fn test_zone_and_quest_require_context() {
        let zone = TriggerCondition::Zone { zones: vec!["frostmarch".into()] };
        assert!(!zone.is_met(&ctx()));
        assert!(zone.is_met(&ctx().with_zone("frostmarch")));

        let quest = TriggerCondition::RequiredQuest { quest_id: 9 };
        assert!(!quest.is_met(&ctx()));
        assert!(quest.is_met(&ctx().with_completed_quest(9)));
    }

    #[test]
    fn test_all_conditions_must_hold() {
        let conditions = vec![
            TriggerCondition::FirstKill,
            TriggerCondition::DungeonType { dungeon_types: vec![DungeonType::Boss] },
        ];
        let partial = ctx().with_first_kill(true);
        assert!(!all_met(&conditions, &partial));
        let full = partial.with_dungeon(DungeonType::Boss, 3);
        assert!(all_met(&conditions, &full));
        assert!(all_met(&[], &ctx()));
    }

    #[test]
    fn test_additive_bonuses_sum_before_multiplier() {
        let modifiers = vec![
            RateModifier::TimeOfDay {
                start_hour: 20,
                end_hour: 2,
                multiplier: Multiplier::from_ppm(2_000_000),
            },
            RateModifier::PartySizeBonus { per_member: RateDelta::from_ppm(10_000) },
            RateModifier::FirstKillBonus { bonus: RateDelta::from_ppm(50_000) },
        ];
        let base = Probability::from_ppm(100_000);
        let party = ctx().with_party(1, 4).with_first_kill(true);

        // (0.10 + 4 * 0.01 + 0.05) * 2 = 0.38 inside the window
        assert_eq!(effective_rate(base, &modifiers, &party, at_hour(23)).ppm(), 380_000);
        assert_eq!(effective_rate(base, &modifiers, &party, at_hour(1)).ppm(), 380_000);
        // 0.19 outside
        assert_eq!(effective_rate(base, &modifiers, &party, at_hour(12)).ppm(), 190_000);
    }

    #[test]
    fn test_effective_rate_is_clamped() {
        let modifiers = vec![RateModifier::LuckBonus { per_point: RateDelta::from_ppm(100_000) }];
        let lucky = ctx().with_luck(50);
        let rate = effective_rate(Probability::from_ppm(500_000), &modifiers, &lucky, at_hour(0));
        assert_eq!(rate, Probability::ONE);

        let cursed = vec![RateModifier::FirstKillBonus { bonus: RateDelta::from_ppm(-900_000) }];
        let rate = effective_rate(
            Probability::from_ppm(100_000),
            &cursed,
            &ctx().with_first_kill(true),
            at_hour(0),
        );
        assert_eq!(rate, Probability::ZERO);
    }

    #[test]
    fn test_tagged_toml_and_unknown_kind() {
        #[derive(Debug, Deserialize)]
        struct Doc {
            trigger_conditions: Vec<TriggerCondition>,
            drop_rate_modifiers: Vec<RateModifier>,
        }
        let doc: Doc = toml::from_str(
            r#"
            trigger_conditions = [
                { type = "level_range", min_level = 30 },
                { type = "first_kill" },
            ]
            drop_rate_modifiers = [
                { type = "dungeon_level_bonus", per_level = 0.002 },
            ]
            "#,
        )
        .unwrap();
        assert_eq!(doc.trigger_conditions.len(), 2);
        assert_eq!(
            doc.drop_rate_modifiers[0],
            RateModifier::DungeonLevelBonus { per_level: RateDelta::from_ppm(2_000) }
        );

        let bad: Result<Doc, _> = toml::from_str(
            "trigger_conditions = [{ type = \"moon_phase\" }]\ndrop_rate_modifiers = []",
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_validation() {
        let inverted = TriggerCondition::LevelRange { min_level: Some(9), max_level: Some(3) };
        assert!(inverted.validate().is_err());
        let bad_hour = RateModifier::TimeOfDay {
            start_hour: 24,
            end_hour: 2,
            multiplier: Multiplier::IDENTITY,
        };
        assert!(bad_hour.validate().is_err());
    }
}
