//! # Drop Catalog
//!
//! The read-only configuration store the engine resolves against: item
//! definitions, drop pools with their items, monster and dungeon pool
//! bindings, and world drop configs.
//!
//! All balance data lives in TOML and is validated once at load time. A
//! catalog that loads is structurally sound: weights and rates are in range,
//! quantity and level bands are ordered, pool slot counts are consistent and
//! at most one active world drop exists per item.
//!
//! ```toml
//! [[item]]
//! id = 1001
//! code = "wolf_pelt"
//! name = "Wolf Pelt"
//!
//! [[pool]]
//! id = 1
//! code = "wolf_common"
//! pool_type = "monster"
//! min_drops = 1
//! max_drops = 3
//! guaranteed_drops = 1
//!
//! [[pool.items]]
//! item_id = 1001
//! drop_weight = 90
//! max_quantity = 2
//!
//! [[monster_drop]]
//! monster_id = 17
//! pool_id = 1
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::conditions::{RateModifier, TriggerCondition};
use crate::context::{ConfigId, DropSource, DropSourceKind, ItemId, PoolId};
use crate::error::{LootError, LootResult};
use crate::quality::{Quality, QualityWeights};
use crate::rate::Probability;

const fn default_true() -> bool {
    true
}

const fn default_quantity() -> u32 {
    1
}

// =============================================================================
// Definitions
// =============================================================================

/// Static item metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ItemDef {
    /// Item id.
    pub id: ItemId,
    /// Unique code.
    pub code: String,
    /// Display name.
    pub name: String,
    /// Quality used when a drop has no quality weights.
    #[serde(default)]
    pub quality: Quality,
}

/// What a pool is attached to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolType {
    /// Monster kills.
    Monster,
    /// Dungeon events.
    Dungeon,
    /// Quest rewards.
    Quest,
    /// Activities.
    Activity,
    /// Boss kills.
    Boss,
    /// Anything else.
    Other,
}

/// One candidate item inside a pool.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DropPoolItem {
    /// The item granted.
    pub item_id: ItemId,
    /// Relative weight in the pool's weighted roll.
    #[serde(default)]
    pub drop_weight: Option<u32>,
    /// Independent per-slot chance, used when no weight is set.
    #[serde(default)]
    pub drop_rate: Option<Probability>,
    /// Smallest quantity granted.
    #[serde(default = "default_quantity")]
    pub min_quantity: u32,
    /// Largest quantity granted.
    #[serde(default = "default_quantity")]
    pub max_quantity: u32,
    /// Lowest player level that can receive the item.
    #[serde(default)]
    pub min_level: Option<u16>,
    /// Highest player level that can receive the item.
    #[serde(default)]
    pub max_level: Option<u16>,
    /// Placed into the pool's guaranteed slots first.
    #[serde(default)]
    pub guaranteed: bool,
    /// Inactive items are dropped at load.
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Per-item quality roll.
    #[serde(default)]
    pub quality_weights: Option<QualityWeights>,
}

impl DropPoolItem {
    /// A weighted item granting exactly one unit, with no level band.
    #[must_use]
    pub fn weighted(item_id: ItemId, weight: u32) -> Self {
        Self {
            item_id,
            drop_weight: Some(weight),
            drop_rate: None,
            min_quantity: 1,
            max_quantity: 1,
            min_level: None,
            max_level: None,
            guaranteed: false,
            is_active: true,
            quality_weights: None,
        }
    }

    /// A rate-only item granting exactly one unit.
    #[must_use]
    pub fn with_rate(item_id: ItemId, rate: Probability) -> Self {
        Self {
            drop_weight: None,
            drop_rate: Some(rate),
            ..Self::weighted(item_id, 1)
        }
    }

    /// True if `level` is inside the item's level band.
    #[inline]
    #[must_use]
    pub fn accepts_level(&self, level: u16) -> bool {
        self.min_level.map_or(true, |min| level >= min)
            && self.max_level.map_or(true, |max| level <= max)
    }

    fn validate(&self) -> Result<(), String> {
        match (self.drop_weight, self.drop_rate) {
            (None, None) => return Err("needs drop_weight or drop_rate".to_string()),
            (Some(0), _) => return Err("drop_weight must be > 0".to_string()),
            (_, Some(rate)) if rate.is_zero() => {
                return Err("drop_rate must be within (0, 1]".to_string());
            }
            _ => {}
        }
        if self.min_quantity == 0 {
            return Err("min_quantity must be >= 1".to_string());
        }
        if self.max_quantity < self.min_quantity {
            return Err(format!(
                "max_quantity {} is below min_quantity {}",
                self.max_quantity, self.min_quantity
            ));
        }
        if let (Some(min), Some(max)) = (self.min_level, self.max_level) {
            if min > max {
                return Err(format!("min_level {min} exceeds max_level {max}"));
            }
        }
        Ok(())
    }
}

/// A named collection of candidate items.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DropPool {
    /// Pool id.
    pub id: PoolId,
    /// Unique code.
    pub code: String,
    /// What the pool is attached to.
    pub pool_type: PoolType,
    /// Fewest items a resolution aims for.
    pub min_drops: u16,
    /// Most items a resolution may grant.
    pub max_drops: u16,
    /// Slots that always succeed.
    #[serde(default)]
    pub guaranteed_drops: u16,
    /// Inactive pools are dropped at load.
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Lets the same item fill several slots.
    #[serde(default)]
    pub allow_duplicates: bool,
    /// Candidate items.
    #[serde(default)]
    pub items: Vec<DropPoolItem>,
}

impl DropPool {
    /// An active pool with no items.
    #[must_use]
    pub fn new(id: PoolId, code: impl Into<String>, min_drops: u16, max_drops: u16) -> Self {
        Self {
            id,
            code: code.into(),
            pool_type: PoolType::Monster,
            min_drops,
            max_drops,
            guaranteed_drops: 0,
            is_active: true,
            allow_duplicates: false,
            items: Vec::new(),
        }
    }

    /// Sets the guaranteed slot count.
    #[must_use]
    pub fn guaranteed(mut self, guaranteed_drops: u16) -> Self {
        self.guaranteed_drops = guaranteed_drops;
        self
    }

    /// Adds an item.
    #[must_use]
    pub fn with_item(mut self, item: DropPoolItem) -> Self {
        self.items.push(item);
        self
    }

    /// Checks slot counts and every item.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` describing the first problem found.
    pub fn validate(&self) -> LootResult<()> {
        let fail = |msg: String| LootError::InvalidConfig(format!("pool '{}': {msg}", self.code));

        if self.max_drops < self.min_drops {
            return Err(fail(format!(
                "max_drops {} is below min_drops {}",
                self.max_drops, self.min_drops
            )));
        }
        if self.min_drops < self.guaranteed_drops {
            return Err(fail(format!(
                "guaranteed_drops {} exceeds min_drops {}",
                self.guaranteed_drops, self.min_drops
            )));
        }
        let mut seen = HashSet::new();
        for item in &self.items {
            item.validate()
                .map_err(|msg| fail(format!("item {}: {msg}", item.item_id)))?;
            if !seen.insert(item.item_id) {
                return Err(fail(format!("item {} listed twice", item.item_id)));
            }
        }
        Ok(())
    }
}

/// Monster-to-pool association as authored.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonsterDrop {
    /// Monster id.
    pub monster_id: u32,
    /// Pool resolved on a kill.
    pub pool_id: PoolId,
    /// Chance that the pool's variable slots roll at all.
    #[serde(default)]
    pub drop_rate: Option<Probability>,
    /// Evaluation order when a monster has several pools.
    #[serde(default)]
    pub display_order: i32,
}

/// Dungeon-to-pool association as authored.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DungeonDrop {
    /// Dungeon id.
    pub dungeon_id: u32,
    /// Pool resolved on a clear.
    pub pool_id: PoolId,
    /// Chance that the pool's variable slots roll at all.
    #[serde(default)]
    pub drop_rate: Option<Probability>,
    /// Evaluation order when a dungeon has several pools.
    #[serde(default)]
    pub display_order: i32,
}

/// A pool attached to a drop source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolBinding {
    /// Source the pool is attached to.
    pub source: DropSource,
    /// The pool.
    pub pool_id: PoolId,
    /// Gate on the variable slots. `ONE` when not overridden.
    pub drop_rate: Probability,
    /// Evaluation order.
    pub display_order: i32,
}

impl From<MonsterDrop> for PoolBinding {
    fn from(d: MonsterDrop) -> Self {
        Self {
            source: DropSource::monster(d.monster_id),
            pool_id: d.pool_id,
            drop_rate: d.drop_rate.unwrap_or(Probability::ONE),
            display_order: d.display_order,
        }
    }
}

impl From<DungeonDrop> for PoolBinding {
    fn from(d: DungeonDrop) -> Self {
        Self {
            source: DropSource::dungeon(d.dungeon_id),
            pool_id: d.pool_id,
            drop_rate: d.drop_rate.unwrap_or(Probability::ONE),
            display_order: d.display_order,
        }
    }
}

/// A global, item-scoped drop opportunity with supply caps.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorldDropConfig {
    /// Config id.
    pub id: ConfigId,
    /// Item granted.
    pub item_id: ItemId,
    /// Inactive configs never grant.
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Chance per opportunity before modifiers.
    pub base_drop_rate: Probability,
    /// Lifetime cap. `None` is unlimited.
    #[serde(default)]
    pub total_drop_limit: Option<u64>,
    /// Per-day cap.
    #[serde(default)]
    pub daily_drop_limit: Option<u64>,
    /// Per-hour cap.
    #[serde(default)]
    pub hourly_drop_limit: Option<u64>,
    /// Seconds that must pass between two drops.
    #[serde(default)]
    pub min_drop_interval: Option<u64>,
    /// Seconds after which the next eligible opportunity skips the roll.
    #[serde(default)]
    pub max_drop_interval: Option<u64>,
    /// Every condition must hold.
    #[serde(default)]
    pub trigger_conditions: Vec<TriggerCondition>,
    /// Contextual rate adjustments.
    #[serde(default)]
    pub drop_rate_modifiers: Vec<RateModifier>,
    /// Smallest quantity granted.
    #[serde(default = "default_quantity")]
    pub min_quantity: u32,
    /// Largest quantity granted.
    #[serde(default = "default_quantity")]
    pub max_quantity: u32,
    /// Quality roll for the granted item.
    #[serde(default)]
    pub quality_weights: Option<QualityWeights>,
}

impl WorldDropConfig {
    /// An active, uncapped config.
    #[must_use]
    pub fn new(id: ConfigId, item_id: ItemId, base_drop_rate: Probability) -> Self {
        Self {
            id,
            item_id,
            is_active: true,
            base_drop_rate,
            total_drop_limit: None,
            daily_drop_limit: None,
            hourly_drop_limit: None,
            min_drop_interval: None,
            max_drop_interval: None,
            trigger_conditions: Vec::new(),
            drop_rate_modifiers: Vec::new(),
            min_quantity: 1,
            max_quantity: 1,
            quality_weights: None,
        }
    }

    /// Checks rates, intervals and typed conditions.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` describing the first problem found.
    pub fn validate(&self) -> LootResult<()> {
        let fail = |msg: String| LootError::InvalidConfig(format!("world drop {}: {msg}", self.id));

        if self.base_drop_rate.is_zero() {
            return Err(fail("base_drop_rate must be within (0, 1]".to_string()));
        }
        if let (Some(min), Some(max)) = (self.min_drop_interval, self.max_drop_interval) {
            if min > max {
                return Err(fail(format!(
                    "min_drop_interval {min}s exceeds max_drop_interval {max}s"
                )));
            }
        }
        if self.min_quantity == 0 || self.max_quantity < self.min_quantity {
            return Err(fail(format!(
                "quantity range {}..={} is invalid",
                self.min_quantity, self.max_quantity
            )));
        }
        for condition in &self.trigger_conditions {
            condition.validate().map_err(|e| fail(e.to_string()))?;
        }
        for modifier in &self.drop_rate_modifiers {
            modifier.validate().map_err(|e| fail(e.to_string()))?;
        }
        Ok(())
    }
}

// =============================================================================
// Configuration source
// =============================================================================

/// Read access to drop configuration, filtered to active rows.
pub trait DropConfigSource: Send + Sync {
    /// Item definition by id.
    fn item(&self, id: ItemId) -> Option<&ItemDef>;

    /// Active pool by id.
    fn pool(&self, id: PoolId) -> Option<&DropPool>;

    /// Active pool by code.
    fn pool_by_code(&self, code: &str) -> Option<&DropPool>;

    /// Pools bound to a source, in evaluation order. A pool appears at most
    /// once: it is one slot of a drop event.
    fn bindings_for(&self, source: &DropSource) -> Vec<&PoolBinding>;

    /// Active world drop configs, by id.
    fn world_drops(&self) -> Vec<&WorldDropConfig>;

    /// World drop config by id, active or not.
    fn world_drop(&self, id: ConfigId) -> Option<&WorldDropConfig>;
}

/// Raw TOML document.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    #[serde(default, rename = "item")]
    items: Vec<ItemDef>,
    #[serde(default, rename = "pool")]
    pools: Vec<DropPool>,
    #[serde(default, rename = "monster_drop")]
    monster_drops: Vec<MonsterDrop>,
    #[serde(default, rename = "dungeon_drop")]
    dungeon_drops: Vec<DungeonDrop>,
    #[serde(default, rename = "world_drop")]
    world_drops: Vec<WorldDropConfig>,
}

/// The validated, in-memory catalog.
#[derive(Clone, Debug, Default)]
pub struct DropCatalog {
    items: HashMap<ItemId, ItemDef>,
    pools: HashMap<PoolId, DropPool>,
    pool_codes: HashMap<String, PoolId>,
    bindings: HashMap<DropSource, Vec<PoolBinding>>,
    world_drops: Vec<WorldDropConfig>,
}

impl DropCatalog {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` on a syntax error or a failed validation rule.
    pub fn from_toml_str(source: &str) -> LootResult<Self> {
        let file: CatalogFile =
            toml::from_str(source).map_err(|e| LootError::InvalidConfig(e.to_string()))?;
        Self::build(file)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the file cannot be read or fails validation.
    pub fn from_toml_file(path: impl AsRef<Path>) -> LootResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            LootError::InvalidConfig(format!("failed to read catalog {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&source)
    }

    /// Builds from already-typed parts, applying the same validation as a file load.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` on a failed validation rule.
    pub fn from_parts(
        items: Vec<ItemDef>,
        pools: Vec<DropPool>,
        bindings: Vec<PoolBinding>,
        world_drops: Vec<WorldDropConfig>,
    ) -> LootResult<Self> {
        let mut catalog = Self::default();
        catalog.insert_items(items)?;
        catalog.insert_pools(pools)?;
        catalog.insert_bindings(bindings)?;
        catalog.insert_world_drops(world_drops)?;
        Ok(catalog)
    }

    fn build(file: CatalogFile) -> LootResult<Self> {
        let bindings = file
            .monster_drops
            .into_iter()
            .map(PoolBinding::from)
            .chain(file.dungeon_drops.into_iter().map(PoolBinding::from))
            .collect();
        let catalog = Self::from_parts(file.items, file.pools, bindings, file.world_drops)?;
        debug!(
            items = catalog.items.len(),
            pools = catalog.pools.len(),
            world_drops = catalog.world_drops.len(),
            "drop catalog loaded"
        );
        Ok(catalog)
    }

    fn insert_items(&mut self, items: Vec<ItemDef>) -> LootResult<()> {
        let mut codes = HashSet::new();
        for item in items {
            if !codes.insert(item.code.clone()) {
                return Err(LootError::InvalidConfig(format!(
                    "item code '{}' is not unique",
                    item.code
                )));
            }
            if let Some(dup) = self.items.insert(item.id, item) {
                return Err(LootError::InvalidConfig(format!(
                    "item id {} is not unique",
                    dup.id
                )));
            }
        }
        Ok(())
    }

    fn insert_pools(&mut self, pools: Vec<DropPool>) -> LootResult<()> {
        let mut seen_ids = HashSet::new();
        let mut seen_codes = HashSet::new();
        for mut pool in pools {
            pool.validate()?;
            if !seen_ids.insert(pool.id) || !seen_codes.insert(pool.code.clone()) {
                return Err(LootError::InvalidConfig(format!(
                    "pool {} ('{}') is not unique",
                    pool.id, pool.code
                )));
            }
            if !pool.is_active {
                debug!(pool_id = pool.id, "skipping inactive pool");
                continue;
            }
            pool.items.retain(|item| item.is_active);
            for item in &pool.items {
                if !self.items.contains_key(&item.item_id) {
                    warn!(
                        pool_id = pool.id,
                        item_id = item.item_id,
                        "pool references an unknown item; the pool will not resolve"
                    );
                }
            }
            self.pool_codes.insert(pool.code.clone(), pool.id);
            self.pools.insert(pool.id, pool);
        }
        Ok(())
    }

    fn insert_bindings(&mut self, bindings: Vec<PoolBinding>) -> LootResult<()> {
        let mut bound = HashSet::new();
        for binding in bindings {
            if binding.drop_rate.is_zero() {
                return Err(LootError::InvalidConfig(format!(
                    "binding {} -> pool {}: drop_rate must be within (0, 1]",
                    binding.source, binding.pool_id
                )));
            }
            if !bound.insert((binding.source, binding.pool_id)) {
                return Err(LootError::InvalidConfig(format!(
                    "pool {} is bound to {} more than once",
                    binding.pool_id, binding.source
                )));
            }
            if !self.pools.contains_key(&binding.pool_id) {
                warn!(
                    source = %binding.source,
                    pool_id = binding.pool_id,
                    "binding references a missing or inactive pool"
                );
            }
            self.bindings.entry(binding.source).or_default().push(binding);
        }
        for list in self.bindings.values_mut() {
            list.sort_by_key(|b| b.display_order);
        }
        Ok(())
    }

    fn insert_world_drops(&mut self, configs: Vec<WorldDropConfig>) -> LootResult<()> {
        let mut ids = HashSet::new();
        let mut active_items = HashSet::new();
        for config in configs {
            config.validate()?;
            if !ids.insert(config.id) {
                return Err(LootError::InvalidConfig(format!(
                    "world drop id {} is not unique",
                    config.id
                )));
            }
            if !self.items.contains_key(&config.item_id) {
                return Err(LootError::InvalidConfig(format!(
                    "world drop {} references unknown item {}",
                    config.id, config.item_id
                )));
            }
            if config.is_active && !active_items.insert(config.item_id) {
                return Err(LootError::InvalidConfig(format!(
                    "item {} already has an active world drop",
                    config.item_id
                )));
            }
            self.world_drops.push(config);
        }
        self.world_drops.sort_by_key(|c| c.id);
        Ok(())
    }
}

impl DropConfigSource for DropCatalog {
    fn item(&self, id: ItemId) -> Option<&ItemDef> {
        self.items.get(&id)
    }

    fn pool(&self, id: PoolId) -> Option<&DropPool> {
        self.pools.get(&id)
    }

    fn pool_by_code(&self, code: &str) -> Option<&DropPool> {
        self.pool_codes.get(code).and_then(|id| self.pools.get(id))
    }

    fn bindings_for(&self, source: &DropSource) -> Vec<&PoolBinding> {
        let mut found: Vec<&PoolBinding> = self.bindings.get(source).into_iter().flatten().collect();
        // Bosses are monsters too. A boss binding wins over a monster
        // binding of the same pool.
        if source.kind == DropSourceKind::Boss {
            let own: HashSet<PoolId> = found.iter().map(|b| b.pool_id).collect();
            let as_monster = DropSource::monster(source.id);
            found.extend(
                self.bindings
                    .get(&as_monster)
                    .into_iter()
                    .flatten()
                    .filter(|b| !own.contains(&b.pool_id)),
            );
            found.sort_by_key(|b| b.display_order);
        }
        found
    }

    fn world_drops(&self) -> Vec<&WorldDropConfig> {
        self.world_drops.iter().filter(|c| c.is_active).collect()
    }

    fn world_drop(&self, id: ConfigId) -> Option<&WorldDropConfig> {
        self.world_drops.iter().find(|c| c.id == id)
    }
}
