//! # Drop Audit Trail
//!
//! Every grant leaves exactly one immutable [`DropRecord`]. Records are keyed
//! by a deterministic [`GrantKey`] built from the event id, the slot that
//! produced the grant, the item and its position, so appending the same
//! batch twice stores it once. This is what makes a retried drop event safe.
//!
//! A slot is claimed by the first batch that records it. A later batch
//! touching a claimed slot stores nothing at all, so two concurrent attempts
//! at one event can never mix their grants.
//!
//! Two sinks implement [`AuditSink`]:
//!
//! - [`MemoryAuditLog`], for tests and embedding
//! - [`crate::wal::WalAuditLog`], file-backed and crash-safe

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::context::{ConfigId, DropSource, EventId, ItemId, PlayerId, PoolId};
use crate::error::LootResult;
use crate::pool::ItemGrant;
use crate::quality::Quality;

/// Which part of a drop event produced a grant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum SlotRef {
    /// A bound drop pool.
    Pool(PoolId),
    /// A world drop config.
    World(ConfigId),
}

/// Idempotency key of a grant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GrantKey {
    /// The drop event.
    pub event_id: EventId,
    /// The slot within the event.
    pub slot: SlotRef,
    /// The item granted.
    pub item_id: ItemId,
    /// Position of the grant within its slot.
    pub sequence: u16,
}

/// Immutable audit row for one grant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropRecord {
    /// Idempotency key.
    pub key: GrantKey,
    /// Player who received the item.
    pub receiver_id: PlayerId,
    /// Receiver's party, if any.
    pub team_id: Option<u64>,
    /// Item granted.
    pub item_id: ItemId,
    /// Units granted.
    pub quantity: u32,
    /// Quality granted.
    pub quality: Quality,
    /// What produced the drop.
    pub source: DropSource,
    /// Receiver's level at the time.
    pub player_level: u16,
    /// When the grant was recorded.
    pub recorded_at: DateTime<Utc>,
}

impl DropRecord {
    /// The grant this record stores.
    #[must_use]
    pub const fn grant(&self) -> ItemGrant {
        ItemGrant {
            item_id: self.item_id,
            quantity: self.quantity,
            quality: self.quality,
        }
    }
}

/// Filter for audit queries. Unset fields match everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuditQuery {
    receiver_id: Option<PlayerId>,
    item_id: Option<ItemId>,
    source: Option<DropSource>,
    from: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    limit: Option<usize>,
}

impl AuditQuery {
    /// Matches every record.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Only grants to this player.
    #[must_use]
    pub const fn receiver(mut self, receiver_id: PlayerId) -> Self {
        self.receiver_id = Some(receiver_id);
        self
    }

    /// Only grants of this item.
    #[must_use]
    pub const fn item(mut self, item_id: ItemId) -> Self {
        self.item_id = Some(item_id);
        self
    }

    /// Only grants from this source.
    #[must_use]
    pub const fn source(mut self, source: DropSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Only grants recorded in `[from, until)`.
    #[must_use]
    pub const fn between(mut self, from: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.until = Some(until);
        self
    }

    /// Keeps only the newest `limit` matches.
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// True if `record` passes every set filter.
    #[must_use]
    pub fn matches(&self, record: &DropRecord) -> bool {
        self.receiver_id.map_or(true, |id| record.receiver_id == id)
            && self.item_id.map_or(true, |id| record.item_id == id)
            && self.source.map_or(true, |s| record.source == s)
            && self.from.map_or(true, |t| record.recorded_at >= t)
            && self.until.map_or(true, |t| record.recorded_at < t)
    }
}

/// Append-only store of drop records.
pub trait AuditSink: Send + Sync {
    /// Appends a batch atomically. Returns how many records were stored.
    ///
    /// Duplicate keys inside the batch are stored once. If any slot the
    /// batch touches already holds records, nothing is stored and the
    /// result is 0, so a result below `records.len()` means a concurrent
    /// attempt got there first.
    ///
    /// # Errors
    ///
    /// Returns `PersistenceFailure` if the batch could not be stored; in that
    /// case none of it is.
    fn append(&self, records: &[DropRecord]) -> LootResult<usize>;

    /// Records already stored for one slot of one event, in sequence order.
    fn records_for_slot(&self, event_id: EventId, slot: SlotRef) -> Vec<DropRecord>;

    /// Matching records, newest first.
    fn query(&self, query: &AuditQuery) -> Vec<DropRecord>;

    /// Number of matching records, ignoring any limit.
    fn count(&self, query: &AuditQuery) -> usize {
        self.query(&AuditQuery { limit: None, ..query.clone() }).len()
    }

    /// The newest `n` records.
    fn recent(&self, n: usize) -> Vec<DropRecord> {
        self.query(&AuditQuery::new().limit(n))
    }
}

/// In-memory index shared by the audit sinks.
#[derive(Debug, Default)]
pub struct AuditIndex {
    records: Vec<DropRecord>,
    keys: HashSet<GrantKey>,
    by_slot: HashMap<(EventId, SlotRef), Vec<usize>>,
}

impl AuditIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All stored records in append order.
    #[must_use]
    pub fn records(&self) -> &[DropRecord] {
        &self.records
    }

    /// True if some record is already stored for this slot of this event.
    #[must_use]
    pub fn is_claimed(&self, event_id: EventId, slot: SlotRef) -> bool {
        self.by_slot.contains_key(&(event_id, slot))
    }

    /// What [`AuditSink::append`] would store for `batch`: nothing if any of
    /// its slots is claimed, else the batch deduplicated by key.
    #[must_use]
    pub fn unseen(&self, batch: &[DropRecord]) -> Vec<DropRecord> {
        if batch.iter().any(|r| self.is_claimed(r.key.event_id, r.key.slot)) {
            return Vec::new();
        }
        let mut in_batch = HashSet::new();
        batch.iter().filter(|r| in_batch.insert(r.key)).cloned().collect()
    }

    /// Stores records that are known to be unseen.
    pub fn extend(&mut self, records: Vec<DropRecord>) {
        for record in records {
            if !self.keys.insert(record.key) {
                continue;
            }
            self.by_slot
                .entry((record.key.event_id, record.key.slot))
                .or_default()
                .push(self.records.len());
            self.records.push(record);
        }
    }

    /// See [`AuditSink::records_for_slot`].
    #[must_use]
    pub fn for_slot(&self, event_id: EventId, slot: SlotRef) -> Vec<DropRecord> {
        let mut found: Vec<DropRecord> = self
            .by_slot
            .get(&(event_id, slot))
            .into_iter()
            .flatten()
            .map(|&i| self.records[i].clone())
            .collect();
        found.sort_by_key(|r| r.key.sequence);
        found
    }

    /// See [`AuditSink::query`].
    #[must_use]
    pub fn query(&self, query: &AuditQuery) -> Vec<DropRecord> {
        let mut found: Vec<DropRecord> =
            self.records.iter().filter(|r| query.matches(r)).cloned().collect();
        // Stable: equal timestamps keep reverse append order.
        found.reverse();
        found.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        if let Some(limit) = query.limit {
            found.truncate(limit);
        }
        found
    }
}

/// Audit sink held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    index: RwLock<AuditIndex>,
}

impl MemoryAuditLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    /// True if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Copy of every record in append order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<DropRecord> {
        self.index.read().records().to_vec()
    }
}

impl AuditSink for MemoryAuditLog {
    fn append(&self, records: &[DropRecord]) -> LootResult<usize> {
        let mut index = self.index.write();
        let fresh = index.unseen(records);
        let added = fresh.len();
        index.extend(fresh);
        Ok(added)
    }

    fn records_for_slot(&self, event_id: EventId, slot: SlotRef) -> Vec<DropRecord> {
        self.index.read().for_slot(event_id, slot)
    }

    fn query(&self, query: &AuditQuery) -> Vec<DropRecord> {
        self.index.read().query(query)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use chrono::TimeZone;

    /// A record with sensible defaults for tests.
    pub fn record(event_id: EventId, slot: SlotRef, item_id: ItemId, sequence: u16) -> DropRecord {
        DropRecord {
            key: GrantKey { event_id, slot, item_id, sequence },
            receiver_id: 1,
            team_id: None,
            item_id,
            quantity: 1,
            quality: Quality::Normal,
            source: DropSource::monster(1),
            player_level: 10,
            recorded_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }
}
