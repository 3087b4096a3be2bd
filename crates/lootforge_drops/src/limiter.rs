//! # World Drop Limiter
//!
//! **Check-then-increment under one row lock**
//!
//! World drops are the only shared mutable state in the loot system. Each
//! world drop config owns one [`WorldDropStat`] row with lifetime, daily and
//! hourly counters. A drop attempt:
//!
//! 1. draws its random value (no lock held)
//! 2. locks the config's row (bounded wait, else `ConcurrencyConflict`)
//! 3. evaluates active flag, trigger conditions, caps, windows and intervals
//! 4. compares the draw against the effective rate
//! 5. persists the grant, then increments the counters
//!
//! Steps 3 to 5 happen in one critical section, so two callers can never
//! both observe "under limit" and both increment past it. Rows are
//! independent: attempts against different configs never contend.
//!
//! Windows are never reset implicitly. An elapsed window denies with
//! `daily_window_elapsed` / `hourly_window_elapsed` until a reset runs,
//! either from the periodic sweep or inside
//! [`WorldDropLimiter::try_consume_event`], which the coordinator uses to
//! attempt every world drop of one event under a single set of row locks.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use tracing::{debug, info, warn};

use crate::audit::{DropRecord, SlotRef};
use crate::catalog::WorldDropConfig;
use crate::conditions::{all_met, effective_rate};
use crate::context::{ConfigId, DropContext, ItemId};
use crate::error::{LootError, LootResult};
use crate::rate::Probability;

/// Default bound on waiting for a row lock.
pub const DEFAULT_LOCK_TIMEOUT: StdDuration = StdDuration::from_millis(250);

/// A counter window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Window {
    /// 24 hours.
    Daily,
    /// 1 hour.
    Hourly,
}

impl Window {
    /// Window length.
    #[must_use]
    pub fn length(self) -> Duration {
        match self {
            Self::Daily => Duration::hours(24),
            Self::Hourly => Duration::hours(1),
        }
    }
}

/// Why a world drop attempt did not grant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DenyReason {
    /// The config is switched off.
    Inactive,
    /// A trigger condition does not hold.
    ConditionUnmet,
    /// Lifetime cap reached.
    TotalExhausted,
    /// Daily cap reached.
    DailyExhausted,
    /// Hourly cap reached.
    HourlyExhausted,
    /// The daily window elapsed and the row has not been reset.
    DailyWindowElapsed,
    /// The hourly window elapsed and the row has not been reset.
    HourlyWindowElapsed,
    /// The minimum interval since the last drop has not passed.
    TooSoon,
    /// Every check passed but the roll missed.
    RollFailed,
}

impl DenyReason {
    /// Stable snake_case code.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::ConditionUnmet => "condition_unmet",
            Self::TotalExhausted => "total_exhausted",
            Self::DailyExhausted => "daily_exhausted",
            Self::HourlyExhausted => "hourly_exhausted",
            Self::DailyWindowElapsed => "daily_window_elapsed",
            Self::HourlyWindowElapsed => "hourly_window_elapsed",
            Self::TooSoon => "too_soon",
            Self::RollFailed => "roll_failed",
        }
    }

    /// The window a reset would reopen, for the window-elapsed reasons.
    #[must_use]
    pub const fn elapsed_window(self) -> Option<Window> {
        match self {
            Self::DailyWindowElapsed => Some(Window::Daily),
            Self::HourlyWindowElapsed => Some(Window::Hourly),
            _ => None,
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Counters for one world drop config.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorldDropStat {
    /// The config.
    pub config_id: ConfigId,
    /// The config's item.
    pub item_id: ItemId,
    /// Grants since the beginning of time.
    pub total_dropped: u64,
    /// Grants since the last daily reset.
    pub daily_dropped: u64,
    /// Grants since the last hourly reset.
    pub hourly_dropped: u64,
    /// Time of the most recent grant.
    pub last_drop_at: Option<DateTime<Utc>>,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// Start of the current daily window.
    pub daily_reset_at: DateTime<Utc>,
    /// Start of the current hourly window.
    pub hourly_reset_at: DateTime<Utc>,
}

impl WorldDropStat {
    /// A fresh row whose windows open at `now`.
    #[must_use]
    pub const fn new(config_id: ConfigId, item_id: ItemId, now: DateTime<Utc>) -> Self {
        Self {
            config_id,
            item_id,
            total_dropped: 0,
            daily_dropped: 0,
            hourly_dropped: 0,
            last_drop_at: None,
            created_at: now,
            daily_reset_at: now,
            hourly_reset_at: now,
        }
    }

    /// True once the window has run its full length since its last reset.
    #[must_use]
    pub fn window_elapsed(&self, window: Window, now: DateTime<Utc>) -> bool {
        let opened = match window {
            Window::Daily => self.daily_reset_at,
            Window::Hourly => self.hourly_reset_at,
        };
        now - opened >= window.length()
    }

    /// Zeroes a window's counter and restarts the window at `now`.
    pub fn reset(&mut self, window: Window, now: DateTime<Utc>) {
        match window {
            Window::Daily => {
                self.daily_dropped = 0;
                self.daily_reset_at = now;
            }
            Window::Hourly => {
                self.hourly_dropped = 0;
                self.hourly_reset_at = now;
            }
        }
    }

    /// Counts one grant.
    pub fn record_drop(&mut self, now: DateTime<Utc>) {
        self.total_dropped += 1;
        self.daily_dropped += 1;
        self.hourly_dropped += 1;
        self.last_drop_at = Some(now);
    }
}

/// Result of the checks, before any counter changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Roll against this effective rate.
    Roll(Probability),
    /// The maximum interval has passed; grant without rolling.
    Force,
    /// Denied.
    Deny(DenyReason),
}

/// Outcome of a drop attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// Granted and counted.
    Granted {
        /// The maximum interval forced the grant.
        forced: bool,
        /// Counters after the increment.
        stats: WorldDropStat,
    },
    /// Not granted. Nothing changed.
    Denied(DenyReason),
}

impl ConsumeOutcome {
    /// True for a grant.
    #[must_use]
    pub const fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }

    /// The denial reason, if denied.
    #[must_use]
    pub const fn deny_reason(&self) -> Option<DenyReason> {
        match self {
            Self::Denied(reason) => Some(*reason),
            Self::Granted { .. } => None,
        }
    }
}

/// One world drop attempt whose random draw was taken up front.
#[derive(Clone, Copy, Debug)]
pub struct PendingAttempt<'a> {
    /// The config.
    pub config: &'a WorldDropConfig,
    /// Uniform draw in `[0, PPM_SCALE)`, compared against the effective rate.
    pub draw: u32,
}

/// A row whose windows need a reset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResetDue {
    /// The config.
    pub config_id: ConfigId,
    /// Daily window elapsed.
    pub daily: bool,
    /// Hourly window elapsed.
    pub hourly: bool,
}

type Row = Arc<Mutex<WorldDropStat>>;

// =============================================================================
// Ledger - the rows
// =============================================================================

/// The set of [`WorldDropStat`] rows, one lock per row.
#[derive(Debug, Default)]
pub struct WorldDropLedger {
    rows: RwLock<HashMap<ConfigId, Row>>,
}

impl WorldDropLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconstructs counters from the audit trail.
    ///
    /// Lifetime totals count every world drop record. Daily and hourly
    /// counters count the records of the last 24 hours and hour, with both
    /// windows reopening at `now`, so a restart never loosens a cap.
    #[must_use]
    pub fn rebuild_from_records(records: &[DropRecord], now: DateTime<Utc>) -> Self {
        let mut rows: HashMap<ConfigId, WorldDropStat> = HashMap::new();
        for record in records {
            let SlotRef::World(config_id) = record.key.slot else {
                continue;
            };
            let at = record.recorded_at;
            let row = rows
                .entry(config_id)
                .or_insert_with(|| WorldDropStat::new(config_id, record.item_id, now));
            row.created_at = row.created_at.min(at);
            row.total_dropped += 1;
            if now - at < Window::Daily.length() {
                row.daily_dropped += 1;
            }
            if now - at < Window::Hourly.length() {
                row.hourly_dropped += 1;
            }
            row.last_drop_at = Some(row.last_drop_at.map_or(at, |last| last.max(at)));
        }

        info!(rows = rows.len(), records = records.len(), "world drop ledger rebuilt");
        Self {
            rows: RwLock::new(
                rows.into_iter()
                    .map(|(id, stat)| (id, Arc::new(Mutex::new(stat))))
                    .collect(),
            ),
        }
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    /// True if no config has a row yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    fn get(&self, config_id: ConfigId) -> Option<Row> {
        self.rows.read().get(&config_id).cloned()
    }

    fn get_or_create(&self, config: &WorldDropConfig, now: DateTime<Utc>) -> Row {
        if let Some(row) = self.get(config.id) {
            return row;
        }
        let mut rows = self.rows.write();
        Arc::clone(rows.entry(config.id).or_insert_with(|| {
            debug!(config_id = config.id, "creating world drop stat row");
            Arc::new(Mutex::new(WorldDropStat::new(config.id, config.item_id, now)))
        }))
    }

    fn all(&self) -> Vec<(ConfigId, Row)> {
        self.rows
            .read()
            .iter()
            .map(|(id, row)| (*id, Arc::clone(row)))
            .collect()
    }
}

// =============================================================================
// Limiter
// =============================================================================

/// Enforces world drop caps and intervals.
#[derive(Debug)]
pub struct WorldDropLimiter {
    ledger: WorldDropLedger,
    lock_timeout: StdDuration,
}

impl Default for WorldDropLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl WorldDropLimiter {
    /// An empty limiter.
    #[must_use]
    pub fn new(lock_timeout: StdDuration) -> Self {
        Self::with_ledger(WorldDropLedger::new(), lock_timeout)
    }

    /// A limiter over existing rows, e.g. a rebuilt ledger.
    #[must_use]
    pub const fn with_ledger(ledger: WorldDropLedger, lock_timeout: StdDuration) -> Self {
        Self { ledger, lock_timeout }
    }

    /// The rows.
    #[must_use]
    pub const fn ledger(&self) -> &WorldDropLedger {
        &self.ledger
    }

    /// Runs every check against a row, in order: active flag, trigger
    /// conditions, lifetime cap, daily then hourly window and cap, minimum
    /// interval. Pure: nothing is locked or changed.
    #[must_use]
    pub fn evaluate(
        config: &WorldDropConfig,
        stats: &WorldDropStat,
        ctx: &DropContext,
        now: DateTime<Utc>,
    ) -> Verdict {
        if !config.is_active {
            return Verdict::Deny(DenyReason::Inactive);
        }
        if !all_met(&config.trigger_conditions, ctx) {
            return Verdict::Deny(DenyReason::ConditionUnmet);
        }
        if config.total_drop_limit.is_some_and(|limit| stats.total_dropped >= limit) {
            return Verdict::Deny(DenyReason::TotalExhausted);
        }
        if let Some(limit) = config.daily_drop_limit {
            if stats.window_elapsed(Window::Daily, now) {
                return Verdict::Deny(DenyReason::DailyWindowElapsed);
            }
            if stats.daily_dropped >= limit {
                return Verdict::Deny(DenyReason::DailyExhausted);
            }
        }
        if let Some(limit) = config.hourly_drop_limit {
            if stats.window_elapsed(Window::Hourly, now) {
                return Verdict::Deny(DenyReason::HourlyWindowElapsed);
            }
            if stats.hourly_dropped >= limit {
                return Verdict::Deny(DenyReason::HourlyExhausted);
            }
        }
        if let (Some(min), Some(last)) = (config.min_drop_interval, stats.last_drop_at) {
            if now - last < seconds(min) {
                return Verdict::Deny(DenyReason::TooSoon);
            }
        }
        if let Some(max) = config.max_drop_interval {
            let since = stats.last_drop_at.unwrap_or(stats.created_at);
            if now - since >= seconds(max) {
                return Verdict::Force;
            }
        }
        Verdict::Roll(effective_rate(
            config.base_drop_rate,
            &config.drop_rate_modifiers,
            ctx,
            now,
        ))
    }

    /// One drop attempt with nothing to persist.
    ///
    /// # Errors
    ///
    /// See [`WorldDropLimiter::try_consume_with`].
    pub fn try_consume<R: RngCore + ?Sized>(
        &self,
        config: &WorldDropConfig,
        ctx: &DropContext,
        rng: &mut R,
        now: DateTime<Utc>,
    ) -> LootResult<ConsumeOutcome> {
        self.try_consume_with(config, ctx, rng, now, |_| Ok(()))
    }

    /// One drop attempt. On a grant, `persist` runs inside the row lock with
    /// the incremented counters; the increment is kept only if it succeeds.
    ///
    /// # Errors
    ///
    /// - `RandomSource` if the generator fails (before any lock is taken)
    /// - `ConcurrencyConflict` if the row lock is not acquired in time
    /// - whatever `persist` returns; counters are left untouched
    pub fn try_consume_with<R, P>(
        &self,
        config: &WorldDropConfig,
        ctx: &DropContext,
        rng: &mut R,
        now: DateTime<Utc>,
        persist: P,
    ) -> LootResult<ConsumeOutcome>
    where
        R: RngCore + ?Sized,
        P: FnOnce(&WorldDropStat) -> LootResult<()>,
    {
        let draw = Probability::draw(rng)?;
        let row = self.ledger.get_or_create(config, now);
        let mut stats = row
            .try_lock_for(self.lock_timeout)
            .ok_or(LootError::ConcurrencyConflict { config_id: config.id })?;

        let mut next = stats.clone();
        let outcome = Self::settle(config, &mut next, ctx, draw, now, false);
        if outcome.is_granted() {
            persist(&next)?;
            *stats = next;
            log_grant(config, &outcome);
        }
        Ok(outcome)
    }

    /// Attempts several world drops as one unit, with their draws taken by
    /// the caller beforehand.
    ///
    /// Every row is locked in config id order and held until the end.
    /// Elapsed windows are reset and rechecked under those locks, at most
    /// once per window. `persist` then runs once with one flag per attempt
    /// (true for a grant). Counter changes and window resets are kept only
    /// if it succeeds.
    ///
    /// # Errors
    ///
    /// - `ConcurrencyConflict` if any row lock is not acquired in time
    /// - whatever `persist` returns; every row is left untouched
    pub fn try_consume_event<P>(
        &self,
        attempts: &[PendingAttempt<'_>],
        ctx: &DropContext,
        now: DateTime<Utc>,
        persist: P,
    ) -> LootResult<Vec<ConsumeOutcome>>
    where
        P: FnOnce(&[bool]) -> LootResult<()>,
    {
        let rows: Vec<Row> = attempts
            .iter()
            .map(|attempt| self.ledger.get_or_create(attempt.config, now))
            .collect();
        let mut order: Vec<usize> = (0..attempts.len()).collect();
        order.sort_by_key(|&i| attempts[i].config.id);

        let mut locked = Vec::with_capacity(order.len());
        for i in order {
            let config_id = attempts[i].config.id;
            let guard = rows[i]
                .try_lock_for(self.lock_timeout)
                .ok_or(LootError::ConcurrencyConflict { config_id })?;
            locked.push((i, guard));
        }

        let mut outcomes = vec![ConsumeOutcome::Denied(DenyReason::RollFailed); attempts.len()];
        let mut granted = vec![false; attempts.len()];
        let mut next = Vec::with_capacity(locked.len());
        for (i, stats) in &locked {
            let attempt = attempts[*i];
            let mut updated = WorldDropStat::clone(stats);
            let outcome = Self::settle(attempt.config, &mut updated, ctx, attempt.draw, now, true);
            granted[*i] = outcome.is_granted();
            outcomes[*i] = outcome;
            next.push(updated);
        }

        persist(&granted)?;
        for ((i, mut stats), updated) in locked.into_iter().zip(next) {
            *stats = updated;
            log_grant(attempts[i].config, &outcomes[i]);
        }
        Ok(outcomes)
    }

    fn settle(
        config: &WorldDropConfig,
        stats: &mut WorldDropStat,
        ctx: &DropContext,
        draw: u32,
        now: DateTime<Utc>,
        reopen_windows: bool,
    ) -> ConsumeOutcome {
        let mut verdict = Self::evaluate(config, stats, ctx, now);
        if reopen_windows {
            // Daily, then hourly.
            for _ in 0..2 {
                let Verdict::Deny(reason) = verdict else { break };
                let Some(window) = reason.elapsed_window() else { break };
                stats.reset(window, now);
                debug!(config_id = config.id, ?window, "window reset before attempt");
                verdict = Self::evaluate(config, stats, ctx, now);
            }
        }

        let forced = match verdict {
            Verdict::Deny(reason) => {
                debug!(config_id = config.id, reason = reason.code(), "world drop denied");
                return ConsumeOutcome::Denied(reason);
            }
            Verdict::Roll(rate) if !rate.admits(draw) => {
                return ConsumeOutcome::Denied(DenyReason::RollFailed);
            }
            Verdict::Roll(_) => false,
            Verdict::Force => true,
        };
        stats.record_drop(now);
        ConsumeOutcome::Granted { forced, stats: stats.clone() }
    }

    /// Zeroes the daily counter. Idempotent; leaves `total_dropped` alone.
    /// Returns false if the config has no row yet.
    ///
    /// # Errors
    ///
    /// Returns `ConcurrencyConflict` if the row lock is not acquired in time.
    pub fn reset_daily_stats(&self, config_id: ConfigId, now: DateTime<Utc>) -> LootResult<bool> {
        self.reset(config_id, Window::Daily, now)
    }

    /// Zeroes the hourly counter. Idempotent; leaves `total_dropped` alone.
    /// Returns false if the config has no row yet.
    ///
    /// # Errors
    ///
    /// Returns `ConcurrencyConflict` if the row lock is not acquired in time.
    pub fn reset_hourly_stats(&self, config_id: ConfigId, now: DateTime<Utc>) -> LootResult<bool> {
        self.reset(config_id, Window::Hourly, now)
    }

    /// Resets one window of one row.
    ///
    /// # Errors
    ///
    /// Returns `ConcurrencyConflict` if the row lock is not acquired in time.
    pub fn reset(&self, config_id: ConfigId, window: Window, now: DateTime<Utc>) -> LootResult<bool> {
        let Some(row) = self.ledger.get(config_id) else {
            return Ok(false);
        };
        let mut stats = row
            .try_lock_for(self.lock_timeout)
            .ok_or(LootError::ConcurrencyConflict { config_id })?;
        stats.reset(window, now);
        debug!(config_id, ?window, "window reset");
        Ok(true)
    }

    /// Rows with at least one elapsed window. A snapshot: rows busy past the
    /// lock timeout are left for the next sweep.
    #[must_use]
    pub fn stats_needing_reset(&self, now: DateTime<Utc>) -> Vec<ResetDue> {
        let mut due = Vec::new();
        for (config_id, row) in self.ledger.all() {
            let Some(stats) = row.try_lock_for(self.lock_timeout) else {
                continue;
            };
            let daily = stats.window_elapsed(Window::Daily, now);
            let hourly = stats.window_elapsed(Window::Hourly, now);
            if daily || hourly {
                due.push(ResetDue { config_id, daily, hourly });
            }
        }
        due.sort_by_key(|d| d.config_id);
        due
    }

    /// Resets every elapsed window. Each row is rechecked under its lock, so
    /// a window reset concurrently is not reset twice. Returns the number of
    /// windows reset.
    ///
    /// # Errors
    ///
    /// Never fails today; a row busy past the lock timeout is skipped with a
    /// warning and picked up by the next sweep.
    pub fn sweep_expired_windows(&self, now: DateTime<Utc>) -> LootResult<usize> {
        let mut reset = 0;
        for due in self.stats_needing_reset(now) {
            let Some(row) = self.ledger.get(due.config_id) else {
                continue;
            };
            let Some(mut stats) = row.try_lock_for(self.lock_timeout) else {
                warn!(config_id = due.config_id, "row busy, skipping reset until next sweep");
                continue;
            };
            for window in [Window::Daily, Window::Hourly] {
                if stats.window_elapsed(window, now) {
                    stats.reset(window, now);
                    reset += 1;
                }
            }
        }
        if reset > 0 {
            info!(windows = reset, "expired windows reset");
        }
        Ok(reset)
    }

    /// Snapshot of one row.
    #[must_use]
    pub fn stats(&self, config_id: ConfigId) -> Option<WorldDropStat> {
        self.ledger.get(config_id).map(|row| row.lock().clone())
    }

    #[cfg(test)]
    fn row(&self, config: &WorldDropConfig, now: DateTime<Utc>) -> Row {
        self.ledger.get_or_create(config, now)
    }
}

fn log_grant(config: &WorldDropConfig, outcome: &ConsumeOutcome) {
    if let ConsumeOutcome::Granted { forced, stats } = outcome {
        info!(
            config_id = config.id,
            item_id = config.item_id,
            total = stats.total_dropped,
            daily = stats.daily_dropped,
            forced,
            "world drop granted"
        );
    }
}

fn seconds(secs: u64) -> Duration {
    // Largest second count chrono can represent.
    let secs = i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1_000);
    Duration::seconds(secs)
}
