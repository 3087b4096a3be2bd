//! # Loot Error Types
//!
//! All errors that can occur while resolving drops.
//!
//! Capacity and interval outcomes (`total_exhausted`, `too_soon`, ...) are
//! NOT errors. They are ordinary business results and live in
//! [`crate::limiter::DenyReason`].

use thiserror::Error;

/// Errors that can occur in the loot system.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LootError {
    /// A referenced pool, item or world drop config does not exist.
    #[error("{kind} not found: {id}")]
    ConfigNotFound {
        /// What was looked up ("pool", "item", "world_drop").
        kind: &'static str,
        /// The missing identifier.
        id: u64,
    },

    /// Weights sum to zero, or no item carries a weight or rate.
    #[error("invalid weight configuration: {0}")]
    InvalidWeightConfiguration(String),

    /// Configuration failed load-time validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The row lock for a world drop config could not be acquired in time.
    #[error("lock contention on world drop config {config_id}, try again")]
    ConcurrencyConflict {
        /// The contended config.
        config_id: u32,
    },

    /// A concurrent attempt at the same event recorded one of its slots
    /// first. A retry reuses what was recorded.
    #[error("event {event_id} was recorded by a concurrent attempt, try again")]
    SlotClaimed {
        /// The contended event.
        event_id: u64,
    },

    /// The audit store could not be written.
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    /// The random source failed to produce bytes.
    #[error("random source failure: {0}")]
    RandomSource(String),
}

impl LootError {
    /// Returns true if the whole call may be retried from scratch.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. } | Self::SlotClaimed { .. })
    }

    /// Returns true if the error must abort the entire drop event.
    ///
    /// Configuration errors only abort the pool they occurred in.
    #[must_use]
    pub const fn is_fatal_to_event(&self) -> bool {
        matches!(
            self,
            Self::PersistenceFailure(_)
                | Self::RandomSource(_)
                | Self::ConcurrencyConflict { .. }
                | Self::SlotClaimed { .. }
        )
    }
}

/// Result type for loot operations.
pub type LootResult<T> = Result<T, LootError>;
