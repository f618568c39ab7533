//! Durable ledger storage.
//!
//! The store is the only source of truth. Every write that touches more than
//! one row (reset with rollovers, multi-entry deductions, cache
//! reconciliation) is a single transaction.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::{PostgresStore, PostgresTables};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::balance::BalanceKey;
use crate::types::{
    Balances, EntityId, EntryId, Feature, FeatureId, Grant, GrantId, LedgerEntry,
    ProductInstanceId, RolloverRecord,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Write conflict on entry {id}")]
    Conflict { id: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage { message } => {
                let message = message.to_lowercase();
                message.contains("timeout")
                    || message.contains("connection")
                    || message.contains("pool")
                    || message.contains("deadlock")
                    || message.contains("serialize")
            }
            _ => false,
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(feature = "postgres")]
pub(crate) trait StorageResultExt<T> {
    fn storage_err(self) -> StoreResult<T>;
    fn storage_err_ctx(self, context: &str) -> StoreResult<T>;
}

#[cfg(feature = "postgres")]
impl<T, E: std::fmt::Display> StorageResultExt<T> for std::result::Result<T, E> {
    fn storage_err(self) -> StoreResult<T> {
        self.map_err(|e| StoreError::Storage {
            message: e.to_string(),
        })
    }

    fn storage_err_ctx(self, context: &str) -> StoreResult<T> {
        self.map_err(|e| StoreError::Storage {
            message: format!("{}: {}", context, e),
        })
    }
}

/// A reset transition, committed only if `next_reset_at` still equals the
/// value the resetter observed.
#[derive(Clone, Debug)]
pub struct ResetCommit {
    pub entry: LedgerEntry,
    pub expected_next_reset_at: DateTime<Utc>,
    /// Full replacement set of rollover records for the entry.
    pub rollovers: Vec<RolloverRecord>,
}

/// Optimistic full-row write guarded by the row version.
#[derive(Clone, Debug)]
pub struct EntryCommit {
    pub entry: LedgerEntry,
    pub expected_version: i64,
}

/// Cache-observed state of one touched entry.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncTarget {
    pub entry_id: EntryId,
    /// Period the cached values belong to.
    pub next_reset_at: Option<DateTime<Utc>>,
    pub slots: Vec<(Option<EntityId>, Balances)>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncOutcome {
    pub written: Vec<EntryId>,
    /// Entries reset in the store since the cache snapshot was taken.
    pub stale: Vec<EntryId>,
    pub missing: Vec<EntryId>,
}

#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    fn name(&self) -> &str;

    async fn put_feature(&self, feature: &Feature) -> StoreResult<()>;

    async fn feature(&self, id: &FeatureId) -> StoreResult<Option<Feature>>;

    async fn put_grant(&self, grant: &Grant) -> StoreResult<()>;

    async fn grant(&self, id: &GrantId) -> StoreResult<Option<Grant>>;

    async fn insert_entry(&self, entry: &LedgerEntry) -> StoreResult<()>;

    async fn entry(&self, id: &EntryId) -> StoreResult<Option<LedgerEntry>>;

    /// Live (active or past-due) entries for a customer-feature pair.
    async fn entries_for(&self, key: &BalanceKey) -> StoreResult<Vec<LedgerEntry>>;

    async fn entries_for_instance(&self, id: &ProductInstanceId)
    -> StoreResult<Vec<LedgerEntry>>;

    async fn rollovers(&self, entry_id: &EntryId) -> StoreResult<Vec<RolloverRecord>>;

    /// Live entries with `next_reset_at <= now`, ordered by
    /// `(next_reset_at, id)` and strictly after `after`.
    async fn due_for_reset(
        &self,
        now: DateTime<Utc>,
        after: Option<(DateTime<Utc>, EntryId)>,
        limit: usize,
    ) -> StoreResult<Vec<LedgerEntry>>;

    /// Returns `false` when another resetter won the race.
    async fn apply_reset(&self, commit: &ResetCommit) -> StoreResult<bool>;

    /// All-or-nothing; fails with [`StoreError::Conflict`] on any version mismatch.
    async fn commit_entries(&self, commits: &[EntryCommit]) -> StoreResult<()>;

    async fn add_purchase(
        &self,
        entry_id: &EntryId,
        entity_id: Option<&EntityId>,
        quantity: rust_decimal::Decimal,
    ) -> StoreResult<LedgerEntry>;

    /// Reconciles cached state against the latest rows in one transaction.
    async fn sync_entries(&self, targets: &[SyncTarget]) -> StoreResult<SyncOutcome>;

    /// Marks every entry of a product instance expired; returns the entries.
    async fn expire_instance(&self, id: &ProductInstanceId) -> StoreResult<Vec<LedgerEntry>>;
}
