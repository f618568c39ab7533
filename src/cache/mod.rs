//! Cache tier.
//!
//! The cache holds one full [`Breakdown`] per customer-feature pair plus the
//! ids of entries written since the last sync. Every mutation on a pair runs
//! inside a single atomic per-key operation, so concurrent tracks on one key
//! never interleave. The cache is never a second source of truth: a key is
//! only evicted once all of its writes have reached the store.

mod memory;
#[cfg(feature = "redis-backend")]
mod redis;

pub use memory::MemoryCache;
#[cfg(feature = "redis-backend")]
pub use self::redis::{RedisCache, RedisCacheConfig};

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::balance::{BalanceKey, Breakdown, BreakdownItem, DeductionOrder};
use crate::deduction::{self, BalanceTarget, Deduction, DeductionMode};
use crate::types::{EntityId, EntryId};
use crate::{Error, Result};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache backend error: {message}")]
    Backend { message: String },

    #[error("Cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Gave up on key {key} after {attempts} contended attempts")]
    Contention { key: String, attempts: u32 },
}

impl CacheError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Backend { message } => {
                message.contains("timeout")
                    || message.contains("connection")
                    || message.contains("BUSY")
                    || message.contains("LOADING")
            }
            Self::Contention { .. } => true,
            Self::Serialization(_) => false,
        }
    }
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CachedBalance {
    pub breakdown: Breakdown,
    /// Entries written since the last sync.
    pub dirty: BTreeSet<EntryId>,
    /// Entries drained by a sync that has not completed yet.
    pub syncing: BTreeSet<EntryId>,
    pub cached_at: DateTime<Utc>,
}

impl CachedBalance {
    pub fn new(breakdown: Breakdown) -> Self {
        Self {
            breakdown,
            dirty: BTreeSet::new(),
            syncing: BTreeSet::new(),
            cached_at: Utc::now(),
        }
    }

    /// No write is waiting for the store.
    pub fn is_clean(&self) -> bool {
        self.dirty.is_empty() && self.syncing.is_empty()
    }

    pub fn is_expired(&self, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
        match ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok()) {
            Some(ttl) => self.cached_at + ttl <= now,
            None => false,
        }
    }

    /// Clean and past its TTL.
    pub fn is_evictable(&self, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
        self.is_clean() && self.is_expired(ttl, now)
    }

    /// Moves the dirty set into `syncing` and returns it. `None` when
    /// nothing is dirty or an earlier drain has not completed; one sync per
    /// key is in flight at a time.
    pub fn drain_dirty(&mut self) -> Option<BTreeSet<EntryId>> {
        if self.dirty.is_empty() || !self.syncing.is_empty() {
            return None;
        }
        let drained = std::mem::take(&mut self.dirty);
        self.syncing.extend(drained.iter().copied());
        Some(drained)
    }

    pub fn complete_sync(&mut self, ids: &BTreeSet<EntryId>, succeeded: bool) {
        for id in ids {
            self.syncing.remove(id);
        }
        if !succeeded {
            self.dirty.extend(ids.iter().copied());
        }
    }

    /// Applies `mutation` and records the touched entries as dirty.
    pub fn apply(&mut self, mutation: &Mutation) -> Result<Deduction> {
        let mut working = self.breakdown.clone();
        let deduction = mutation.apply(&mut working)?;
        self.breakdown = working;
        if mutation.marks_dirty() {
            self.dirty.extend(deduction.touched.iter().copied());
        }
        Ok(deduction)
    }
}

/// A change applied to a cached breakdown under the per-key atomic operation.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    Track {
        entity_id: Option<EntityId>,
        delta: Decimal,
        /// Fail instead of leaving part of a consumption unabsorbed.
        reject: bool,
    },
    Update {
        entity_id: Option<EntityId>,
        target: BalanceTarget,
    },
    /// Mirrors a purchase already committed to the store. Carries the
    /// durable purchased balance; within a period it only grows, so the
    /// larger of cached and durable wins.
    Purchase {
        entry_id: EntryId,
        entity_id: Option<EntityId>,
        purchased_balance: Decimal,
    },
    /// Adds newly attached entry slots in deduction order.
    Attach {
        items: Vec<BreakdownItem>,
        order: DeductionOrder,
    },
    /// Drops expired entries.
    Detach { entry_ids: Vec<EntryId> },
}

impl Mutation {
    fn marks_dirty(&self) -> bool {
        matches!(self, Self::Track { .. } | Self::Update { .. })
    }

    pub fn apply(&self, breakdown: &mut Breakdown) -> Result<Deduction> {
        match self {
            Self::Track {
                entity_id,
                delta,
                reject,
            } => {
                let mut view = breakdown.view(entity_id.as_ref(), None);
                if view.is_unlimited() {
                    return Ok(Deduction::default());
                }
                let outcome = deduction::apply(&mut view.items, *delta, DeductionMode::Usage);
                if *reject && delta.is_sign_positive() && !outcome.is_complete() {
                    return Err(Error::InsufficientBalance {
                        requested: *delta,
                        available: outcome.applied,
                    });
                }
                breakdown.merge(&view);
                Ok(outcome)
            }
            Self::Update { entity_id, target } => {
                let mut view = breakdown.view(entity_id.as_ref(), None);
                let outcome = deduction::apply_target(&mut view, target, entity_id.as_ref())?;
                breakdown.merge(&view);
                Ok(outcome)
            }
            Self::Purchase {
                entry_id,
                entity_id,
                purchased_balance,
            } => {
                let mut outcome = Deduction::default();
                if let Some(item) = breakdown.item_mut(entry_id, entity_id.as_ref()) {
                    let raised = (*purchased_balance - item.balances.purchased_balance)
                        .max(Decimal::ZERO);
                    item.balances.purchased_balance += raised;
                    outcome.applied = -raised;
                }
                Ok(outcome)
            }
            Self::Attach { items, order } => {
                for item in items {
                    if breakdown.item(&item.entry_id, item.entity_id.as_ref()).is_none() {
                        breakdown.items.push(item.clone());
                    }
                }
                // Stable sort keeps entity slots in entity order within an entry.
                breakdown.items.sort_by(|a, b| {
                    let ordering = (a.created_at, a.entry_id).cmp(&(b.created_at, b.entry_id));
                    match order {
                        DeductionOrder::AttachOrder => ordering,
                        DeductionOrder::ReverseAttachOrder => ordering.reverse(),
                    }
                });
                Ok(Deduction::default())
            }
            Self::Detach { entry_ids } => {
                breakdown
                    .items
                    .retain(|item| !entry_ids.contains(&item.entry_id));
                Ok(Deduction::default())
            }
        }
    }
}

/// State after a mutation was applied.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationOutcome {
    pub breakdown: Breakdown,
    pub deduction: Deduction,
}

#[async_trait::async_trait]
pub trait BalanceCache: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, key: &BalanceKey) -> CacheResult<Option<CachedBalance>>;

    /// Current fill epoch of `key`. Read it before loading rows for a fill.
    async fn fill_epoch(&self, key: &BalanceKey) -> CacheResult<u64>;

    /// Advances the fill epoch. Called after every durable write that is
    /// mirrored into the cache, before the mirror runs.
    async fn bump_epoch(&self, key: &BalanceKey) -> CacheResult<()>;

    /// Stores `breakdown` unless the key is already cached; returns what the
    /// cache holds afterwards. `Ok(None)` when the key is absent and its
    /// epoch moved past `epoch`: the rows behind `breakdown` may predate a
    /// durable write, so the fill is dropped.
    async fn put_if_absent(
        &self,
        breakdown: Breakdown,
        epoch: u64,
    ) -> CacheResult<Option<CachedBalance>>;

    /// Runs `mutation` atomically. `Ok(None)` when the key is not cached or
    /// holds an entry whose reset is due at `now`.
    async fn mutate(
        &self,
        key: &BalanceKey,
        mutation: &Mutation,
        now: DateTime<Utc>,
    ) -> Result<Option<MutationOutcome>>;

    /// Atomically snapshots the breakdown and drains its dirty set.
    /// `Ok(None)` when nothing is dirty or another sync of the key is still
    /// in flight; the key stays dirty for the next pass.
    async fn take_dirty(
        &self,
        key: &BalanceKey,
    ) -> CacheResult<Option<(Breakdown, BTreeSet<EntryId>)>>;

    /// Settles a drained set; a failed sync puts the ids back.
    async fn complete_sync(
        &self,
        key: &BalanceKey,
        ids: &BTreeSet<EntryId>,
        succeeded: bool,
    ) -> CacheResult<()>;

    async fn dirty_keys(&self) -> CacheResult<Vec<BalanceKey>>;

    /// Evicts `key` if it holds no unsynced writes. Returns whether the key
    /// is absent afterwards.
    async fn invalidate_if_clean(&self, key: &BalanceKey) -> CacheResult<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::OveragePolicy;
    use crate::types::Balances;
    use rust_decimal_macros::dec;

    fn item(granted: Decimal) -> BreakdownItem {
        BreakdownItem {
            entry_id: EntryId::new(),
            entity_id: None,
            interval: None,
            one_off: false,
            balances: Balances::granted(granted),
            unlimited: false,
            overage: OveragePolicy::Forbidden,
            next_reset_at: None,
            created_at: Utc::now(),
        }
    }

    fn cached(items: Vec<BreakdownItem>) -> CachedBalance {
        CachedBalance::new(Breakdown {
            key: BalanceKey::new("cus", "messages"),
            items,
        })
    }

    #[test]
    fn test_reject_leaves_breakdown_untouched() {
        let mut balance = cached(vec![item(dec!(5))]);
        let before = balance.clone();
        let result = balance.apply(&Mutation::Track {
            entity_id: None,
            delta: dec!(6),
            reject: true,
        });
        assert!(matches!(result, Err(Error::InsufficientBalance { .. })));
        assert_eq!(balance, before);
    }

    #[test]
    fn test_track_marks_dirty_and_purchase_does_not() {
        let slot = item(dec!(5));
        let entry_id = slot.entry_id;
        let mut balance = cached(vec![slot]);

        balance
            .apply(&Mutation::Purchase {
                entry_id,
                entity_id: None,
                purchased_balance: dec!(10),
            })
            .unwrap();
        assert!(balance.dirty.is_empty());

        // A stale mirror never lowers the purchased balance.
        balance
            .apply(&Mutation::Purchase {
                entry_id,
                entity_id: None,
                purchased_balance: dec!(4),
            })
            .unwrap();
        assert_eq!(balance.breakdown.items[0].balances.purchased_balance, dec!(10));

        balance
            .apply(&Mutation::Track {
                entity_id: None,
                delta: dec!(1),
                reject: false,
            })
            .unwrap();
        assert!(balance.dirty.contains(&entry_id));
        assert_eq!(balance.breakdown.aggregate(None).current_balance, dec!(14));
    }

    #[test]
    fn test_drain_and_restore() {
        let slot = item(dec!(5));
        let entry_id = slot.entry_id;
        let mut balance = cached(vec![slot]);
        balance.dirty.insert(entry_id);

        let drained = balance.drain_dirty().unwrap();
        assert!(balance.dirty.is_empty());
        assert!(!balance.is_clean());

        balance.complete_sync(&drained, false);
        assert!(balance.dirty.contains(&entry_id));
        let drained = balance.drain_dirty().unwrap();
        balance.complete_sync(&drained, true);
        assert!(balance.is_clean());
        assert!(balance.drain_dirty().is_none());
    }

    #[test]
    fn test_second_drain_waits_for_first() {
        let slot = item(dec!(100));
        let entry_id = slot.entry_id;
        let mut balance = cached(vec![slot]);
        let track = |delta| Mutation::Track {
            entity_id: None,
            delta,
            reject: false,
        };

        balance.apply(&track(dec!(10))).unwrap();
        let first = balance.drain_dirty().unwrap();

        balance.apply(&track(dec!(20))).unwrap();
        assert!(balance.drain_dirty().is_none());
        assert!(balance.dirty.contains(&entry_id));

        balance.complete_sync(&first, true);
        assert!(!balance.is_clean());
        let second = balance.drain_dirty().unwrap();
        assert_eq!(second, first);
    }

    #[test]
    fn test_attach_keeps_order() {
        let older = item(dec!(1));
        let mut newer = item(dec!(2));
        newer.created_at = older.created_at + chrono::Duration::seconds(1);
        let mut balance = cached(vec![newer.clone()]);

        balance
            .apply(&Mutation::Attach {
                items: vec![older.clone()],
                order: DeductionOrder::AttachOrder,
            })
            .unwrap();
        assert_eq!(balance.breakdown.entry_ids(), vec![older.entry_id, newer.entry_id]);

        balance
            .apply(&Mutation::Detach {
                entry_ids: vec![older.entry_id],
            })
            .unwrap();
        assert_eq!(balance.breakdown.entry_ids(), vec![newer.entry_id]);
    }
}
