use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{BalanceCache, CacheResult, CachedBalance, Mutation, MutationOutcome};
use crate::Result;
use crate::balance::{BalanceKey, Breakdown};
use crate::types::EntryId;

/// In-process cache. Each key's shard lock is the per-key atomic section.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<BalanceKey, CachedBalance>,
    /// Fill epochs. A fill holds the key's epoch lock while inserting.
    epochs: DashMap<BalanceKey, u64>,
    ttl: Option<Duration>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_expired(&self, key: &BalanceKey, now: DateTime<Utc>) {
        self.entries
            .remove_if(key, |_, cached| cached.is_evictable(self.ttl, now));
    }
}

#[async_trait::async_trait]
impl BalanceCache for MemoryCache {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &BalanceKey) -> CacheResult<Option<CachedBalance>> {
        self.evict_expired(key, Utc::now());
        Ok(self.entries.get(key).map(|cached| cached.clone()))
    }

    async fn fill_epoch(&self, key: &BalanceKey) -> CacheResult<u64> {
        Ok(self.epochs.get(key).map(|epoch| *epoch).unwrap_or(0))
    }

    async fn bump_epoch(&self, key: &BalanceKey) -> CacheResult<()> {
        *self.epochs.entry(key.clone()).or_default() += 1;
        Ok(())
    }

    async fn put_if_absent(
        &self,
        breakdown: Breakdown,
        epoch: u64,
    ) -> CacheResult<Option<CachedBalance>> {
        let key = breakdown.key.clone();
        self.evict_expired(&key, Utc::now());
        let current = self.epochs.entry(key.clone()).or_default();
        let cached = match self.entries.entry(key) {
            Entry::Occupied(occupied) => Some(occupied.get().clone()),
            Entry::Vacant(_) if *current != epoch => None,
            Entry::Vacant(vacant) => Some(vacant.insert(CachedBalance::new(breakdown)).clone()),
        };
        drop(current);
        Ok(cached)
    }

    async fn mutate(
        &self,
        key: &BalanceKey,
        mutation: &Mutation,
        now: DateTime<Utc>,
    ) -> Result<Option<MutationOutcome>> {
        self.evict_expired(key, now);
        let Some(mut cached) = self.entries.get_mut(key) else {
            return Ok(None);
        };
        if cached.breakdown.is_due(now) {
            return Ok(None);
        }
        let deduction = cached.apply(mutation)?;
        Ok(Some(MutationOutcome {
            breakdown: cached.breakdown.clone(),
            deduction,
        }))
    }

    async fn take_dirty(
        &self,
        key: &BalanceKey,
    ) -> CacheResult<Option<(Breakdown, BTreeSet<EntryId>)>> {
        let Some(mut cached) = self.entries.get_mut(key) else {
            return Ok(None);
        };
        Ok(cached
            .drain_dirty()
            .map(|drained| (cached.breakdown.clone(), drained)))
    }

    async fn complete_sync(
        &self,
        key: &BalanceKey,
        ids: &BTreeSet<EntryId>,
        succeeded: bool,
    ) -> CacheResult<()> {
        if let Some(mut cached) = self.entries.get_mut(key) {
            cached.complete_sync(ids, succeeded);
        }
        Ok(())
    }

    async fn dirty_keys(&self) -> CacheResult<Vec<BalanceKey>> {
        let mut keys: Vec<BalanceKey> = self
            .entries
            .iter()
            .filter(|entry| !entry.dirty.is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn invalidate_if_clean(&self, key: &BalanceKey) -> CacheResult<bool> {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(occupied) if occupied.get().is_clean() => {
                occupied.remove();
                Ok(true)
            }
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(_) => Ok(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::balance::{BreakdownItem, OveragePolicy};
    use crate::types::Balances;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn breakdown(next_reset_at: Option<DateTime<Utc>>) -> Breakdown {
        Breakdown {
            key: BalanceKey::new("cus", "messages"),
            items: vec![BreakdownItem {
                entry_id: EntryId::new(),
                entity_id: None,
                interval: None,
                one_off: false,
                balances: Balances::granted(dec!(100)),
                unlimited: false,
                overage: OveragePolicy::Forbidden,
                next_reset_at,
                created_at: Utc::now(),
            }],
        }
    }

    fn track(delta: rust_decimal::Decimal) -> Mutation {
        Mutation::Track {
            entity_id: None,
            delta,
            reject: false,
        }
    }

    #[tokio::test]
    async fn test_mutate_requires_cached_key() {
        let cache = MemoryCache::new();
        let key = BalanceKey::new("cus", "messages");
        assert!(cache.mutate(&key, &track(dec!(1)), Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_due_breakdown_is_not_mutated() {
        let cache = MemoryCache::new();
        let due = breakdown(Some(Utc::now() - chrono::Duration::seconds(1)));
        let key = due.key.clone();
        cache.put_if_absent(due, 0).await.unwrap();
        assert!(cache.mutate(&key, &track(dec!(1)), Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_if_absent_keeps_existing() {
        let cache = MemoryCache::new();
        let first = breakdown(None);
        let key = first.key.clone();
        cache.put_if_absent(first, 0).await.unwrap();
        cache.mutate(&key, &track(dec!(10)), Utc::now()).await.unwrap();

        let kept = cache.put_if_absent(breakdown(None), 0).await.unwrap().unwrap();
        assert_eq!(kept.breakdown.aggregate(None).current_balance, dec!(90));
    }

    #[tokio::test]
    async fn test_fill_after_durable_write_is_discarded() {
        let cache = MemoryCache::new();
        let stale = breakdown(None);
        let key = stale.key.clone();

        let epoch = cache.fill_epoch(&key).await.unwrap();
        cache.bump_epoch(&key).await.unwrap();
        assert!(cache.put_if_absent(stale, epoch).await.unwrap().is_none());
        assert!(cache.get(&key).await.unwrap().is_none());

        let epoch = cache.fill_epoch(&key).await.unwrap();
        assert_eq!(epoch, 1);
        assert!(cache.put_if_absent(breakdown(None), epoch).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_dirty_key_survives_invalidation_and_ttl() {
        let cache = MemoryCache::new().with_ttl(Duration::from_millis(0));
        let initial = breakdown(None);
        let key = initial.key.clone();
        cache.put_if_absent(initial, 0).await.unwrap();
        cache.mutate(&key, &track(dec!(5)), Utc::now()).await.unwrap();

        assert!(!cache.invalidate_if_clean(&key).await.unwrap());
        assert!(cache.get(&key).await.unwrap().is_some());
        assert_eq!(cache.dirty_keys().await.unwrap(), vec![key.clone()]);

        let (_, drained) = cache.take_dirty(&key).await.unwrap().unwrap();
        assert!(cache.dirty_keys().await.unwrap().is_empty());
        assert!(!cache.invalidate_if_clean(&key).await.unwrap());

        cache.complete_sync(&key, &drained, true).await.unwrap();
        assert!(cache.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overlapping_drain_is_deferred() {
        let cache = MemoryCache::new();
        let initial = breakdown(None);
        let key = initial.key.clone();
        cache.put_if_absent(initial, 0).await.unwrap();

        cache.mutate(&key, &track(dec!(10)), Utc::now()).await.unwrap();
        let (snapshot, first) = cache.take_dirty(&key).await.unwrap().unwrap();
        assert_eq!(snapshot.aggregate(None).current_balance, dec!(90));

        cache.mutate(&key, &track(dec!(20)), Utc::now()).await.unwrap();
        assert!(cache.take_dirty(&key).await.unwrap().is_none());

        cache.complete_sync(&key, &first, true).await.unwrap();
        assert!(!cache.invalidate_if_clean(&key).await.unwrap());
        assert_eq!(cache.dirty_keys().await.unwrap(), vec![key.clone()]);

        let (snapshot, _) = cache.take_dirty(&key).await.unwrap().unwrap();
        assert_eq!(snapshot.aggregate(None).current_balance, dec!(70));
    }

    #[tokio::test]
    async fn test_rejected_track_reports_shortfall() {
        let cache = MemoryCache::new();
        let initial = breakdown(None);
        let key = initial.key.clone();
        cache.put_if_absent(initial, 0).await.unwrap();
        let result = cache
            .mutate(
                &key,
                &Mutation::Track {
                    entity_id: None,
                    delta: dec!(150),
                    reject: true,
                },
                Utc::now(),
            )
            .await;
        assert!(matches!(
            result,
            Err(Error::InsufficientBalance { available, .. }) if available == dec!(100)
        ));
        let cached = cache.get(&key).await.unwrap().unwrap();
        assert!(cached.is_clean());
    }

    #[tokio::test]
    async fn test_concurrent_mutations_serialize() {
        let cache = Arc::new(MemoryCache::new());
        let initial = breakdown(None);
        let key = initial.key.clone();
        cache.put_if_absent(initial, 0).await.unwrap();

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let cache = cache.clone();
                let key = key.clone();
                tokio::spawn(async move { cache.mutate(&key, &track(dec!(1)), Utc::now()).await })
            })
            .collect();
        for task in futures::future::join_all(tasks).await {
            task.unwrap().unwrap();
        }
        let cached = cache.get(&key).await.unwrap().unwrap();
        assert_eq!(cached.breakdown.aggregate(None).current_balance, dec!(50));
    }
}
