//! Breakdown assembly over the durable store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{BalanceKey, Breakdown, BreakdownItem, DeductionOrder};
use crate::reset::ResetManager;
use crate::store::LedgerStore;
use crate::types::{Grant, GrantId, LedgerEntry};
use crate::{Error, Result};

/// Orders entries by `(created_at, id)` and expands them into slots.
///
/// Entity slots keep entity-id order inside their entry regardless of the
/// requested direction.
pub fn build_breakdown(
    key: BalanceKey,
    mut entries: Vec<(LedgerEntry, Grant)>,
    order: DeductionOrder,
) -> Breakdown {
    entries.sort_by(|(a, _), (b, _)| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
    if order == DeductionOrder::ReverseAttachOrder {
        entries.reverse();
    }
    let items = entries
        .iter()
        .flat_map(|(entry, grant)| BreakdownItem::from_entry(entry, grant))
        .collect();
    Breakdown { key, items }
}

/// Reads breakdowns from the durable store.
///
/// Grants are immutable at evaluation time, so they are memoized.
pub struct BalanceAggregator {
    store: Arc<dyn LedgerStore>,
    order: DeductionOrder,
    grants: DashMap<GrantId, Grant>,
}

impl BalanceAggregator {
    pub fn new(store: Arc<dyn LedgerStore>, order: DeductionOrder) -> Self {
        Self {
            store,
            order,
            grants: DashMap::new(),
        }
    }

    pub fn order(&self) -> DeductionOrder {
        self.order
    }

    pub async fn grant(&self, id: &GrantId) -> Result<Grant> {
        if let Some(grant) = self.grants.get(id) {
            return Ok(grant.clone());
        }
        let grant = self
            .store
            .grant(id)
            .await?
            .ok_or_else(|| Error::not_found("grant", id))?;
        self.grants.insert(*id, grant.clone());
        Ok(grant)
    }

    pub async fn entries_with_grants(&self, key: &BalanceKey) -> Result<Vec<(LedgerEntry, Grant)>> {
        let entries = self.store.entries_for(key).await?;
        let mut paired = Vec::with_capacity(entries.len());
        for entry in entries {
            let grant = self.grant(&entry.grant_id).await?;
            paired.push((entry, grant));
        }
        Ok(paired)
    }

    /// Last-synced durable breakdown, without touching expired entries.
    pub async fn breakdown(&self, key: &BalanceKey) -> Result<Breakdown> {
        let entries = self.entries_with_grants(key).await?;
        Ok(build_breakdown(key.clone(), entries, self.order))
    }

    /// Durable entries with every due entry rolled into its current period.
    pub async fn fresh_entries(
        &self,
        key: &BalanceKey,
        resets: &ResetManager,
        now: DateTime<Utc>,
    ) -> Result<Vec<(LedgerEntry, Grant)>> {
        let entries = self.entries_with_grants(key).await?;
        let due: Vec<_> = entries
            .iter()
            .filter(|(entry, _)| entry.is_due(now))
            .map(|(entry, _)| entry.id)
            .collect();
        if due.is_empty() {
            return Ok(entries);
        }

        tracing::debug!(key = %key, due = due.len(), "Lazily resetting expired entries");
        for entry_id in &due {
            resets.reset_entry(entry_id, now).await?;
        }
        self.entries_with_grants(key).await
    }

    pub async fn fresh_breakdown(
        &self,
        key: &BalanceKey,
        resets: &ResetManager,
        now: DateTime<Utc>,
    ) -> Result<Breakdown> {
        let entries = self.fresh_entries(key, resets, now).await?;
        Ok(build_breakdown(key.clone(), entries, self.order))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Balances, EntryId, EntryStatus};
    use chrono::Duration;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn entry(grant: &Grant, created_at: DateTime<Utc>) -> LedgerEntry {
        LedgerEntry {
            id: EntryId::new(),
            customer_id: "cus".into(),
            feature_id: grant.feature_id.clone(),
            product_instance_id: None,
            subscription_ref: None,
            grant_id: grant.id,
            status: EntryStatus::Active,
            balances: Balances::granted(grant.allowance),
            unlimited: false,
            overage_allowed: false,
            quantity: Decimal::ONE,
            next_reset_at: None,
            entity_balances: None,
            version: 0,
            created_at,
        }
    }

    #[test]
    fn test_attach_order_and_reverse() {
        let now = Utc::now();
        let free = Grant::new("free", "messages", dec!(10));
        let pack = Grant::new("pack", "messages", dec!(50));
        let older = entry(&free, now - Duration::days(2));
        let newer = entry(&pack, now);
        let key = BalanceKey::new("cus", "messages");

        let forward = build_breakdown(
            key.clone(),
            vec![(newer.clone(), pack.clone()), (older.clone(), free.clone())],
            DeductionOrder::AttachOrder,
        );
        assert_eq!(forward.entry_ids(), vec![older.id, newer.id]);

        let reverse = build_breakdown(
            key,
            vec![(older.clone(), free), (newer.clone(), pack)],
            DeductionOrder::ReverseAttachOrder,
        );
        assert_eq!(reverse.entry_ids(), vec![newer.id, older.id]);
    }

    #[test]
    fn test_equal_timestamps_tie_break_on_entry_id() {
        let now = Utc::now();
        let grant = Grant::new("pro", "messages", dec!(10));
        let a = entry(&grant, now);
        let b = entry(&grant, now);
        let expected = if a.id < b.id {
            vec![a.id, b.id]
        } else {
            vec![b.id, a.id]
        };

        let breakdown = build_breakdown(
            BalanceKey::new("cus", "messages"),
            vec![(b, grant.clone()), (a, grant)],
            DeductionOrder::AttachOrder,
        );
        assert_eq!(breakdown.entry_ids(), expected);
    }
}
