//! In-memory ledger store for testing and single-process deployments.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::RwLock;

use super::{
    EntryCommit, LedgerStore, ResetCommit, StoreError, StoreResult, SyncOutcome, SyncTarget,
};
use crate::balance::BalanceKey;
use crate::sync::reconcile;
use crate::types::{
    EntityId, EntryId, EntryStatus, Feature, FeatureId, Grant, GrantId, LedgerEntry,
    ProductInstanceId, RolloverRecord,
};

#[derive(Default)]
struct State {
    features: HashMap<FeatureId, Feature>,
    grants: HashMap<GrantId, Grant>,
    entries: HashMap<EntryId, LedgerEntry>,
    rollovers: HashMap<EntryId, Vec<RolloverRecord>>,
}

/// Every multi-row write holds the single write lock, which stands in for a
/// database transaction.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entry_count(&self) -> usize {
        self.state.read().await.entries.len()
    }
}

#[async_trait::async_trait]
impl LedgerStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put_feature(&self, feature: &Feature) -> StoreResult<()> {
        self.state
            .write()
            .await
            .features
            .insert(feature.id.clone(), feature.clone());
        Ok(())
    }

    async fn feature(&self, id: &FeatureId) -> StoreResult<Option<Feature>> {
        Ok(self.state.read().await.features.get(id).cloned())
    }

    async fn put_grant(&self, grant: &Grant) -> StoreResult<()> {
        self.state
            .write()
            .await
            .grants
            .insert(grant.id, grant.clone());
        Ok(())
    }

    async fn grant(&self, id: &GrantId) -> StoreResult<Option<Grant>> {
        Ok(self.state.read().await.grants.get(id).cloned())
    }

    async fn insert_entry(&self, entry: &LedgerEntry) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if !state.grants.contains_key(&entry.grant_id) {
            return Err(StoreError::not_found("grant", entry.grant_id));
        }
        state.entries.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn entry(&self, id: &EntryId) -> StoreResult<Option<LedgerEntry>> {
        Ok(self.state.read().await.entries.get(id).cloned())
    }

    async fn entries_for(&self, key: &BalanceKey) -> StoreResult<Vec<LedgerEntry>> {
        let state = self.state.read().await;
        Ok(state
            .entries
            .values()
            .filter(|e| e.customer_id == key.customer_id && e.feature_id == key.feature_id)
            .filter(|e| e.status.is_live())
            .cloned()
            .collect())
    }

    async fn entries_for_instance(
        &self,
        id: &ProductInstanceId,
    ) -> StoreResult<Vec<LedgerEntry>> {
        let state = self.state.read().await;
        Ok(state
            .entries
            .values()
            .filter(|e| e.product_instance_id.as_ref() == Some(id))
            .cloned()
            .collect())
    }

    async fn rollovers(&self, entry_id: &EntryId) -> StoreResult<Vec<RolloverRecord>> {
        let state = self.state.read().await;
        let mut records = state.rollovers.get(entry_id).cloned().unwrap_or_default();
        records.sort_by_key(|r| (r.created_at, r.id));
        Ok(records)
    }

    async fn due_for_reset(
        &self,
        now: DateTime<Utc>,
        after: Option<(DateTime<Utc>, EntryId)>,
        limit: usize,
    ) -> StoreResult<Vec<LedgerEntry>> {
        let state = self.state.read().await;
        let mut due: Vec<&LedgerEntry> = state
            .entries
            .values()
            .filter(|e| e.status.is_live())
            .filter(|e| match (e.next_reset_at, &after) {
                (Some(at), _) if at > now => false,
                (Some(at), Some(cursor)) => (at, e.id) > *cursor,
                (Some(_), None) => true,
                (None, _) => false,
            })
            .collect();
        due.sort_by_key(|e| (e.next_reset_at, e.id));
        Ok(due.into_iter().take(limit).cloned().collect())
    }

    async fn apply_reset(&self, commit: &ResetCommit) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let current = state
            .entries
            .get_mut(&commit.entry.id)
            .ok_or_else(|| StoreError::not_found("entry", commit.entry.id))?;

        if current.next_reset_at != Some(commit.expected_next_reset_at) {
            return Ok(false);
        }

        let version = current.version + 1;
        *current = LedgerEntry {
            version,
            ..commit.entry.clone()
        };
        state
            .rollovers
            .insert(commit.entry.id, commit.rollovers.clone());
        Ok(true)
    }

    async fn commit_entries(&self, commits: &[EntryCommit]) -> StoreResult<()> {
        let mut state = self.state.write().await;
        for commit in commits {
            match state.entries.get(&commit.entry.id) {
                Some(current) if current.version == commit.expected_version => {}
                Some(_) => {
                    return Err(StoreError::Conflict {
                        id: commit.entry.id.to_string(),
                    });
                }
                None => return Err(StoreError::not_found("entry", commit.entry.id)),
            }
        }
        for commit in commits {
            let mut entry = commit.entry.clone();
            entry.version = commit.expected_version + 1;
            state.entries.insert(entry.id, entry);
        }
        Ok(())
    }

    async fn add_purchase(
        &self,
        entry_id: &EntryId,
        entity_id: Option<&EntityId>,
        quantity: Decimal,
    ) -> StoreResult<LedgerEntry> {
        let mut state = self.state.write().await;
        let entry = state
            .entries
            .get_mut(entry_id)
            .ok_or_else(|| StoreError::not_found("entry", entry_id))?;
        let slot = entry.slot_mut(entity_id).ok_or_else(|| {
            StoreError::not_found(
                "entity",
                entity_id.map(|e| e.to_string()).unwrap_or_default(),
            )
        })?;
        slot.purchased_balance += quantity;
        entry.refresh_totals();
        entry.version += 1;
        Ok(entry.clone())
    }

    async fn sync_entries(&self, targets: &[SyncTarget]) -> StoreResult<SyncOutcome> {
        let mut state = self.state.write().await;
        let mut outcome = SyncOutcome::default();
        for target in targets {
            let Some(durable) = state.entries.get_mut(&target.entry_id) else {
                outcome.missing.push(target.entry_id);
                continue;
            };
            match reconcile(durable, target) {
                Some(updated) => {
                    if updated != *durable {
                        *durable = LedgerEntry {
                            version: durable.version + 1,
                            ..updated
                        };
                    }
                    outcome.written.push(target.entry_id);
                }
                None => outcome.stale.push(target.entry_id),
            }
        }
        Ok(outcome)
    }

    async fn expire_instance(&self, id: &ProductInstanceId) -> StoreResult<Vec<LedgerEntry>> {
        let mut state = self.state.write().await;
        let mut expired = Vec::new();
        for entry in state.entries.values_mut() {
            if entry.product_instance_id.as_ref() == Some(id) && entry.status.is_live() {
                entry.status = EntryStatus::Expired;
                entry.version += 1;
                expired.push(entry.clone());
            }
        }
        Ok(expired)
    }
}
