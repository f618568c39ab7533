//! Folds cache-observed balances back into the durable store.
//!
//! Reconciliation never copies cached rows wholesale. Usage and the net
//! adjustment come from the cache; granted and purchased amounts always come
//! from the row as it stands inside the write transaction. A purchase or
//! allowance change that reached the store after the cache snapshot is
//! therefore preserved, and replaying the same snapshot is a no-op.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::Instrument;

use crate::balance::{BalanceKey, Breakdown};
use crate::cache::BalanceCache;
use crate::observability::{LedgerMetrics, sync_span};
use crate::retry::{RetryPolicy, with_retry};
use crate::store::{LedgerStore, StoreError, SyncOutcome, SyncTarget};
use crate::types::{EntryId, LedgerEntry};
use crate::{Error, Result};

/// Applies a cached slot state onto the latest durable row.
///
/// Returns `None` when the row has been reset since the cache observed it.
pub fn reconcile(durable: &LedgerEntry, target: &SyncTarget) -> Option<LedgerEntry> {
    if durable.next_reset_at != target.next_reset_at {
        return None;
    }

    let mut updated = durable.clone();
    for (entity_id, cached) in &target.slots {
        let Some(slot) = updated.slot_mut(entity_id.as_ref()) else {
            continue;
        };
        slot.adjustment = cached.adjustment + (cached.granted_balance - slot.granted_balance);
        slot.usage = cached.usage;
    }
    updated.refresh_totals();
    Some(updated)
}

/// Sync targets for the dirty entries of a cached breakdown.
pub fn targets_for(snapshot: &Breakdown, dirty: &BTreeSet<EntryId>) -> Vec<SyncTarget> {
    dirty
        .iter()
        .filter_map(|entry_id| {
            let items: Vec<_> = snapshot
                .items
                .iter()
                .filter(|item| item.entry_id == *entry_id)
                .collect();
            let first = items.first()?;
            Some(SyncTarget {
                entry_id: *entry_id,
                next_reset_at: first.next_reset_at,
                slots: items
                    .iter()
                    .map(|item| (item.entity_id.clone(), item.balances))
                    .collect(),
            })
        })
        .collect()
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncReport {
    pub outcome: SyncOutcome,
    /// Another sync of the key was still in flight; nothing was drained.
    pub deferred: bool,
}

impl SyncReport {
    pub fn is_noop(&self) -> bool {
        self.outcome == SyncOutcome::default()
    }

    pub fn had_conflicts(&self) -> bool {
        !self.outcome.stale.is_empty() || !self.outcome.missing.is_empty()
    }
}

pub struct SyncEngine {
    store: Arc<dyn LedgerStore>,
    cache: Arc<dyn BalanceCache>,
    metrics: Arc<LedgerMetrics>,
    retry: RetryPolicy,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        cache: Arc<dyn BalanceCache>,
        metrics: Arc<LedgerMetrics>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            cache,
            metrics,
            retry,
        }
    }

    /// Writes every entry touched since the last sync of `key` in one store
    /// transaction. On failure the dirty set is restored for the next pass.
    pub async fn sync_key(&self, key: &BalanceKey) -> Result<SyncReport> {
        let span = sync_span(key);
        self.sync_in_span(key, &span).instrument(span.clone()).await
    }

    async fn sync_in_span(&self, key: &BalanceKey, span: &tracing::Span) -> Result<SyncReport> {
        let Some((snapshot, dirty)) = self.cache.take_dirty(key).await? else {
            let deferred = self.cache.get(key).await?.is_some_and(|c| !c.dirty.is_empty());
            if deferred {
                tracing::debug!(key = %key, "Sync already in flight; leaving key dirty");
            }
            return Ok(SyncReport {
                deferred,
                ..Default::default()
            });
        };
        let targets = targets_for(&snapshot, &dirty);
        span.record("entries", targets.len());
        if targets.is_empty() {
            self.cache.complete_sync(key, &dirty, true).await?;
            return Ok(SyncReport::default());
        }

        let result = with_retry(&self.retry, StoreError::is_transient, || {
            self.store.sync_entries(&targets)
        })
        .await;

        let succeeded = result.is_ok();
        if let Err(settle) = self.cache.complete_sync(key, &dirty, succeeded).await {
            tracing::error!(
                key = %key,
                error = %settle,
                "Failed to settle drained entries after sync"
            );
        }

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                self.metrics.sync_failures.inc();
                tracing::warn!(key = %key, error = %e, "Sync failed; will retry on next pass");
                return Err(Error::Sync {
                    key: key.to_string(),
                    message: e.to_string(),
                });
            }
        };

        self.metrics.syncs.inc();
        let report = SyncReport {
            outcome,
            deferred: false,
        };
        if report.had_conflicts() {
            let conflicts = report.outcome.stale.len() + report.outcome.missing.len();
            self.metrics.sync_conflicts.add(conflicts as u64);
            tracing::warn!(
                key = %key,
                stale = report.outcome.stale.len(),
                missing = report.outcome.missing.len(),
                "Cached balances predate the stored period; dropping them"
            );
            self.cache.invalidate_if_clean(key).await?;
        } else {
            tracing::debug!(key = %key, written = report.outcome.written.len(), "Synced");
        }
        Ok(report)
    }

    /// Syncs every key with unsynced writes. Failed keys stay dirty, as do
    /// keys whose previous sync is still in flight; neither counts as synced.
    pub async fn sync_all(&self) -> Result<(usize, usize)> {
        let mut synced = 0;
        let mut failed = 0;
        for key in self.cache.dirty_keys().await? {
            match self.sync_key(&key).await {
                Ok(report) if report.deferred => {}
                Ok(_) => synced += 1,
                Err(_) => failed += 1,
            }
        }
        Ok((synced, failed))
    }
}
