use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{Instrument, Span};

use super::rollover::{SlotContext, roll_slot};
use super::schedule::{align_to_anchor, needs_anchor_check, next_after};
use crate::external::BillingAnchorProvider;
use crate::observability::{LedgerMetrics, reset_span};
use crate::store::{LedgerStore, ResetCommit};
use crate::types::{Balances, EntryId, Grant, GrantBehavior, LedgerEntry, RolloverRecord};
use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq)]
pub enum ResetOutcome {
    /// The entry had no reset due; returned as read.
    NotDue(LedgerEntry),
    Applied { entry: LedgerEntry, periods: u32 },
    /// Unlimited, lifetime and one-off entries stop resetting.
    Terminal(LedgerEntry),
    /// Another resetter committed first; returned as re-read.
    LostRace(LedgerEntry),
}

impl ResetOutcome {
    pub fn entry(&self) -> &LedgerEntry {
        match self {
            Self::NotDue(entry)
            | Self::Applied { entry, .. }
            | Self::Terminal(entry)
            | Self::LostRace(entry) => entry,
        }
    }

    pub fn committed(&self) -> bool {
        matches!(self, Self::Applied { .. } | Self::Terminal(_))
    }
}

/// Rolls expired entries into their next period.
///
/// Safe to call from any number of lazy readers and sweepers at once: the
/// store commit is conditional on the `next_reset_at` the caller observed.
pub struct ResetManager {
    store: Arc<dyn LedgerStore>,
    anchors: Option<Arc<dyn BillingAnchorProvider>>,
    metrics: Arc<LedgerMetrics>,
}

impl ResetManager {
    pub fn new(store: Arc<dyn LedgerStore>, metrics: Arc<LedgerMetrics>) -> Self {
        Self {
            store,
            anchors: None,
            metrics,
        }
    }

    pub fn with_anchors(mut self, anchors: Arc<dyn BillingAnchorProvider>) -> Self {
        self.anchors = Some(anchors);
        self
    }

    pub async fn reset_entry(&self, entry_id: &EntryId, now: DateTime<Utc>) -> Result<ResetOutcome> {
        let span = reset_span(entry_id);
        self.reset_in_span(entry_id, now, &span)
            .instrument(span.clone())
            .await
    }

    async fn reset_in_span(
        &self,
        entry_id: &EntryId,
        now: DateTime<Utc>,
        span: &Span,
    ) -> Result<ResetOutcome> {
        let entry = self
            .store
            .entry(entry_id)
            .await?
            .ok_or_else(|| Error::not_found("entry", entry_id))?;
        let Some(observed) = entry.next_reset_at.filter(|_| entry.status.is_live()) else {
            return Ok(ResetOutcome::NotDue(entry));
        };
        if observed > now {
            return Ok(ResetOutcome::NotDue(entry));
        }

        let grant = self
            .store
            .grant(&entry.grant_id)
            .await?
            .ok_or_else(|| Error::not_found("grant", entry.grant_id))?;

        let (next, periods, rollovers) = match entry.behavior(&grant) {
            GrantBehavior::Unlimited | GrantBehavior::OneOff | GrantBehavior::Lifetime => {
                let mut terminal = entry.clone();
                terminal.next_reset_at = None;
                let rollovers = self.store.rollovers(entry_id).await?;
                (terminal, 0, rollovers)
            }
            GrantBehavior::Recurring(cadence) => {
                let schedule = next_after(observed, cadence, now).ok_or_else(|| {
                    Error::validation(format!(
                        "reset date for entry {} is out of range",
                        entry_id
                    ))
                })?;
                let mut at = schedule.at;
                if needs_anchor_check(at, cadence) {
                    at = self.align(&entry, at).await;
                }

                let records = self.store.rollovers(entry_id).await?;
                let (next, rollovers) =
                    self.new_period(&entry, &grant, records, schedule.periods, at, now);
                (next, schedule.periods, rollovers)
            }
        };

        span.record("periods", periods);
        let commit = ResetCommit {
            entry: next,
            expected_next_reset_at: observed,
            rollovers,
        };

        if self.store.apply_reset(&commit).await? {
            self.metrics.resets_applied.inc();
            let entry = self
                .store
                .entry(entry_id)
                .await?
                .ok_or_else(|| Error::not_found("entry", entry_id))?;
            if periods == 0 {
                tracing::info!(entry_id = %entry_id, "Entry reached terminal state");
                Ok(ResetOutcome::Terminal(entry))
            } else {
                tracing::info!(
                    entry_id = %entry_id,
                    periods = periods,
                    granted = %entry.balances.granted_balance,
                    next_reset_at = ?entry.next_reset_at,
                    "Reset applied"
                );
                Ok(ResetOutcome::Applied { entry, periods })
            }
        } else {
            self.metrics.reset_races_lost.inc();
            tracing::debug!(entry_id = %entry_id, "Reset already applied by another caller");
            let entry = self
                .store
                .entry(entry_id)
                .await?
                .ok_or_else(|| Error::not_found("entry", entry_id))?;
            Ok(ResetOutcome::LostRace(entry))
        }
    }

    /// Best-effort anchor correction; never fails the reset.
    async fn align(&self, entry: &LedgerEntry, at: DateTime<Utc>) -> DateTime<Utc> {
        let (Some(anchors), Some(subscription)) = (&self.anchors, &entry.subscription_ref) else {
            return at;
        };
        match anchors.billing_anchor_day(subscription).await {
            Ok(day) => align_to_anchor(at, day),
            Err(e) => {
                self.metrics.anchor_fallbacks.inc();
                tracing::warn!(
                    entry_id = %entry.id,
                    subscription = %subscription,
                    error = %e,
                    "Billing anchor lookup failed; keeping computed reset date"
                );
                at
            }
        }
    }

    fn new_period(
        &self,
        entry: &LedgerEntry,
        grant: &Grant,
        records: Vec<RolloverRecord>,
        periods: u32,
        next_reset_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> (LedgerEntry, Vec<RolloverRecord>) {
        let allowance = grant.starting_allowance(entry.quantity);
        let mut next = entry.clone();
        let mut kept = Vec::new();

        for (entity_id, expiring) in entry.slots() {
            let slot_records = records
                .iter()
                .filter(|r| r.entity_id == entity_id)
                .cloned()
                .collect();
            let ctx = SlotContext {
                entry_id: entry.id,
                entity_id: entity_id.as_ref(),
                policy: grant.rollover.as_ref(),
                periods,
                now,
            };
            let rolled = roll_slot(&ctx, &expiring, slot_records);

            let fresh = Balances {
                granted_balance: allowance + rolled.carried_in,
                purchased_balance: expiring
                    .purchased_balance
                    .min(expiring.current().max(Decimal::ZERO)),
                usage: Decimal::ZERO,
                adjustment: Decimal::ZERO,
            };
            if let Some(slot) = next.slot_mut(entity_id.as_ref()) {
                *slot = fresh;
            }
            kept.extend(rolled.records);
        }

        next.refresh_totals();
        next.next_reset_at = Some(next_reset_at);
        (next, kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::StaticAnchors;
    use crate::store::MemoryStore;
    use crate::types::{EntryStatus, ResetInterval};
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    async fn setup(grant: Grant, next_reset_at: DateTime<Utc>) -> (Arc<MemoryStore>, LedgerEntry) {
        let store = Arc::new(MemoryStore::new());
        store.put_grant(&grant).await.unwrap();
        let entry = LedgerEntry {
            id: EntryId::new(),
            customer_id: "cus".into(),
            feature_id: grant.feature_id.clone(),
            product_instance_id: Some("cp_1".into()),
            subscription_ref: Some("sub_1".into()),
            grant_id: grant.id,
            status: EntryStatus::Active,
            balances: Balances {
                granted_balance: grant.allowance,
                purchased_balance: dec!(20),
                usage: dec!(250),
                adjustment: Decimal::ZERO,
            },
            unlimited: false,
            overage_allowed: false,
            quantity: Decimal::ONE,
            next_reset_at: Some(next_reset_at),
            entity_balances: None,
            version: 0,
            created_at: Utc::now(),
        };
        store.insert_entry(&entry).await.unwrap();
        (store, entry)
    }

    #[tokio::test]
    async fn test_reset_restores_allowance_with_rollover() {
        let grant = Grant::new("pro", "messages", dec!(400))
            .every(ResetInterval::Month, 1)
            .with_rollover(Some(dec!(500)), 1);
        let due = Utc.with_ymd_and_hms(2025, 1, 10, 0, 0, 0).unwrap();
        let (store, entry) = setup(grant, due).await;
        let manager = ResetManager::new(store.clone(), Arc::new(LedgerMetrics::new()));

        let now = due + Duration::hours(1);
        let outcome = manager.reset_entry(&entry.id, now).await.unwrap();
        let ResetOutcome::Applied { entry: reset, periods } = outcome else {
            panic!("expected reset, got {:?}", outcome);
        };
        assert_eq!(periods, 1);
        assert_eq!(reset.balances.granted_balance, dec!(550));
        assert_eq!(reset.balances.purchased_balance, dec!(20));
        assert_eq!(reset.balances.usage, Decimal::ZERO);
        assert_eq!(reset.current_balance(), dec!(570));
        assert_eq!(
            reset.next_reset_at,
            Some(Utc.with_ymd_and_hms(2025, 2, 10, 0, 0, 0).unwrap())
        );
        assert_eq!(store.rollovers(&entry.id).await.unwrap().len(), 1);

        let again = manager.reset_entry(&entry.id, now).await.unwrap();
        assert!(matches!(again, ResetOutcome::NotDue(_)));
    }

    #[tokio::test]
    async fn test_lifetime_entry_goes_terminal() {
        let grant = Grant::new("pro", "seats", dec!(400)).every(ResetInterval::Lifetime, 1);
        let due = Utc::now() - Duration::minutes(1);
        let (store, entry) = setup(grant, due).await;
        let manager = ResetManager::new(store, Arc::new(LedgerMetrics::new()));

        let outcome = manager.reset_entry(&entry.id, Utc::now()).await.unwrap();
        let ResetOutcome::Terminal(terminal) = outcome else {
            panic!("expected terminal, got {:?}", outcome);
        };
        assert_eq!(terminal.next_reset_at, None);
        assert_eq!(terminal.balances, entry.balances);
    }

    #[tokio::test]
    async fn test_anchor_alignment_and_fallback() {
        let grant = Grant::new("pro", "messages", dec!(400)).every(ResetInterval::Month, 1);
        let due = Utc.with_ymd_and_hms(2025, 2, 28, 0, 0, 0).unwrap();
        let now = due + Duration::minutes(5);

        let (store, entry) = setup(grant.clone(), due).await;
        let anchors = Arc::new(StaticAnchors::new().with_anchor("sub_1", 31));
        let metrics = Arc::new(LedgerMetrics::new());
        let manager = ResetManager::new(store, metrics.clone()).with_anchors(anchors.clone());
        let outcome = manager.reset_entry(&entry.id, now).await.unwrap();
        assert_eq!(
            outcome.entry().next_reset_at,
            Some(Utc.with_ymd_and_hms(2025, 3, 31, 0, 0, 0).unwrap())
        );

        let (store, entry) = setup(grant, due).await;
        anchors.set_offline(true);
        let manager = ResetManager::new(store, metrics.clone()).with_anchors(anchors);
        let outcome = manager.reset_entry(&entry.id, now).await.unwrap();
        assert!(outcome.committed());
        assert_eq!(
            outcome.entry().next_reset_at,
            Some(Utc.with_ymd_and_hms(2025, 3, 28, 0, 0, 0).unwrap())
        );
        assert_eq!(metrics.anchor_fallbacks.get(), 1);
    }
}
