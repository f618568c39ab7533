//! Automatic top-ups.
//!
//! A customer can register a policy per feature: when a track leaves the
//! balance below `threshold`, `quantity` is charged through the
//! [`TopUpGateway`] and purchased onto the breakdown. At most one top-up is
//! in flight per balance key, and an optional rolling-window limit bounds how
//! often a customer is charged.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::balance::{Aggregate, BalanceKey, BreakdownItem};
use crate::external::TopUpGateway;
use crate::observability::LedgerMetrics;
use crate::retry::duration_millis;
use crate::types::{CustomerId, EntityId, EntryId, FeatureId};
use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseLimit {
    #[serde(with = "duration_millis")]
    pub window: Duration,
    pub limit: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AutoTopUp {
    pub feature_id: FeatureId,
    pub threshold: Decimal,
    pub quantity: Decimal,
    pub enabled: bool,
    pub max_purchases: Option<PurchaseLimit>,
}

impl AutoTopUp {
    pub fn new(feature_id: impl Into<FeatureId>, threshold: Decimal, quantity: Decimal) -> Self {
        Self {
            feature_id: feature_id.into(),
            threshold,
            quantity,
            enabled: true,
            max_purchases: None,
        }
    }

    pub fn limited(mut self, window: Duration, limit: u32) -> Self {
        self.max_purchases = Some(PurchaseLimit { window, limit });
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.quantity <= Decimal::ZERO {
            return Err(Error::validation(format!(
                "top-up quantity must be positive, got {}",
                self.quantity
            )));
        }
        if self.threshold < Decimal::ZERO {
            return Err(Error::validation(format!(
                "top-up threshold must not be negative, got {}",
                self.threshold
            )));
        }
        Ok(())
    }
}

/// Slot a top-up purchases onto.
#[derive(Clone, Debug, PartialEq)]
pub struct TopUpTarget {
    pub entry_id: EntryId,
    pub entity_id: Option<EntityId>,
    pub quantity: Decimal,
}

/// First non-unlimited one-off slot, else the first non-unlimited slot.
pub fn purchase_target(items: &[BreakdownItem]) -> Option<&BreakdownItem> {
    let limited = || items.iter().filter(|item| !item.unlimited);
    limited()
        .find(|item| item.one_off)
        .or_else(|| limited().next())
}

struct InFlight<'a> {
    slots: &'a DashMap<BalanceKey, ()>,
    key: BalanceKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.slots.remove(&self.key);
    }
}

pub struct TopUpManager {
    policies: DashMap<(CustomerId, FeatureId), AutoTopUp>,
    history: DashMap<BalanceKey, VecDeque<DateTime<Utc>>>,
    in_flight: DashMap<BalanceKey, ()>,
    gateway: Option<Arc<dyn TopUpGateway>>,
    metrics: Arc<LedgerMetrics>,
}

impl TopUpManager {
    pub fn new(metrics: Arc<LedgerMetrics>) -> Self {
        Self {
            policies: DashMap::new(),
            history: DashMap::new(),
            in_flight: DashMap::new(),
            gateway: None,
            metrics,
        }
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn TopUpGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn register(&self, customer_id: impl Into<CustomerId>, policy: AutoTopUp) -> Result<()> {
        policy.validate()?;
        let customer_id = customer_id.into();
        tracing::debug!(
            customer_id = %customer_id,
            feature_id = %policy.feature_id,
            threshold = %policy.threshold,
            "Auto top-up registered"
        );
        self.policies
            .insert((customer_id, policy.feature_id.clone()), policy);
        Ok(())
    }

    pub fn remove(&self, customer_id: &CustomerId, feature_id: &FeatureId) -> Option<AutoTopUp> {
        self.policies
            .remove(&(customer_id.clone(), feature_id.clone()))
            .map(|(_, policy)| policy)
    }

    pub fn policy(&self, key: &BalanceKey) -> Option<AutoTopUp> {
        self.policies
            .get(&(key.customer_id.clone(), key.feature_id.clone()))
            .map(|policy| policy.clone())
    }

    /// Purchases made for `key` inside the policy window ending at `now`.
    pub fn recent_purchases(&self, key: &BalanceKey, now: DateTime<Utc>) -> usize {
        let Some(window) = self
            .policy(key)
            .and_then(|p| p.max_purchases)
            .and_then(|limit| chrono::Duration::from_std(limit.window).ok())
        else {
            return self.history.get(key).map_or(0, |h| h.len());
        };
        self.history
            .get(key)
            .map_or(0, |h| h.iter().filter(|at| **at > now - window).count())
    }

    fn within_limit(&self, key: &BalanceKey, limit: &PurchaseLimit, now: DateTime<Utc>) -> bool {
        let Ok(window) = chrono::Duration::from_std(limit.window) else {
            return true;
        };
        let mut history = self.history.entry(key.clone()).or_default();
        while history.front().is_some_and(|at| *at <= now - window) {
            history.pop_front();
        }
        history.len() < limit.limit as usize
    }

    fn try_begin(&self, key: &BalanceKey) -> Option<InFlight<'_>> {
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                vacant.insert(());
                Some(InFlight {
                    slots: &self.in_flight,
                    key: key.clone(),
                })
            }
        }
    }

    /// Fires the top-up for `aggregate` if its policy says so.
    ///
    /// `purchase` applies the charged quantity; it runs while the key's
    /// in-flight slot is held. Returns the post-purchase aggregate when a
    /// top-up happened. A purchase that fails after the charge succeeded is
    /// logged and counted in `topups_failed`; the triggering track still
    /// stands.
    pub async fn maybe_top_up<F, Fut>(
        &self,
        key: &BalanceKey,
        aggregate: &Aggregate,
        now: DateTime<Utc>,
        purchase: F,
    ) -> Result<Option<Aggregate>>
    where
        F: FnOnce(TopUpTarget) -> Fut,
        Fut: Future<Output = Result<Aggregate>>,
    {
        let Some(policy) = self.policy(key).filter(|p| p.enabled) else {
            return Ok(None);
        };
        if aggregate.unlimited || aggregate.current_balance >= policy.threshold {
            return Ok(None);
        }
        let Some(gateway) = &self.gateway else {
            tracing::debug!(key = %key, "Top-up due but no gateway configured");
            return Ok(None);
        };
        let Some(item) = purchase_target(&aggregate.breakdown) else {
            return Ok(None);
        };
        let target = TopUpTarget {
            entry_id: item.entry_id,
            entity_id: item.entity_id.clone(),
            quantity: policy.quantity,
        };

        let Some(_guard) = self.try_begin(key) else {
            tracing::debug!(key = %key, "Top-up already in flight");
            return Ok(None);
        };
        if let Some(limit) = &policy.max_purchases
            && !self.within_limit(key, limit, now)
        {
            tracing::debug!(key = %key, limit = limit.limit, "Top-up purchase limit reached");
            return Ok(None);
        }

        if let Err(e) = gateway
            .charge(&key.customer_id, &key.feature_id, policy.quantity)
            .await
        {
            self.metrics.topups_rejected.inc();
            tracing::warn!(key = %key, error = %e, "Top-up charge failed; balance unchanged");
            return Ok(None);
        }

        // The charge went through, so it counts against the limit either way.
        self.history.entry(key.clone()).or_default().push_back(now);
        let entry_id = target.entry_id;
        let topped_up = match purchase(target).await {
            Ok(topped_up) => topped_up,
            Err(e) => {
                self.metrics.topups_failed.inc();
                tracing::error!(
                    key = %key,
                    entry_id = %entry_id,
                    quantity = %policy.quantity,
                    error = %e,
                    "Top-up charged but purchase failed; needs manual reconciliation"
                );
                return Ok(None);
            }
        };
        self.metrics.topups_fired.inc();
        tracing::info!(
            key = %key,
            quantity = %policy.quantity,
            balance = %topped_up.current_balance,
            "Auto top-up applied"
        );
        Ok(Some(topped_up))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::{Breakdown, OveragePolicy};
    use crate::external::StaticGateway;
    use crate::types::Balances;
    use rust_decimal_macros::dec;

    fn item(one_off: bool, unlimited: bool, current: Decimal) -> BreakdownItem {
        BreakdownItem {
            entry_id: EntryId::new(),
            entity_id: None,
            interval: None,
            one_off,
            balances: Balances::granted(current),
            unlimited,
            overage: OveragePolicy::Forbidden,
            next_reset_at: None,
            created_at: Utc::now(),
        }
    }

    fn aggregate(items: Vec<BreakdownItem>) -> Aggregate {
        Breakdown {
            key: BalanceKey::new("cus", "messages"),
            items,
        }
        .aggregate(None)
    }

    fn apply(before: &Aggregate, target: &TopUpTarget) -> Aggregate {
        let mut items = before.breakdown.clone();
        for item in &mut items {
            if item.entry_id == target.entry_id {
                item.balances.purchased_balance += target.quantity;
            }
        }
        aggregate(items)
    }

    #[test]
    fn test_purchase_target_prefers_one_off() {
        let recurring = item(false, false, dec!(1));
        let one_off = item(true, false, dec!(1));
        let items = vec![recurring.clone(), one_off.clone()];
        assert_eq!(purchase_target(&items).unwrap().entry_id, one_off.entry_id);

        let items = vec![item(true, true, dec!(0)), recurring.clone()];
        assert_eq!(purchase_target(&items).unwrap().entry_id, recurring.entry_id);
    }

    #[test]
    fn test_policy_validation() {
        assert!(AutoTopUp::new("messages", dec!(20), dec!(0)).validate().is_err());
        assert!(AutoTopUp::new("messages", dec!(-1), dec!(10)).validate().is_err());
        assert!(AutoTopUp::new("messages", dec!(20), dec!(100)).validate().is_ok());
    }

    #[tokio::test]
    async fn test_fires_below_threshold() {
        let gateway = Arc::new(StaticGateway::approving());
        let manager = TopUpManager::new(Arc::new(LedgerMetrics::new())).with_gateway(gateway.clone());
        manager
            .register("cus", AutoTopUp::new("messages", dec!(20), dec!(100)))
            .unwrap();
        let key = BalanceKey::new("cus", "messages");
        let low = aggregate(vec![item(false, false, dec!(15))]);
        let snapshot = low.clone();

        let topped = manager
            .maybe_top_up(&key, &low, Utc::now(), |target| async move {
                Ok(apply(&snapshot, &target))
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(topped.current_balance, dec!(115));
        assert_eq!(gateway.attempts(), 1);

        let fine = aggregate(vec![item(false, false, dec!(50))]);
        let none = manager
            .maybe_top_up(&key, &fine, Utc::now(), |_| async { unreachable!() })
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_declined_charge_leaves_balance() {
        let metrics = Arc::new(LedgerMetrics::new());
        let manager = TopUpManager::new(metrics.clone())
            .with_gateway(Arc::new(StaticGateway::declining()));
        manager
            .register("cus", AutoTopUp::new("messages", dec!(20), dec!(100)))
            .unwrap();
        let key = BalanceKey::new("cus", "messages");
        let low = aggregate(vec![item(false, false, dec!(5))]);

        let result = manager
            .maybe_top_up(&key, &low, Utc::now(), |_| async { unreachable!() })
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(metrics.topups_rejected.get(), 1);
        assert!(manager.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_failed_purchase_after_charge_is_contained() {
        let metrics = Arc::new(LedgerMetrics::new());
        let gateway = Arc::new(StaticGateway::approving());
        let manager = TopUpManager::new(metrics.clone()).with_gateway(gateway.clone());
        manager
            .register("cus", AutoTopUp::new("messages", dec!(20), dec!(100)))
            .unwrap();
        let key = BalanceKey::new("cus", "messages");
        let low = aggregate(vec![item(false, false, dec!(5))]);

        let result = manager
            .maybe_top_up(&key, &low, Utc::now(), |_| async {
                Err(Error::ConcurrencyConflict("store unavailable".into()))
            })
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(gateway.attempts(), 1);
        assert_eq!(metrics.topups_failed.get(), 1);
        assert_eq!(metrics.topups_fired.get(), 0);
        assert_eq!(manager.recent_purchases(&key, Utc::now()), 1);
        assert!(manager.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_rolling_window_limit() {
        let manager = TopUpManager::new(Arc::new(LedgerMetrics::new()))
            .with_gateway(Arc::new(StaticGateway::approving()));
        manager
            .register(
                "cus",
                AutoTopUp::new("messages", dec!(20), dec!(10)).limited(Duration::from_secs(3600), 2),
            )
            .unwrap();
        let key = BalanceKey::new("cus", "messages");
        let low = aggregate(vec![item(false, false, dec!(0))]);
        let now = Utc::now();

        let mut fired = 0;
        for _ in 0..4 {
            let snapshot = low.clone();
            let result = manager
                .maybe_top_up(&key, &low, now, |target| async move {
                    Ok(apply(&snapshot, &target))
                })
                .await
                .unwrap();
            fired += usize::from(result.is_some());
        }
        assert_eq!(fired, 2);
        assert_eq!(manager.recent_purchases(&key, now), 2);

        let later = now + chrono::Duration::hours(2);
        assert_eq!(manager.recent_purchases(&key, later), 0);
        let snapshot = low.clone();
        let result = manager
            .maybe_top_up(&key, &low, later, |target| async move {
                Ok(apply(&snapshot, &target))
            })
            .await
            .unwrap();
        assert!(result.is_some());
    }
}
