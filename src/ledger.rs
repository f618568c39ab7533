//! Request-handling boundary.
//!
//! [`Ledger`] wires the store, cache, reset, sync and top-up components
//! together and exposes the six operations callers use: `check_balance`,
//! `track`, `update_balance`, `purchase`, `attach_grant` and
//! `end_product_instance`.
//!
//! With the cache enabled, every mutation runs as one atomic per-key cache
//! operation and reaches the store through [`SyncEngine`]. With it disabled,
//! mutations are computed against a fresh durable breakdown and committed
//! with optimistic row versions.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::balance::{
    Aggregate, BalanceAggregator, BalanceKey, BalanceQuery, Breakdown, BreakdownItem,
    build_breakdown,
};
use crate::cache::{BalanceCache, MemoryCache, Mutation, MutationOutcome};
use crate::config::LedgerConfig;
use crate::deduction::BalanceTarget;
use crate::external::{BillingAnchorProvider, TopUpGateway};
use crate::observability::{LedgerMetrics, check_span, track_span, update_span};
use crate::reset::{ResetManager, Sweeper, advance};
use crate::store::{EntryCommit, LedgerStore, StoreError};
use crate::sync::{SyncEngine, reconcile, targets_for};
use crate::topup::{TopUpManager, TopUpTarget};
use crate::types::{
    Balances, CustomerId, EntityId, EntryId, EntryStatus, Feature, FeatureId, Grant,
    GrantBehavior, GrantId, LedgerEntry, ProductInstanceId, SubscriptionRef,
};
use crate::{Error, Result};

/// What `track` does with consumption the breakdown cannot absorb.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverageBehavior {
    /// Leave the remainder unconsumed.
    #[default]
    Cap,
    /// Fail with [`Error::InsufficientBalance`] and change nothing.
    Reject,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrackRequest {
    pub key: BalanceKey,
    pub entity_id: Option<EntityId>,
    /// Positive consumes, negative credits.
    pub delta: Decimal,
    pub overage: OverageBehavior,
}

impl TrackRequest {
    pub fn new(
        customer_id: impl Into<CustomerId>,
        feature_id: impl Into<FeatureId>,
        delta: Decimal,
    ) -> Self {
        Self {
            key: BalanceKey::new(customer_id, feature_id),
            entity_id: None,
            delta,
            overage: OverageBehavior::Cap,
        }
    }

    pub fn entity(mut self, entity_id: impl Into<EntityId>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn reject_overage(mut self) -> Self {
        self.overage = OverageBehavior::Reject;
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct UpdateBalanceRequest {
    pub key: BalanceKey,
    pub entity_id: Option<EntityId>,
    pub target: BalanceTarget,
}

impl UpdateBalanceRequest {
    pub fn new(
        customer_id: impl Into<CustomerId>,
        feature_id: impl Into<FeatureId>,
        target: BalanceTarget,
    ) -> Self {
        Self {
            key: BalanceKey::new(customer_id, feature_id),
            entity_id: None,
            target,
        }
    }

    pub fn entity(mut self, entity_id: impl Into<EntityId>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PurchaseRequest {
    pub entry_id: EntryId,
    pub entity_id: Option<EntityId>,
    pub quantity: Decimal,
}

impl PurchaseRequest {
    pub fn new(entry_id: EntryId, quantity: Decimal) -> Self {
        Self {
            entry_id,
            entity_id: None,
            quantity,
        }
    }

    pub fn entity(mut self, entity_id: impl Into<EntityId>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AttachRequest {
    pub customer_id: CustomerId,
    pub grant_id: GrantId,
    pub product_instance_id: Option<ProductInstanceId>,
    pub subscription_ref: Option<SubscriptionRef>,
    pub quantity: Decimal,
    /// Start of the first period; the first reset is one cadence later.
    pub anchor: DateTime<Utc>,
    /// Entities receiving a slot when the grant is entity-scoped.
    pub entities: Vec<EntityId>,
    pub overage_allowed: bool,
    /// Administrative override.
    pub unlimited: bool,
}

impl AttachRequest {
    pub fn new(customer_id: impl Into<CustomerId>, grant_id: GrantId) -> Self {
        Self {
            customer_id: customer_id.into(),
            grant_id,
            product_instance_id: None,
            subscription_ref: None,
            quantity: Decimal::ONE,
            anchor: Utc::now(),
            entities: Vec::new(),
            overage_allowed: false,
            unlimited: false,
        }
    }

    pub fn instance(mut self, id: impl Into<ProductInstanceId>) -> Self {
        self.product_instance_id = Some(id.into());
        self
    }

    pub fn subscription(mut self, subscription: impl Into<SubscriptionRef>) -> Self {
        self.subscription_ref = Some(subscription.into());
        self
    }

    pub fn quantity(mut self, quantity: Decimal) -> Self {
        self.quantity = quantity;
        self
    }

    pub fn anchored_at(mut self, anchor: DateTime<Utc>) -> Self {
        self.anchor = anchor;
        self
    }

    pub fn entities<I, E>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<EntityId>,
    {
        self.entities = entities.into_iter().map(Into::into).collect();
        self
    }

    pub fn allow_overage(mut self) -> Self {
        self.overage_allowed = true;
        self
    }

    pub fn unlimited(mut self) -> Self {
        self.unlimited = true;
        self
    }
}

pub struct LedgerBuilder {
    store: Arc<dyn LedgerStore>,
    config: LedgerConfig,
    cache: Option<Arc<dyn BalanceCache>>,
    anchors: Option<Arc<dyn BillingAnchorProvider>>,
    gateway: Option<Arc<dyn TopUpGateway>>,
    metrics: Option<Arc<LedgerMetrics>>,
}

impl LedgerBuilder {
    pub fn config(mut self, config: LedgerConfig) -> Self {
        self.config = config;
        self
    }

    /// Cache backend; defaults to [`MemoryCache`] when the cache is enabled.
    pub fn cache(mut self, cache: Arc<dyn BalanceCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn anchors(mut self, anchors: Arc<dyn BillingAnchorProvider>) -> Self {
        self.anchors = Some(anchors);
        self
    }

    pub fn gateway(mut self, gateway: Arc<dyn TopUpGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn metrics(mut self, metrics: Arc<LedgerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<Ledger> {
        self.config.validate()?;
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(LedgerMetrics::new()));

        let mut resets = ResetManager::new(self.store.clone(), metrics.clone());
        if let Some(anchors) = self.anchors {
            resets = resets.with_anchors(anchors);
        }

        let cache = self.config.cache.enabled.then(|| {
            self.cache.unwrap_or_else(|| {
                let cache = MemoryCache::new();
                let cache = match self.config.cache.ttl {
                    Some(ttl) => cache.with_ttl(ttl),
                    None => cache,
                };
                Arc::new(cache) as Arc<dyn BalanceCache>
            })
        });
        let sync = cache.as_ref().map(|cache| {
            Arc::new(SyncEngine::new(
                self.store.clone(),
                cache.clone(),
                metrics.clone(),
                self.config.retry.clone(),
            ))
        });

        let mut topups = TopUpManager::new(metrics.clone());
        if let Some(gateway) = self.gateway {
            topups = topups.with_gateway(gateway);
        }

        tracing::debug!(
            store = self.store.name(),
            cache = cache.as_ref().map(|c| c.name()).unwrap_or("disabled"),
            order = ?self.config.deduction_order,
            "Ledger built"
        );

        Ok(Ledger {
            aggregator: BalanceAggregator::new(self.store.clone(), self.config.deduction_order),
            store: self.store,
            cache,
            resets: Arc::new(resets),
            sync,
            topups,
            metrics,
            config: self.config,
        })
    }
}

pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    cache: Option<Arc<dyn BalanceCache>>,
    aggregator: BalanceAggregator,
    resets: Arc<ResetManager>,
    sync: Option<Arc<SyncEngine>>,
    topups: TopUpManager,
    metrics: Arc<LedgerMetrics>,
    config: LedgerConfig,
}

impl Ledger {
    pub fn builder(store: Arc<dyn LedgerStore>) -> LedgerBuilder {
        LedgerBuilder {
            store,
            config: LedgerConfig::default(),
            cache: None,
            anchors: None,
            gateway: None,
            metrics: None,
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn cache(&self) -> Option<&Arc<dyn BalanceCache>> {
        self.cache.as_ref()
    }

    pub fn metrics(&self) -> &Arc<LedgerMetrics> {
        &self.metrics
    }

    pub fn topups(&self) -> &TopUpManager {
        &self.topups
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// A sweeper sharing this ledger's store, cache and reset manager.
    pub fn sweeper(&self) -> Sweeper {
        let sweeper = Sweeper::new(
            self.store.clone(),
            self.resets.clone(),
            self.config.sweep.clone(),
        );
        match (&self.cache, &self.sync) {
            (Some(cache), Some(sync)) => sweeper.with_cache(cache.clone(), sync.clone()),
            _ => sweeper,
        }
    }

    /// Folds every dirty cache key into the store. Returns `(synced, failed)`.
    pub async fn sync_all(&self) -> Result<(usize, usize)> {
        match &self.sync {
            Some(sync) => sync.sync_all().await,
            None => Ok((0, 0)),
        }
    }

    pub async fn define_feature(&self, feature: &Feature) -> Result<()> {
        Ok(self.store.put_feature(feature).await?)
    }

    pub async fn define_grant(&self, grant: &Grant) -> Result<()> {
        self.store
            .feature(&grant.feature_id)
            .await?
            .ok_or_else(|| Error::not_found("feature", &grant.feature_id))?;
        Ok(self.store.put_grant(grant).await?)
    }

    async fn feature(&self, id: &FeatureId) -> Result<Feature> {
        self.store
            .feature(id)
            .await?
            .ok_or_else(|| Error::not_found("feature", id))
    }

    pub async fn check_balance(&self, query: BalanceQuery) -> Result<Aggregate> {
        let span = check_span(&query.key);
        async move {
            self.feature(&query.key.feature_id).await?;
            let breakdown = if query.skip_cache {
                self.aggregator.breakdown(&query.key).await?
            } else {
                self.current_breakdown(&query.key, Utc::now()).await?
            };
            Ok(breakdown
                .view(query.entity_id.as_ref(), query.interval)
                .aggregate(query.entity_id))
        }
        .instrument(span)
        .await
    }

    pub async fn track(&self, request: TrackRequest) -> Result<Aggregate> {
        let operation = track_span(&request.key);
        operation.record("delta", request.delta);
        let result = self
            .track_inner(request)
            .instrument(operation.span().clone())
            .await;
        let elapsed = operation.finish();
        self.metrics.record_track(result.is_ok(), elapsed);
        result
    }

    async fn track_inner(&self, request: TrackRequest) -> Result<Aggregate> {
        let TrackRequest {
            key,
            entity_id,
            delta,
            overage,
        } = request;

        let feature = self.feature(&key.feature_id).await?;
        if !feature.is_metered() {
            return Err(Error::validation(format!(
                "feature {} is boolean and cannot be tracked",
                feature.id
            )));
        }

        let now = Utc::now();
        if delta.is_zero() {
            let breakdown = self.current_breakdown(&key, now).await?;
            return Ok(breakdown.view(entity_id.as_ref(), None).aggregate(entity_id));
        }

        let mutation = Mutation::Track {
            entity_id: entity_id.clone(),
            delta,
            reject: overage == OverageBehavior::Reject,
        };
        let outcome = self.apply_mutation(&key, &mutation, now).await?;
        if !outcome.deduction.remaining.is_zero() {
            tracing::debug!(
                key = %key,
                remaining = %outcome.deduction.remaining,
                "Delta not fully absorbed"
            );
        }
        let aggregate = outcome
            .breakdown
            .view(entity_id.as_ref(), None)
            .aggregate(entity_id.clone());

        let topped_up = self
            .topups
            .maybe_top_up(&key, &aggregate, now, |target| {
                let entity_id = entity_id.clone();
                async move { self.purchase_for_top_up(target, entity_id).await }
            })
            .await?;
        Ok(topped_up.unwrap_or(aggregate))
    }

    async fn purchase_for_top_up(
        &self,
        target: TopUpTarget,
        view: Option<EntityId>,
    ) -> Result<Aggregate> {
        let breakdown = self
            .purchase_breakdown(PurchaseRequest {
                entry_id: target.entry_id,
                entity_id: target.entity_id,
                quantity: target.quantity,
            })
            .await?;
        Ok(breakdown.view(view.as_ref(), None).aggregate(view))
    }

    pub async fn update_balance(&self, request: UpdateBalanceRequest) -> Result<Aggregate> {
        let span = update_span(&request.key);
        async move {
            request.target.validate()?;
            self.feature(&request.key.feature_id).await?;

            let mutation = Mutation::Update {
                entity_id: request.entity_id.clone(),
                target: request.target.clone(),
            };
            let outcome = self.apply_mutation(&request.key, &mutation, Utc::now()).await?;
            if outcome.deduction.touched.is_empty() {
                tracing::debug!(key = %request.key, "Balance already at target");
            } else {
                tracing::info!(
                    key = %request.key,
                    entries = outcome.deduction.touched.len(),
                    "Balance updated"
                );
            }
            Ok(outcome
                .breakdown
                .view(request.entity_id.as_ref(), None)
                .aggregate(request.entity_id))
        }
        .instrument(span)
        .await
    }

    /// Adds purchased quantity to one entry slot. The store is written first
    /// and is authoritative for purchased amounts.
    pub async fn purchase(&self, request: PurchaseRequest) -> Result<Aggregate> {
        let view = request.entity_id.clone();
        let breakdown = self.purchase_breakdown(request).await?;
        Ok(breakdown.view(view.as_ref(), None).aggregate(view))
    }

    async fn purchase_breakdown(&self, request: PurchaseRequest) -> Result<Breakdown> {
        if request.quantity <= Decimal::ZERO {
            return Err(Error::validation(format!(
                "purchase quantity must be positive, got {}",
                request.quantity
            )));
        }

        let entry = self
            .store
            .add_purchase(&request.entry_id, request.entity_id.as_ref(), request.quantity)
            .await?;
        let key = BalanceKey::new(entry.customer_id.clone(), entry.feature_id.clone());
        let purchased_balance = entry
            .slot(request.entity_id.as_ref())
            .map(|slot| slot.purchased_balance)
            .unwrap_or_default();
        tracing::info!(
            key = %key,
            entry_id = %entry.id,
            quantity = %request.quantity,
            "Purchase recorded"
        );

        let now = Utc::now();
        let mirrored = self
            .mirror(
                &key,
                &Mutation::Purchase {
                    entry_id: entry.id,
                    entity_id: request.entity_id,
                    purchased_balance,
                },
                now,
            )
            .await?;
        match mirrored {
            Some(outcome) => Ok(outcome.breakdown),
            None => self.current_breakdown(&key, now).await,
        }
    }

    /// Creates a ledger entry from a grant.
    pub async fn attach_grant(&self, request: AttachRequest) -> Result<LedgerEntry> {
        if request.quantity <= Decimal::ZERO {
            return Err(Error::validation(format!(
                "quantity must be positive, got {}",
                request.quantity
            )));
        }
        let grant = self.aggregator.grant(&request.grant_id).await?;
        self.feature(&grant.feature_id).await?;
        if !grant.is_entity_scoped() && !request.entities.is_empty() {
            return Err(Error::validation(format!(
                "grant {} is not entity-scoped",
                grant.id
            )));
        }

        let behavior = if request.unlimited {
            GrantBehavior::Unlimited
        } else {
            grant.behavior()
        };
        let next_reset_at = match behavior {
            GrantBehavior::Recurring(cadence) => Some(
                advance(request.anchor, cadence, 1)
                    .ok_or_else(|| Error::validation("first reset date is out of range"))?,
            ),
            GrantBehavior::Unlimited | GrantBehavior::OneOff | GrantBehavior::Lifetime => None,
        };
        let granted = match behavior {
            GrantBehavior::Unlimited => Decimal::ZERO,
            _ => grant.starting_allowance(request.quantity),
        };
        let entity_balances = grant.is_entity_scoped().then(|| {
            request
                .entities
                .iter()
                .map(|entity| (entity.clone(), Balances::granted(granted)))
                .collect::<BTreeMap<_, _>>()
        });

        let mut entry = LedgerEntry {
            id: EntryId::new(),
            customer_id: request.customer_id,
            feature_id: grant.feature_id.clone(),
            product_instance_id: request.product_instance_id,
            subscription_ref: request.subscription_ref,
            grant_id: grant.id,
            status: EntryStatus::Active,
            balances: Balances::granted(granted),
            unlimited: request.unlimited,
            overage_allowed: request.overage_allowed,
            quantity: request.quantity,
            next_reset_at,
            entity_balances,
            version: 0,
            created_at: Utc::now(),
        };
        entry.refresh_totals();
        self.store.insert_entry(&entry).await?;

        let key = BalanceKey::new(entry.customer_id.clone(), entry.feature_id.clone());
        tracing::info!(
            key = %key,
            entry_id = %entry.id,
            grant_id = %grant.id,
            granted = %entry.balances.granted_balance,
            next_reset_at = ?entry.next_reset_at,
            "Grant attached"
        );
        self.mirror(
            &key,
            &Mutation::Attach {
                items: BreakdownItem::from_entry(&entry, &grant),
                order: self.aggregator.order(),
            },
            entry.created_at,
        )
        .await?;
        Ok(entry)
    }

    /// Expires every entry of a product instance.
    pub async fn end_product_instance(&self, id: &ProductInstanceId) -> Result<Vec<LedgerEntry>> {
        let expired = self.store.expire_instance(id).await?;
        if expired.is_empty() {
            return Err(Error::not_found("product instance", id));
        }

        let mut by_key: BTreeMap<BalanceKey, Vec<EntryId>> = BTreeMap::new();
        for entry in &expired {
            by_key
                .entry(BalanceKey::new(entry.customer_id.clone(), entry.feature_id.clone()))
                .or_default()
                .push(entry.id);
        }

        let now = Utc::now();
        for (key, entry_ids) in by_key {
            self.mirror(&key, &Mutation::Detach { entry_ids }, now).await?;
            if let Some(sync) = &self.sync
                && let Err(e) = sync.sync_key(&key).await
            {
                tracing::warn!(key = %key, error = %e, "Sync after expiry failed");
            }
            if let Some(cache) = &self.cache {
                cache.invalidate_if_clean(&key).await?;
            }
        }
        tracing::info!(instance = %id, entries = expired.len(), "Product instance ended");
        Ok(expired)
    }

    /// Breakdown with no due entries, from the cache when enabled.
    async fn current_breakdown(&self, key: &BalanceKey, now: DateTime<Utc>) -> Result<Breakdown> {
        let Some(cache) = &self.cache else {
            return self.aggregator.fresh_breakdown(key, &self.resets, now).await;
        };

        for round in 0..self.config.reset.conflict_retries {
            match cache.get(key).await? {
                Some(cached) if !cached.breakdown.is_due(now) => {
                    self.metrics.record_cache(true);
                    return Ok(cached.breakdown);
                }
                Some(_) => {
                    if !self.refresh_due(cache.as_ref(), key, now).await? {
                        self.backoff(round).await;
                    }
                }
                None => {
                    self.metrics.record_cache(false);
                    let epoch = cache.fill_epoch(key).await?;
                    let fresh = self.aggregator.fresh_breakdown(key, &self.resets, now).await?;
                    match cache.put_if_absent(fresh, epoch).await? {
                        Some(cached) if !cached.breakdown.is_due(now) => {
                            return Ok(cached.breakdown);
                        }
                        Some(_) => {}
                        None => {
                            tracing::debug!(key = %key, "Store changed during cache fill; reloading");
                        }
                    }
                }
            }
        }

        tracing::error!(key = %key, "Cached balance stayed stale after every retry");
        Err(Error::ConcurrencyConflict(format!(
            "{} could not be refreshed after {} attempts",
            key, self.config.reset.conflict_retries
        )))
    }

    /// Syncs the key, resets its due entries and drops the stale cache entry.
    /// Returns whether the stale entry is gone.
    async fn refresh_due(
        &self,
        cache: &dyn BalanceCache,
        key: &BalanceKey,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if let Some(sync) = &self.sync {
            sync.sync_key(key).await?;
        }
        self.aggregator.fresh_entries(key, &self.resets, now).await?;
        Ok(cache.invalidate_if_clean(key).await?)
    }

    async fn backoff(&self, round: u32) {
        let delay = self
            .config
            .retry
            .initial_backoff
            .saturating_mul(round + 1)
            .min(self.config.retry.max_backoff);
        tokio::time::sleep(delay).await;
    }

    /// Applies a cache-only mirror of a change already in the store. The fill
    /// epoch moves first, so a fill that read rows from before the change
    /// cannot land after the mirror found the key absent.
    async fn mirror(
        &self,
        key: &BalanceKey,
        mutation: &Mutation,
        now: DateTime<Utc>,
    ) -> Result<Option<MutationOutcome>> {
        let Some(cache) = &self.cache else {
            return Ok(None);
        };
        cache.bump_epoch(key).await?;
        cache.mutate(key, mutation, now).await
    }

    async fn apply_mutation(
        &self,
        key: &BalanceKey,
        mutation: &Mutation,
        now: DateTime<Utc>,
    ) -> Result<MutationOutcome> {
        let Some(cache) = &self.cache else {
            return self.commit_direct(key, mutation, now).await;
        };

        for _ in 0..self.config.reset.conflict_retries {
            if let Some(outcome) = cache.mutate(key, mutation, now).await? {
                return Ok(outcome);
            }
            self.current_breakdown(key, now).await?;
        }
        Err(Error::ConcurrencyConflict(format!(
            "{} was evicted or reset on every attempt",
            key
        )))
    }

    /// Cache-disabled path: compute against the durable rows and commit them
    /// guarded by their versions.
    async fn commit_direct(
        &self,
        key: &BalanceKey,
        mutation: &Mutation,
        now: DateTime<Utc>,
    ) -> Result<MutationOutcome> {
        for attempt in 1..=self.config.reset.conflict_retries {
            let entries = self.aggregator.fresh_entries(key, &self.resets, now).await?;
            let mut breakdown =
                build_breakdown(key.clone(), entries.clone(), self.aggregator.order());
            let deduction = mutation.apply(&mut breakdown)?;

            let touched: BTreeSet<EntryId> = deduction.touched.iter().copied().collect();
            if touched.is_empty() {
                return Ok(MutationOutcome {
                    breakdown,
                    deduction,
                });
            }

            let commits: Vec<EntryCommit> = targets_for(&breakdown, &touched)
                .iter()
                .filter_map(|target| {
                    let (entry, _) = entries.iter().find(|(e, _)| e.id == target.entry_id)?;
                    let updated = reconcile(entry, target)?;
                    Some(EntryCommit {
                        expected_version: entry.version,
                        entry: updated,
                    })
                })
                .collect();

            match self.store.commit_entries(&commits).await {
                Ok(()) => {
                    return Ok(MutationOutcome {
                        breakdown,
                        deduction,
                    });
                }
                Err(StoreError::Conflict { id }) => {
                    tracing::debug!(
                        key = %key,
                        entry_id = %id,
                        attempt = attempt,
                        "Entry changed underneath; recomputing"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        tracing::error!(key = %key, "Optimistic commit retries exhausted");
        Err(Error::ConcurrencyConflict(format!(
            "{} kept changing during {} commit attempts",
            key, self.config.reset.conflict_retries
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::ResetInterval;
    use rust_decimal_macros::dec;

    async fn ledger_with(config: LedgerConfig) -> (Ledger, Grant) {
        let ledger = Ledger::builder(Arc::new(MemoryStore::new()))
            .config(config)
            .build()
            .unwrap();
        ledger
            .define_feature(&Feature::metered("messages", "message"))
            .await
            .unwrap();
        let grant = Grant::new("pro", "messages", dec!(100)).every(ResetInterval::Month, 1);
        ledger.define_grant(&grant).await.unwrap();
        (ledger, grant)
    }

    fn uncached() -> LedgerConfig {
        let mut config = LedgerConfig::default();
        config.cache.enabled = false;
        config
    }

    #[tokio::test]
    async fn test_track_caps_or_rejects_overage() {
        let (ledger, grant) = ledger_with(LedgerConfig::default()).await;
        ledger
            .attach_grant(AttachRequest::new("cus", grant.id))
            .await
            .unwrap();

        let err = ledger
            .track(TrackRequest::new("cus", "messages", dec!(120)).reject_overage())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientBalance { requested, available }
                if requested == dec!(120) && available == dec!(100)
        ));

        let capped = ledger
            .track(TrackRequest::new("cus", "messages", dec!(120)))
            .await
            .unwrap();
        assert_eq!(capped.current_balance, Decimal::ZERO);
        assert_eq!(capped.usage, dec!(100));
        assert_eq!(ledger.metrics().tracks_rejected.get(), 1);
    }

    #[tokio::test]
    async fn test_track_requires_metered_feature() {
        let (ledger, _) = ledger_with(LedgerConfig::default()).await;
        ledger.define_feature(&Feature::boolean("sso")).await.unwrap();

        let err = ledger
            .track(TrackRequest::new("cus", "sso", dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = ledger
            .track(TrackRequest::new("cus", "unknown", dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "feature", .. }));
    }

    #[tokio::test]
    async fn test_uncached_track_commits_to_store() {
        let (ledger, grant) = ledger_with(uncached()).await;
        assert!(ledger.cache().is_none());
        let entry = ledger
            .attach_grant(AttachRequest::new("cus", grant.id))
            .await
            .unwrap();

        ledger
            .track(TrackRequest::new("cus", "messages", dec!(30)))
            .await
            .unwrap();
        let stored = ledger.store().entry(&entry.id).await.unwrap().unwrap();
        assert_eq!(stored.balances.usage, dec!(30));
        assert_eq!(stored.version, entry.version + 1);

        let durable = ledger
            .check_balance(BalanceQuery::new("cus", "messages").skip_cache())
            .await
            .unwrap();
        assert_eq!(durable.current_balance, dec!(70));
    }

    #[tokio::test]
    async fn test_update_balance_is_idempotent() {
        let (ledger, grant) = ledger_with(LedgerConfig::default()).await;
        ledger
            .attach_grant(AttachRequest::new("cus", grant.id))
            .await
            .unwrap();

        let request = UpdateBalanceRequest::new("cus", "messages", BalanceTarget::current(dec!(40)));
        let first = ledger.update_balance(request.clone()).await.unwrap();
        let second = ledger.update_balance(request).await.unwrap();
        assert_eq!(first.current_balance, dec!(40));
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn test_purchase_adds_to_entry() {
        let (ledger, grant) = ledger_with(LedgerConfig::default()).await;
        let entry = ledger
            .attach_grant(AttachRequest::new("cus", grant.id))
            .await
            .unwrap();
        ledger
            .track(TrackRequest::new("cus", "messages", dec!(90)))
            .await
            .unwrap();

        let err = ledger
            .purchase(PurchaseRequest::new(entry.id, Decimal::ZERO))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let balance = ledger
            .purchase(PurchaseRequest::new(entry.id, dec!(50)))
            .await
            .unwrap();
        assert_eq!(balance.current_balance, dec!(60));
        assert_eq!(balance.purchased_balance, dec!(50));
    }

    #[tokio::test]
    async fn test_attach_entity_scoped_grant() {
        let (ledger, grant) = ledger_with(LedgerConfig::default()).await;
        let err = ledger
            .attach_grant(AttachRequest::new("cus", grant.id).entities(["e1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let seats = Grant::new("team", "messages", dec!(10)).per_entity("seats");
        ledger.define_grant(&seats).await.unwrap();
        let entry = ledger
            .attach_grant(AttachRequest::new("cus", seats.id).entities(["e1", "e2"]))
            .await
            .unwrap();
        assert_eq!(entry.balances.granted_balance, dec!(20));
        assert_eq!(entry.next_reset_at, None);

        let e1 = ledger
            .track(TrackRequest::new("cus", "messages", dec!(4)).entity("e1"))
            .await
            .unwrap();
        assert_eq!(e1.current_balance, dec!(6));
        let all = ledger
            .check_balance(BalanceQuery::new("cus", "messages"))
            .await
            .unwrap();
        assert_eq!(all.current_balance, dec!(16));
    }

    #[tokio::test]
    async fn test_check_balance_resets_expired_entry() {
        let (ledger, grant) = ledger_with(uncached()).await;
        let entry = ledger
            .attach_grant(AttachRequest::new("cus", grant.id))
            .await
            .unwrap();
        ledger
            .track(TrackRequest::new("cus", "messages", dec!(90)))
            .await
            .unwrap();

        let mut expired = ledger.store().entry(&entry.id).await.unwrap().unwrap();
        let version = expired.version;
        expired.next_reset_at = Some(Utc::now() - chrono::Duration::hours(1));
        ledger
            .store()
            .commit_entries(&[EntryCommit {
                entry: expired,
                expected_version: version,
            }])
            .await
            .unwrap();

        let balance = ledger
            .check_balance(BalanceQuery::new("cus", "messages"))
            .await
            .unwrap();
        assert_eq!(balance.current_balance, dec!(100));
        assert_eq!(balance.usage, Decimal::ZERO);
        assert!(balance.next_reset_at.is_some_and(|at| at > Utc::now()));

        let stored = ledger.store().entry(&entry.id).await.unwrap().unwrap();
        assert!(!stored.is_due(Utc::now()));
    }

    #[tokio::test]
    async fn test_fill_overtaken_by_attach_is_discarded() {
        let (ledger, grant) = ledger_with(LedgerConfig::default()).await;
        ledger
            .attach_grant(AttachRequest::new("cus", grant.id))
            .await
            .unwrap();
        let key = BalanceKey::new("cus", "messages");
        let cache = ledger.cache().unwrap().clone();

        // A reader loads rows, then an attach commits before the fill lands.
        let epoch = cache.fill_epoch(&key).await.unwrap();
        let stale = ledger
            .aggregator
            .fresh_breakdown(&key, &ledger.resets, Utc::now())
            .await
            .unwrap();
        assert_eq!(stale.items.len(), 1);

        let bonus = Grant::new("bonus", "messages", dec!(50));
        ledger.define_grant(&bonus).await.unwrap();
        ledger
            .attach_grant(AttachRequest::new("cus", bonus.id))
            .await
            .unwrap();

        assert!(cache.put_if_absent(stale, epoch).await.unwrap().is_none());
        let balance = ledger
            .check_balance(BalanceQuery::new("cus", "messages"))
            .await
            .unwrap();
        assert_eq!(balance.current_balance, dec!(150));
        assert_eq!(balance.breakdown.len(), 2);
    }

    #[tokio::test]
    async fn test_end_product_instance() {
        let (ledger, grant) = ledger_with(LedgerConfig::default()).await;
        ledger
            .attach_grant(AttachRequest::new("cus", grant.id).instance("cp_1"))
            .await
            .unwrap();
        ledger
            .track(TrackRequest::new("cus", "messages", dec!(5)))
            .await
            .unwrap();

        let expired = ledger
            .end_product_instance(&ProductInstanceId::from("cp_1"))
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        let balance = ledger
            .check_balance(BalanceQuery::new("cus", "messages"))
            .await
            .unwrap();
        assert!(balance.breakdown.is_empty());
        assert_eq!(balance.current_balance, Decimal::ZERO);

        let err = ledger
            .end_product_instance(&ProductInstanceId::from("cp_missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
