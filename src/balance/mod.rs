//! Breakdowns and aggregate balances for one customer-feature pair.
//!
//! A [`Breakdown`] is the ordered list of slots (one per entry, or one per
//! entity for entity-scoped entries) that contribute to a balance. The
//! [`Aggregate`] is the reportable sum over a breakdown view.

mod aggregator;

pub use aggregator::{BalanceAggregator, build_breakdown};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{
    Balances, CustomerId, EntityId, EntryId, FeatureId, Grant, GrantBehavior, LedgerEntry,
    ResetInterval,
};

/// Cache and serialization unit: every mutation on one pair is serialized.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct BalanceKey {
    pub customer_id: CustomerId,
    pub feature_id: FeatureId,
}

impl BalanceKey {
    pub fn new(customer_id: impl Into<CustomerId>, feature_id: impl Into<FeatureId>) -> Self {
        Self {
            customer_id: customer_id.into(),
            feature_id: feature_id.into(),
        }
    }
}

impl std::fmt::Display for BalanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.customer_id, self.feature_id)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BalanceQuery {
    pub key: BalanceKey,
    pub entity_id: Option<EntityId>,
    pub interval: Option<ResetInterval>,
    /// Read the last-synced durable state instead of the cache.
    pub skip_cache: bool,
}

impl BalanceQuery {
    pub fn new(customer_id: impl Into<CustomerId>, feature_id: impl Into<FeatureId>) -> Self {
        Self {
            key: BalanceKey::new(customer_id, feature_id),
            entity_id: None,
            interval: None,
            skip_cache: false,
        }
    }

    pub fn entity(mut self, entity_id: impl Into<EntityId>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn interval(mut self, interval: ResetInterval) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn skip_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }
}

/// Which grant is drawn down first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeductionOrder {
    /// Oldest attached entry first, ties broken by entry id.
    #[default]
    AttachOrder,
    ReverseAttachOrder,
}

/// Lowest balance a slot may be driven to by consumption.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OveragePolicy {
    Forbidden,
    Capped { floor: Decimal },
    Unbounded,
}

impl OveragePolicy {
    pub fn derive(entry: &LedgerEntry, grant: &Grant) -> Self {
        if !entry.overage_allowed || grant.prepaid {
            return Self::Forbidden;
        }
        match grant.usage_limit {
            Some(limit) => {
                let headroom = (limit - grant.starting_allowance(entry.quantity)).max(Decimal::ZERO);
                Self::Capped { floor: -headroom }
            }
            None => Self::Unbounded,
        }
    }

    pub fn allows_overage(&self) -> bool {
        !matches!(self, Self::Forbidden)
    }

    /// Floor for consumption; `None` when unbounded.
    pub fn floor(&self) -> Option<Decimal> {
        match self {
            Self::Forbidden => Some(Decimal::ZERO),
            Self::Capped { floor } => Some(*floor),
            Self::Unbounded => None,
        }
    }
}

/// One deductible slot of a breakdown.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BreakdownItem {
    pub entry_id: EntryId,
    pub entity_id: Option<EntityId>,
    pub interval: Option<ResetInterval>,
    pub one_off: bool,
    pub balances: Balances,
    pub unlimited: bool,
    pub overage: OveragePolicy,
    pub next_reset_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl BreakdownItem {
    /// Expands an entry into its slots.
    pub fn from_entry(entry: &LedgerEntry, grant: &Grant) -> Vec<Self> {
        let behavior = entry.behavior(grant);
        let overage = OveragePolicy::derive(entry, grant);
        entry
            .slots()
            .into_iter()
            .map(|(entity_id, balances)| Self {
                entry_id: entry.id,
                entity_id,
                interval: grant.interval,
                one_off: matches!(behavior, GrantBehavior::OneOff),
                balances,
                unlimited: behavior.is_unlimited(),
                overage,
                next_reset_at: entry.next_reset_at,
                created_at: entry.created_at,
            })
            .collect()
    }

    pub fn current(&self) -> Decimal {
        self.balances.current()
    }

    pub fn matches(&self, entry_id: &EntryId, entity_id: Option<&EntityId>) -> bool {
        self.entry_id == *entry_id && self.entity_id.as_ref() == entity_id
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Breakdown {
    pub key: BalanceKey,
    pub items: Vec<BreakdownItem>,
}

impl Breakdown {
    pub fn empty(key: BalanceKey) -> Self {
        Self {
            key,
            items: Vec::new(),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.items.iter().any(|item| item.unlimited)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.items
            .iter()
            .any(|item| item.next_reset_at.is_some_and(|at| at <= now))
    }

    pub fn due_entries(&self, now: DateTime<Utc>) -> Vec<EntryId> {
        let mut ids: Vec<EntryId> = self
            .items
            .iter()
            .filter(|item| item.next_reset_at.is_some_and(|at| at <= now))
            .map(|item| item.entry_id)
            .collect();
        ids.dedup();
        ids
    }

    pub fn entry_ids(&self) -> Vec<EntryId> {
        let mut ids: Vec<EntryId> = self.items.iter().map(|item| item.entry_id).collect();
        ids.dedup();
        ids
    }

    /// Narrows to the slots visible to an entity and/or interval.
    ///
    /// An entity sees its own slots of entity-scoped entries plus every
    /// customer-level entry.
    pub fn view(&self, entity: Option<&EntityId>, interval: Option<ResetInterval>) -> Self {
        let items = self
            .items
            .iter()
            .filter(|item| match (entity, &item.entity_id) {
                (None, _) | (Some(_), None) => true,
                (Some(wanted), Some(slot)) => wanted == slot,
            })
            .filter(|item| interval.is_none() || item.interval == interval)
            .cloned()
            .collect();
        Self {
            key: self.key.clone(),
            items,
        }
    }

    pub fn item(&self, entry_id: &EntryId, entity_id: Option<&EntityId>) -> Option<&BreakdownItem> {
        self.items
            .iter()
            .find(|item| item.matches(entry_id, entity_id))
    }

    pub fn item_mut(
        &mut self,
        entry_id: &EntryId,
        entity_id: Option<&EntityId>,
    ) -> Option<&mut BreakdownItem> {
        self.items
            .iter_mut()
            .find(|item| item.matches(entry_id, entity_id))
    }

    /// Writes a view's slots back into this (full) breakdown.
    pub fn merge(&mut self, view: &Breakdown) {
        for updated in &view.items {
            if let Some(item) = self.item_mut(&updated.entry_id, updated.entity_id.as_ref()) {
                item.balances = updated.balances;
            }
        }
    }

    pub fn aggregate(&self, entity_id: Option<EntityId>) -> Aggregate {
        let totals: Balances = self.items.iter().map(|item| item.balances).sum();
        Aggregate {
            customer_id: self.key.customer_id.clone(),
            feature_id: self.key.feature_id.clone(),
            entity_id,
            granted_balance: totals.granted_balance,
            purchased_balance: totals.purchased_balance,
            current_balance: totals.current(),
            usage: totals.usage,
            unlimited: self.is_unlimited(),
            overage_allowed: self.items.iter().any(|item| item.overage.allows_overage()),
            next_reset_at: self.items.iter().filter_map(|item| item.next_reset_at).min(),
            breakdown: self.items.clone(),
        }
    }
}

/// Summed balance across a breakdown view.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub customer_id: CustomerId,
    pub feature_id: FeatureId,
    pub entity_id: Option<EntityId>,
    pub granted_balance: Decimal,
    pub purchased_balance: Decimal,
    pub current_balance: Decimal,
    pub usage: Decimal,
    pub unlimited: bool,
    pub overage_allowed: bool,
    pub next_reset_at: Option<DateTime<Utc>>,
    pub breakdown: Vec<BreakdownItem>,
}

impl Aggregate {
    /// Amount consumption could still take before every slot hits its floor.
    /// `None` means no bound.
    pub fn available(&self) -> Option<Decimal> {
        if self.unlimited {
            return None;
        }
        let mut total = Decimal::ZERO;
        for item in &self.breakdown {
            match item.overage.floor() {
                Some(floor) => total += (item.current() - floor).max(Decimal::ZERO),
                None => return None,
            }
        }
        Some(total)
    }

    pub fn allows(&self, required: Decimal) -> bool {
        self.available().is_none_or(|available| available >= required)
    }
}
