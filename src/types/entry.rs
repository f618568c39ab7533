//! Live ledger entries and their balance columns.

use std::collections::BTreeMap;
use std::iter::Sum;
use std::ops::AddAssign;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::grant::{Grant, GrantBehavior};
use super::ids::{
    CustomerId, EntityId, EntryId, FeatureId, GrantId, ProductInstanceId, SubscriptionRef,
};

/// The four persisted balance columns of an entry (or of one entity slot).
///
/// `current = granted + purchased - usage + adjustment` always holds; the
/// current balance is derived, never stored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balances {
    pub granted_balance: Decimal,
    pub purchased_balance: Decimal,
    pub usage: Decimal,
    pub adjustment: Decimal,
}

impl Balances {
    pub fn granted(amount: Decimal) -> Self {
        Self {
            granted_balance: amount,
            ..Default::default()
        }
    }

    pub fn current(&self) -> Decimal {
        self.granted_balance + self.purchased_balance - self.usage + self.adjustment
    }

    /// Highest current balance a credit may restore.
    pub fn ceiling(&self) -> Decimal {
        self.granted_balance + self.purchased_balance
    }

    /// Moves the current balance to `target` through the adjustment column.
    pub fn set_current(&mut self, target: Decimal) {
        self.adjustment += target - self.current();
    }
}

impl AddAssign for Balances {
    fn add_assign(&mut self, rhs: Self) {
        self.granted_balance += rhs.granted_balance;
        self.purchased_balance += rhs.purchased_balance;
        self.usage += rhs.usage;
        self.adjustment += rhs.adjustment;
    }
}

impl Sum for Balances {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |mut acc, b| {
            acc += b;
            acc
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    #[default]
    Active,
    PastDue,
    Expired,
}

impl EntryStatus {
    /// Whether entries in this status contribute to balances.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Active | Self::PastDue)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "past_due" => Some(Self::PastDue),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

/// A customer's live instance of a [`Grant`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub customer_id: CustomerId,
    pub feature_id: FeatureId,
    /// Absent for loose entries not tied to a subscription.
    pub product_instance_id: Option<ProductInstanceId>,
    pub subscription_ref: Option<SubscriptionRef>,
    pub grant_id: GrantId,
    pub status: EntryStatus,
    /// Totals; for entity-scoped entries, the sum of `entity_balances`.
    pub balances: Balances,
    /// Administrative override that makes the entry unlimited.
    pub unlimited: bool,
    pub overage_allowed: bool,
    pub quantity: Decimal,
    pub next_reset_at: Option<DateTime<Utc>>,
    pub entity_balances: Option<BTreeMap<EntityId, Balances>>,
    /// Bumped on every durable write.
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn behavior(&self, grant: &Grant) -> GrantBehavior {
        if self.unlimited {
            GrantBehavior::Unlimited
        } else {
            grant.behavior()
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_reset_at.is_some_and(|at| at <= now)
    }

    pub fn is_entity_scoped(&self) -> bool {
        self.entity_balances.is_some()
    }

    pub fn current_balance(&self) -> Decimal {
        self.balances.current()
    }

    /// Slot for `entity`, or the entry-level balances when not entity-scoped.
    pub fn slot(&self, entity: Option<&EntityId>) -> Option<&Balances> {
        match (&self.entity_balances, entity) {
            (Some(slots), Some(entity)) => slots.get(entity),
            (Some(_), None) => None,
            (None, _) => Some(&self.balances),
        }
    }

    pub fn slot_mut(&mut self, entity: Option<&EntityId>) -> Option<&mut Balances> {
        match (&mut self.entity_balances, entity) {
            (Some(slots), Some(entity)) => slots.get_mut(entity),
            (Some(_), None) => None,
            (None, _) => Some(&mut self.balances),
        }
    }

    /// Every slot with its entity key, in entity-id order.
    pub fn slots(&self) -> Vec<(Option<EntityId>, Balances)> {
        match &self.entity_balances {
            Some(slots) => slots
                .iter()
                .map(|(entity, balances)| (Some(entity.clone()), *balances))
                .collect(),
            None => vec![(None, self.balances)],
        }
    }

    /// Recomputes entry totals from entity slots.
    pub fn refresh_totals(&mut self) {
        if let Some(slots) = &self.entity_balances {
            self.balances = slots.values().copied().sum();
        }
    }
}
