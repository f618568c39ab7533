//! Features and grant templates.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::ids::{FeatureId, GrantId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    Boolean,
    Metered,
}

/// Immutable reference data for a billable feature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub id: FeatureId,
    pub kind: FeatureKind,
    pub unit: String,
}

impl Feature {
    pub fn metered(id: impl Into<FeatureId>, unit: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: FeatureKind::Metered,
            unit: unit.into(),
        }
    }

    pub fn boolean(id: impl Into<FeatureId>) -> Self {
        Self {
            id: id.into(),
            kind: FeatureKind::Boolean,
            unit: String::new(),
        }
    }

    pub fn is_metered(&self) -> bool {
        self.kind == FeatureKind::Metered
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowanceType {
    #[default]
    Fixed,
    Unlimited,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetInterval {
    Minute,
    Hour,
    Day,
    Month,
    Year,
    Lifetime,
}

impl ResetInterval {
    pub fn cadence_unit(self) -> Option<CadenceUnit> {
        match self {
            Self::Minute => Some(CadenceUnit::Minute),
            Self::Hour => Some(CadenceUnit::Hour),
            Self::Day => Some(CadenceUnit::Day),
            Self::Month => Some(CadenceUnit::Month),
            Self::Year => Some(CadenceUnit::Year),
            Self::Lifetime => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
            Self::Year => "year",
            Self::Lifetime => "lifetime",
        }
    }
}

/// Units a recurring grant can reset on. Lifetime is deliberately absent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CadenceUnit {
    Minute,
    Hour,
    Day,
    Month,
    Year,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cadence {
    pub unit: CadenceUnit,
    pub count: u32,
}

impl Cadence {
    pub fn new(unit: CadenceUnit, count: u32) -> Self {
        Self {
            unit,
            count: count.max(1),
        }
    }

    /// Minute, hour and day cadences never consult the billing anchor.
    pub fn is_short(&self) -> bool {
        matches!(
            self.unit,
            CadenceUnit::Minute | CadenceUnit::Hour | CadenceUnit::Day
        )
    }
}

/// How much unused balance may carry into later periods.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RolloverPolicy {
    /// Cap on the total carried amount. `None` carries everything.
    pub max_amount: Option<Decimal>,
    /// Number of later periods a carried amount stays usable.
    pub max_periods: u32,
}

/// Entitlement template: what a product grants for one feature.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Grant {
    pub id: GrantId,
    pub product_id: String,
    pub feature_id: FeatureId,
    pub allowance_type: AllowanceType,
    /// `None` means a one-off grant.
    pub interval: Option<ResetInterval>,
    pub interval_count: u32,
    pub allowance: Decimal,
    /// Present when the grant is held per sub-entity.
    pub entity_feature_id: Option<FeatureId>,
    pub rollover: Option<RolloverPolicy>,
    /// Upper bound on usage when overage is allowed.
    pub usage_limit: Option<Decimal>,
    /// Billed in advance; overage never applies.
    pub prepaid: bool,
    pub created_at: DateTime<Utc>,
}

impl Grant {
    pub fn new(
        product_id: impl Into<String>,
        feature_id: impl Into<FeatureId>,
        allowance: Decimal,
    ) -> Self {
        Self {
            id: GrantId::new(),
            product_id: product_id.into(),
            feature_id: feature_id.into(),
            allowance_type: AllowanceType::Fixed,
            interval: None,
            interval_count: 1,
            allowance,
            entity_feature_id: None,
            rollover: None,
            usage_limit: None,
            prepaid: false,
            created_at: Utc::now(),
        }
    }

    pub fn unlimited(product_id: impl Into<String>, feature_id: impl Into<FeatureId>) -> Self {
        Self {
            allowance_type: AllowanceType::Unlimited,
            ..Self::new(product_id, feature_id, Decimal::ZERO)
        }
    }

    pub fn every(mut self, interval: ResetInterval, count: u32) -> Self {
        self.interval = Some(interval);
        self.interval_count = count.max(1);
        self
    }

    pub fn per_entity(mut self, entity_feature_id: impl Into<FeatureId>) -> Self {
        self.entity_feature_id = Some(entity_feature_id.into());
        self
    }

    pub fn with_rollover(mut self, max_amount: Option<Decimal>, max_periods: u32) -> Self {
        self.rollover = Some(RolloverPolicy {
            max_amount,
            max_periods,
        });
        self
    }

    pub fn with_usage_limit(mut self, limit: Decimal) -> Self {
        self.usage_limit = Some(limit);
        self
    }

    pub fn prepaid(mut self) -> Self {
        self.prepaid = true;
        self
    }

    pub fn is_entity_scoped(&self) -> bool {
        self.entity_feature_id.is_some()
    }

    pub fn behavior(&self) -> GrantBehavior {
        match (self.allowance_type, self.interval) {
            (AllowanceType::Unlimited, _) => GrantBehavior::Unlimited,
            (AllowanceType::Fixed, None) => GrantBehavior::OneOff,
            (AllowanceType::Fixed, Some(interval)) => match interval.cadence_unit() {
                Some(unit) => GrantBehavior::Recurring(Cadence::new(unit, self.interval_count)),
                None => GrantBehavior::Lifetime,
            },
        }
    }

    /// Allowance for one period, scaled by the product quantity.
    pub fn starting_allowance(&self, quantity: Decimal) -> Decimal {
        match self.allowance_type {
            AllowanceType::Unlimited => Decimal::ZERO,
            AllowanceType::Fixed => self.allowance * quantity,
        }
    }
}

/// Closed classification of how an entry behaves at every decision point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GrantBehavior {
    Unlimited,
    OneOff,
    Lifetime,
    Recurring(Cadence),
}

impl GrantBehavior {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }

    pub fn cadence(&self) -> Option<Cadence> {
        match self {
            Self::Recurring(cadence) => Some(*cadence),
            Self::Unlimited | Self::OneOff | Self::Lifetime => None,
        }
    }
}
