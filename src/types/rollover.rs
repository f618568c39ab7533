use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::ids::{EntityId, EntryId, RolloverId};

/// Unused balance carried out of an expired period.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloverRecord {
    pub id: RolloverId,
    pub entry_id: EntryId,
    /// Set when the carry belongs to one entity slot.
    pub entity_id: Option<EntityId>,
    pub amount: Decimal,
    /// Further resets this record survives.
    pub expires_after_period_count: u32,
    pub created_at: DateTime<Utc>,
}

impl RolloverRecord {
    pub fn new(
        entry_id: EntryId,
        entity_id: Option<EntityId>,
        amount: Decimal,
        periods: u32,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RolloverId::new(),
            entry_id,
            entity_id,
            amount,
            expires_after_period_count: periods,
            created_at,
        }
    }
}
