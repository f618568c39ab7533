//! Carry-over of unused balance across period boundaries.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::types::{Balances, EntityId, EntryId, RolloverPolicy, RolloverRecord};

/// Result of rolling one slot into its next period.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SlotRollover {
    /// Records live during the new period, oldest first.
    pub records: Vec<RolloverRecord>,
    /// Amount the new period's granted balance gains from `records`.
    pub carried_in: Decimal,
    /// Records dropped because their horizon elapsed or they were used up.
    pub dropped: usize,
}

pub struct SlotContext<'a> {
    pub entry_id: EntryId,
    pub entity_id: Option<&'a EntityId>,
    pub policy: Option<&'a RolloverPolicy>,
    /// Periods elapsed since the previous anchor.
    pub periods: u32,
    pub now: DateTime<Utc>,
}

/// Rolls one slot's expiring period.
///
/// `records` are the slot's live records, oldest first; their amounts were
/// summed into `expiring.granted_balance` at the previous reset, and
/// consumption draws them down before the fresh allowance.
pub fn roll_slot(
    ctx: &SlotContext<'_>,
    expiring: &Balances,
    mut records: Vec<RolloverRecord>,
) -> SlotRollover {
    let consumed = (expiring.ceiling() - expiring.current()).max(Decimal::ZERO);
    let rollover_total: Decimal = records.iter().map(|r| r.amount).sum();

    let mut unattributed = consumed;
    for record in records.iter_mut() {
        let used = record.amount.min(unattributed);
        record.amount -= used;
        unattributed -= used;
    }
    let fresh_granted = (expiring.granted_balance - rollover_total).max(Decimal::ZERO);
    let fresh_left = (fresh_granted - unattributed).max(Decimal::ZERO);

    let before = records.len();
    records.retain_mut(|record| {
        record.expires_after_period_count =
            record.expires_after_period_count.saturating_sub(ctx.periods);
        record.expires_after_period_count > 0 && record.amount > Decimal::ZERO
    });
    let dropped = before - records.len();

    if let Some(policy) = ctx.policy {
        let surviving: Decimal = records.iter().map(|r| r.amount).sum();
        let room = policy
            .max_amount
            .map(|max| (max - surviving).max(Decimal::ZERO));
        let carry = room.map_or(fresh_left, |room| fresh_left.min(room));
        let horizon = policy
            .max_periods
            .saturating_sub(ctx.periods.saturating_sub(1));

        if carry > Decimal::ZERO && horizon > 0 {
            records.push(RolloverRecord::new(
                ctx.entry_id,
                ctx.entity_id.cloned(),
                carry,
                horizon,
                ctx.now,
            ));
        }
    }

    let carried_in = records.iter().map(|r| r.amount).sum();
    SlotRollover {
        records,
        carried_in,
        dropped,
    }
}
