//! Signed-delta distribution over an ordered breakdown.
//!
//! Consumption runs in two passes: the first draws every slot down to zero in
//! order, the second lets slots that allow overage go below zero down to their
//! floor. Credits walk the same order and stop at each slot's ceiling.

mod update;

pub use update::{BalanceTarget, apply_target};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::balance::BreakdownItem;
use crate::types::EntryId;

/// Which balance column absorbs a delta.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeductionMode {
    /// Tracked usage; credits unwind `usage` before touching `adjustment`.
    #[default]
    Usage,
    /// Administrative override; only `adjustment` moves, and any remainder is
    /// forced onto the first limited slot.
    Adjustment,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Deduction {
    /// Signed decrease of the current balance that landed on slots.
    /// Consumption is positive; credits, purchases and raised allowances
    /// are negative.
    pub applied: Decimal,
    /// Signed amount no slot could absorb.
    pub remaining: Decimal,
    /// Entries with at least one changed slot, in breakdown order.
    pub touched: Vec<EntryId>,
}

impl Deduction {
    fn touch(&mut self, entry_id: EntryId) {
        if !self.touched.contains(&entry_id) {
            self.touched.push(entry_id);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.remaining.is_zero()
    }
}

/// Applies `delta` (positive consumes, negative credits) across `items`.
pub fn apply(items: &mut [BreakdownItem], delta: Decimal, mode: DeductionMode) -> Deduction {
    let mut outcome = Deduction::default();
    if delta.is_zero() {
        return outcome;
    }

    let mut remaining = if delta.is_sign_positive() {
        consume(items, delta, mode, &mut outcome)
    } else {
        -credit(items, -delta, mode, &mut outcome)
    };

    if mode == DeductionMode::Adjustment && !remaining.is_zero() {
        if let Some(item) = items.iter_mut().find(|item| !item.unlimited) {
            item.balances.adjustment -= remaining;
            outcome.touch(item.entry_id);
            remaining = Decimal::ZERO;
        }
    }

    outcome.applied = delta - remaining;
    outcome.remaining = remaining;
    outcome
}

fn consume(
    items: &mut [BreakdownItem],
    amount: Decimal,
    mode: DeductionMode,
    outcome: &mut Deduction,
) -> Decimal {
    let mut remaining = amount;

    for item in items.iter_mut().filter(|item| !item.unlimited) {
        if remaining.is_zero() {
            return remaining;
        }
        let take = remaining.min(item.current().max(Decimal::ZERO));
        if take > Decimal::ZERO {
            take_from(item, take, mode);
            outcome.touch(item.entry_id);
            remaining -= take;
        }
    }

    for item in items.iter_mut().filter(|item| !item.unlimited) {
        if remaining.is_zero() {
            break;
        }
        let take = match item.overage.floor() {
            None => remaining,
            Some(floor) => remaining.min((item.current() - floor).max(Decimal::ZERO)),
        };
        if take > Decimal::ZERO {
            take_from(item, take, mode);
            outcome.touch(item.entry_id);
            remaining -= take;
        }
    }

    remaining
}

fn credit(
    items: &mut [BreakdownItem],
    amount: Decimal,
    mode: DeductionMode,
    outcome: &mut Deduction,
) -> Decimal {
    let mut remaining = amount;

    for item in items.iter_mut().filter(|item| !item.unlimited) {
        if remaining.is_zero() {
            break;
        }
        let room = (item.balances.ceiling() - item.current()).max(Decimal::ZERO);
        let give = remaining.min(room);
        if give.is_zero() {
            continue;
        }
        match mode {
            DeductionMode::Usage => {
                let unwound = give.min(item.balances.usage.max(Decimal::ZERO));
                item.balances.usage -= unwound;
                item.balances.adjustment += give - unwound;
            }
            DeductionMode::Adjustment => item.balances.adjustment += give,
        }
        outcome.touch(item.entry_id);
        remaining -= give;
    }

    remaining
}

fn take_from(item: &mut BreakdownItem, amount: Decimal, mode: DeductionMode) {
    match mode {
        DeductionMode::Usage => item.balances.usage += amount,
        DeductionMode::Adjustment => item.balances.adjustment -= amount,
    }
}
