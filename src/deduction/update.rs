//! Administrative balance overrides.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{Deduction, DeductionMode, apply};
use crate::balance::Breakdown;
use crate::types::{EntityId, EntryId};
use crate::{Error, Result};

/// Target state for a direct balance update.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BalanceTarget {
    /// Distributes the difference over the breakdown in deduction order.
    Aggregate {
        current_balance: Option<Decimal>,
        granted_balance: Option<Decimal>,
    },
    /// Rewrites one slot's adjustment; no cross-entry distribution.
    Entry {
        entry_id: EntryId,
        current_balance: Decimal,
    },
}

impl BalanceTarget {
    pub fn current(current_balance: Decimal) -> Self {
        Self::Aggregate {
            current_balance: Some(current_balance),
            granted_balance: None,
        }
    }

    pub fn entry(entry_id: EntryId, current_balance: Decimal) -> Self {
        Self::Entry {
            entry_id,
            current_balance,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Aggregate {
                current_balance: None,
                granted_balance: None,
            } => Err(Error::validation("balance target names no balance")),
            Self::Aggregate {
                granted_balance: Some(granted),
                ..
            } if *granted < Decimal::ZERO => Err(Error::validation(
                format!("granted balance target must not be negative: {}", granted),
            )),
            _ => Ok(()),
        }
    }
}

/// Moves `view` onto `target`. Re-applying the same target is a no-op.
pub fn apply_target(
    view: &mut Breakdown,
    target: &BalanceTarget,
    entity: Option<&EntityId>,
) -> Result<Deduction> {
    target.validate()?;

    match target {
        BalanceTarget::Aggregate {
            current_balance,
            granted_balance,
        } => {
            if view.is_unlimited() {
                return Err(Error::validation(format!(
                    "{} is unlimited; its balance cannot be set",
                    view.key
                )));
            }
            let mut outcome = Deduction::default();

            if let Some(granted) = granted_balance {
                let total: Decimal = view.items.iter().map(|i| i.balances.granted_balance).sum();
                let delta = *granted - total;
                if !delta.is_zero() {
                    let key = view.key.to_string();
                    let item = view
                        .items
                        .iter_mut()
                        .find(|item| !item.unlimited)
                        .ok_or_else(|| Error::not_found("balance", key))?;
                    item.balances.granted_balance += delta;
                    outcome.touched.push(item.entry_id);
                    outcome.applied -= delta;
                }
            }

            if let Some(current) = current_balance {
                let total: Decimal = view.items.iter().map(|i| i.current()).sum();
                let distributed = apply(&mut view.items, total - *current, DeductionMode::Adjustment);
                for id in distributed.touched {
                    if !outcome.touched.contains(&id) {
                        outcome.touched.push(id);
                    }
                }
                outcome.applied += distributed.applied;
                outcome.remaining = distributed.remaining;
            }

            Ok(outcome)
        }
        BalanceTarget::Entry {
            entry_id,
            current_balance,
        } => {
            let position = view
                .items
                .iter()
                .position(|i| i.matches(entry_id, entity))
                .or_else(|| {
                    entity.and_then(|_| {
                        view.items.iter().position(|i| i.matches(entry_id, None))
                    })
                });
            let Some(position) = position else {
                let scoped = view.items.iter().any(|i| i.entry_id == *entry_id);
                return Err(if scoped && entity.is_none() {
                    Error::validation(format!(
                        "entry {} on {} is entity-scoped; an entity id is required",
                        entry_id, view.key
                    ))
                } else {
                    Error::not_found("entry", entry_id)
                });
            };
            let item = &mut view.items[position];
            if item.unlimited {
                return Err(Error::validation(format!("entry {} is unlimited", entry_id)));
            }

            let delta = item.current() - *current_balance;
            let mut outcome = Deduction::default();
            if !delta.is_zero() {
                item.balances.set_current(*current_balance);
                outcome.touched.push(*entry_id);
                outcome.applied = delta;
            }
            Ok(outcome)
        }
    }
}
