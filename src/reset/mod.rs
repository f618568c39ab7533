//! Period boundaries: cadence arithmetic, the exactly-once reset transition,
//! rollover carry-over and the scheduled sweep.

mod manager;
mod rollover;
mod schedule;
mod sweep;

pub use manager::{ResetManager, ResetOutcome};
pub use rollover::{SlotContext, SlotRollover, roll_slot};
pub use schedule::{NextReset, advance, align_to_anchor, days_in_month, needs_anchor_check, next_after};
pub use sweep::{SweepReport, Sweeper};
