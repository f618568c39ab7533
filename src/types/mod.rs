//! Ledger data model: features, grant templates, entries and rollovers.

mod entry;
mod grant;
mod ids;
mod rollover;

pub use entry::{Balances, EntryStatus, LedgerEntry};
pub use grant::{
    AllowanceType, Cadence, CadenceUnit, Feature, FeatureKind, Grant, GrantBehavior,
    ResetInterval, RolloverPolicy,
};
pub use ids::{
    CustomerId, EntityId, EntryId, FeatureId, GrantId, ProductInstanceId, RolloverId,
    SubscriptionRef,
};
pub use rollover::RolloverRecord;
