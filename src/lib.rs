//! # entitlement-ledger
//!
//! Metered-billing entitlement ledger: per-customer (and per-entity) balances
//! across overlapping grants, with exactly-once period resets, rollovers, and
//! a cache tier that is folded back into the durable store without losing
//! concurrent writes.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use entitlement_ledger::{
//!     AttachRequest, BalanceQuery, Feature, Grant, Ledger, MemoryStore, ResetInterval,
//!     TrackRequest,
//! };
//! use rust_decimal_macros::dec;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), entitlement_ledger::Error> {
//!     let ledger = Ledger::builder(Arc::new(MemoryStore::new())).build()?;
//!
//!     ledger.define_feature(&Feature::metered("messages", "message")).await?;
//!     let grant = Grant::new("pro", "messages", dec!(100)).every(ResetInterval::Month, 1);
//!     ledger.define_grant(&grant).await?;
//!     ledger.attach_grant(AttachRequest::new("cus_1", grant.id)).await?;
//!
//!     let balance = ledger.track(TrackRequest::new("cus_1", "messages", dec!(85))).await?;
//!     assert_eq!(balance.current_balance, dec!(15));
//!
//!     let balance = ledger.check_balance(BalanceQuery::new("cus_1", "messages")).await?;
//!     println!("{} left", balance.current_balance);
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod balance;
pub mod cache;
pub mod config;
pub mod deduction;
pub mod external;
pub mod ledger;
pub mod observability;
pub mod reset;
pub mod retry;
pub mod store;
pub mod sync;
pub mod topup;
pub mod types;

pub use balance::{
    Aggregate, BalanceAggregator, BalanceKey, BalanceQuery, Breakdown, BreakdownItem,
    DeductionOrder, OveragePolicy,
};
pub use cache::{BalanceCache, CacheError, CachedBalance, MemoryCache, Mutation};
#[cfg(feature = "redis-backend")]
pub use cache::{RedisCache, RedisCacheConfig};
pub use config::{
    CacheConfig, ConfigError, ConfigLoader, LedgerConfig, ResetConfig, SweepConfig,
};
pub use deduction::{BalanceTarget, Deduction, DeductionMode};
pub use external::{BillingAnchorProvider, ExternalError, StaticAnchors, StaticGateway, TopUpGateway};
pub use ledger::{
    AttachRequest, Ledger, LedgerBuilder, OverageBehavior, PurchaseRequest, TrackRequest,
    UpdateBalanceRequest,
};
pub use observability::{LedgerMetrics, MetricsSnapshot};
pub use reset::{ResetManager, ResetOutcome, SweepReport, Sweeper};
pub use retry::RetryPolicy;
pub use store::{LedgerStore, MemoryStore, StoreError};
#[cfg(feature = "postgres")]
pub use store::{PostgresStore, PostgresTables};
pub use sync::{SyncEngine, SyncReport};
pub use topup::{AutoTopUp, PurchaseLimit, TopUpManager};
pub use types::{
    AllowanceType, Balances, CustomerId, EntityId, EntryId, EntryStatus, Feature, FeatureId,
    FeatureKind, Grant, GrantBehavior, GrantId, LedgerEntry, ProductInstanceId, ResetInterval,
    RolloverPolicy, RolloverRecord, SubscriptionRef,
};

use rust_decimal::Decimal;

/// Error type for ledger operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed delta, target or request; nothing was mutated.
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Retries of a compare-and-swap or a dirty cache key were exhausted.
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("External dependency failed: {0}")]
    ExternalDependency(#[from] external::ExternalError),

    /// The key stays dirty and is retried on the next sync pass.
    #[error("Sync failed for {key}: {message}")]
    Sync { key: String, message: String },

    #[error("Insufficient balance: requested {requested}, only {available} available")]
    InsufficientBalance {
        requested: Decimal,
        available: Decimal,
    },

    #[error("Store error: {0}")]
    Store(store::StoreError),

    #[error("Cache error: {0}")]
    Cache(#[from] cache::CacheError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Error category for unified error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Rejected before any mutation
    Validation,
    NotFound,
    /// Lost races that outlasted internal retries
    Conflict,
    /// Backend failures that may succeed on retry
    Transient,
    /// Payment-processor failures
    External,
    Internal,
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Validation(_) | Error::InsufficientBalance { .. } => ErrorCategory::Validation,
            Error::NotFound { .. } => ErrorCategory::NotFound,
            Error::ConcurrencyConflict(_) => ErrorCategory::Conflict,
            Error::ExternalDependency(_) => ErrorCategory::External,
            Error::Sync { .. } => ErrorCategory::Transient,
            Error::Store(e) if e.is_transient() => ErrorCategory::Transient,
            Error::Cache(e) if e.is_transient() => ErrorCategory::Transient,
            Error::Store(_) | Error::Cache(_) | Error::Config(_) | Error::Json(_) => {
                ErrorCategory::Internal
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Conflict | ErrorCategory::Transient
        )
    }
}

impl From<store::StoreError> for Error {
    fn from(err: store::StoreError) -> Self {
        match err {
            store::StoreError::NotFound { kind, id } => Error::NotFound { kind, id },
            store::StoreError::Conflict { id } => {
                Error::ConcurrencyConflict(format!("entry {} changed concurrently", id))
            }
            other => Error::Store(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
