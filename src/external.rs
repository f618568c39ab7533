//! Payment-processor boundary.
//!
//! The ledger reads billing anchors and charges top-ups through these traits;
//! it never depends on a concrete processor.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::{CustomerId, FeatureId, SubscriptionRef};

#[derive(Error, Debug, Clone)]
pub enum ExternalError {
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Charge declined: {0}")]
    Declined(String),

    #[error("Payment processor unavailable: {0}")]
    Unavailable(String),
}

#[async_trait::async_trait]
pub trait BillingAnchorProvider: Send + Sync {
    /// Day of month (1-31) the subscription bills on.
    async fn billing_anchor_day(&self, subscription: &SubscriptionRef)
    -> Result<u32, ExternalError>;
}

#[async_trait::async_trait]
pub trait TopUpGateway: Send + Sync {
    async fn charge(
        &self,
        customer_id: &CustomerId,
        feature_id: &FeatureId,
        quantity: Decimal,
    ) -> Result<(), ExternalError>;
}

/// Anchor days held in memory.
#[derive(Default)]
pub struct StaticAnchors {
    days: DashMap<SubscriptionRef, u32>,
    offline: AtomicBool,
}

impl StaticAnchors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_anchor(self, subscription: impl Into<SubscriptionRef>, day: u32) -> Self {
        self.days.insert(subscription.into(), day);
        self
    }

    /// Makes every lookup fail with [`ExternalError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl BillingAnchorProvider for StaticAnchors {
    async fn billing_anchor_day(
        &self,
        subscription: &SubscriptionRef,
    ) -> Result<u32, ExternalError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ExternalError::Unavailable("anchor lookup offline".into()));
        }
        self.days
            .get(subscription)
            .map(|day| *day)
            .ok_or_else(|| ExternalError::SubscriptionNotFound(subscription.to_string()))
    }
}

/// Gateway that approves or declines every charge and counts attempts.
pub struct StaticGateway {
    approve: AtomicBool,
    attempts: AtomicU64,
}

impl StaticGateway {
    pub fn approving() -> Self {
        Self {
            approve: AtomicBool::new(true),
            attempts: AtomicU64::new(0),
        }
    }

    pub fn declining() -> Self {
        Self {
            approve: AtomicBool::new(false),
            attempts: AtomicU64::new(0),
        }
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl TopUpGateway for StaticGateway {
    async fn charge(
        &self,
        customer_id: &CustomerId,
        _feature_id: &FeatureId,
        _quantity: Decimal,
    ) -> Result<(), ExternalError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.approve.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ExternalError::Declined(format!(
                "card declined for {}",
                customer_id
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_anchors() {
        let anchors = StaticAnchors::new().with_anchor("sub_1", 31);
        assert_eq!(anchors.billing_anchor_day(&"sub_1".into()).await.unwrap(), 31);
        assert!(matches!(
            anchors.billing_anchor_day(&"sub_2".into()).await,
            Err(ExternalError::SubscriptionNotFound(_))
        ));

        anchors.set_offline(true);
        assert!(matches!(
            anchors.billing_anchor_day(&"sub_1".into()).await,
            Err(ExternalError::Unavailable(_))
        ));
    }
}
