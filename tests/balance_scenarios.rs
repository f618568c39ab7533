//! Balance Scenario Tests
//!
//! End-to-end behavior of the ledger facade over the in-memory store:
//! top-ups, entity distribution, overage kinds, credits and cache/store
//! agreement after sync.
//!
//! Run: cargo nextest run --test balance_scenarios

use std::sync::Arc;

use entitlement_ledger::{
    AttachRequest, AutoTopUp, BalanceQuery, BalanceTarget, Feature, Grant, Ledger, LedgerConfig,
    MemoryStore, ResetInterval, StaticGateway, TrackRequest, UpdateBalanceRequest,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn ledger(config: LedgerConfig, gateway: Option<Arc<StaticGateway>>) -> Ledger {
    init_tracing();
    let mut builder = Ledger::builder(Arc::new(MemoryStore::new())).config(config);
    if let Some(gateway) = gateway {
        builder = builder.gateway(gateway);
    }
    let ledger = builder.build().unwrap();
    ledger
        .define_feature(&Feature::metered("messages", "message"))
        .await
        .unwrap();
    ledger
}

async fn attach(ledger: &Ledger, customer: &str, grant: Grant) -> Grant {
    ledger.define_grant(&grant).await.unwrap();
    ledger
        .attach_grant(AttachRequest::new(customer, grant.id))
        .await
        .unwrap();
    grant
}

// =============================================================================
// Auto top-up
// =============================================================================

mod topup_tests {
    use super::*;

    #[tokio::test]
    async fn test_top_up_fires_and_survives_sync() {
        let gateway = Arc::new(StaticGateway::approving());
        let ledger = ledger(LedgerConfig::default(), Some(gateway.clone())).await;
        attach(
            &ledger,
            "cus_a",
            Grant::new("pro", "messages", dec!(100)).every(ResetInterval::Month, 1),
        )
        .await;
        ledger
            .topups()
            .register("cus_a", AutoTopUp::new("messages", dec!(20), dec!(100)))
            .unwrap();

        let balance = ledger
            .track(TrackRequest::new("cus_a", "messages", dec!(85)))
            .await
            .unwrap();
        assert_eq!(balance.current_balance, dec!(115));
        assert_eq!(balance.purchased_balance, dec!(100));
        assert_eq!(gateway.attempts(), 1);

        let (synced, failed) = ledger.sync_all().await.unwrap();
        assert_eq!((synced, failed), (1, 0));

        let cached = ledger
            .check_balance(BalanceQuery::new("cus_a", "messages"))
            .await
            .unwrap();
        let durable = ledger
            .check_balance(BalanceQuery::new("cus_a", "messages").skip_cache())
            .await
            .unwrap();
        assert_eq!(cached.current_balance, dec!(115));
        assert_eq!(durable.current_balance, dec!(115));
        assert_eq!(durable.usage, dec!(85));
        assert_eq!(ledger.metrics().topups_fired.get(), 1);
    }

    #[tokio::test]
    async fn test_declined_top_up_keeps_balance() {
        let gateway = Arc::new(StaticGateway::declining());
        let ledger = ledger(LedgerConfig::default(), Some(gateway.clone())).await;
        attach(&ledger, "cus_a", Grant::new("pro", "messages", dec!(100))).await;
        ledger
            .topups()
            .register("cus_a", AutoTopUp::new("messages", dec!(20), dec!(100)))
            .unwrap();

        let balance = ledger
            .track(TrackRequest::new("cus_a", "messages", dec!(85)))
            .await
            .unwrap();
        assert_eq!(balance.current_balance, dec!(15));
        assert_eq!(gateway.attempts(), 1);
        assert_eq!(ledger.metrics().topups_rejected.get(), 1);
    }
}

// =============================================================================
// Entity distribution
// =============================================================================

mod entity_tests {
    use super::*;

    #[tokio::test]
    async fn test_aggregate_target_deducts_entities_in_order() {
        let ledger = ledger(LedgerConfig::default(), None).await;
        let seats = Grant::new("team", "messages", dec!(100)).per_entity("seats");
        ledger.define_grant(&seats).await.unwrap();
        ledger
            .attach_grant(AttachRequest::new("cus_b", seats.id).entities(["e1", "e2", "e3"]))
            .await
            .unwrap();

        let balance = ledger
            .update_balance(UpdateBalanceRequest::new(
                "cus_b",
                "messages",
                BalanceTarget::current(dec!(240)),
            ))
            .await
            .unwrap();
        let currents: Vec<Decimal> = balance.breakdown.iter().map(|i| i.current()).collect();
        assert_eq!(currents, vec![dec!(40), dec!(100), dec!(100)]);

        let balance = ledger
            .update_balance(UpdateBalanceRequest::new(
                "cus_b",
                "messages",
                BalanceTarget::current(dec!(150)),
            ))
            .await
            .unwrap();
        let currents: Vec<Decimal> = balance.breakdown.iter().map(|i| i.current()).collect();
        assert_eq!(currents, vec![dec!(0), dec!(50), dec!(100)]);
        assert_eq!(balance.current_balance, dec!(150));

        let e3 = ledger
            .check_balance(BalanceQuery::new("cus_b", "messages").entity("e3"))
            .await
            .unwrap();
        assert_eq!(e3.current_balance, dec!(100));
    }
}

// =============================================================================
// Overage kinds
// =============================================================================

mod overage_tests {
    use super::*;

    #[tokio::test]
    async fn test_unbounded_overage_goes_negative() {
        let ledger = ledger(LedgerConfig::default(), None).await;
        let payg = Grant::new("payg", "messages", dec!(0));
        ledger.define_grant(&payg).await.unwrap();
        ledger
            .attach_grant(AttachRequest::new("cus_c", payg.id).allow_overage())
            .await
            .unwrap();

        let balance = ledger
            .track(TrackRequest::new("cus_c", "messages", dec!(8)))
            .await
            .unwrap();
        assert_eq!(balance.current_balance, dec!(-8));
        assert_eq!(balance.available(), None);
    }

    #[tokio::test]
    async fn test_prepaid_pool_never_goes_negative() {
        let ledger = ledger(LedgerConfig::default(), None).await;
        let pack = Grant::new("pack", "messages", dec!(3)).prepaid();
        ledger.define_grant(&pack).await.unwrap();
        ledger
            .attach_grant(AttachRequest::new("cus_c", pack.id).allow_overage())
            .await
            .unwrap();

        let balance = ledger
            .track(TrackRequest::new("cus_c", "messages", dec!(8)))
            .await
            .unwrap();
        assert_eq!(balance.current_balance, Decimal::ZERO);
        assert_eq!(balance.usage, dec!(3));
        assert!(!balance.overage_allowed);
    }

    #[tokio::test]
    async fn test_usage_limit_caps_overage() {
        let ledger = ledger(LedgerConfig::default(), None).await;
        let limited = Grant::new("pro", "messages", dec!(100)).with_usage_limit(dec!(150));
        ledger.define_grant(&limited).await.unwrap();
        ledger
            .attach_grant(AttachRequest::new("cus_c", limited.id).allow_overage())
            .await
            .unwrap();

        let balance = ledger
            .track(TrackRequest::new("cus_c", "messages", dec!(170)))
            .await
            .unwrap();
        assert_eq!(balance.current_balance, dec!(-50));
    }
}

// =============================================================================
// Credits and idempotence
// =============================================================================

mod credit_tests {
    use super::*;

    #[tokio::test]
    async fn test_track_round_trip_restores_balance() {
        let ledger = ledger(LedgerConfig::default(), None).await;
        attach(&ledger, "cus_d", Grant::new("free", "messages", dec!(3.3))).await;
        attach(&ledger, "cus_d", Grant::new("pro", "messages", dec!(10))).await;
        let before = ledger
            .check_balance(BalanceQuery::new("cus_d", "messages"))
            .await
            .unwrap();

        ledger
            .track(TrackRequest::new("cus_d", "messages", dec!(7.77)))
            .await
            .unwrap();
        let after = ledger
            .track(TrackRequest::new("cus_d", "messages", dec!(-7.77)))
            .await
            .unwrap();
        assert_eq!(after.current_balance, before.current_balance);
        assert_eq!(after.usage, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_credit_stops_at_ceiling() {
        let ledger = ledger(LedgerConfig::default(), None).await;
        attach(&ledger, "cus_d", Grant::new("pro", "messages", dec!(100))).await;

        ledger
            .track(TrackRequest::new("cus_d", "messages", dec!(30)))
            .await
            .unwrap();
        let balance = ledger
            .track(TrackRequest::new("cus_d", "messages", dec!(-50)))
            .await
            .unwrap();
        assert_eq!(balance.current_balance, dec!(100));
        assert_eq!(balance.usage, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_zero_delta_reads_only() {
        let ledger = ledger(LedgerConfig::default(), None).await;
        attach(&ledger, "cus_d", Grant::new("pro", "messages", dec!(10))).await;

        let balance = ledger
            .track(TrackRequest::new("cus_d", "messages", Decimal::ZERO))
            .await
            .unwrap();
        assert_eq!(balance.current_balance, dec!(10));
        assert_eq!(ledger.sync_all().await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn test_repeated_update_is_noop() {
        let mut config = LedgerConfig::default();
        config.cache.enabled = false;
        let ledger = ledger(config, None).await;
        attach(&ledger, "cus_d", Grant::new("pro", "messages", dec!(100))).await;

        let request =
            UpdateBalanceRequest::new("cus_d", "messages", BalanceTarget::current(dec!(25)));
        let first = ledger.update_balance(request.clone()).await.unwrap();
        let second = ledger.update_balance(request).await.unwrap();
        assert_eq!(first.current_balance, dec!(25));
        assert_eq!(second.breakdown, first.breakdown);
    }
}

// =============================================================================
// Cache and store agreement
// =============================================================================

mod sync_tests {
    use super::*;

    #[tokio::test]
    async fn test_durable_read_lags_until_sync() {
        let ledger = ledger(LedgerConfig::default(), None).await;
        attach(&ledger, "cus_e", Grant::new("pro", "messages", dec!(100))).await;

        ledger
            .track(TrackRequest::new("cus_e", "messages", dec!(40)))
            .await
            .unwrap();
        let durable = ledger
            .check_balance(BalanceQuery::new("cus_e", "messages").skip_cache())
            .await
            .unwrap();
        assert_eq!(durable.current_balance, dec!(100));

        ledger.sync_all().await.unwrap();
        let durable = ledger
            .check_balance(BalanceQuery::new("cus_e", "messages").skip_cache())
            .await
            .unwrap();
        assert_eq!(durable.current_balance, dec!(60));

        // Replaying a sync with nothing dirty changes nothing.
        assert_eq!(ledger.sync_all().await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn test_cached_and_uncached_agree() {
        let mut uncached = LedgerConfig::default();
        uncached.cache.enabled = false;
        let cached_ledger = ledger(LedgerConfig::default(), None).await;
        let direct_ledger = ledger(uncached, None).await;

        for ledger in [&cached_ledger, &direct_ledger] {
            attach(ledger, "cus_f", Grant::new("free", "messages", dec!(10))).await;
            attach(ledger, "cus_f", Grant::new("pack", "messages", dec!(50))).await;
            for delta in [dec!(4), dec!(9.5), dec!(-2), dec!(20)] {
                ledger
                    .track(TrackRequest::new("cus_f", "messages", delta))
                    .await
                    .unwrap();
            }
            ledger.sync_all().await.unwrap();
        }

        let query = BalanceQuery::new("cus_f", "messages").skip_cache();
        let a = cached_ledger.check_balance(query.clone()).await.unwrap();
        let b = direct_ledger.check_balance(query).await.unwrap();
        assert_eq!(a.current_balance, dec!(28.5));
        assert_eq!(a.current_balance, b.current_balance);
        assert_eq!(a.usage, b.usage);
    }
}
