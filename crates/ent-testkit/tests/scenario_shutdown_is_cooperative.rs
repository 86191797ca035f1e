//! Scenario: Shutdown Is Cooperative
//!
//! # Invariants under test
//!
//! 1. An item whose pass is already running when shutdown is requested
//!    completes, finalize included.
//! 2. After shutdown, updates are no longer consumed and commands report
//!    `StoreError::Stopped`.
//! 3. A purchase after shutdown never reaches the provider and never fails
//!    the caller.
//! 4. Cache writes applied before shutdown stand.

use std::time::Duration;

use ent_provider::ProviderCall;
use ent_runtime::StoreError;
use ent_schemas::{ProductId, TransactionId};
use ent_testkit::{days, t0, verified, Harness};

#[tokio::test]
async fn in_flight_item_completes_before_stop() {
    let h = Harness::builder()
        .with_provider(|p| p.set_snapshot_delay(Some(Duration::from_millis(150))))
        .start()
        .await
        .unwrap();
    let start_index = h.provider.calls().len();

    let item = verified("inflight", "pro.monthly", Some(t0() + days(30)));
    h.provider.add_entitlement(item.clone());
    h.provider.push_update(item);

    // Wait until the item's pass has issued its snapshot query.
    tokio::time::timeout(Duration::from_secs(5), async {
        while h.provider.calls().len() <= start_index {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    h.handle.shutdown().await;

    let calls = h.provider.calls()[start_index..].to_vec();
    assert_eq!(calls.first(), Some(&ProviderCall::CurrentEntitlements));
    assert_eq!(
        calls.last(),
        Some(&ProviderCall::Finish(TransactionId::new("inflight")))
    );
    assert_eq!(h.status().passes, 2);
    assert!(h.status().has_active_subscription);
}

#[tokio::test]
async fn stopped_store_ignores_updates_and_rejects_commands() {
    let h = Harness::builder().start().await.unwrap();
    h.handle.shutdown().await;
    let calls_at_stop = h.provider.calls().len();

    h.provider
        .push_update(verified("late", "pro.monthly", Some(t0() + days(30))));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.provider.calls().len(), calls_at_stop);

    assert_eq!(h.handle.refresh().await.unwrap_err(), StoreError::Stopped);
    assert_eq!(h.handle.sync().await.unwrap_err(), StoreError::Stopped);

    let status = h.handle.purchase(ProductId::new("pro.monthly")).await;
    assert!(!status.is_purchasing);
    assert_eq!(h.provider.calls().len(), calls_at_stop);

    // Second shutdown is harmless.
    h.handle.shutdown().await;
}

#[tokio::test]
async fn marker_written_before_shutdown_stands() {
    let h = Harness::builder().start().await.unwrap();
    h.handle.purchase(ProductId::new("pro.annual")).await;
    let marker = h.marker();
    assert_eq!(marker, Some(t0() + days(365)));

    let store = h.store.clone();
    h.shutdown().await;
    assert_eq!(
        ent_cache::ExpirationCache::new(store).read().unwrap(),
        marker
    );
}
