//! Scenario: Update Stream Ordering
//!
//! # Invariants under test
//!
//! 1. Three verified updates produce three reconcile passes in arrival order;
//!    each pass and the item's finalize complete before the next item's pass
//!    starts, even when the snapshot query is slow.
//! 2. Unverified updates are skipped: no pass, no finalize.
//! 3. A verified update that brings a new transaction activates the store.

use std::time::Duration;

use ent_provider::ProviderCall;
use ent_schemas::{TransactionId, VerificationError};
use ent_testkit::{days, t0, unverified, verified, Harness};

#[tokio::test]
async fn verified_updates_are_processed_strictly_in_order() {
    let h = Harness::builder()
        .with_provider(|p| p.set_snapshot_delay(Some(Duration::from_millis(30))))
        .start()
        .await
        .unwrap();
    h.wait_for_passes(1).await.unwrap();
    let start_index = h.provider.calls().len();

    for id in ["a", "b", "c"] {
        h.provider
            .push_update(verified(id, "pro.monthly", Some(t0() + days(30))));
    }
    h.wait_for_passes(4).await.unwrap();
    h.settle().await.unwrap();

    // Snapshot stays empty, so the only finalize per pass is the item's own.
    let calls = h.provider.calls()[start_index..].to_vec();
    assert_eq!(
        calls,
        vec![
            ProviderCall::CurrentEntitlements,
            ProviderCall::Finish(TransactionId::new("a")),
            ProviderCall::CurrentEntitlements,
            ProviderCall::Finish(TransactionId::new("b")),
            ProviderCall::CurrentEntitlements,
            ProviderCall::Finish(TransactionId::new("c")),
        ]
    );

    h.shutdown().await;
}

#[tokio::test]
async fn unverified_updates_are_skipped() {
    let h = Harness::builder().start().await.unwrap();
    h.wait_for_passes(1).await.unwrap();
    let start_index = h.provider.calls().len();

    h.provider
        .push_update(unverified("u1", "pro.monthly", VerificationError::InvalidEncoding));
    h.provider
        .push_update(verified("v1", "pro.monthly", Some(t0() + days(30))));
    h.wait_for_passes(2).await.unwrap();
    let status = h.settle().await.unwrap();

    assert_eq!(status.passes, 2, "only the verified item triggers a pass");
    let calls = h.provider.calls()[start_index..].to_vec();
    assert!(!calls.contains(&ProviderCall::Finish(TransactionId::new("u1"))));
    assert_eq!(
        calls.last(),
        Some(&ProviderCall::Finish(TransactionId::new("v1")))
    );

    h.shutdown().await;
}

#[tokio::test]
async fn renewal_update_activates_store() {
    let h = Harness::builder().start().await.unwrap();
    assert!(!h.wait_for_passes(1).await.unwrap().has_active_subscription);

    // Provider learns about the renewal, then announces it on the stream.
    let renewal = verified("r1", "pro.annual", Some(t0() + days(365)));
    h.provider.add_entitlement(renewal.clone());
    h.provider.push_update(renewal);

    let status = h.wait_for_passes(2).await.unwrap();
    assert!(status.has_active_subscription);
    assert_eq!(h.marker(), Some(t0() + days(365)));
    assert_eq!(
        status.representative.map(|t| t.id),
        Some(TransactionId::new("r1"))
    );

    h.shutdown().await;
}
