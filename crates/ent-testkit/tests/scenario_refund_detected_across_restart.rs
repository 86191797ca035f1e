//! Scenario: Refund Detected Across Restart
//!
//! # Invariants under test
//!
//! 1. A purchase in one session persists the marker to disk.
//! 2. A second session over the same files, where the provider no longer
//!    reports the transaction, raises `MissingTransaction` and is inactive.
//! 3. The anomaly lands in the hash-chained audit log, which verifies.

use std::sync::Arc;

use ent_audit::{
    verify_hash_chain, AuditAnomalyReporter, FanoutAnomalyReporter, MemoryAnomalyReporter,
    VerifyResult,
};
use ent_cache::{ExpirationCache, FileStore};
use ent_provider::PaperProvider;
use ent_runtime::{EntitlementStore, FixedClock, StoreHandle};
use ent_schemas::ProductId;
use ent_testkit::{days, default_catalog, default_product_ids, t0};

fn start_session(
    provider: Arc<PaperProvider>,
    cache_path: &std::path::Path,
    log_path: &std::path::Path,
    memory: Arc<MemoryAnomalyReporter>,
) -> StoreHandle {
    let audit = Arc::new(AuditAnomalyReporter::open(log_path, true).unwrap());
    let reporter = FanoutAnomalyReporter::new().with(audit).with(memory);

    EntitlementStore::builder(provider)
        .cache_store(Arc::new(FileStore::open(cache_path).unwrap()))
        .reporter(Arc::new(reporter))
        .clock(Arc::new(FixedClock::new(t0())))
        .product_ids(default_product_ids())
        .start()
}

#[tokio::test]
async fn refund_between_sessions_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("entitlements.json");
    let log_path = dir.path().join("anomalies.jsonl");

    // Session 1: buy the annual plan.
    let provider = Arc::new(PaperProvider::from_catalog(
        default_catalog()
            .iter()
            .map(|e| (e.to_product(), e.period_days)),
    ));
    provider.set_now(t0());
    let memory = Arc::new(MemoryAnomalyReporter::new());
    let s1 = start_session(provider.clone(), &cache_path, &log_path, memory.clone());
    s1.startup_complete().await.unwrap();

    let status = s1.purchase(ProductId::new("pro.annual")).await;
    assert!(status.has_active_subscription);
    s1.shutdown().await;

    let persisted = ExpirationCache::new(FileStore::open(&cache_path).unwrap())
        .read()
        .unwrap();
    assert_eq!(persisted, Some(t0() + days(365)));

    // Session 2: the provider has dropped the transaction (refund).
    let provider = Arc::new(PaperProvider::from_catalog(
        default_catalog()
            .iter()
            .map(|e| (e.to_product(), e.period_days)),
    ));
    let memory = Arc::new(MemoryAnomalyReporter::new());
    let s2 = start_session(provider, &cache_path, &log_path, memory.clone());
    s2.startup_complete().await.unwrap();

    assert!(!s2.status().has_active_subscription);
    assert_eq!(memory.missing_count(), 1);
    s2.shutdown().await;

    assert_eq!(
        verify_hash_chain(&log_path).unwrap(),
        VerifyResult::Valid { lines: 1 }
    );
}
