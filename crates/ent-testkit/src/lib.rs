//! Shared fixtures for scenario tests: fixed time, snapshot builders and a
//! fully wired store over the paper provider.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeZone, Utc};

use ent_audit::MemoryAnomalyReporter;
use ent_cache::{ExpirationCache, MemoryStore};
use ent_config::CatalogEntry;
use ent_provider::PaperProvider;
use ent_reconcile::{snapshot_adapter, SelectionPolicy};
use ent_runtime::{EntitlementStore, FixedClock, StoreHandle, StoreStatus};
use ent_schemas::{ProductId, Transaction, VerificationError, VerificationResult};

/// Reference instant every scenario is anchored on.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 15, 9, 30, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

pub fn days(n: i64) -> chrono::Duration {
    chrono::Duration::days(n)
}

pub fn verified(id: &str, product: &str, expires_at: Option<DateTime<Utc>>) -> VerificationResult {
    VerificationResult::verified(Transaction::new(id, product, t0() - days(1), expires_at))
}

pub fn unverified(id: &str, product: &str, error: VerificationError) -> VerificationResult {
    VerificationResult::unverified(Transaction::new(id, product, t0() - days(1), None), error)
}

pub fn default_catalog() -> Vec<CatalogEntry> {
    vec![
        CatalogEntry {
            id: "pro.monthly".to_string(),
            display_name: "Pro Monthly".to_string(),
            description: "Billed monthly".to_string(),
            price_micros: 5_990_000,
            currency: "USD".to_string(),
            period_days: Some(30),
        },
        CatalogEntry {
            id: "pro.annual".to_string(),
            display_name: "Pro Annual".to_string(),
            description: "Billed yearly".to_string(),
            price_micros: 49_990_000,
            currency: "USD".to_string(),
            period_days: Some(365),
        },
    ]
}

pub fn default_product_ids() -> Vec<ProductId> {
    vec![ProductId::new("pro.annual"), ProductId::new("pro.monthly")]
}

/// Load a JSON snapshot file (wire format) into verification results.
pub fn load_snapshot_json(path: &str) -> Result<Vec<VerificationResult>> {
    let s = fs::read_to_string(path).with_context(|| format!("read snapshot: {path}"))?;
    let snapshot = snapshot_adapter::normalize_json(&s)
        .map_err(|e| anyhow::anyhow!("parse snapshot json: {e}"))?;
    Ok(snapshot.entries)
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct HarnessBuilder {
    provider: PaperProvider,
    marker: Option<DateTime<Utc>>,
    policy: SelectionPolicy,
}

impl HarnessBuilder {
    pub fn entitlements(self, entries: Vec<VerificationResult>) -> Self {
        self.provider.set_entitlements(entries);
        self
    }

    /// Pre-existing cached expiration, as left by an earlier session.
    pub fn marker(mut self, expires_at: DateTime<Utc>) -> Self {
        self.marker = Some(expires_at);
        self
    }

    pub fn policy(mut self, policy: SelectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Configure the provider before the store's startup pass sees it.
    pub fn with_provider(self, f: impl FnOnce(&PaperProvider)) -> Self {
        f(&self.provider);
        self
    }

    /// Start the store and wait for its startup task (catalog + first pass).
    pub async fn start(self) -> Result<Harness> {
        let provider = Arc::new(self.provider);
        let store = Arc::new(MemoryStore::new());
        let reporter = Arc::new(MemoryAnomalyReporter::new());
        let clock = Arc::new(FixedClock::new(t0()));

        if let Some(marker) = self.marker {
            ExpirationCache::new(store.clone())
                .write(Some(marker))
                .context("seed cached expiration")?;
        }

        let handle = EntitlementStore::builder(provider.clone())
            .cache_store(store.clone())
            .reporter(reporter.clone())
            .clock(clock.clone())
            .policy(self.policy)
            .product_ids(default_product_ids())
            .start();

        handle
            .startup_complete()
            .await
            .context("store startup failed")?;

        Ok(Harness {
            provider,
            store,
            reporter,
            clock,
            handle,
        })
    }
}

/// A running store over deterministic collaborators.
pub struct Harness {
    pub provider: Arc<PaperProvider>,
    pub store: Arc<MemoryStore>,
    pub reporter: Arc<MemoryAnomalyReporter>,
    pub clock: Arc<FixedClock>,
    pub handle: StoreHandle,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        let provider = PaperProvider::from_catalog(
            default_catalog()
                .iter()
                .map(|e| (e.to_product(), e.period_days)),
        );
        provider.set_now(t0());
        HarnessBuilder {
            provider,
            marker: None,
            policy: SelectionPolicy::default(),
        }
    }

    pub fn cache(&self) -> ExpirationCache<Arc<MemoryStore>> {
        ExpirationCache::new(self.store.clone())
    }

    pub fn marker(&self) -> Option<DateTime<Utc>> {
        self.cache().read().ok().flatten()
    }

    pub fn status(&self) -> StoreStatus {
        self.handle.status()
    }

    /// Wait until at least `n` reconciliation passes have completed.
    pub async fn wait_for_passes(&self, n: u64) -> Result<StoreStatus> {
        let mut rx = self.handle.watch();
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if rx.borrow_and_update().passes >= n {
                    return Ok(rx.borrow().clone());
                }
                if rx.changed().await.is_err() {
                    bail!("store stopped before {n} passes");
                }
            }
        })
        .await;
        match waited {
            Ok(res) => res,
            Err(_) => bail!("timed out waiting for {n} passes"),
        }
    }

    /// Let the owner drain everything queued so far (finalize calls included).
    pub async fn settle(&self) -> Result<StoreStatus> {
        self.handle.sync().await.context("store stopped")
    }

    pub async fn shutdown(self) {
        self.handle.shutdown().await;
    }
}
