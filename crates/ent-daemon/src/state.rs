//! Shared runtime state for ent-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. Entitlement state is
//! owned by the store's actor; the daemon only holds a handle to it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::broadcast;
use tracing::info;

use ent_audit::{AnomalyReporter, AuditAnomalyReporter, FanoutAnomalyReporter, TracingAnomalyReporter};
use ent_cache::FileStore;
use ent_config::StoreConfig;
use ent_provider::PaperProvider;
use ent_runtime::{BusMsg, EntitlementStore, StoreHandle};
use ent_schemas::ProductId;

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

/// Static build metadata included in health / status responses.
#[derive(Clone, Debug)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub store: StoreHandle,
    pub build: BuildInfo,
    pub config_hash: Option<String>,
    pub provider: &'static str,
}

impl AppState {
    /// Wrap an already running store.
    pub fn new(store: StoreHandle, provider: &'static str) -> Self {
        Self {
            store,
            build: BuildInfo {
                service: "ent-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            config_hash: None,
            provider,
        }
    }

    pub fn with_config_hash(mut self, hash: impl Into<String>) -> Self {
        self.config_hash = Some(hash.into());
        self
    }

    /// Wire the paper provider, the file-backed marker and the anomaly sinks
    /// from config, then start the store.
    pub fn boot(cfg: &StoreConfig) -> anyhow::Result<Self> {
        let provider = Arc::new(PaperProvider::from_catalog(
            cfg.catalog.iter().map(|e| (e.to_product(), e.period_days)),
        ));
        let cache = FileStore::open(&cfg.cache_path)
            .with_context(|| format!("open cache store: {}", cfg.cache_path))?;
        let audit = AuditAnomalyReporter::open(&cfg.anomaly_log_path, cfg.hash_chain)
            .with_context(|| format!("open anomaly log: {}", cfg.anomaly_log_path))?;

        let reporter: Arc<dyn AnomalyReporter> = Arc::new(
            FanoutAnomalyReporter::new()
                .with(Arc::new(TracingAnomalyReporter))
                .with(Arc::new(audit)),
        );

        let store = EntitlementStore::builder(provider)
            .cache_store(Arc::new(cache))
            .reporter(reporter)
            .policy(cfg.selection_policy)
            .product_ids(cfg.product_ids.iter().map(ProductId::new).collect())
            .start();

        info!(
            cache = %cfg.cache_path,
            anomalies = %cfg.anomaly_log_path,
            policy = cfg.selection_policy.as_str(),
            "entitlement store wired"
        );
        Ok(Self::new(store, "paper"))
    }

    pub fn bus(&self) -> broadcast::Sender<BusMsg> {
        self.store.bus()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}

/// Spawn a background task that emits a heartbeat SSE every `interval`.
pub fn spawn_heartbeat(bus: broadcast::Sender<BusMsg>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ts = chrono::Utc::now().timestamp_millis();
            let _ = bus.send(BusMsg::Heartbeat { ts_millis: ts });
        }
    });
}
