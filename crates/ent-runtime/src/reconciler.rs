//! Side-effecting half of a reconciliation pass.
//!
//! The decision comes from [`ent_reconcile::reconcile_with_policy`]; this
//! module reads the marker, reports anomalies, writes the marker and
//! finalizes transactions. Nothing here fails the pass: storage and sink
//! errors are logged and the pass carries on.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use ent_audit::AnomalyReporter;
use ent_cache::{ExpirationCache, KeyValueStore};
use ent_provider::{PaymentProvider, ProviderError};
use ent_reconcile::{
    reconcile_with_policy, CacheDecision, EntitlementSnapshot, ReconcileReport, SelectionPolicy,
};

use crate::clock::Clock;
use crate::status::BusMsg;

pub struct Reconciler {
    provider: Arc<dyn PaymentProvider>,
    cache: ExpirationCache<Arc<dyn KeyValueStore>>,
    reporter: Arc<dyn AnomalyReporter>,
    clock: Arc<dyn Clock>,
    policy: SelectionPolicy,
    bus: Option<broadcast::Sender<BusMsg>>,
}

impl Reconciler {
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        cache_store: Arc<dyn KeyValueStore>,
        reporter: Arc<dyn AnomalyReporter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            provider,
            cache: ExpirationCache::new(cache_store),
            reporter,
            clock,
            policy: SelectionPolicy::default(),
            bus: None,
        }
    }

    pub fn with_policy(mut self, policy: SelectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Mirror anomalies and pass summaries onto an event bus.
    pub fn with_bus(mut self, bus: broadcast::Sender<BusMsg>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn provider(&self) -> &Arc<dyn PaymentProvider> {
        &self.provider
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Fetch a fresh snapshot from the provider and apply it.
    ///
    /// A failed snapshot query leaves marker, anomalies and finalization
    /// untouched.
    pub async fn run_pass(&self) -> Result<ReconcileReport, ProviderError> {
        let entries = match self.provider.current_entitlements().await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(
                    provider = self.provider.name(),
                    error = %err,
                    "entitlement snapshot query failed"
                );
                self.emit(BusMsg::log(
                    "WARN",
                    format!("entitlement snapshot query failed: {err}"),
                ));
                return Err(err);
            }
        };
        Ok(self.apply(&EntitlementSnapshot::new(entries)).await)
    }

    /// Apply one snapshot: report, write marker, finalize.
    pub async fn apply(&self, snapshot: &EntitlementSnapshot) -> ReconcileReport {
        let cached = match self.cache.read() {
            Ok(v) => v,
            Err(err) => {
                warn!(error = %err, "cached expiration unreadable; treating as absent");
                None
            }
        };

        let now = self.clock.now();
        let report = reconcile_with_policy(snapshot, cached, now, self.policy);

        for anomaly in &report.anomalies {
            self.reporter.report(anomaly);
            self.emit(BusMsg::Anomaly(anomaly.clone()));
        }

        if let CacheDecision::Write(expires_at) = &report.cache {
            if let Err(err) = self.cache.write(*expires_at) {
                warn!(error = %err, "failed to persist cached expiration");
            }
        }

        for id in &report.finalize {
            debug!(transaction_id = %id, "finalize");
            self.provider.finish(id).await;
        }

        info!(
            verified = report.verified_count,
            unverified = report.unverified_count,
            active = report.has_active_subscription,
            cache = ?report.cache,
            anomalies = report.anomalies.len(),
            "reconciliation pass complete"
        );
        self.emit(BusMsg::log(
            "INFO",
            format!(
                "reconciled: active={} verified={} unverified={}",
                report.has_active_subscription, report.verified_count, report.unverified_count
            ),
        ));

        report
    }

    fn emit(&self, msg: BusMsg) {
        if let Some(bus) = &self.bus {
            // No subscribers is not an error.
            let _ = bus.send(msg);
        }
    }
}
