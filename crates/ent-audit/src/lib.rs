//! ent-audit
//!
//! Anomaly reporting sinks.
//!
//! Reporting is fire-and-forget: [`AnomalyReporter::report`] returns nothing
//! and must never fail or block a reconciliation pass. Sinks that do IO log
//! their own failures and move on.
//!
//! The durable sink is a hash-chained JSON Lines log ([`AuditWriter`]) so that
//! edits to the anomaly history itself are detectable with
//! [`verify_hash_chain`].

mod writer;

pub use writer::{verify_hash_chain, verify_hash_chain_str, AuditEvent, AuditWriter, VerifyResult};

use std::path::Path;
use std::sync::{Arc, Mutex};

use ent_reconcile::Anomaly;
use tracing::warn;
use uuid::Uuid;

/// Topic stamped on every anomaly event in the audit log.
pub const ANOMALY_TOPIC: &str = "entitlement.anomaly";

/// Sink for the two anomaly kinds raised by reconciliation.
pub trait AnomalyReporter: Send + Sync {
    fn report(&self, anomaly: &Anomaly);
}

impl<R: AnomalyReporter + ?Sized> AnomalyReporter for Arc<R> {
    fn report(&self, anomaly: &Anomaly) {
        (**self).report(anomaly)
    }
}

// ---------------------------------------------------------------------------
// Tracing sink
// ---------------------------------------------------------------------------

/// Emits each anomaly as a structured `warn!` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAnomalyReporter;

impl AnomalyReporter for TracingAnomalyReporter {
    fn report(&self, anomaly: &Anomaly) {
        match anomaly {
            Anomaly::UnverifiedTransaction {
                transaction_id,
                product_id,
                error,
            } => warn!(
                kind = anomaly.kind(),
                transaction_id = %transaction_id,
                product_id = %product_id,
                error = %error,
                "unverified transaction in entitlement snapshot"
            ),
            Anomaly::MissingTransaction { cached_expires_at } => warn!(
                kind = anomaly.kind(),
                cached_expires_at = %cached_expires_at,
                "cached entitlement still valid but no verified transaction found"
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Audit log sink
// ---------------------------------------------------------------------------

/// Appends each anomaly to a JSONL audit log.
pub struct AuditAnomalyReporter {
    writer: Mutex<AuditWriter>,
}

impl AuditAnomalyReporter {
    pub fn open(path: impl AsRef<Path>, hash_chain: bool) -> anyhow::Result<Self> {
        let writer = AuditWriter::open(path, hash_chain, Uuid::new_v4())?;
        Ok(Self {
            writer: Mutex::new(writer),
        })
    }

    pub fn from_writer(writer: AuditWriter) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl AnomalyReporter for AuditAnomalyReporter {
    fn report(&self, anomaly: &Anomaly) {
        let payload = match serde_json::to_value(anomaly) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "anomaly not serializable; dropped from audit log");
                return;
            }
        };
        let Ok(mut writer) = self.writer.lock() else {
            warn!("audit writer lock poisoned; anomaly dropped from audit log");
            return;
        };
        if let Err(e) = writer.append(ANOMALY_TOPIC, anomaly.kind(), payload) {
            warn!(error = %e, path = ?writer.path(), "audit append failed");
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory sink
// ---------------------------------------------------------------------------

/// Records anomalies in memory. Used by tests and the offline CLI reconcile.
#[derive(Debug, Default)]
pub struct MemoryAnomalyReporter {
    seen: Mutex<Vec<Anomaly>>,
}

impl MemoryAnomalyReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn anomalies(&self) -> Vec<Anomaly> {
        self.seen.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn count_kind(&self, kind: &str) -> usize {
        self.anomalies().iter().filter(|a| a.kind() == kind).count()
    }

    pub fn missing_count(&self) -> usize {
        self.count_kind("missing_transaction")
    }

    pub fn unverified_count(&self) -> usize {
        self.count_kind("unverified_transaction")
    }
}

impl AnomalyReporter for MemoryAnomalyReporter {
    fn report(&self, anomaly: &Anomaly) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(anomaly.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

/// Forwards every anomaly to each inner sink, in order.
#[derive(Default)]
pub struct FanoutAnomalyReporter {
    sinks: Vec<Arc<dyn AnomalyReporter>>,
}

impl FanoutAnomalyReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn AnomalyReporter>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl AnomalyReporter for FanoutAnomalyReporter {
    fn report(&self, anomaly: &Anomaly) {
        for sink in &self.sinks {
            sink.report(anomaly);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn missing() -> Anomaly {
        Anomaly::MissingTransaction {
            cached_expires_at: Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let a = Arc::new(MemoryAnomalyReporter::new());
        let b = Arc::new(MemoryAnomalyReporter::new());
        let fan = FanoutAnomalyReporter::new()
            .with(a.clone())
            .with(b.clone())
            .with(Arc::new(TracingAnomalyReporter));

        fan.report(&missing());

        assert_eq!(a.missing_count(), 1);
        assert_eq!(b.missing_count(), 1);
    }

    #[test]
    fn audit_sink_swallows_io_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anomalies.jsonl");
        let reporter = AuditAnomalyReporter::open(&path, true).unwrap();
        // Replace the log with a directory so the next append fails.
        std::fs::create_dir(&path).unwrap();
        reporter.report(&missing());
    }
}
