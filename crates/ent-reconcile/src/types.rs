use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ent_schemas::{ProductId, Transaction, TransactionId, VerificationError, VerificationResult};

/// All transactions currently conferring entitlement, in provider iteration
/// order. Recomputed for every pass; never persisted as a whole.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementSnapshot {
    pub entries: Vec<VerificationResult>,
}

impl EntitlementSnapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(entries: Vec<VerificationResult>) -> Self {
        Self { entries }
    }

    pub fn push(&mut self, entry: VerificationResult) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Split into verified transactions and unverified (transaction, error)
    /// pairs, both in snapshot order.
    pub fn partition(&self) -> (Vec<&Transaction>, Vec<(&Transaction, &VerificationError)>) {
        let mut verified = Vec::new();
        let mut unverified = Vec::new();
        for entry in &self.entries {
            match entry {
                VerificationResult::Verified { transaction } => verified.push(transaction),
                VerificationResult::Unverified { transaction, error } => {
                    unverified.push((transaction, error))
                }
            }
        }
        (verified, unverified)
    }
}

impl From<Vec<VerificationResult>> for EntitlementSnapshot {
    fn from(entries: Vec<VerificationResult>) -> Self {
        Self::new(entries)
    }
}

/// How the representative transaction is chosen when several verified
/// transactions are present (e.g. two concurrently active tiers).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// First verified entry in snapshot iteration order.
    #[default]
    FirstInSnapshot,
    /// Latest expiration wins; a non-expiring transaction beats any dated one.
    LatestExpiring,
    /// Soonest expiration wins; non-expiring transactions only win when no
    /// dated transaction exists.
    SoonestExpiring,
}

impl SelectionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionPolicy::FirstInSnapshot => "first_in_snapshot",
            SelectionPolicy::LatestExpiring => "latest_expiring",
            SelectionPolicy::SoonestExpiring => "soonest_expiring",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first_in_snapshot" | "first" => Some(SelectionPolicy::FirstInSnapshot),
            "latest_expiring" | "latest" => Some(SelectionPolicy::LatestExpiring),
            "soonest_expiring" | "soonest" => Some(SelectionPolicy::SoonestExpiring),
            _ => None,
        }
    }
}

/// A non-fatal divergence observed during a pass.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Anomaly {
    /// The provider could not verify a transaction in the snapshot.
    UnverifiedTransaction {
        transaction_id: TransactionId,
        product_id: ProductId,
        error: VerificationError,
    },
    /// The cache says an entitlement should still be valid but the snapshot
    /// has no verified transaction. Tamper / data-loss signal.
    MissingTransaction { cached_expires_at: DateTime<Utc> },
}

impl Anomaly {
    pub fn kind(&self) -> &'static str {
        match self {
            Anomaly::UnverifiedTransaction { .. } => "unverified_transaction",
            Anomaly::MissingTransaction { .. } => "missing_transaction",
        }
    }
}

/// What the caller must do with the cached expiration marker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "expires_at", rename_all = "snake_case")]
pub enum CacheDecision {
    /// Leave the marker exactly as it is (no verified transaction).
    Keep,
    /// Overwrite the marker. `None` means "never expires" and clears it.
    Write(Option<DateTime<Utc>>),
}

impl CacheDecision {
    pub fn is_write(&self) -> bool {
        matches!(self, CacheDecision::Write(_))
    }
}

/// Full result of one reconciliation pass.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub has_active_subscription: bool,
    /// Transaction whose expiration feeds the cache, if any was verified.
    pub representative: Option<Transaction>,
    /// Unverified anomalies in snapshot order, then at most one missing anomaly.
    pub anomalies: Vec<Anomaly>,
    pub cache: CacheDecision,
    /// Every verified transaction in the snapshot, in snapshot order.
    pub finalize: Vec<TransactionId>,
    pub verified_count: usize,
    pub unverified_count: usize,
}

impl ReconcileReport {
    pub fn missing_transaction_reported(&self) -> bool {
        self.anomalies
            .iter()
            .any(|a| matches!(a, Anomaly::MissingTransaction { .. }))
    }
}
