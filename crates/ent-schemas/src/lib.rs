//! ent-schemas
//!
//! Shared domain types crossing crate boundaries: transactions, verification
//! results, purchase outcomes and catalog products.
//!
//! These types carry no behaviour beyond small accessors. Reconciliation
//! logic lives in `ent-reconcile`; provider wiring lives in `ent-provider`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Micros scale (1e-6) used for catalog prices.
pub const MICROS_SCALE: i64 = 1_000_000;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Stable product identifier as registered with the payment provider
/// (e.g. `"pro.annual"`).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(String);

impl ProductId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProductId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Provider-assigned transaction identifier.
///
/// Doubles as the acknowledgment handle: finishing a transaction means
/// handing this id back to the provider that issued it.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(String);

impl TransactionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransactionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ---------------------------------------------------------------------------
// Transaction + verification
// ---------------------------------------------------------------------------

/// A purchase transaction as delivered by the payment provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub product_id: ProductId,
    pub purchased_at: DateTime<Utc>,
    /// `None` for entitlements that never expire.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Transaction {
    pub fn new(
        id: impl Into<String>,
        product_id: impl Into<String>,
        purchased_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: TransactionId::new(id),
            product_id: ProductId::new(product_id),
            purchased_at,
            expires_at,
        }
    }

    /// Handle used to acknowledge (finish) this transaction with its provider.
    pub fn ack_handle(&self) -> &TransactionId {
        &self.id
    }
}

/// Why the provider could not verify a transaction. Opaque to the core: it is
/// reported and surfaced, never interpreted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum VerificationError {
    InvalidSignature,
    InvalidEncoding,
    InvalidCertificateChain,
    RevokedCertificate,
    Other(String),
}

impl fmt::Display for VerificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSignature => write!(f, "transaction signature is invalid"),
            Self::InvalidEncoding => write!(f, "transaction payload is not decodable"),
            Self::InvalidCertificateChain => write!(f, "signing certificate chain is invalid"),
            Self::RevokedCertificate => write!(f, "signing certificate was revoked"),
            Self::Other(msg) => write!(f, "verification failed: {msg}"),
        }
    }
}

impl std::error::Error for VerificationError {}

/// A transaction classified by the provider as verified or not.
///
/// Exactly one arm is populated: a verified result never carries an error.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VerificationResult {
    Verified {
        transaction: Transaction,
    },
    Unverified {
        transaction: Transaction,
        error: VerificationError,
    },
}

impl VerificationResult {
    pub fn verified(transaction: Transaction) -> Self {
        Self::Verified { transaction }
    }

    pub fn unverified(transaction: Transaction, error: VerificationError) -> Self {
        Self::Unverified { transaction, error }
    }

    pub fn transaction(&self) -> &Transaction {
        match self {
            Self::Verified { transaction } | Self::Unverified { transaction, .. } => transaction,
        }
    }

    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified { .. })
    }
}

// ---------------------------------------------------------------------------
// Purchase outcome
// ---------------------------------------------------------------------------

/// Result class of a single purchase request.
///
/// Marked `#[non_exhaustive]`: providers may grow new outcome classes, and
/// consumers must keep a default arm for them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
#[non_exhaustive]
pub enum PurchaseOutcome {
    Success { result: VerificationResult },
    /// Deferred by the provider (e.g. awaiting external approval). Surfaces
    /// later through the updates stream.
    Pending,
    UserCancelled,
    /// Outcome class the provider reported but this build does not know.
    Unrecognized { raw: String },
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// A purchasable product as returned by the provider catalog query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    /// Price in micros of `currency` (1.00 == 1_000_000).
    pub price_micros: i64,
    pub currency: String,
}

impl Product {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        price_micros: i64,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            id: ProductId::new(id),
            display_name: display_name.into(),
            description: String::new(),
            price_micros,
            currency: currency.into(),
        }
    }

    /// Human-readable price, e.g. `"49.99 USD"`.
    pub fn display_price(&self) -> String {
        let whole = self.price_micros / MICROS_SCALE;
        let cents = (self.price_micros % MICROS_SCALE).abs() / 10_000;
        format!("{whole}.{cents:02} {}", self.currency)
    }
}
