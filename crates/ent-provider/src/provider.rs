//! Provider boundary for entitlement queries, purchases and the live
//! transaction update stream.
//!
//! This module defines **only** the trait and its error type. No concrete
//! SDK bindings belong here.

use std::fmt;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use ent_schemas::{Product, ProductId, PurchaseOutcome, TransactionId, VerificationResult};

/// Live, unbounded, strictly ordered stream of verification results.
pub type UpdateStream = BoxStream<'static, VerificationResult>;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that a [`PaymentProvider`] implementation may return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Network or transport failure.
    Transport(String),
    /// The provider returned an application-level error.
    Api { code: Option<i64>, message: String },
    /// The requested product id is not known to the provider.
    UnknownProduct(ProductId),
    /// A response payload could not be decoded.
    Decode(String),
    /// Provider configuration is missing or invalid.
    Config(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Transport(msg) => write!(f, "transport error: {msg}"),
            ProviderError::Api {
                code: Some(c),
                message,
            } => write!(f, "provider api error code={c}: {message}"),
            ProviderError::Api {
                code: None,
                message,
            } => write!(f, "provider api error: {message}"),
            ProviderError::UnknownProduct(id) => write!(f, "unknown product '{id}'"),
            ProviderError::Decode(msg) => write!(f, "decode error: {msg}"),
            ProviderError::Config(msg) => write!(f, "config error: {msg}"),
        }
    }
}

impl std::error::Error for ProviderError {}

// ---------------------------------------------------------------------------
// Provider trait
// ---------------------------------------------------------------------------

/// Payment-provider contract.
///
/// Object-safe so the runtime can hold an `Arc<dyn PaymentProvider>`, and
/// `Send + Sync` so it can be shared between the owner task and the update
/// listener task.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Human-readable name (e.g. `"paper"`).
    fn name(&self) -> &'static str;

    /// One-shot query: every transaction currently conferring entitlement, in
    /// provider iteration order.
    async fn current_entitlements(&self) -> Result<Vec<VerificationResult>, ProviderError>;

    /// The live update stream. Not restartable: implementations hand out the
    /// stream once; later calls may return an empty stream.
    fn updates(&self) -> UpdateStream;

    /// Issue a purchase request and wait for its outcome class.
    async fn purchase(&self, product: &ProductId) -> Result<PurchaseOutcome, ProviderError>;

    /// Catalog query for the given ids, in provider order.
    async fn products(&self, ids: &[ProductId]) -> Result<Vec<Product>, ProviderError>;

    /// Acknowledge a transaction so it is not redelivered as unfinished.
    /// Fire-and-forget: implementations log their own failures.
    async fn finish(&self, transaction: &TransactionId);
}
