//! Request and response types for all ent-daemon HTTP endpoints.
//!
//! These types are `Serialize + Deserialize` so they can be JSON-encoded
//! by Axum and decoded by tests.  No business logic lives here.

use serde::{Deserialize, Serialize};

use ent_runtime::StoreStatus;
use ent_schemas::Product;

// ---------------------------------------------------------------------------
// /v1/health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: String,
    pub version: String,
}

// ---------------------------------------------------------------------------
// /v1/status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub daemon_uptime_secs: u64,
    /// SHA-256 of the canonical config the daemon booted with, if any.
    pub config_hash: Option<String>,
    pub provider: String,
    #[serde(flatten)]
    pub store: StoreStatus,
}

// ---------------------------------------------------------------------------
// /v1/products
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductView {
    pub id: String,
    pub display_name: String,
    pub description: String,
    pub price_micros: i64,
    pub currency: String,
    /// e.g. "49.99 USD"
    pub display_price: String,
}

impl From<&Product> for ProductView {
    fn from(p: &Product) -> Self {
        Self {
            id: p.id.to_string(),
            display_name: p.display_name.clone(),
            description: p.description.clone(),
            price_micros: p.price_micros,
            currency: p.currency.clone(),
            display_price: p.display_price(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductsResponse {
    pub products: Vec<ProductView>,
}

// ---------------------------------------------------------------------------
// /v1/purchase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseRequest {
    pub product_id: String,
}

// ---------------------------------------------------------------------------
// /v1/reconcile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileResponse {
    pub has_active_subscription: bool,
    pub verified_count: usize,
    pub unverified_count: usize,
    /// Anomaly kinds raised by this pass, in report order.
    pub anomalies: Vec<String>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
