//! Observable store state and event bus payloads.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use ent_reconcile::Anomaly;
use ent_schemas::{Product, ProductId, Transaction, VerificationError};

// ---------------------------------------------------------------------------
// PurchaseErrorAlert
// ---------------------------------------------------------------------------

/// Last purchase failure, surfaced to the UI instead of returned to the
/// caller. Stays set until dismissed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PurchaseErrorAlert {
    /// The purchase went through but the provider could not verify it.
    Unverified {
        product_id: ProductId,
        error: VerificationError,
    },
    /// The purchase request itself could not be issued or completed.
    Initiation {
        product_id: ProductId,
        message: String,
    },
}

impl fmt::Display for PurchaseErrorAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unverified { product_id, error } => {
                write!(f, "purchase of '{product_id}' could not be verified: {error}")
            }
            Self::Initiation {
                product_id,
                message,
            } => write!(f, "purchase of '{product_id}' failed: {message}"),
        }
    }
}

impl std::error::Error for PurchaseErrorAlert {}

// ---------------------------------------------------------------------------
// StoreStatus
// ---------------------------------------------------------------------------

/// Everything a UI observes. Published through a `watch` channel by the
/// owner task only.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStatus {
    /// True exactly while one purchase attempt is running.
    pub is_purchasing: bool,
    pub has_active_subscription: bool,
    /// Catalog, most expensive first.
    pub subscriptions: Vec<Product>,
    pub purchase_error_alert: Option<PurchaseErrorAlert>,
    /// Transaction whose expiration fed the cache on the last pass.
    pub representative: Option<Transaction>,
    pub last_reconciled_at: Option<DateTime<Utc>>,
    /// Completed reconciliation passes since start.
    pub passes: u64,
}

// ---------------------------------------------------------------------------
// BusMsg
// ---------------------------------------------------------------------------

/// Messages broadcast on the store's event bus (surfaced as SSE by the
/// daemon).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Heartbeat { ts_millis: i64 },
    Status(StoreStatus),
    Anomaly(Anomaly),
    LogLine { level: String, msg: String },
}

impl BusMsg {
    pub fn log(level: &str, msg: impl Into<String>) -> Self {
        BusMsg::LogLine {
            level: level.to_string(),
            msg: msg.into(),
        }
    }

    /// SSE event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            BusMsg::Heartbeat { .. } => "heartbeat",
            BusMsg::Status(_) => "status",
            BusMsg::Anomaly(_) => "anomaly",
            BusMsg::LogLine { .. } => "log",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_serializes_with_kind_tag() {
        let alert = PurchaseErrorAlert::Unverified {
            product_id: ProductId::new("pro.annual"),
            error: VerificationError::InvalidSignature,
        };
        let v = serde_json::to_value(&alert).unwrap();
        assert_eq!(v["kind"], "unverified");
        assert_eq!(v["product_id"], "pro.annual");
        assert!(alert.to_string().contains("could not be verified"));
    }

    #[test]
    fn bus_message_names_match_sse_events() {
        assert_eq!(BusMsg::log("INFO", "x").event_name(), "log");
        assert_eq!(
            BusMsg::Status(StoreStatus::default()).event_name(),
            "status"
        );
    }
}
