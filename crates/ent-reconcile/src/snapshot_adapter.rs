//! Snapshot adapter: deserialize the provider's entitlement snapshot wire
//! format and normalize it to [`EntitlementSnapshot`].
//!
//! # Wire format
//! ```json
//! { "entries": [
//!     { "status": "verified", "transaction_id": "t1", "product_id": "pro.annual",
//!       "purchased_at": "2026-01-01T00:00:00Z", "expires_at": "2027-01-01T00:00:00Z" },
//!     { "status": "unverified", "transaction_id": "t2", "product_id": "pro.monthly",
//!       "purchased_at": "2026-01-01T00:00:00Z", "error": "invalid_signature" }
//! ] }
//! ```
//!
//! Pure conversion. Unknown JSON fields are ignored so provider additions do
//! not break deserialization. A verified entry must not carry an error and an
//! unverified entry must carry one; violations are normalization errors.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use ent_schemas::{Transaction, VerificationError, VerificationResult};

use crate::EntitlementSnapshot;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotAdapterError {
    MissingTransactionId,
    MissingProductId { transaction_id: String },
    UnknownStatus { transaction_id: String, raw: String },
    BadTimestamp {
        transaction_id: String,
        field: &'static str,
        raw: String,
    },
    VerifiedWithError { transaction_id: String },
    UnverifiedWithoutError { transaction_id: String },
}

impl std::fmt::Display for SnapshotAdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingTransactionId => write!(f, "snapshot entry has empty transaction_id"),
            Self::MissingProductId { transaction_id } => {
                write!(f, "snapshot entry '{transaction_id}' has empty product_id")
            }
            Self::UnknownStatus {
                transaction_id,
                raw,
            } => write!(
                f,
                "snapshot entry '{transaction_id}' has unrecognised status '{raw}'"
            ),
            Self::BadTimestamp {
                transaction_id,
                field,
                raw,
            } => write!(
                f,
                "snapshot entry '{transaction_id}' has unparseable {field} '{raw}'"
            ),
            Self::VerifiedWithError { transaction_id } => write!(
                f,
                "snapshot entry '{transaction_id}' is verified but carries an error"
            ),
            Self::UnverifiedWithoutError { transaction_id } => write!(
                f,
                "snapshot entry '{transaction_id}' is unverified but carries no error"
            ),
        }
    }
}

impl std::error::Error for SnapshotAdapterError {}

// ---------------------------------------------------------------------------
// Raw wire-level structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RawSnapshotEntry {
    /// `"verified"` | `"unverified"` (case-insensitive).
    pub status: String,
    pub transaction_id: String,
    pub product_id: String,
    /// RFC 3339.
    pub purchased_at: String,
    /// RFC 3339; absent or null for non-expiring entitlements.
    #[serde(default)]
    pub expires_at: Option<String>,
    /// Verification failure reason; required iff `status == "unverified"`.
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawSnapshot {
    pub entries: Vec<RawSnapshotEntry>,
}

// ---------------------------------------------------------------------------
// Normalization helpers
// ---------------------------------------------------------------------------

fn parse_ts(
    transaction_id: &str,
    field: &'static str,
    raw: &str,
) -> Result<DateTime<Utc>, SnapshotAdapterError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| SnapshotAdapterError::BadTimestamp {
            transaction_id: transaction_id.to_string(),
            field,
            raw: raw.to_string(),
        })
}

fn normalize_error(raw: &str) -> VerificationError {
    match raw.trim().to_ascii_lowercase().as_str() {
        "invalid_signature" | "bad_signature" => VerificationError::InvalidSignature,
        "invalid_encoding" => VerificationError::InvalidEncoding,
        "invalid_certificate_chain" | "invalid_chain" => {
            VerificationError::InvalidCertificateChain
        }
        "revoked_certificate" | "revoked" => VerificationError::RevokedCertificate,
        _ => VerificationError::Other(raw.trim().to_string()),
    }
}

fn normalize_entry(raw: RawSnapshotEntry) -> Result<VerificationResult, SnapshotAdapterError> {
    let transaction_id = raw.transaction_id.trim().to_string();
    if transaction_id.is_empty() {
        return Err(SnapshotAdapterError::MissingTransactionId);
    }
    let product_id = raw.product_id.trim().to_string();
    if product_id.is_empty() {
        return Err(SnapshotAdapterError::MissingProductId { transaction_id });
    }

    let purchased_at = parse_ts(&transaction_id, "purchased_at", &raw.purchased_at)?;
    let expires_at = match raw.expires_at.as_deref() {
        Some(s) if !s.trim().is_empty() => Some(parse_ts(&transaction_id, "expires_at", s)?),
        _ => None,
    };
    let error = raw
        .error
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let status = raw.status.trim().to_ascii_lowercase();
    let transaction = Transaction::new(transaction_id.clone(), product_id, purchased_at, expires_at);

    match (status.as_str(), error) {
        ("verified", None) => Ok(VerificationResult::verified(transaction)),
        ("verified", Some(_)) => Err(SnapshotAdapterError::VerifiedWithError { transaction_id }),
        ("unverified", Some(e)) => Ok(VerificationResult::unverified(
            transaction,
            normalize_error(e),
        )),
        ("unverified", None) => {
            Err(SnapshotAdapterError::UnverifiedWithoutError { transaction_id })
        }
        _ => Err(SnapshotAdapterError::UnknownStatus {
            transaction_id,
            raw: raw.status,
        }),
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Normalize a raw snapshot, failing on the first malformed entry.
/// Entry order is preserved.
pub fn normalize(raw: RawSnapshot) -> Result<EntitlementSnapshot, SnapshotAdapterError> {
    let mut entries = Vec::with_capacity(raw.entries.len());
    for e in raw.entries {
        entries.push(normalize_entry(e)?);
    }
    Ok(EntitlementSnapshot::new(entries))
}

/// Lenient variant: skip malformed entries and return them as errors.
pub fn normalize_lenient(raw: RawSnapshot) -> (EntitlementSnapshot, Vec<SnapshotAdapterError>) {
    let mut entries = Vec::new();
    let mut errors = Vec::new();
    for e in raw.entries {
        match normalize_entry(e) {
            Ok(v) => entries.push(v),
            Err(err) => errors.push(err),
        }
    }
    (EntitlementSnapshot::new(entries), errors)
}

/// `json_str → RawSnapshot → EntitlementSnapshot`.
pub fn normalize_json(json: &str) -> Result<EntitlementSnapshot, Box<dyn std::error::Error>> {
    let raw: RawSnapshot = serde_json::from_str(json)?;
    let snap = normalize(raw)?;
    Ok(snap)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(status: &str, id: &str, expires: Option<&str>, error: Option<&str>) -> RawSnapshotEntry {
        RawSnapshotEntry {
            status: status.to_string(),
            transaction_id: id.to_string(),
            product_id: "pro.annual".to_string(),
            purchased_at: "2026-01-01T00:00:00Z".to_string(),
            expires_at: expires.map(str::to_string),
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn verified_entry_normalizes() {
        let v = normalize_entry(raw("Verified", "t1", Some("2027-01-01T00:00:00Z"), None)).unwrap();
        assert!(v.is_verified());
        assert!(v.transaction().expires_at.is_some());
    }

    #[test]
    fn empty_expires_is_non_expiring() {
        let v = normalize_entry(raw("verified", "t1", Some(""), None)).unwrap();
        assert_eq!(v.transaction().expires_at, None);
    }

    #[test]
    fn unverified_maps_known_reason() {
        let v = normalize_entry(raw("unverified", "t2", None, Some("revoked"))).unwrap();
        match v {
            VerificationResult::Unverified { error, .. } => {
                assert_eq!(error, VerificationError::RevokedCertificate)
            }
            other => panic!("expected unverified, got {other:?}"),
        }
    }

    #[test]
    fn unknown_reason_is_kept_verbatim() {
        let v = normalize_entry(raw("unverified", "t2", None, Some("clock_skew"))).unwrap();
        assert!(matches!(
            v,
            VerificationResult::Unverified { error: VerificationError::Other(ref s), .. } if s == "clock_skew"
        ));
    }

    #[test]
    fn both_arms_populated_is_rejected() {
        let err = normalize_entry(raw("verified", "t3", None, Some("invalid_signature")));
        assert!(matches!(err, Err(SnapshotAdapterError::VerifiedWithError { .. })));
    }

    #[test]
    fn unverified_without_reason_is_rejected() {
        let err = normalize_entry(raw("unverified", "t4", None, None));
        assert!(matches!(
            err,
            Err(SnapshotAdapterError::UnverifiedWithoutError { .. })
        ));
    }

    #[test]
    fn bad_timestamp_is_rejected() {
        let err = normalize_entry(raw("verified", "t5", Some("yesterday"), None));
        assert!(matches!(
            err,
            Err(SnapshotAdapterError::BadTimestamp { field: "expires_at", .. })
        ));
    }

    #[test]
    fn empty_transaction_id_is_rejected() {
        assert_eq!(
            normalize_entry(raw("verified", "  ", None, None)),
            Err(SnapshotAdapterError::MissingTransactionId)
        );
    }

    #[test]
    fn lenient_skips_bad_entries_and_keeps_order() {
        let snap = RawSnapshot {
            entries: vec![
                raw("verified", "a", None, None),
                raw("bogus", "b", None, None),
                raw("verified", "c", None, None),
            ],
        };
        let (ok, errs) = normalize_lenient(snap);
        assert_eq!(ok.len(), 2);
        assert_eq!(errs.len(), 1);
        assert_eq!(ok.entries[0].transaction().id.as_str(), "a");
        assert_eq!(ok.entries[1].transaction().id.as_str(), "c");
    }

    #[test]
    fn normalize_json_round_trip_from_wire() {
        let json = r#"{"entries":[
            {"status":"verified","transaction_id":"t1","product_id":"pro.annual",
             "purchased_at":"2026-01-01T00:00:00Z","expires_at":null,"extra":1}
        ]}"#;
        let snap = normalize_json(json).unwrap();
        assert_eq!(snap.len(), 1);
    }
}
