use chrono::{DateTime, Utc};

use ent_schemas::Transaction;

use crate::{Anomaly, CacheDecision, EntitlementSnapshot, ReconcileReport, SelectionPolicy};

/// Reconcile with the default [`SelectionPolicy::FirstInSnapshot`].
pub fn reconcile(
    snapshot: &EntitlementSnapshot,
    cached_expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> ReconcileReport {
    reconcile_with_policy(snapshot, cached_expires_at, now, SelectionPolicy::default())
}

/// Deterministic reconciliation:
/// - every unverified entry => `UnverifiedTransaction` anomaly (pass continues)
/// - active iff at least one verified entry
/// - cached marker strictly after `now` with zero verified => `MissingTransaction`
/// - at least one verified => write the representative's expiration,
///   otherwise keep the marker untouched
/// - every verified transaction is listed for finalize
pub fn reconcile_with_policy(
    snapshot: &EntitlementSnapshot,
    cached_expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    policy: SelectionPolicy,
) -> ReconcileReport {
    let (verified, unverified) = snapshot.partition();

    let mut anomalies: Vec<Anomaly> = unverified
        .iter()
        .map(|(txn, err)| Anomaly::UnverifiedTransaction {
            transaction_id: txn.id.clone(),
            product_id: txn.product_id.clone(),
            error: (*err).clone(),
        })
        .collect();

    let has_active_subscription = !verified.is_empty();

    // Marker is only consulted here; an absent marker means no prior entitlement.
    if let Some(cached) = cached_expires_at {
        if cached > now && verified.is_empty() {
            anomalies.push(Anomaly::MissingTransaction {
                cached_expires_at: cached,
            });
        }
    }

    let representative = select_representative(&verified, policy).cloned();
    let cache = match &representative {
        Some(txn) => CacheDecision::Write(txn.expires_at),
        None => CacheDecision::Keep,
    };

    let finalize = verified.iter().map(|t| t.id.clone()).collect();

    ReconcileReport {
        has_active_subscription,
        representative,
        anomalies,
        cache,
        finalize,
        verified_count: verified.len(),
        unverified_count: unverified.len(),
    }
}

/// Pick the transaction whose expiration becomes the cached marker.
///
/// Ties keep the earlier snapshot entry under every policy.
pub fn select_representative<'a>(
    verified: &[&'a Transaction],
    policy: SelectionPolicy,
) -> Option<&'a Transaction> {
    let mut best: Option<&'a Transaction> = None;
    for &candidate in verified {
        best = match best {
            None => Some(candidate),
            Some(current) => {
                if replaces(current, candidate, policy) {
                    Some(candidate)
                } else {
                    Some(current)
                }
            }
        };
    }
    best
}

/// True when `candidate` strictly beats `current` under `policy`.
fn replaces(current: &Transaction, candidate: &Transaction, policy: SelectionPolicy) -> bool {
    match policy {
        SelectionPolicy::FirstInSnapshot => false,
        SelectionPolicy::LatestExpiring => match (current.expires_at, candidate.expires_at) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(cur), Some(cand)) => cand > cur,
        },
        SelectionPolicy::SoonestExpiring => match (current.expires_at, candidate.expires_at) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(cur), Some(cand)) => cand < cur,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use ent_schemas::{VerificationError, VerificationResult};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn txn(id: &str, expires_in_days: Option<i64>) -> Transaction {
        Transaction::new(
            id,
            "pro.monthly",
            now() - Duration::days(1),
            expires_in_days.map(|d| now() + Duration::days(d)),
        )
    }

    fn verified(id: &str, days: Option<i64>) -> VerificationResult {
        VerificationResult::verified(txn(id, days))
    }

    fn unverified(id: &str) -> VerificationResult {
        VerificationResult::unverified(txn(id, Some(30)), VerificationError::InvalidSignature)
    }

    #[test]
    fn empty_snapshot_without_cache_is_inactive_and_quiet() {
        let r = reconcile(&EntitlementSnapshot::empty(), None, now());
        assert!(!r.has_active_subscription);
        assert!(r.anomalies.is_empty());
        assert_eq!(r.cache, CacheDecision::Keep);
        assert!(r.finalize.is_empty());
    }

    #[test]
    fn unverified_entries_are_reported_but_not_finalized() {
        let snap = EntitlementSnapshot::new(vec![unverified("u1"), unverified("u2")]);
        let r = reconcile(&snap, None, now());
        assert!(!r.has_active_subscription);
        assert_eq!(r.unverified_count, 2);
        assert_eq!(r.anomalies.len(), 2);
        assert!(r.finalize.is_empty());
        assert_eq!(r.cache, CacheDecision::Keep);
    }

    #[test]
    fn mixed_snapshot_reports_and_activates() {
        let snap = EntitlementSnapshot::new(vec![unverified("u1"), verified("v1", Some(10))]);
        let r = reconcile(&snap, None, now());
        assert!(r.has_active_subscription);
        assert_eq!(r.anomalies.len(), 1);
        assert_eq!(r.anomalies[0].kind(), "unverified_transaction");
        assert_eq!(r.finalize.len(), 1);
        assert_eq!(r.cache, CacheDecision::Write(Some(now() + Duration::days(10))));
    }

    #[test]
    fn marker_equal_to_now_counts_as_expired() {
        let r = reconcile(&EntitlementSnapshot::empty(), Some(now()), now());
        assert!(!r.missing_transaction_reported());
    }

    #[test]
    fn first_in_snapshot_keeps_first_even_if_later_expires_later() {
        let a = txn("a", Some(5));
        let b = txn("b", Some(50));
        let got = select_representative(&[&a, &b], SelectionPolicy::FirstInSnapshot);
        assert_eq!(got.map(|t| t.id.as_str()), Some("a"));
    }

    #[test]
    fn latest_expiring_prefers_non_expiring() {
        let a = txn("a", Some(5));
        let b = txn("b", None);
        let c = txn("c", Some(500));
        let got = select_representative(&[&a, &b, &c], SelectionPolicy::LatestExpiring);
        assert_eq!(got.map(|t| t.id.as_str()), Some("b"));
    }

    #[test]
    fn soonest_expiring_prefers_dated() {
        let a = txn("a", None);
        let b = txn("b", Some(40));
        let c = txn("c", Some(4));
        let got = select_representative(&[&a, &b, &c], SelectionPolicy::SoonestExpiring);
        assert_eq!(got.map(|t| t.id.as_str()), Some("c"));
    }

    #[test]
    fn ties_keep_earlier_entry() {
        let a = txn("a", Some(7));
        let b = txn("b", Some(7));
        for policy in [
            SelectionPolicy::FirstInSnapshot,
            SelectionPolicy::LatestExpiring,
            SelectionPolicy::SoonestExpiring,
        ] {
            let got = select_representative(&[&a, &b], policy);
            assert_eq!(got.map(|t| t.id.as_str()), Some("a"), "{policy:?}");
        }
    }

    #[test]
    fn non_expiring_representative_clears_marker() {
        let snap = EntitlementSnapshot::new(vec![verified("life", None)]);
        let r = reconcile(&snap, Some(now() + Duration::days(3)), now());
        assert_eq!(r.cache, CacheDecision::Write(None));
        assert!(!r.missing_transaction_reported());
    }
}
