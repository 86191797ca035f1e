//! Scenario: Anomaly Log Hash Chain
//!
//! # Invariants under test
//!
//! 1. Anomalies appended through `AuditAnomalyReporter` form a valid chain.
//! 2. Editing a recorded anomaly in the file breaks the chain at that line.
//! 3. Reopening the log (process restart) extends the existing chain instead
//!    of starting a new one.
//! 4. Event types match the anomaly kind.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use ent_audit::{verify_hash_chain, AnomalyReporter, AuditAnomalyReporter, AuditEvent, VerifyResult};
use ent_reconcile::Anomaly;
use ent_schemas::{ProductId, TransactionId, VerificationError};

fn unverified(id: &str) -> Anomaly {
    Anomaly::UnverifiedTransaction {
        transaction_id: TransactionId::new(id),
        product_id: ProductId::new("pro.monthly"),
        error: VerificationError::InvalidSignature,
    }
}

fn missing() -> Anomaly {
    Anomaly::MissingTransaction {
        cached_expires_at: Utc.with_ymd_and_hms(2027, 5, 5, 0, 0, 0).unwrap(),
    }
}

fn read_events(path: &std::path::Path) -> Vec<AuditEvent> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

#[test]
fn reported_anomalies_form_valid_chain() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("anomalies.jsonl");

    let reporter = Arc::new(AuditAnomalyReporter::open(&path, true).unwrap());
    reporter.report(&unverified("t1"));
    reporter.report(&missing());
    reporter.report(&unverified("t2"));

    assert_eq!(
        verify_hash_chain(&path).unwrap(),
        VerifyResult::Valid { lines: 3 }
    );

    let events = read_events(&path);
    let kinds: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        kinds,
        vec![
            "unverified_transaction",
            "missing_transaction",
            "unverified_transaction"
        ]
    );
}

#[test]
fn edited_anomaly_breaks_chain() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("anomalies.jsonl");

    let reporter = AuditAnomalyReporter::open(&path, true).unwrap();
    reporter.report(&unverified("t1"));
    reporter.report(&missing());
    reporter.report(&unverified("t2"));
    drop(reporter);

    let content = std::fs::read_to_string(&path).unwrap();
    let tampered: Vec<String> = content
        .lines()
        .enumerate()
        .map(|(i, l)| {
            if i == 1 {
                l.replace("2027-05-05", "2020-05-05")
            } else {
                l.to_string()
            }
        })
        .collect();
    std::fs::write(&path, tampered.join("\n") + "\n").unwrap();

    match verify_hash_chain(&path).unwrap() {
        VerifyResult::Broken { line, .. } => assert_eq!(line, 2),
        other => panic!("expected broken chain, got {other:?}"),
    }
}

#[test]
fn reopen_extends_existing_chain() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("anomalies.jsonl");

    {
        let first = AuditAnomalyReporter::open(&path, true).unwrap();
        first.report(&missing());
        first.report(&unverified("t1"));
    }
    {
        let second = AuditAnomalyReporter::open(&path, true).unwrap();
        second.report(&missing());
    }

    assert_eq!(
        verify_hash_chain(&path).unwrap(),
        VerifyResult::Valid { lines: 3 }
    );
    let events = read_events(&path);
    assert_eq!(events[2].seq, 2);
    assert_ne!(
        events[0].session_id, events[2].session_id,
        "each open is its own session"
    );
}
