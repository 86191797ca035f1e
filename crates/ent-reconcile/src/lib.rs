//! ent-reconcile
//!
//! Entitlement reconciliation engine.
//!
//! Given an entitlement snapshot (the provider's view of every transaction
//! currently conferring entitlement) and the locally cached expiration
//! marker, decide:
//! - whether an entitlement is active
//! - which anomalies to report (unverifiable entries, cache/source divergence)
//! - what the cache should hold after the pass
//! - which transactions to finalize
//!
//! Deterministic, pure logic. No IO. No provider calls. The caller
//! (`ent-runtime`) applies the returned decisions.

mod engine;
mod types;

pub mod snapshot_adapter;

pub use engine::{reconcile, reconcile_with_policy, select_representative};
pub use types::*;
