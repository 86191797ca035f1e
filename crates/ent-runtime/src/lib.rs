//! ent-runtime
//!
//! Owns all observable entitlement state and applies the side effects the
//! pure engine in `ent-reconcile` decides on.
//!
//! Concurrency model:
//! - one owner task (the actor) processes [`StoreHandle`] commands strictly
//!   one at a time: startup pass, manual refresh, each verified stream item,
//!   each purchase, catalog load
//! - the update listener is its own task but hands every item to the owner
//!   and waits for the pass (finalize included) before pulling the next one
//! - observers read state through a `watch` channel and follow events on a
//!   `broadcast` bus; nothing outside the owner mutates either
//!
//! Shutdown is cooperative: [`StoreHandle::shutdown`] stops the listener
//! between items and lets any in-flight command finish.

mod catalog;
mod clock;
mod listener;
mod reconciler;
mod status;
mod store;

pub use catalog::sort_catalog;
pub use clock::{Clock, FixedClock, SystemClock};
pub use reconciler::Reconciler;
pub use status::{BusMsg, PurchaseErrorAlert, StoreStatus};
pub use store::{EntitlementStore, StoreError, StoreHandle};
