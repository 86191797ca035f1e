//! ent-provider
//!
//! Boundary to the payment-provider SDK plus a deterministic in-memory
//! implementation.
//!
//! The provider is an external collaborator: it performs purchases, verifies
//! transactions and delivers them already classified. This crate owns only
//! the trait the runtime programs against ([`PaymentProvider`]) and the
//! [`PaperProvider`] used by the daemon's sandbox mode and by tests.

pub mod paper;
pub mod provider;

pub use paper::{PaperProvider, ProviderCall, PurchaseScript};
pub use provider::{PaymentProvider, ProviderError, UpdateStream};
