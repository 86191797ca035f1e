//! Deterministic in-memory "paper" payment provider.
//!
//! - Transaction ids are `paper:txn:{seq}` with a per-provider counter.
//! - With no script queued, a purchase of a known product succeeds with a
//!   verified transaction that also joins the entitlement set.
//! - Scripted outcomes are consumed in FIFO order, one per purchase call.
//! - The update stream is handed out once; `push_update` feeds it.
//! - Every call is recorded in order, so tests can assert interleavings.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use ent_schemas::{
    Product, ProductId, PurchaseOutcome, Transaction, TransactionId, VerificationResult,
};

use crate::provider::{PaymentProvider, ProviderError, UpdateStream};

/// One recorded provider interaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProviderCall {
    CurrentEntitlements,
    Purchase(ProductId),
    Products(Vec<ProductId>),
    Finish(TransactionId),
}

/// Pre-programmed reply for the next purchase call.
#[derive(Clone, Debug)]
pub enum PurchaseScript {
    Outcome(PurchaseOutcome),
    Fail(ProviderError),
}

#[derive(Clone, Debug)]
struct PaperProduct {
    product: Product,
    period_days: Option<i64>,
}

#[derive(Default)]
struct PaperState {
    catalog: BTreeMap<ProductId, PaperProduct>,
    entitlements: Vec<VerificationResult>,
    scripts: VecDeque<PurchaseScript>,
    calls: Vec<ProviderCall>,
    next_txn: u64,
    now: Option<DateTime<Utc>>,
    snapshot_error: Option<ProviderError>,
    products_error: Option<ProviderError>,
    snapshot_delay: Option<Duration>,
    purchase_delay: Option<Duration>,
    products_delay: Option<Duration>,
}

pub struct PaperProvider {
    state: Mutex<PaperState>,
    updates_tx: mpsc::UnboundedSender<VerificationResult>,
    updates_rx: Mutex<Option<mpsc::UnboundedReceiver<VerificationResult>>>,
}

impl Default for PaperProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperProvider {
    pub fn new() -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(PaperState::default()),
            updates_tx,
            updates_rx: Mutex::new(Some(updates_rx)),
        }
    }

    /// Seed the catalog. Each product comes with the subscription length a
    /// purchase grants; `None` never expires.
    pub fn from_catalog(entries: impl IntoIterator<Item = (Product, Option<i64>)>) -> Self {
        let provider = Self::new();
        for (product, period_days) in entries {
            provider.add_product(product, period_days);
        }
        provider
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    fn lock(&self) -> MutexGuard<'_, PaperState> {
        // A panicking test thread must not wedge every later call.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    // -----------------------------------------------------------------------
    // Scenario wiring
    // -----------------------------------------------------------------------

    pub fn add_product(&self, product: Product, period_days: Option<i64>) {
        self.lock().catalog.insert(
            product.id.clone(),
            PaperProduct {
                product,
                period_days,
            },
        );
    }

    /// Replace the whole entitlement set (provider iteration order).
    pub fn set_entitlements(&self, entries: Vec<VerificationResult>) {
        self.lock().entitlements = entries;
    }

    pub fn add_entitlement(&self, entry: VerificationResult) {
        self.lock().entitlements.push(entry);
    }

    /// Drop a transaction from the entitlement set (refund / revocation).
    pub fn revoke(&self, id: &TransactionId) {
        self.lock()
            .entitlements
            .retain(|r| &r.transaction().id != id);
    }

    pub fn script_purchase(&self, script: PurchaseScript) {
        self.lock().scripts.push_back(script);
    }

    /// Deliver an item on the update stream.
    pub fn push_update(&self, result: VerificationResult) {
        // Receiver gone means nobody listens any more; dropping is correct.
        let _ = self.updates_tx.send(result);
    }

    /// Pin the clock used for generated transactions.
    pub fn set_now(&self, now: DateTime<Utc>) {
        self.lock().now = Some(now);
    }

    pub fn fail_snapshot(&self, err: Option<ProviderError>) {
        self.lock().snapshot_error = err;
    }

    pub fn fail_products(&self, err: Option<ProviderError>) {
        self.lock().products_error = err;
    }

    /// Simulated latency for the entitlement query.
    pub fn set_snapshot_delay(&self, delay: Option<Duration>) {
        self.lock().snapshot_delay = delay;
    }

    pub fn set_purchase_delay(&self, delay: Option<Duration>) {
        self.lock().purchase_delay = delay;
    }

    /// Simulated storefront latency for the catalog query.
    pub fn set_products_delay(&self, delay: Option<Duration>) {
        self.lock().products_delay = delay;
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    pub fn finished(&self) -> Vec<TransactionId> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                ProviderCall::Finish(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn entitlements(&self) -> Vec<VerificationResult> {
        self.lock().entitlements.clone()
    }

    fn mint_transaction(state: &mut PaperState, product: &PaperProduct) -> Transaction {
        state.next_txn += 1;
        let now = state.now.unwrap_or_else(Utc::now);
        let expires_at = product
            .period_days
            .map(|d| now + chrono::Duration::days(d));
        Transaction::new(
            format!("paper:txn:{}", state.next_txn),
            product.product.id.as_str(),
            now,
            expires_at,
        )
    }
}

#[async_trait]
impl PaymentProvider for PaperProvider {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn current_entitlements(&self) -> Result<Vec<VerificationResult>, ProviderError> {
        let delay = {
            let mut st = self.lock();
            st.calls.push(ProviderCall::CurrentEntitlements);
            st.snapshot_delay
        };
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }

        let st = self.lock();
        match &st.snapshot_error {
            Some(err) => Err(err.clone()),
            None => Ok(st.entitlements.clone()),
        }
    }

    fn updates(&self) -> UpdateStream {
        let rx = self
            .updates_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        match rx {
            Some(rx) => UnboundedReceiverStream::new(rx).boxed(),
            None => {
                tracing::warn!("paper provider update stream already taken");
                futures_util::stream::empty().boxed()
            }
        }
    }

    async fn purchase(&self, product: &ProductId) -> Result<PurchaseOutcome, ProviderError> {
        let delay = {
            let mut st = self.lock();
            st.calls.push(ProviderCall::Purchase(product.clone()));
            st.purchase_delay
        };
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }

        let mut st = self.lock();
        if let Some(script) = st.scripts.pop_front() {
            return match script {
                PurchaseScript::Outcome(outcome) => Ok(outcome),
                PurchaseScript::Fail(err) => Err(err),
            };
        }

        let entry = st
            .catalog
            .get(product)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownProduct(product.clone()))?;
        let txn = Self::mint_transaction(&mut st, &entry);
        let result = VerificationResult::verified(txn);
        st.entitlements.push(result.clone());
        Ok(PurchaseOutcome::Success { result })
    }

    async fn products(&self, ids: &[ProductId]) -> Result<Vec<Product>, ProviderError> {
        let delay = {
            let mut st = self.lock();
            st.calls.push(ProviderCall::Products(ids.to_vec()));
            st.products_delay
        };
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }

        let st = self.lock();
        if let Some(err) = &st.products_error {
            return Err(err.clone());
        }
        // Unknown ids are silently absent, as with real storefronts.
        Ok(ids
            .iter()
            .filter_map(|id| st.catalog.get(id).map(|p| p.product.clone()))
            .collect())
    }

    async fn finish(&self, transaction: &TransactionId) {
        self.lock()
            .calls
            .push(ProviderCall::Finish(transaction.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn provider() -> PaperProvider {
        let p = PaperProvider::new();
        p.add_product(Product::new("pro.monthly", "Pro Monthly", 5_990_000, "USD"), Some(30));
        p.add_product(Product::new("lifetime", "Lifetime", 99_990_000, "USD"), None);
        p.set_now(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        p
    }

    #[tokio::test]
    async fn default_purchase_mints_verified_transaction() {
        let p = provider();
        let outcome = p.purchase(&ProductId::new("pro.monthly")).await.unwrap();

        let PurchaseOutcome::Success { result } = outcome else {
            panic!("expected success");
        };
        let txn = result.transaction();
        assert!(result.is_verified());
        assert_eq!(txn.id.as_str(), "paper:txn:1");
        assert_eq!(
            txn.expires_at,
            Some(Utc.with_ymd_and_hms(2026, 1, 31, 0, 0, 0).unwrap())
        );
        assert_eq!(p.entitlements().len(), 1);
    }

    #[tokio::test]
    async fn lifetime_product_never_expires() {
        let p = provider();
        let outcome = p.purchase(&ProductId::new("lifetime")).await.unwrap();
        let PurchaseOutcome::Success { result } = outcome else {
            panic!("expected success");
        };
        assert_eq!(result.transaction().expires_at, None);
    }

    #[tokio::test]
    async fn unknown_product_is_an_error() {
        let p = provider();
        let err = p.purchase(&ProductId::new("nope")).await.unwrap_err();
        assert_eq!(err, ProviderError::UnknownProduct(ProductId::new("nope")));
    }

    #[tokio::test]
    async fn scripts_are_consumed_in_order() {
        let p = provider();
        p.script_purchase(PurchaseScript::Outcome(PurchaseOutcome::UserCancelled));
        p.script_purchase(PurchaseScript::Fail(ProviderError::Transport("offline".into())));

        let id = ProductId::new("pro.monthly");
        assert_eq!(p.purchase(&id).await.unwrap(), PurchaseOutcome::UserCancelled);
        assert!(p.purchase(&id).await.is_err());
        assert!(matches!(
            p.purchase(&id).await.unwrap(),
            PurchaseOutcome::Success { .. }
        ));
    }

    #[tokio::test]
    async fn update_stream_is_handed_out_once() {
        let p = provider();
        let mut first = p.updates();
        let mut second = p.updates();

        let txn = Transaction::new("t1", "pro.monthly", Utc::now(), None);
        p.push_update(VerificationResult::verified(txn));

        assert!(first.next().await.is_some());
        assert!(second.next().await.is_none());
    }

    #[tokio::test]
    async fn products_skip_unknown_ids_and_record_call() {
        let p = provider();
        let ids = vec![ProductId::new("lifetime"), ProductId::new("ghost")];
        let products = p.products(&ids).await.unwrap();
        assert_eq!(products.len(), 1);
        assert_eq!(p.calls(), vec![ProviderCall::Products(ids)]);
    }

    #[tokio::test]
    async fn from_catalog_grants_configured_period() {
        let p = PaperProvider::from_catalog([
            (Product::new("pro.annual", "Pro Annual", 49_990_000, "USD"), Some(365)),
            (Product::new("forever", "Forever", 199_990_000, "USD"), None),
        ]);
        p.set_now(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());

        let annual = p.purchase(&ProductId::new("pro.annual")).await.unwrap();
        let PurchaseOutcome::Success { result } = annual else {
            panic!("expected success, got {annual:?}");
        };
        assert_eq!(
            result.transaction().expires_at,
            Some(Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(p.products(&[ProductId::new("forever")]).await.unwrap().len(), 1);
    }
}
