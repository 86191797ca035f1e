//! The owner actor and its handle.
//!
//! [`EntitlementStore`] is the builder; [`EntitlementStore::start`] spawns
//! three tasks (owner, update listener, startup) and returns a cloneable
//! [`StoreHandle`]. All mutations go through the owner's command channel.
//!
//! The catalog query runs outside the owner; only its sorted result is handed
//! in. A slow storefront never holds up reconciliation.

use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use ent_audit::{AnomalyReporter, TracingAnomalyReporter};
use ent_cache::{KeyValueStore, MemoryStore};
use ent_provider::{PaymentProvider, ProviderError};
use ent_reconcile::{ReconcileReport, SelectionPolicy};
use ent_schemas::{Product, ProductId, PurchaseOutcome, VerificationResult};

use crate::catalog::sort_catalog;
use crate::clock::{Clock, SystemClock};
use crate::listener::spawn_update_listener;
use crate::reconciler::Reconciler;
use crate::status::{BusMsg, PurchaseErrorAlert, StoreStatus};

const COMMAND_QUEUE: usize = 64;
const BUS_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    Provider(ProviderError),
    /// The owner task is gone (store shut down).
    Stopped,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Provider(err) => write!(f, "{err}"),
            StoreError::Stopped => write!(f, "entitlement store is stopped"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<ProviderError> for StoreError {
    fn from(err: ProviderError) -> Self {
        StoreError::Provider(err)
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

pub(crate) enum Command {
    Refresh {
        reply: oneshot::Sender<Result<ReconcileReport, ProviderError>>,
    },
    StreamItem {
        item: VerificationResult,
        reply: oneshot::Sender<()>,
    },
    Purchase {
        product: ProductId,
        reply: oneshot::Sender<StoreStatus>,
    },
    PublishProducts {
        products: Vec<Product>,
        reply: oneshot::Sender<()>,
    },
    DismissAlert {
        reply: oneshot::Sender<()>,
    },
    Sync {
        reply: oneshot::Sender<StoreStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct EntitlementStore {
    provider: Arc<dyn PaymentProvider>,
    cache_store: Arc<dyn KeyValueStore>,
    reporter: Arc<dyn AnomalyReporter>,
    clock: Arc<dyn Clock>,
    policy: SelectionPolicy,
    product_ids: Vec<ProductId>,
}

impl EntitlementStore {
    /// Defaults: in-memory cache, tracing anomaly sink, system clock,
    /// first-in-snapshot selection, empty product list.
    pub fn builder(provider: Arc<dyn PaymentProvider>) -> Self {
        Self {
            provider,
            cache_store: Arc::new(MemoryStore::new()),
            reporter: Arc::new(TracingAnomalyReporter),
            clock: Arc::new(SystemClock),
            policy: SelectionPolicy::default(),
            product_ids: Vec::new(),
        }
    }

    pub fn cache_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.cache_store = store;
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn AnomalyReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(mut self, policy: SelectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn product_ids(mut self, ids: Vec<ProductId>) -> Self {
        self.product_ids = ids;
        self
    }

    /// Spawn the owner, the update listener and the startup task (catalog
    /// load followed by one reconciliation pass). Must be called inside a
    /// Tokio runtime.
    pub fn start(self) -> StoreHandle {
        let (bus, _rx) = broadcast::channel::<BusMsg>(BUS_CAPACITY);
        let (status_tx, status_rx) = watch::channel(StoreStatus::default());
        let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(COMMAND_QUEUE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let updates = self.provider.updates();
        let catalog = Arc::new(CatalogSource {
            provider: self.provider.clone(),
            product_ids: self.product_ids,
            bus: bus.clone(),
        });
        let reconciler = Reconciler::new(
            self.provider,
            self.cache_store,
            self.reporter,
            self.clock,
        )
        .with_policy(self.policy)
        .with_bus(bus.clone());

        let owner = Owner {
            reconciler,
            status: status_tx,
            bus: bus.clone(),
            shutdown: shutdown_tx,
        };
        let owner_task = tokio::spawn(owner.run(cmd_rx));

        let listener_task = spawn_update_listener(updates, cmd_tx.clone(), shutdown_rx.clone());
        let startup_task = spawn_startup(catalog.clone(), cmd_tx.clone(), shutdown_rx);

        info!("entitlement store started");

        StoreHandle {
            commands: cmd_tx,
            catalog,
            status: status_rx,
            bus,
            tasks: Arc::new(Tasks {
                owner: Mutex::new(Some(owner_task)),
                listener: Mutex::new(Some(listener_task)),
                startup: Mutex::new(Some(startup_task)),
            }),
        }
    }
}

/// The first reconciliation pass and the catalog load run side by side. The
/// pass never waits for the catalog; the catalog error, if any, is what the
/// task returns once both are done.
fn spawn_startup(
    catalog: Arc<CatalogSource>,
    commands: mpsc::Sender<Command>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<Result<(), StoreError>> {
    tokio::spawn(async move {
        let pass = async {
            match request(&commands, |reply| Command::Refresh { reply }).await {
                Ok(Err(err)) => warn!(error = %err, "startup reconciliation pass failed"),
                Err(err) => debug!(error = %err, "startup pass not run"),
                Ok(Ok(_)) => {}
            }
        };
        let products = catalog.load(&commands);

        tokio::select! {
            res = async { tokio::join!(pass, products).1 } => res.map(|_| ()),
            _ = shutdown.changed() => {
                debug!("startup task cancelled");
                Ok(())
            }
        }
    })
}

/// Where the catalog comes from. Queried from whichever task asks, never
/// from the owner.
struct CatalogSource {
    provider: Arc<dyn PaymentProvider>,
    product_ids: Vec<ProductId>,
    bus: broadcast::Sender<BusMsg>,
}

impl CatalogSource {
    async fn load(&self, commands: &mpsc::Sender<Command>) -> Result<Vec<Product>, StoreError> {
        let products = match self.provider.products(&self.product_ids).await {
            Ok(p) => sort_catalog(p),
            Err(err) => {
                error!(error = %err, "catalog query failed");
                let _ = self
                    .bus
                    .send(BusMsg::log("ERROR", format!("catalog query failed: {err}")));
                return Err(err.into());
            }
        };
        let published = products.clone();
        request(commands, |reply| Command::PublishProducts {
            products: published,
            reply,
        })
        .await?;
        Ok(products)
    }
}

async fn request<T>(
    commands: &mpsc::Sender<Command>,
    make: impl FnOnce(oneshot::Sender<T>) -> Command,
) -> Result<T, StoreError> {
    let (tx, rx) = oneshot::channel();
    commands
        .send(make(tx))
        .await
        .map_err(|_| StoreError::Stopped)?;
    rx.await.map_err(|_| StoreError::Stopped)
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

struct Tasks {
    owner: Mutex<Option<JoinHandle<()>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    startup: Mutex<Option<JoinHandle<Result<(), StoreError>>>>,
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(|p| p.into_inner()).take()
}

/// Cloneable handle to a running store.
#[derive(Clone)]
pub struct StoreHandle {
    commands: mpsc::Sender<Command>,
    catalog: Arc<CatalogSource>,
    status: watch::Receiver<StoreStatus>,
    bus: broadcast::Sender<BusMsg>,
    tasks: Arc<Tasks>,
}

impl StoreHandle {
    /// Current observable state.
    pub fn status(&self) -> StoreStatus {
        self.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<StoreStatus> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMsg> {
        self.bus.subscribe()
    }

    pub fn bus(&self) -> broadcast::Sender<BusMsg> {
        self.bus.clone()
    }

    /// Explicit reconciliation pass on a fresh snapshot ("restore").
    pub async fn refresh(&self) -> Result<ReconcileReport, StoreError> {
        Ok(request(&self.commands, |reply| Command::Refresh { reply }).await??)
    }

    /// Query the catalog for the configured ids and publish it sorted.
    pub async fn load_products(&self) -> Result<Vec<Product>, StoreError> {
        self.catalog.load(&self.commands).await
    }

    /// Never fails: failures land in `purchase_error_alert`. Returns the
    /// state after the attempt.
    ///
    /// Purchases run on the owner, so stream updates and refreshes queue
    /// until the provider's purchase call returns.
    pub async fn purchase(&self, product: ProductId) -> StoreStatus {
        match request(&self.commands, |reply| Command::Purchase { product, reply }).await {
            Ok(status) => status,
            Err(_) => self.status(),
        }
    }

    /// State as seen by the owner once every previously queued command has
    /// been processed.
    pub async fn sync(&self) -> Result<StoreStatus, StoreError> {
        request(&self.commands, |reply| Command::Sync { reply }).await
    }

    pub async fn dismiss_alert(&self) -> Result<(), StoreError> {
        request(&self.commands, |reply| Command::DismissAlert { reply }).await
    }

    /// Wait for the startup task. Returns the catalog error, if any. A second
    /// call returns `Ok(())`.
    pub async fn startup_complete(&self) -> Result<(), StoreError> {
        match take(&self.tasks.startup) {
            Some(task) => task.await.unwrap_or(Err(StoreError::Stopped)),
            None => Ok(()),
        }
    }

    /// Cooperative shutdown. The listener stops between items, an in-flight
    /// command completes, applied cache writes and finalizations stand.
    pub async fn shutdown(&self) {
        // Owner already gone is fine: still reap the tasks.
        let _ = request(&self.commands, |reply| Command::Shutdown { reply }).await;

        for task in [take(&self.tasks.listener), take(&self.tasks.owner)]
            .into_iter()
            .flatten()
        {
            if let Err(err) = task.await {
                warn!(error = %err, "store task ended abnormally");
            }
        }
        if let Some(task) = take(&self.tasks.startup) {
            let _ = task.await;
        }
        info!("entitlement store stopped");
    }
}

// ---------------------------------------------------------------------------
// Owner
// ---------------------------------------------------------------------------

struct Owner {
    reconciler: Reconciler,
    status: watch::Sender<StoreStatus>,
    bus: broadcast::Sender<BusMsg>,
    shutdown: watch::Sender<bool>,
}

/// Holds `is_purchasing` true for its lifetime.
struct BusyGuard<'a> {
    status: &'a watch::Sender<StoreStatus>,
}

impl<'a> BusyGuard<'a> {
    fn engage(status: &'a watch::Sender<StoreStatus>) -> Self {
        status.send_modify(|s| s.is_purchasing = true);
        Self { status }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.status.send_modify(|s| s.is_purchasing = false);
    }
}

impl Owner {
    async fn run(self, mut commands: mpsc::Receiver<Command>) {
        while let Some(cmd) = commands.recv().await {
            match cmd {
                Command::Refresh { reply } => {
                    let _ = reply.send(self.reconcile_pass().await);
                }
                Command::StreamItem { item, reply } => {
                    self.handle_stream_item(item).await;
                    let _ = reply.send(());
                }
                Command::Purchase { product, reply } => {
                    self.handle_purchase(product).await;
                    let _ = reply.send(self.status.borrow().clone());
                }
                Command::PublishProducts { products, reply } => {
                    self.publish_products(products);
                    let _ = reply.send(());
                }
                Command::DismissAlert { reply } => {
                    self.status.send_modify(|s| s.purchase_error_alert = None);
                    self.publish_status();
                    let _ = reply.send(());
                }
                Command::Sync { reply } => {
                    let _ = reply.send(self.status.borrow().clone());
                }
                Command::Shutdown { reply } => {
                    let _ = self.shutdown.send(true);
                    let _ = reply.send(());
                    break;
                }
            }
        }
        // Queued commands are dropped with the receiver; their callers see
        // `StoreError::Stopped`.
        debug!("owner task exiting");
    }

    async fn reconcile_pass(&self) -> Result<ReconcileReport, ProviderError> {
        let report = self.reconciler.run_pass().await?;
        let now = self.reconciler.now();
        self.status.send_modify(|s| {
            s.has_active_subscription = report.has_active_subscription;
            s.representative = report.representative.clone();
            s.last_reconciled_at = Some(now);
            s.passes += 1;
        });
        self.publish_status();
        Ok(report)
    }

    /// Unverified items are ignored; verified ones trigger a full pass on a
    /// fresh snapshot and are then finalized.
    async fn handle_stream_item(&self, item: VerificationResult) {
        match item {
            VerificationResult::Verified { transaction } => {
                info!(transaction_id = %transaction.id, product_id = %transaction.product_id, "verified transaction update");
                if let Err(err) = self.reconcile_pass().await {
                    warn!(error = %err, "reconciliation after update failed");
                }
                self.reconciler.provider().finish(transaction.ack_handle()).await;
            }
            VerificationResult::Unverified { transaction, error } => {
                debug!(transaction_id = %transaction.id, error = %error, "skipping unverified transaction update");
            }
        }
    }

    async fn handle_purchase(&self, product: ProductId) {
        let busy = BusyGuard::engage(&self.status);
        self.publish_status();
        info!(product_id = %product, "purchase started");

        match self.reconciler.provider().purchase(&product).await {
            Ok(PurchaseOutcome::Success {
                result: VerificationResult::Verified { transaction },
            }) => {
                info!(product_id = %product, transaction_id = %transaction.id, "purchase verified");
                if let Err(err) = self.reconcile_pass().await {
                    warn!(error = %err, "reconciliation after purchase failed");
                }
                self.reconciler.provider().finish(transaction.ack_handle()).await;
            }
            Ok(PurchaseOutcome::Success {
                result: VerificationResult::Unverified { transaction, error },
            }) => {
                warn!(product_id = %product, transaction_id = %transaction.id, error = %error, "purchase could not be verified");
                self.raise_alert(PurchaseErrorAlert::Unverified {
                    product_id: product.clone(),
                    error,
                });
            }
            Ok(PurchaseOutcome::Pending) => {
                info!(product_id = %product, "purchase pending");
            }
            Ok(PurchaseOutcome::UserCancelled) => {
                info!(product_id = %product, "purchase cancelled by user");
            }
            Ok(other) => {
                debug!(product_id = %product, outcome = ?other, "ignoring unrecognized purchase outcome");
            }
            Err(err) => {
                error!(product_id = %product, error = %err, "purchase failed");
                self.raise_alert(PurchaseErrorAlert::Initiation {
                    product_id: product.clone(),
                    message: err.to_string(),
                });
            }
        }

        drop(busy);
        self.publish_status();
    }

    fn publish_products(&self, products: Vec<Product>) {
        info!(count = products.len(), "catalog loaded");
        self.status.send_modify(|s| s.subscriptions = products);
        self.publish_status();
    }

    fn raise_alert(&self, alert: PurchaseErrorAlert) {
        let _ = self.bus.send(BusMsg::log("ERROR", alert.to_string()));
        self.status
            .send_modify(|s| s.purchase_error_alert = Some(alert));
    }

    fn publish_status(&self) {
        let snap = self.status.borrow().clone();
        let _ = self.bus.send(BusMsg::Status(snap));
    }
}
