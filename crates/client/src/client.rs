use std::sync::{Arc, Mutex, PoisonError};

use futures_util::stream::{self, Stream, StreamExt};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use entitle_core::{ProductKind, PurchaseToken};
use entitle_products::{ProductDescriptor, ProductSelection};

use crate::backend::{BackendEvent, BillingBackend};
use crate::catalog::CatalogResolver;
use crate::config::ClientConfig;
use crate::connection::{ConnectionManager, ConnectionStatus, Session, SessionState};
use crate::entitlements::EntitlementTracker;
use crate::orchestrator::{PurchaseOrchestrator, PurchaseOutcome};

/// Entry point for applications.
///
/// Cheap to clone; clones share one session. Must be created inside a tokio
/// runtime: construction spawns the task that dispatches backend events.
#[derive(Clone)]
pub struct BillingClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    connection: Arc<ConnectionManager>,
    catalog: CatalogResolver,
    entitlements: Arc<EntitlementTracker>,
    orchestrator: Arc<PurchaseOrchestrator>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl BillingClient {
    pub fn new(backend: Arc<dyn BillingBackend>, config: ClientConfig) -> Self {
        let connection = ConnectionManager::new(backend.clone(), config.retry);
        let entitlements = EntitlementTracker::new(backend.clone(), connection.clone());
        let orchestrator = PurchaseOrchestrator::new(
            backend.clone(),
            connection.clone(),
            entitlements.clone(),
            config.purchase_timeout,
        );
        let catalog = CatalogResolver::new(backend.clone(), connection.clone());

        let pump = tokio::spawn(run_event_pump(
            backend.events(),
            connection.subscribe(),
            connection.clone(),
            orchestrator.clone(),
            entitlements.clone(),
        ));

        Self {
            inner: Arc::new(ClientInner {
                connection,
                catalog,
                entitlements,
                orchestrator,
                pump: Mutex::new(Some(pump)),
            }),
        }
    }

    /// Start or join the billing session and follow its status.
    pub fn connect(&self) -> impl Stream<Item = ConnectionStatus> + Send + 'static {
        self.inner.connection.connect()
    }

    pub fn session(&self) -> Session {
        self.inner.connection.state()
    }

    /// Release the session. Streams end, waiting purchases fail, and later
    /// calls return empty/false without contacting the service.
    pub async fn terminate(&self) {
        self.inner.connection.terminate().await;
        self.inner.orchestrator.shutdown();

        let pump = self
            .inner
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pump) = pump {
            pump.abort();
        }
    }

    /// Emits the merged catalog once.
    pub fn query_catalog(
        &self,
        selection: ProductSelection,
    ) -> impl Stream<Item = Vec<ProductDescriptor>> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        stream::once(async move { inner.catalog.query(&selection).await })
    }

    /// Entitlement status for `selection`, re-published whenever it changes.
    pub fn watch_entitlements(
        &self,
        selection: ProductSelection,
    ) -> impl Stream<Item = bool> + Send + 'static {
        self.inner.entitlements.watch(selection)
    }

    pub async fn check_entitlements(&self, selection: &ProductSelection) -> bool {
        self.inner.entitlements.check(selection).await
    }

    /// Emits once: whether the purchase ended acknowledged.
    ///
    /// Dropping the stream before it emits abandons the attempt and frees the
    /// purchase slot; a late result is then reconciled in the background.
    pub fn purchase(
        &self,
        product: ProductDescriptor,
        kind: ProductKind,
        plan: Option<String>,
    ) -> impl Stream<Item = bool> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        stream::once(async move {
            inner
                .orchestrator
                .purchase(&product, kind, plan.as_deref())
                .await
        })
        .map(|outcome| outcome.is_entitled())
    }

    pub async fn purchase_detailed(
        &self,
        product: &ProductDescriptor,
        kind: ProductKind,
        plan: Option<&str>,
    ) -> PurchaseOutcome {
        self.inner.orchestrator.purchase(product, kind, plan).await
    }

    /// Emits once: whether the service consumed `token`.
    pub fn consume(&self, token: PurchaseToken) -> impl Stream<Item = bool> + Send + 'static {
        let inner = Arc::clone(&self.inner);
        stream::once(async move { inner.orchestrator.consume(&token).await })
    }

    pub async fn consume_attempt(&self, outcome: PurchaseOutcome) -> PurchaseOutcome {
        self.inner.orchestrator.consume_attempt(outcome).await
    }
}

async fn run_event_pump(
    mut events: broadcast::Receiver<BackendEvent>,
    mut session: watch::Receiver<Session>,
    connection: Arc<ConnectionManager>,
    orchestrator: Arc<PurchaseOrchestrator>,
    entitlements: Arc<EntitlementTracker>,
) {
    tracing::debug!("billing event pump started");
    let mut connected_before = false;
    let mut connected_now = false;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(BackendEvent::ServiceDisconnected) => connection.on_service_disconnected(),
                Ok(BackendEvent::PurchasesUpdated(update)) => {
                    tracing::debug!(
                        code = %update.response.code,
                        purchases = update.purchases.len(),
                        "purchases updated"
                    );
                    orchestrator.on_purchases_updated(update);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Lost notifications may hide purchases; recompute from the service.
                    tracing::warn!(skipped, "billing event pump lagged");
                    entitlements.refresh();
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            changed = session.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = session.borrow_and_update().state;
                match state {
                    SessionState::Connected => {
                        if connected_before && !connected_now {
                            tracing::info!("billing session restored; refreshing entitlements");
                            entitlements.refresh();
                        }
                        connected_before = true;
                        connected_now = true;
                    }
                    SessionState::Terminated => break,
                    _ => connected_now = false,
                }
            }
        }
    }
    tracing::debug!("billing event pump stopped");
}
