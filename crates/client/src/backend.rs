//! Capability interface to the platform billing service.

use async_trait::async_trait;
use tokio::sync::broadcast;

use entitle_core::{BillingResponse, ProductId, ProductKind, PurchaseToken};
use entitle_products::ProductDescriptor;
use entitle_purchasing::PurchaseRecord;

/// Result of one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupOutcome {
    Connected,
    /// The service answered the setup with a non-OK code.
    Failed(BillingResponse),
    /// The service went away before setup finished.
    Disconnected,
}

/// Request to open the platform purchase flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub product_id: ProductId,
    pub kind: ProductKind,
    /// Offer token of the selected plan; recurring products only.
    pub offer_token: Option<String>,
}

/// Outcome of a purchase flow, delivered asynchronously.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchasesUpdate {
    pub response: BillingResponse,
    pub purchases: Vec<PurchaseRecord>,
}

impl PurchasesUpdate {
    pub fn new(response: BillingResponse, purchases: Vec<PurchaseRecord>) -> Self {
        Self {
            response,
            purchases,
        }
    }
}

/// Service-originated notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// An established session was dropped by the service.
    ServiceDisconnected,
    PurchasesUpdated(PurchasesUpdate),
}

/// Request/response calls are async; the purchase result and disconnects arrive
/// on the [`events`](BillingBackend::events) channel.
#[async_trait]
pub trait BillingBackend: Send + Sync {
    async fn start_connection(&self) -> SetupOutcome;

    async fn end_connection(&self);

    async fn query_product_details(
        &self,
        ids: &[ProductId],
        kind: ProductKind,
    ) -> Result<Vec<ProductDescriptor>, BillingResponse>;

    /// Immediate accept/reject of the launch; the result comes later as an event.
    async fn launch_purchase(&self, request: &LaunchRequest) -> BillingResponse;

    async fn acknowledge_purchase(&self, token: &PurchaseToken) -> BillingResponse;

    async fn consume_purchase(&self, token: &PurchaseToken) -> BillingResponse;

    async fn query_owned_purchases(
        &self,
        kind: ProductKind,
    ) -> Result<Vec<PurchaseRecord>, BillingResponse>;

    fn events(&self) -> broadcast::Receiver<BackendEvent>;
}
