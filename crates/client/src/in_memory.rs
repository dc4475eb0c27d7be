//! Scriptable in-memory billing backend for tests/dev.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};

use entitle_core::{BillingResponse, ProductId, ProductKind, PurchaseToken, ResponseCode};
use entitle_products::ProductDescriptor;
use entitle_purchasing::PurchaseRecord;

use crate::backend::{BackendEvent, BillingBackend, LaunchRequest, PurchasesUpdate, SetupOutcome};

const DEFAULT_EVENT_BUFFER: usize = 64;

/// Snapshot of how often each backend call was made.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub connects: usize,
    /// Highest number of `start_connection` calls outstanding at once.
    pub max_concurrent_connects: usize,
    pub end_connections: usize,
    pub catalog_queries: usize,
    pub owned_queries: usize,
    pub launches: usize,
    pub acknowledgements: usize,
    pub consumptions: usize,
}

impl CallCounts {
    /// Every call except `end_connection`.
    pub fn service_calls(&self) -> usize {
        self.connects
            + self.catalog_queries
            + self.owned_queries
            + self.launches
            + self.acknowledgements
            + self.consumptions
    }
}

#[derive(Debug, Default)]
struct Counters {
    connects: AtomicUsize,
    connects_in_flight: AtomicUsize,
    max_concurrent_connects: AtomicUsize,
    end_connections: AtomicUsize,
    catalog_queries: AtomicUsize,
    owned_queries: AtomicUsize,
    launches: AtomicUsize,
    acknowledgements: AtomicUsize,
    consumptions: AtomicUsize,
}

#[derive(Debug, Default)]
struct BackendState {
    catalog: Vec<ProductDescriptor>,
    owned: BTreeMap<ProductKind, Vec<PurchaseRecord>>,
    /// Consumed front to back; `Connected` once empty.
    setup_script: VecDeque<SetupOutcome>,
    connect_delay: Duration,
    launch_script: VecDeque<BillingResponse>,
    acknowledge_script: VecDeque<BillingResponse>,
    consume_script: VecDeque<BillingResponse>,
    catalog_failures: BTreeMap<ProductKind, BillingResponse>,
    owned_failures: BTreeMap<ProductKind, BillingResponse>,
    launch_requests: Vec<LaunchRequest>,
}

/// In-memory billing service.
///
/// - Catalog and owned purchases are plain vectors
/// - Responses are scripted per call and default to OK
/// - Every call is counted
/// - Events are pushed explicitly by the test
#[derive(Debug)]
pub struct InMemoryBackend {
    state: Mutex<BackendState>,
    events: broadcast::Sender<BackendEvent>,
    launched: watch::Sender<usize>,
    calls: Counters,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::with_event_buffer(DEFAULT_EVENT_BUFFER)
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_buffer(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        let (launched, _) = watch::channel(0);
        Self {
            state: Mutex::new(BackendState::default()),
            events,
            launched,
            calls: Counters::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, BackendState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_product(self, product: ProductDescriptor) -> Self {
        self.add_product(product);
        self
    }

    pub fn add_product(&self, product: ProductDescriptor) {
        self.state().catalog.push(product);
    }

    /// Add an owned purchase visible to owned-items queries of `kind`.
    pub fn add_owned(&self, kind: ProductKind, record: PurchaseRecord) {
        self.state().owned.entry(kind).or_default().push(record);
    }

    pub fn owned(&self, kind: ProductKind) -> Vec<PurchaseRecord> {
        self.state().owned.get(&kind).cloned().unwrap_or_default()
    }

    pub fn script_setup(&self, outcomes: impl IntoIterator<Item = SetupOutcome>) {
        self.state().setup_script.extend(outcomes);
    }

    /// Time every `start_connection` call takes before answering.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state().connect_delay = delay;
    }

    pub fn script_launch(&self, response: BillingResponse) {
        self.state().launch_script.push_back(response);
    }

    pub fn script_acknowledge(&self, response: BillingResponse) {
        self.state().acknowledge_script.push_back(response);
    }

    pub fn script_consume(&self, response: BillingResponse) {
        self.state().consume_script.push_back(response);
    }

    pub fn fail_catalog_queries(&self, kind: ProductKind, response: BillingResponse) {
        self.state().catalog_failures.insert(kind, response);
    }

    pub fn fail_owned_queries(&self, kind: ProductKind, response: BillingResponse) {
        self.state().owned_failures.insert(kind, response);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.catalog_failures.clear();
        state.owned_failures.clear();
    }

    pub fn launch_requests(&self) -> Vec<LaunchRequest> {
        self.state().launch_requests.clone()
    }

    /// Resolves once at least `count` launches were accepted or rejected.
    pub async fn wait_for_launches(&self, count: usize) {
        let mut rx = self.launched.subscribe();
        let _ = rx.wait_for(|launched| *launched >= count).await;
    }

    pub fn emit(&self, event: BackendEvent) {
        // No receivers simply means no client is listening yet.
        let _ = self.events.send(event);
    }

    pub fn emit_disconnect(&self) {
        self.emit(BackendEvent::ServiceDisconnected);
    }

    pub fn emit_purchases(&self, response: BillingResponse, purchases: Vec<PurchaseRecord>) {
        self.emit(BackendEvent::PurchasesUpdated(PurchasesUpdate::new(
            response, purchases,
        )));
    }

    /// Record `record` as owned under `kind` and notify it as a successful purchase.
    pub fn complete_purchase(&self, kind: ProductKind, record: PurchaseRecord) {
        self.add_owned(kind, record.clone());
        self.emit_purchases(BillingResponse::ok(), vec![record]);
    }

    pub fn calls(&self) -> CallCounts {
        let c = &self.calls;
        CallCounts {
            connects: c.connects.load(Ordering::SeqCst),
            max_concurrent_connects: c.max_concurrent_connects.load(Ordering::SeqCst),
            end_connections: c.end_connections.load(Ordering::SeqCst),
            catalog_queries: c.catalog_queries.load(Ordering::SeqCst),
            owned_queries: c.owned_queries.load(Ordering::SeqCst),
            launches: c.launches.load(Ordering::SeqCst),
            acknowledgements: c.acknowledgements.load(Ordering::SeqCst),
            consumptions: c.consumptions.load(Ordering::SeqCst),
        }
    }

    fn record_for_token_mut<'a>(
        state: &'a mut BackendState,
        token: &PurchaseToken,
    ) -> Option<&'a mut PurchaseRecord> {
        state
            .owned
            .values_mut()
            .flat_map(|records| records.iter_mut())
            .find(|r| &r.token == token)
    }
}

/// Decrements the in-flight connect counter even if the call is aborted.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BillingBackend for InMemoryBackend {
    async fn start_connection(&self) -> SetupOutcome {
        self.calls.connects.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.calls.connects_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.calls
            .max_concurrent_connects
            .fetch_max(in_flight, Ordering::SeqCst);
        let _guard = InFlight(&self.calls.connects_in_flight);

        let delay = self.state().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        self.state()
            .setup_script
            .pop_front()
            .unwrap_or(SetupOutcome::Connected)
    }

    async fn end_connection(&self) {
        self.calls.end_connections.fetch_add(1, Ordering::SeqCst);
    }

    async fn query_product_details(
        &self,
        ids: &[ProductId],
        kind: ProductKind,
    ) -> Result<Vec<ProductDescriptor>, BillingResponse> {
        self.calls.catalog_queries.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        if let Some(response) = state.catalog_failures.get(&kind) {
            return Err(response.clone());
        }

        Ok(state
            .catalog
            .iter()
            .filter(|p| p.kind() == kind && ids.contains(p.id()))
            .cloned()
            .collect())
    }

    async fn launch_purchase(&self, request: &LaunchRequest) -> BillingResponse {
        self.calls.launches.fetch_add(1, Ordering::SeqCst);
        let response = {
            let mut state = self.state();
            state.launch_requests.push(request.clone());
            state
                .launch_script
                .pop_front()
                .unwrap_or_else(BillingResponse::ok)
        };
        self.launched.send_modify(|count| *count += 1);
        response
    }

    async fn acknowledge_purchase(&self, token: &PurchaseToken) -> BillingResponse {
        self.calls.acknowledgements.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        let response = state
            .acknowledge_script
            .pop_front()
            .unwrap_or_else(BillingResponse::ok);

        if response.is_ok() {
            if let Some(record) = Self::record_for_token_mut(&mut state, token) {
                record.is_acknowledged = true;
            }
        }
        response
    }

    async fn consume_purchase(&self, token: &PurchaseToken) -> BillingResponse {
        self.calls.consumptions.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state();
        if let Some(response) = state.consume_script.pop_front() {
            if !response.is_ok() {
                return response;
            }
        }

        let before: usize = state.owned.values().map(Vec::len).sum();
        for records in state.owned.values_mut() {
            records.retain(|r| &r.token != token);
        }
        let after: usize = state.owned.values().map(Vec::len).sum();

        if before == after {
            BillingResponse::new(ResponseCode::ItemNotOwned, format!("no purchase for token {token}"))
        } else {
            BillingResponse::ok()
        }
    }

    async fn query_owned_purchases(
        &self,
        kind: ProductKind,
    ) -> Result<Vec<PurchaseRecord>, BillingResponse> {
        self.calls.owned_queries.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        if let Some(response) = state.owned_failures.get(&kind) {
            return Err(response.clone());
        }
        Ok(state.owned.get(&kind).cloned().unwrap_or_default())
    }

    fn events(&self) -> broadcast::Receiver<BackendEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entitle_purchasing::PurchaseState;

    fn pid(s: &str) -> ProductId {
        ProductId::new(s).unwrap()
    }

    fn record(product: &str, token: &str, acknowledged: bool) -> PurchaseRecord {
        PurchaseRecord::new(
            vec![pid(product)],
            PurchaseState::Purchased,
            PurchaseToken::new(token).unwrap(),
            acknowledged,
        )
    }

    #[tokio::test]
    async fn setup_script_is_consumed_then_defaults_to_connected() {
        let backend = InMemoryBackend::new();
        backend.script_setup([SetupOutcome::Disconnected]);

        assert_eq!(backend.start_connection().await, SetupOutcome::Disconnected);
        assert_eq!(backend.start_connection().await, SetupOutcome::Connected);
        assert_eq!(backend.calls().connects, 2);
        assert_eq!(backend.calls().max_concurrent_connects, 1);
    }

    #[tokio::test]
    async fn catalog_query_filters_by_kind_and_id() {
        let backend = InMemoryBackend::new()
            .with_product(ProductDescriptor::one_time(pid("life_time"), "Lifetime", "$19.99"))
            .with_product(ProductDescriptor::one_time(pid("coins"), "Coins", "$0.99"));

        let found = backend
            .query_product_details(&[pid("life_time")], ProductKind::OneTime)
            .await
            .unwrap();
        assert_eq!(found.len(), 1);

        let none = backend
            .query_product_details(&[pid("life_time")], ProductKind::Recurring)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn acknowledge_marks_owned_record() {
        let backend = InMemoryBackend::new();
        backend.add_owned(ProductKind::Recurring, record("monthly", "tok-1", false));

        let response = backend
            .acknowledge_purchase(&PurchaseToken::new("tok-1").unwrap())
            .await;
        assert!(response.is_ok());
        assert!(backend.owned(ProductKind::Recurring)[0].is_acknowledged);
    }

    #[tokio::test]
    async fn consume_removes_record_and_rejects_unknown_tokens() {
        let backend = InMemoryBackend::new();
        backend.add_owned(ProductKind::OneTime, record("coins", "tok-1", true));
        let token = PurchaseToken::new("tok-1").unwrap();

        assert!(backend.consume_purchase(&token).await.is_ok());
        assert!(backend.owned(ProductKind::OneTime).is_empty());

        let again = backend.consume_purchase(&token).await;
        assert_eq!(again.code, ResponseCode::ItemNotOwned);
    }

    #[tokio::test]
    async fn emitted_events_reach_subscribers() {
        let backend = InMemoryBackend::new();
        let mut events = backend.events();
        backend.emit_disconnect();
        assert_eq!(events.recv().await.unwrap(), BackendEvent::ServiceDisconnected);
    }
}
