//! Purchase flow: one active attempt at a time, driven to a terminal state.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use entitle_core::{
    AggregateRoot, AttemptId, BillingError, BillingResponse, ProductId, ProductKind,
    PurchaseToken, ResponseCode,
};
use entitle_events::{Event, execute};
use entitle_products::ProductDescriptor;
use entitle_purchasing::{
    AcceptLaunch, AcknowledgePurchase, AttemptState, CancelAttempt, ConfirmPurchase,
    ConsumePurchase, FailAttempt, LaunchAttempt, PurchaseAttempt, PurchaseAttemptCommand,
    PurchaseRecord, PurchaseState,
};

use crate::backend::{BillingBackend, LaunchRequest, PurchasesUpdate};
use crate::connection::ConnectionManager;
use crate::entitlements::EntitlementTracker;

/// Final snapshot of a purchase attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurchaseOutcome {
    attempt: PurchaseAttempt,
}

impl PurchaseOutcome {
    /// Reached acknowledgment: the caller now holds the product.
    pub fn is_entitled(&self) -> bool {
        self.attempt.state().is_entitled()
    }

    pub fn state(&self) -> AttemptState {
        self.attempt.state()
    }

    pub fn failure(&self) -> Option<&BillingError> {
        self.attempt.failure()
    }

    pub fn purchase_token(&self) -> Option<&PurchaseToken> {
        self.attempt.purchase_token()
    }

    pub fn attempt(&self) -> &PurchaseAttempt {
        &self.attempt
    }

    pub fn into_attempt(self) -> PurchaseAttempt {
        self.attempt
    }
}

struct ActiveSlot {
    attempt_id: AttemptId,
    product_id: ProductId,
    /// Where the next purchase notification goes; set right before launch.
    results: Option<oneshot::Sender<PurchasesUpdate>>,
}

impl ActiveSlot {
    /// Failures belong to the open flow; an OK notification only when it
    /// carries a record of the attempt's product.
    fn correlates(&self, update: &PurchasesUpdate) -> bool {
        !update.response.is_ok()
            || update
                .purchases
                .iter()
                .any(|r| r.covers(self.product_id.as_str()))
    }
}

/// Releases the slot when the owning attempt ends or its future is dropped.
///
/// A result delivered to an attempt that never read it is reconciled.
struct SlotGuard {
    orchestrator: Arc<PurchaseOrchestrator>,
    attempt_id: AttemptId,
    pending: Option<oneshot::Receiver<PurchasesUpdate>>,
}

impl SlotGuard {
    fn register(&mut self) {
        let (tx, rx) = oneshot::channel();
        let mut slot = self.orchestrator.lock_slot();
        if let Some(active) = slot.as_mut().filter(|a| a.attempt_id == self.attempt_id) {
            active.results = Some(tx);
        }
        self.pending = Some(rx);
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        {
            let mut slot = self.orchestrator.lock_slot();
            if slot.as_ref().is_some_and(|a| a.attempt_id == self.attempt_id) {
                *slot = None;
                tracing::debug!(attempt_id = %self.attempt_id, "purchase slot released");
            }
        }

        if let Some(mut pending) = self.pending.take() {
            pending.close();
            if let Ok(update) = pending.try_recv() {
                tracing::info!(
                    attempt_id = %self.attempt_id,
                    "purchase abandoned after its result arrived; reconciling"
                );
                self.orchestrator.spawn_reconcile_update(update);
            }
        }
    }
}

pub struct PurchaseOrchestrator {
    backend: Arc<dyn BillingBackend>,
    connection: Arc<ConnectionManager>,
    entitlements: Arc<EntitlementTracker>,
    purchase_timeout: Option<Duration>,
    slot: Mutex<Option<ActiveSlot>>,
}

impl PurchaseOrchestrator {
    pub fn new(
        backend: Arc<dyn BillingBackend>,
        connection: Arc<ConnectionManager>,
        entitlements: Arc<EntitlementTracker>,
        purchase_timeout: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            connection,
            entitlements,
            purchase_timeout,
            slot: Mutex::new(None),
        })
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<ActiveSlot>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attempt currently holding the purchase slot.
    pub fn active_attempt(&self) -> Option<AttemptId> {
        self.lock_slot().as_ref().map(|a| a.attempt_id)
    }

    /// Run one purchase to a terminal state.
    ///
    /// Recurring products need `plan` to name one of their offers; one-time
    /// products ignore it.
    pub async fn purchase(
        self: &Arc<Self>,
        product: &ProductDescriptor,
        kind: ProductKind,
        plan: Option<&str>,
    ) -> PurchaseOutcome {
        let attempt_id = AttemptId::new();
        let mut attempt = PurchaseAttempt::empty(attempt_id);
        self.transition(
            &mut attempt,
            PurchaseAttemptCommand::Launch(LaunchAttempt {
                attempt_id,
                product_id: product.id().clone(),
                kind,
                selected_plan_id: plan.map(str::to_string),
                occurred_at: Utc::now(),
            }),
        );

        self.drive(&mut attempt, product, kind, plan).await;
        PurchaseOutcome { attempt }
    }

    async fn drive(
        self: &Arc<Self>,
        attempt: &mut PurchaseAttempt,
        product: &ProductDescriptor,
        kind: ProductKind,
        plan: Option<&str>,
    ) {
        let Some(mut slot) = self.claim(attempt.id_typed(), product.id()) else {
            self.fail(attempt, BillingError::PurchaseInProgress);
            return;
        };

        let offer_token = match kind {
            ProductKind::OneTime => None,
            ProductKind::Recurring => match plan.and_then(|p| product.resolve_offer_token(p)) {
                Some(token) => Some(token.to_string()),
                None => {
                    let error = BillingError::OfferResolutionFailed {
                        product_id: product.id().to_string(),
                        plan: plan.map(str::to_string),
                    };
                    self.fail(attempt, error);
                    return;
                }
            },
        };

        if !self.connection.ready().await {
            let error = if self.connection.is_terminated() {
                BillingError::Terminated
            } else {
                BillingError::ConnectionExhausted
            };
            self.fail(attempt, error);
            return;
        }

        slot.register();
        let request = LaunchRequest {
            product_id: product.id().clone(),
            kind,
            offer_token,
        };
        let response = self.backend.launch_purchase(&request).await;
        if !response.is_ok() {
            self.fail(attempt, BillingError::LaunchRejected(response));
            return;
        }

        let attempt_id = attempt.id_typed();
        self.transition(
            attempt,
            PurchaseAttemptCommand::AcceptLaunch(AcceptLaunch {
                attempt_id,
                occurred_at: Utc::now(),
            }),
        );

        match self.await_result(&mut slot).await {
            Ok(update) => self.settle(attempt, update).await,
            Err(error) => self.fail(attempt, error),
        }
    }

    fn claim(self: &Arc<Self>, attempt_id: AttemptId, product_id: &ProductId) -> Option<SlotGuard> {
        let mut slot = self.lock_slot();
        if let Some(active) = slot.as_ref() {
            tracing::warn!(
                attempt_id = %attempt_id,
                active_attempt_id = %active.attempt_id,
                "purchase already in progress"
            );
            return None;
        }

        *slot = Some(ActiveSlot {
            attempt_id,
            product_id: product_id.clone(),
            results: None,
        });
        Some(SlotGuard {
            orchestrator: Arc::clone(self),
            attempt_id,
            pending: None,
        })
    }

    async fn await_result(&self, slot: &mut SlotGuard) -> Result<PurchasesUpdate, BillingError> {
        let Some(results) = slot.pending.as_mut() else {
            return Err(BillingError::Terminated);
        };
        let received = match self.purchase_timeout {
            Some(limit) => tokio::time::timeout(limit, results).await.map_err(|_| {
                BillingError::PurchaseNotCompleted {
                    reason: format!("no purchase result within {limit:?}"),
                }
            })?,
            None => results.await,
        };
        slot.pending = None;
        // The sender only goes away on shutdown.
        received.map_err(|_| BillingError::Terminated)
    }

    async fn settle(self: &Arc<Self>, attempt: &mut PurchaseAttempt, update: PurchasesUpdate) {
        let attempt_id = attempt.id_typed();
        let PurchasesUpdate {
            response,
            purchases,
        } = update;

        if !response.is_ok() {
            if response.code == ResponseCode::UserCanceled {
                self.transition(
                    attempt,
                    PurchaseAttemptCommand::Cancel(CancelAttempt {
                        attempt_id,
                        occurred_at: Utc::now(),
                    }),
                );
            } else {
                let reason = format!("purchase flow ended with {response}");
                self.fail(attempt, BillingError::PurchaseNotCompleted { reason });
            }
            return;
        }

        let Some(product_id) = attempt.product_id().cloned() else {
            return;
        };
        let (matching, others): (Vec<_>, Vec<_>) = purchases
            .into_iter()
            .partition(|r| r.covers(product_id.as_str()));
        if !others.is_empty() {
            self.spawn_reconcile(others);
        }

        let record = matching
            .iter()
            .find(|r| r.state == PurchaseState::Purchased)
            .or_else(|| matching.first());
        let Some(record) = record else {
            let reason = format!("no purchase of {product_id} in notification");
            self.fail(attempt, BillingError::PurchaseNotCompleted { reason });
            return;
        };

        let reason = match record.state {
            PurchaseState::Purchased => None,
            PurchaseState::Pending => Some("purchase is pending"),
            PurchaseState::Unspecified => Some("purchase state is unspecified"),
        };
        if let Some(reason) = reason {
            self.fail(
                attempt,
                BillingError::PurchaseNotCompleted {
                    reason: reason.to_string(),
                },
            );
            return;
        }

        self.transition(
            attempt,
            PurchaseAttemptCommand::Confirm(ConfirmPurchase {
                attempt_id,
                purchase_token: record.token.clone(),
                already_acknowledged: record.is_acknowledged,
                occurred_at: Utc::now(),
            }),
        );
        if attempt.state() == AttemptState::Acknowledged {
            self.entitlements.refresh();
            return;
        }

        // No retry on failure: an unacknowledged purchase is picked up by a
        // later reconciliation or the caller's next attempt.
        let ack = match self.spawn_acknowledge(record.token.clone()).await {
            Ok(response) => response,
            Err(err) => BillingResponse::new(ResponseCode::Error, err.to_string()),
        };
        if !ack.is_ok() {
            self.fail(attempt, BillingError::AcknowledgeFailed(ack));
            return;
        }

        self.transition(
            attempt,
            PurchaseAttemptCommand::Acknowledge(AcknowledgePurchase {
                attempt_id,
                occurred_at: Utc::now(),
            }),
        );
    }

    /// Detached: the acknowledge and its refresh finish even if the purchase
    /// future is dropped while waiting on them.
    fn spawn_acknowledge(self: &Arc<Self>, token: PurchaseToken) -> JoinHandle<BillingResponse> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let response = this.backend.acknowledge_purchase(&token).await;
            if response.is_ok() {
                this.entitlements.refresh();
            }
            response
        })
    }

    /// Route a purchase notification to the waiting attempt, or reconcile it.
    ///
    /// An OK notification without a record of the attempt's product (an older
    /// purchase completing, say) leaves the attempt waiting.
    pub fn on_purchases_updated(self: &Arc<Self>, update: PurchasesUpdate) {
        let waiting = self
            .lock_slot()
            .as_mut()
            .filter(|active| active.correlates(&update))
            .and_then(|active| active.results.take());

        match waiting {
            Some(results) => {
                if let Err(update) = results.send(update) {
                    self.spawn_reconcile_update(update);
                }
            }
            None => self.spawn_reconcile_update(update),
        }
    }

    fn spawn_reconcile_update(self: &Arc<Self>, update: PurchasesUpdate) {
        if !update.response.is_ok() {
            tracing::debug!(code = %update.response.code, "ignoring unsolicited purchase failure");
            return;
        }
        self.spawn_reconcile(update.purchases);
    }

    fn spawn_reconcile(self: &Arc<Self>, records: Vec<PurchaseRecord>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(records = records.len(), "no runtime; purchases left unreconciled");
            return;
        };
        let this = Arc::clone(self);
        runtime.spawn(async move {
            this.reconcile(records).await;
        });
    }

    /// Acknowledge purchases that completed outside an attempt.
    pub async fn reconcile(&self, records: Vec<PurchaseRecord>) {
        let mut changed = false;
        for record in records {
            if record.is_entitling() {
                changed = true;
                continue;
            }
            if !record.needs_acknowledgement() {
                continue;
            }

            let response = self.backend.acknowledge_purchase(&record.token).await;
            if response.is_ok() {
                tracing::info!(product_ids = ?record.product_ids, "acknowledged out-of-band purchase");
                changed = true;
            } else {
                let err = BillingError::AcknowledgeFailed(response);
                tracing::warn!(
                    product_ids = ?record.product_ids,
                    code = err.code(),
                    error = %err,
                    "out-of-band acknowledge failed"
                );
            }
        }

        if changed {
            self.entitlements.refresh();
        }
    }

    /// Consume a purchase token so the product can be bought again.
    pub async fn consume(&self, token: &PurchaseToken) -> bool {
        if !self.connection.ready().await {
            tracing::warn!("no billing session; purchase not consumed");
            return false;
        }

        let response = self.backend.consume_purchase(token).await;
        if !response.is_ok() {
            let err = BillingError::ConsumeFailed(response);
            tracing::warn!(code = err.code(), error = %err, "consume failed");
            return false;
        }

        tracing::info!("purchase consumed");
        self.entitlements.refresh();
        true
    }

    /// Consume the token of an acknowledged attempt and record it as consumed.
    pub async fn consume_attempt(&self, outcome: PurchaseOutcome) -> PurchaseOutcome {
        let mut attempt = outcome.into_attempt();
        if attempt.state() != AttemptState::Acknowledged {
            tracing::warn!(
                attempt_id = %attempt.id_typed(),
                state = ?attempt.state(),
                "only acknowledged purchases can be consumed"
            );
            return PurchaseOutcome { attempt };
        }
        let Some(token) = attempt.purchase_token().cloned() else {
            return PurchaseOutcome { attempt };
        };

        if self.consume(&token).await {
            let attempt_id = attempt.id_typed();
            self.transition(
                &mut attempt,
                PurchaseAttemptCommand::Consume(ConsumePurchase {
                    attempt_id,
                    occurred_at: Utc::now(),
                }),
            );
        }
        PurchaseOutcome { attempt }
    }

    /// Fail the waiting attempt, if any; called on terminate.
    pub fn shutdown(&self) {
        let waiting = self
            .lock_slot()
            .as_mut()
            .and_then(|active| active.results.take());
        drop(waiting);
    }

    fn fail(&self, attempt: &mut PurchaseAttempt, error: BillingError) {
        tracing::warn!(
            attempt_id = %attempt.id_typed(),
            code = error.code(),
            error = %error,
            "purchase attempt failed"
        );
        let attempt_id = attempt.id_typed();
        self.transition(
            attempt,
            PurchaseAttemptCommand::Fail(FailAttempt {
                attempt_id,
                error,
                occurred_at: Utc::now(),
            }),
        );
    }

    fn transition(&self, attempt: &mut PurchaseAttempt, command: PurchaseAttemptCommand) {
        match execute(attempt, &command) {
            Ok(events) => {
                for event in &events {
                    tracing::info!(
                        attempt_id = %attempt.id_typed(),
                        event_type = event.event_type(),
                        version = attempt.version(),
                        "purchase attempt event"
                    );
                }
            }
            Err(err) => {
                tracing::error!(
                    attempt_id = %attempt.id_typed(),
                    error = %err,
                    "rejected purchase attempt transition"
                );
                if matches!(command, PurchaseAttemptCommand::Fail(_)) {
                    return;
                }

                let fail = PurchaseAttemptCommand::Fail(FailAttempt {
                    attempt_id: attempt.id_typed(),
                    error: BillingError::InvalidTransition {
                        reason: err.to_string(),
                    },
                    occurred_at: Utc::now(),
                });
                // Terminal attempts keep their decided result.
                if execute(attempt, &fail).is_ok() {
                    tracing::warn!(
                        attempt_id = %attempt.id_typed(),
                        version = attempt.version(),
                        "purchase attempt failed after rejected transition"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::in_memory::InMemoryBackend;
    use entitle_products::OfferDescriptor;

    fn pid(s: &str) -> ProductId {
        ProductId::new(s).unwrap()
    }

    fn premium() -> ProductDescriptor {
        ProductDescriptor::recurring(
            pid("premium"),
            "Premium",
            vec![OfferDescriptor::new("yearly", "offer-y", "$39.99")],
        )
        .unwrap()
    }

    fn purchased(acknowledged: bool) -> PurchaseRecord {
        PurchaseRecord::new(
            vec![pid("premium")],
            PurchaseState::Purchased,
            PurchaseToken::new("tok-premium").unwrap(),
            acknowledged,
        )
    }

    fn orchestrator(backend: &Arc<InMemoryBackend>) -> Arc<PurchaseOrchestrator> {
        let connection = ConnectionManager::new(backend.clone(), RetryPolicy::default());
        let entitlements = EntitlementTracker::new(backend.clone(), connection.clone());
        PurchaseOrchestrator::new(backend.clone(), connection, entitlements, None)
    }

    async fn deliver_after_launch(
        backend: &Arc<InMemoryBackend>,
        orchestrator: &Arc<PurchaseOrchestrator>,
        update: PurchasesUpdate,
    ) {
        backend.wait_for_launches(1).await;
        orchestrator.on_purchases_updated(update);
    }

    #[tokio::test]
    async fn unknown_plan_fails_without_touching_the_service() {
        let backend = Arc::new(InMemoryBackend::new());
        let orchestrator = orchestrator(&backend);

        let outcome = orchestrator
            .purchase(&premium(), ProductKind::Recurring, Some("monthly"))
            .await;

        assert_eq!(outcome.state(), AttemptState::Failed);
        assert!(matches!(
            outcome.failure(),
            Some(BillingError::OfferResolutionFailed { .. })
        ));
        assert_eq!(backend.calls().service_calls(), 0);
        assert_eq!(orchestrator.active_attempt(), None);
    }

    #[tokio::test]
    async fn acknowledges_and_reports_entitled() {
        let backend = Arc::new(InMemoryBackend::new());
        let orchestrator = orchestrator(&backend);

        let product = premium();
        let (outcome, ()) = tokio::join!(
            orchestrator.purchase(&product, ProductKind::Recurring, Some("yearly")),
            deliver_after_launch(
                &backend,
                &orchestrator,
                PurchasesUpdate::new(BillingResponse::ok(), vec![purchased(false)]),
            ),
        );

        assert!(outcome.is_entitled());
        assert_eq!(outcome.state(), AttemptState::Acknowledged);
        assert_eq!(outcome.attempt().version(), 4);
        assert_eq!(backend.calls().acknowledgements, 1);
        assert_eq!(
            backend.launch_requests()[0].offer_token.as_deref(),
            Some("offer-y")
        );
    }

    #[tokio::test]
    async fn user_cancel_ends_cancelled() {
        let backend = Arc::new(InMemoryBackend::new());
        let orchestrator = orchestrator(&backend);

        let product = premium();
        let (outcome, ()) = tokio::join!(
            orchestrator.purchase(&product, ProductKind::Recurring, Some("yearly")),
            deliver_after_launch(
                &backend,
                &orchestrator,
                PurchasesUpdate::new(BillingResponse::new(ResponseCode::UserCanceled, ""), vec![]),
            ),
        );

        assert_eq!(outcome.state(), AttemptState::Cancelled);
        assert!(!outcome.is_entitled());
    }

    #[tokio::test]
    async fn pending_purchase_is_not_completed() {
        let backend = Arc::new(InMemoryBackend::new());
        let orchestrator = orchestrator(&backend);
        let pending = PurchaseRecord {
            state: PurchaseState::Pending,
            ..purchased(false)
        };

        let product = premium();
        let (outcome, ()) = tokio::join!(
            orchestrator.purchase(&product, ProductKind::Recurring, Some("yearly")),
            deliver_after_launch(
                &backend,
                &orchestrator,
                PurchasesUpdate::new(BillingResponse::ok(), vec![pending]),
            ),
        );

        assert_eq!(outcome.state(), AttemptState::Failed);
        assert_eq!(
            outcome.failure(),
            Some(&BillingError::PurchaseNotCompleted {
                reason: "purchase is pending".to_string()
            })
        );
        assert_eq!(backend.calls().acknowledgements, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_an_attempt_that_never_hears_back() {
        let backend = Arc::new(InMemoryBackend::new());
        let connection = ConnectionManager::new(backend.clone(), RetryPolicy::default());
        let entitlements = EntitlementTracker::new(backend.clone(), connection.clone());
        let orchestrator = PurchaseOrchestrator::new(
            backend.clone(),
            connection,
            entitlements,
            Some(Duration::from_secs(30)),
        );

        let outcome = orchestrator
            .purchase(&premium(), ProductKind::Recurring, Some("yearly"))
            .await;

        assert_eq!(outcome.state(), AttemptState::Failed);
        assert!(matches!(
            outcome.failure(),
            Some(BillingError::PurchaseNotCompleted { .. })
        ));
        assert_eq!(orchestrator.active_attempt(), None);
    }

    #[tokio::test]
    async fn consume_attempt_moves_acknowledged_attempt_to_consumed() {
        let backend = Arc::new(InMemoryBackend::new());
        let orchestrator = orchestrator(&backend);
        backend.add_owned(ProductKind::Recurring, purchased(true));

        let product = premium();
        let (outcome, ()) = tokio::join!(
            orchestrator.purchase(&product, ProductKind::Recurring, Some("yearly")),
            deliver_after_launch(
                &backend,
                &orchestrator,
                PurchasesUpdate::new(BillingResponse::ok(), vec![purchased(true)]),
            ),
        );
        assert_eq!(outcome.state(), AttemptState::Acknowledged);
        assert_eq!(backend.calls().acknowledgements, 0);

        let consumed = orchestrator.consume_attempt(outcome).await;
        assert_eq!(consumed.state(), AttemptState::Consumed);
        assert!(backend.owned(ProductKind::Recurring).is_empty());
    }

    #[tokio::test]
    async fn unrelated_notification_leaves_the_attempt_waiting() {
        let backend = Arc::new(InMemoryBackend::new());
        let orchestrator = orchestrator(&backend);
        let older = PurchaseRecord::new(
            vec![pid("life_time")],
            PurchaseState::Purchased,
            PurchaseToken::new("tok-old").unwrap(),
            false,
        );
        backend.add_owned(ProductKind::OneTime, older.clone());

        let product = premium();
        let deliver = async {
            backend.wait_for_launches(1).await;
            orchestrator.on_purchases_updated(PurchasesUpdate::new(BillingResponse::ok(), vec![older]));
            orchestrator
                .on_purchases_updated(PurchasesUpdate::new(BillingResponse::ok(), vec![purchased(false)]));
        };
        let (outcome, ()) = tokio::join!(
            orchestrator.purchase(&product, ProductKind::Recurring, Some("yearly")),
            deliver,
        );

        assert_eq!(outcome.state(), AttemptState::Acknowledged);
        for _ in 0..20 {
            if backend.calls().acknowledgements == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(backend.calls().acknowledgements, 2);
        assert!(backend.owned(ProductKind::OneTime)[0].is_acknowledged);
    }

    #[tokio::test]
    async fn abandoned_attempt_still_acknowledges_its_delivered_result() {
        let backend = Arc::new(InMemoryBackend::new());
        let orchestrator = orchestrator(&backend);
        backend.add_owned(ProductKind::Recurring, purchased(false));

        let task = tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move {
                orchestrator
                    .purchase(&premium(), ProductKind::Recurring, Some("yearly"))
                    .await
            }
        });
        backend.wait_for_launches(1).await;
        orchestrator.on_purchases_updated(PurchasesUpdate::new(
            BillingResponse::ok(),
            vec![purchased(false)],
        ));
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        for _ in 0..20 {
            if backend.calls().acknowledgements == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(backend.calls().acknowledgements, 1);
        assert!(backend.owned(ProductKind::Recurring)[0].is_acknowledged);
        assert_eq!(orchestrator.active_attempt(), None);
    }

    #[tokio::test]
    async fn rejected_transition_marks_the_attempt_failed() {
        let backend = Arc::new(InMemoryBackend::new());
        let orchestrator = orchestrator(&backend);
        let attempt_id = AttemptId::new();
        let mut attempt = PurchaseAttempt::empty(attempt_id);
        orchestrator.transition(
            &mut attempt,
            PurchaseAttemptCommand::Launch(LaunchAttempt {
                attempt_id,
                product_id: pid("premium"),
                kind: ProductKind::Recurring,
                selected_plan_id: Some("yearly".to_string()),
                occurred_at: Utc::now(),
            }),
        );

        orchestrator.transition(
            &mut attempt,
            PurchaseAttemptCommand::Acknowledge(AcknowledgePurchase {
                attempt_id,
                occurred_at: Utc::now(),
            }),
        );

        assert_eq!(attempt.state(), AttemptState::Failed);
        assert!(matches!(
            attempt.failure(),
            Some(BillingError::InvalidTransition { .. })
        ));
        assert_eq!(attempt.version(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_reason_keeps_sub_second_precision() {
        let backend = Arc::new(InMemoryBackend::new());
        let connection = ConnectionManager::new(backend.clone(), RetryPolicy::default());
        let entitlements = EntitlementTracker::new(backend.clone(), connection.clone());
        let orchestrator = PurchaseOrchestrator::new(
            backend.clone(),
            connection,
            entitlements,
            Some(Duration::from_millis(250)),
        );

        let outcome = orchestrator
            .purchase(&premium(), ProductKind::Recurring, Some("yearly"))
            .await;

        assert_eq!(
            outcome.failure(),
            Some(&BillingError::PurchaseNotCompleted {
                reason: "no purchase result within 250ms".to_string()
            })
        );
    }
}
