use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use entitle_core::{
    Aggregate, AggregateRoot, AttemptId, BillingError, DomainError, DomainResult, ProductId,
    ProductKind, PurchaseToken,
};
use entitle_events::Event;

/// Purchase attempt lifecycle.
///
/// `Launched → AwaitingResult → {Confirmed | Failed | Cancelled}`,
/// `Confirmed → Acknowledged → Consumed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Launched,
    AwaitingResult,
    Confirmed,
    Acknowledged,
    Consumed,
    Failed,
    Cancelled,
}

impl AttemptState {
    /// Launched or awaiting its result; holds the single purchase slot.
    pub fn is_active(self) -> bool {
        matches!(self, AttemptState::Launched | AttemptState::AwaitingResult)
    }

    /// The attempt's result can be delivered; nothing more happens automatically.
    ///
    /// `Acknowledged` counts as terminal: consumption is explicit and optional.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AttemptState::Acknowledged
                | AttemptState::Consumed
                | AttemptState::Failed
                | AttemptState::Cancelled
        )
    }

    /// Reached acknowledgment (or beyond).
    pub fn is_entitled(self) -> bool {
        matches!(self, AttemptState::Acknowledged | AttemptState::Consumed)
    }
}

/// Aggregate root: PurchaseAttempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PurchaseAttempt {
    id: AttemptId,
    product_id: Option<ProductId>,
    kind: Option<ProductKind>,
    selected_plan_id: Option<String>,
    state: AttemptState,
    purchase_token: Option<PurchaseToken>,
    failure: Option<BillingError>,
    launched_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl PurchaseAttempt {
    /// Create an empty, not-yet-launched attempt.
    pub fn empty(id: AttemptId) -> Self {
        Self {
            id,
            product_id: None,
            kind: None,
            selected_plan_id: None,
            state: AttemptState::Launched,
            purchase_token: None,
            failure: None,
            launched_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> AttemptId {
        self.id
    }

    pub fn product_id(&self) -> Option<&ProductId> {
        self.product_id.as_ref()
    }

    pub fn kind(&self) -> Option<ProductKind> {
        self.kind
    }

    pub fn selected_plan_id(&self) -> Option<&str> {
        self.selected_plan_id.as_deref()
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    pub fn purchase_token(&self) -> Option<&PurchaseToken> {
        self.purchase_token.as_ref()
    }

    /// Why the attempt failed, when `state == Failed`.
    pub fn failure(&self) -> Option<&BillingError> {
        self.failure.as_ref()
    }

    pub fn launched_at(&self) -> Option<DateTime<Utc>> {
        self.launched_at
    }

    pub fn is_launched(&self) -> bool {
        self.created
    }
}

impl AggregateRoot for PurchaseAttempt {
    type Id = AttemptId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: LaunchAttempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchAttempt {
    pub attempt_id: AttemptId,
    pub product_id: ProductId,
    pub kind: ProductKind,
    pub selected_plan_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AcceptLaunch (the service opened the purchase flow).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptLaunch {
    pub attempt_id: AttemptId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ConfirmPurchase (a matching `Purchased` record was delivered).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmPurchase {
    pub attempt_id: AttemptId,
    pub purchase_token: PurchaseToken,
    /// The service already reports the purchase as acknowledged.
    pub already_acknowledged: bool,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AcknowledgePurchase (the acknowledge call succeeded).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgePurchase {
    pub attempt_id: AttemptId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ConsumePurchase (the consume call succeeded).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumePurchase {
    pub attempt_id: AttemptId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelAttempt (the user backed out of the flow).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelAttempt {
    pub attempt_id: AttemptId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: FailAttempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailAttempt {
    pub attempt_id: AttemptId,
    pub error: BillingError,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseAttemptCommand {
    Launch(LaunchAttempt),
    AcceptLaunch(AcceptLaunch),
    Confirm(ConfirmPurchase),
    Acknowledge(AcknowledgePurchase),
    Consume(ConsumePurchase),
    Cancel(CancelAttempt),
    Fail(FailAttempt),
}

/// Event: AttemptLaunched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptLaunched {
    pub attempt_id: AttemptId,
    pub product_id: ProductId,
    pub kind: ProductKind,
    pub selected_plan_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LaunchAccepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchAccepted {
    pub attempt_id: AttemptId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PurchaseConfirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseConfirmed {
    pub attempt_id: AttemptId,
    pub purchase_token: PurchaseToken,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PurchaseAcknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseAcknowledged {
    pub attempt_id: AttemptId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PurchaseConsumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseConsumed {
    pub attempt_id: AttemptId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: AttemptCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptCancelled {
    pub attempt_id: AttemptId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: AttemptFailed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptFailed {
    pub attempt_id: AttemptId,
    pub error: BillingError,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PurchaseAttemptEvent {
    AttemptLaunched(AttemptLaunched),
    LaunchAccepted(LaunchAccepted),
    PurchaseConfirmed(PurchaseConfirmed),
    PurchaseAcknowledged(PurchaseAcknowledged),
    PurchaseConsumed(PurchaseConsumed),
    AttemptCancelled(AttemptCancelled),
    AttemptFailed(AttemptFailed),
}

impl Event for PurchaseAttemptEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PurchaseAttemptEvent::AttemptLaunched(_) => "purchasing.attempt.launched",
            PurchaseAttemptEvent::LaunchAccepted(_) => "purchasing.attempt.launch_accepted",
            PurchaseAttemptEvent::PurchaseConfirmed(_) => "purchasing.attempt.confirmed",
            PurchaseAttemptEvent::PurchaseAcknowledged(_) => "purchasing.attempt.acknowledged",
            PurchaseAttemptEvent::PurchaseConsumed(_) => "purchasing.attempt.consumed",
            PurchaseAttemptEvent::AttemptCancelled(_) => "purchasing.attempt.cancelled",
            PurchaseAttemptEvent::AttemptFailed(_) => "purchasing.attempt.failed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            PurchaseAttemptEvent::AttemptLaunched(e) => e.occurred_at,
            PurchaseAttemptEvent::LaunchAccepted(e) => e.occurred_at,
            PurchaseAttemptEvent::PurchaseConfirmed(e) => e.occurred_at,
            PurchaseAttemptEvent::PurchaseAcknowledged(e) => e.occurred_at,
            PurchaseAttemptEvent::PurchaseConsumed(e) => e.occurred_at,
            PurchaseAttemptEvent::AttemptCancelled(e) => e.occurred_at,
            PurchaseAttemptEvent::AttemptFailed(e) => e.occurred_at,
        }
    }
}

impl Aggregate for PurchaseAttempt {
    type Command = PurchaseAttemptCommand;
    type Event = PurchaseAttemptEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            PurchaseAttemptEvent::AttemptLaunched(e) => {
                self.id = e.attempt_id;
                self.product_id = Some(e.product_id.clone());
                self.kind = Some(e.kind);
                self.selected_plan_id = e.selected_plan_id.clone();
                self.state = AttemptState::Launched;
                self.launched_at = Some(e.occurred_at);
                self.created = true;
            }
            PurchaseAttemptEvent::LaunchAccepted(_) => {
                self.state = AttemptState::AwaitingResult;
            }
            PurchaseAttemptEvent::PurchaseConfirmed(e) => {
                self.purchase_token = Some(e.purchase_token.clone());
                self.state = AttemptState::Confirmed;
            }
            PurchaseAttemptEvent::PurchaseAcknowledged(_) => {
                self.state = AttemptState::Acknowledged;
            }
            PurchaseAttemptEvent::PurchaseConsumed(_) => {
                self.state = AttemptState::Consumed;
            }
            PurchaseAttemptEvent::AttemptCancelled(_) => {
                self.state = AttemptState::Cancelled;
            }
            PurchaseAttemptEvent::AttemptFailed(e) => {
                self.failure = Some(e.error.clone());
                self.state = AttemptState::Failed;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            PurchaseAttemptCommand::Launch(cmd) => self.handle_launch(cmd),
            PurchaseAttemptCommand::AcceptLaunch(cmd) => self.handle_accept_launch(cmd),
            PurchaseAttemptCommand::Confirm(cmd) => self.handle_confirm(cmd),
            PurchaseAttemptCommand::Acknowledge(cmd) => self.handle_acknowledge(cmd),
            PurchaseAttemptCommand::Consume(cmd) => self.handle_consume(cmd),
            PurchaseAttemptCommand::Cancel(cmd) => self.handle_cancel(cmd),
            PurchaseAttemptCommand::Fail(cmd) => self.handle_fail(cmd),
        }
    }
}

impl PurchaseAttempt {
    fn ensure_launched(&self, attempt_id: AttemptId) -> DomainResult<()> {
        if !self.created {
            return Err(DomainError::invariant("purchase attempt was never launched"));
        }
        if self.id != attempt_id {
            return Err(DomainError::invariant("attempt_id mismatch"));
        }
        Ok(())
    }

    fn ensure_state(&self, expected: AttemptState, action: &str) -> DomainResult<()> {
        if self.state != expected {
            return Err(DomainError::invariant(format!(
                "cannot {action} a purchase attempt in state {:?}",
                self.state
            )));
        }
        Ok(())
    }

    fn handle_launch(&self, cmd: &LaunchAttempt) -> DomainResult<Vec<PurchaseAttemptEvent>> {
        if self.created {
            return Err(DomainError::conflict("purchase attempt already launched"));
        }
        if cmd.attempt_id != self.id {
            return Err(DomainError::invariant("attempt_id mismatch"));
        }

        Ok(vec![PurchaseAttemptEvent::AttemptLaunched(AttemptLaunched {
            attempt_id: cmd.attempt_id,
            product_id: cmd.product_id.clone(),
            kind: cmd.kind,
            selected_plan_id: cmd.selected_plan_id.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_accept_launch(
        &self,
        cmd: &AcceptLaunch,
    ) -> DomainResult<Vec<PurchaseAttemptEvent>> {
        self.ensure_launched(cmd.attempt_id)?;
        self.ensure_state(AttemptState::Launched, "accept the launch of")?;

        Ok(vec![PurchaseAttemptEvent::LaunchAccepted(LaunchAccepted {
            attempt_id: cmd.attempt_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_confirm(
        &self,
        cmd: &ConfirmPurchase,
    ) -> DomainResult<Vec<PurchaseAttemptEvent>> {
        self.ensure_launched(cmd.attempt_id)?;
        self.ensure_state(AttemptState::AwaitingResult, "confirm")?;

        let mut events = vec![PurchaseAttemptEvent::PurchaseConfirmed(PurchaseConfirmed {
            attempt_id: cmd.attempt_id,
            purchase_token: cmd.purchase_token.clone(),
            occurred_at: cmd.occurred_at,
        })];

        // Already acknowledged remotely: there is nothing left to acknowledge.
        if cmd.already_acknowledged {
            events.push(PurchaseAttemptEvent::PurchaseAcknowledged(PurchaseAcknowledged {
                attempt_id: cmd.attempt_id,
                occurred_at: cmd.occurred_at,
            }));
        }

        Ok(events)
    }

    fn handle_acknowledge(
        &self,
        cmd: &AcknowledgePurchase,
    ) -> DomainResult<Vec<PurchaseAttemptEvent>> {
        self.ensure_launched(cmd.attempt_id)?;
        self.ensure_state(AttemptState::Confirmed, "acknowledge")?;

        Ok(vec![PurchaseAttemptEvent::PurchaseAcknowledged(PurchaseAcknowledged {
            attempt_id: cmd.attempt_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_consume(
        &self,
        cmd: &ConsumePurchase,
    ) -> DomainResult<Vec<PurchaseAttemptEvent>> {
        self.ensure_launched(cmd.attempt_id)?;
        self.ensure_state(AttemptState::Acknowledged, "consume")?;

        Ok(vec![PurchaseAttemptEvent::PurchaseConsumed(PurchaseConsumed {
            attempt_id: cmd.attempt_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelAttempt) -> DomainResult<Vec<PurchaseAttemptEvent>> {
        self.ensure_launched(cmd.attempt_id)?;
        self.ensure_state(AttemptState::AwaitingResult, "cancel")?;

        Ok(vec![PurchaseAttemptEvent::AttemptCancelled(AttemptCancelled {
            attempt_id: cmd.attempt_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_fail(&self, cmd: &FailAttempt) -> DomainResult<Vec<PurchaseAttemptEvent>> {
        self.ensure_launched(cmd.attempt_id)?;

        // Failure is reachable from every non-terminal state, including Confirmed
        // (acknowledge failed). Once terminal, the result has been decided.
        if self.state.is_terminal() {
            return Err(DomainError::invariant(format!(
                "cannot fail a purchase attempt in terminal state {:?}",
                self.state
            )));
        }

        Ok(vec![PurchaseAttemptEvent::AttemptFailed(AttemptFailed {
            attempt_id: cmd.attempt_id,
            error: cmd.error.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}
