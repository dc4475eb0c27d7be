//! Error model.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::kind::ProductKind;
use crate::response::BillingResponse;

/// Result type used by the pure domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Raised by aggregates when a command does not fit the current state. Billing
/// service failures are not domain errors; they are [`BillingError`]s.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A domain invariant was violated (e.g. illegal state transition).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A conflict occurred (e.g. the aggregate was already created).
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}

/// Failure taxonomy for session, query and purchase-flow operations.
///
/// None of these are fatal. Query failures are absorbed into empty/false
/// results by the caller-facing API; connection and purchase failures end up as
/// terminal state values. Issuing a fresh call always recovers.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum BillingError {
    /// Reconnect attempts exhausted; a fresh `connect()` is required.
    #[error("billing connection retries exhausted")]
    ConnectionExhausted,

    /// The client was terminated; no further service calls are possible.
    #[error("billing client terminated")]
    Terminated,

    /// The service refused to start the purchase flow.
    #[error("purchase flow launch rejected: {0}")]
    LaunchRejected(BillingResponse),

    /// No offer matches the requested plan of a recurring product.
    #[error("no offer for plan {plan:?} on product {product_id}")]
    OfferResolutionFailed {
        product_id: String,
        plan: Option<String>,
    },

    /// Another purchase attempt is still launched or awaiting its result.
    #[error("another purchase attempt is in progress")]
    PurchaseInProgress,

    /// The purchase notification did not report a completed purchase.
    #[error("purchase not completed: {reason}")]
    PurchaseNotCompleted { reason: String },

    #[error("acknowledge failed: {0}")]
    AcknowledgeFailed(BillingResponse),

    #[error("consume failed: {0}")]
    ConsumeFailed(BillingResponse),

    /// The attempt was asked to make a transition its state does not allow.
    #[error("invalid purchase attempt transition: {reason}")]
    InvalidTransition { reason: String },

    /// A catalog or owned-items query failed.
    #[error("{kind} query failed: {response}")]
    QueryFailed {
        kind: ProductKind,
        response: BillingResponse,
    },
}

impl BillingError {
    /// Stable short name, used as a structured log field.
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::ConnectionExhausted => "connection_exhausted",
            BillingError::Terminated => "terminated",
            BillingError::LaunchRejected(_) => "launch_rejected",
            BillingError::OfferResolutionFailed { .. } => "offer_resolution_failed",
            BillingError::PurchaseInProgress => "purchase_in_progress",
            BillingError::PurchaseNotCompleted { .. } => "purchase_not_completed",
            BillingError::AcknowledgeFailed(_) => "acknowledge_failed",
            BillingError::ConsumeFailed(_) => "consume_failed",
            BillingError::InvalidTransition { .. } => "invalid_transition",
            BillingError::QueryFailed { .. } => "query_failed",
        }
    }
}
