//! Purchasing domain module.
//!
//! Purchase attempts are modelled as a pure state machine (no IO, no async).
//! Owned-purchase records and the entitlement rule derived from them live here
//! too, so the client crate only has to fetch and route.

pub mod attempt;
pub mod entitlement;
pub mod record;

pub use attempt::{
    AcceptLaunch, AcknowledgePurchase, AttemptCancelled, AttemptFailed, AttemptLaunched,
    AttemptState, CancelAttempt, ConfirmPurchase, ConsumePurchase, FailAttempt, LaunchAccepted,
    LaunchAttempt, PurchaseAcknowledged, PurchaseAttempt, PurchaseAttemptCommand,
    PurchaseAttemptEvent, PurchaseConfirmed, PurchaseConsumed,
};
pub use entitlement::EntitlementSet;
pub use record::{PurchaseRecord, PurchaseState};
