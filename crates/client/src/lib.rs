//! Client-side billing session, catalog, entitlement and purchase handling.
//!
//! [`BillingClient`] is the facade. It talks to the platform billing service
//! through a [`BillingBackend`]; [`InMemoryBackend`] is a scriptable stand-in
//! for tests and development.

pub mod backend;
pub mod catalog;
pub mod client;
pub mod config;
pub mod connection;
pub mod entitlements;
pub mod in_memory;
pub mod orchestrator;

pub use backend::{BackendEvent, BillingBackend, LaunchRequest, PurchasesUpdate, SetupOutcome};
pub use catalog::CatalogResolver;
pub use client::BillingClient;
pub use config::{BackoffStrategy, ClientConfig, RetryPolicy};
pub use connection::{ConnectionManager, ConnectionStatus, Session, SessionState};
pub use entitlements::EntitlementTracker;
pub use in_memory::{CallCounts, InMemoryBackend};
pub use orchestrator::{PurchaseOrchestrator, PurchaseOutcome};
