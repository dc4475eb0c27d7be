//! `entitle-core`: foundation building blocks shared by the billing crates.
//!
//! This crate contains **pure domain** primitives (no IO, no async).

pub mod aggregate;
pub mod error;
pub mod id;
pub mod kind;
pub mod response;
pub mod value_object;

pub use aggregate::{Aggregate, AggregateRoot};
pub use error::{BillingError, DomainError, DomainResult};
pub use id::{AttemptId, ProductId, PurchaseToken};
pub use kind::ProductKind;
pub use response::{BillingResponse, ResponseCode};
pub use value_object::ValueObject;
