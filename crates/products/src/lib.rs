//! Product catalog model.
//!
//! Descriptors are materialized from the billing service's catalog and never
//! mutated locally (no IO here; the client crate performs the queries).

pub mod descriptor;
pub mod selection;

pub use descriptor::{OfferDescriptor, ProductDescriptor, merge_catalog};
pub use selection::ProductSelection;
