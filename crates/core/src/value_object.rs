//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value**. Catalog records
/// are value objects: a fresh query supersedes them instead of mutating them.
///
/// ```ignore
/// #[derive(Debug, Clone, PartialEq, Eq)]
/// struct Offer {
///     plan_id: String,
///     token: String,
/// }
///
/// impl ValueObject for Offer {}
/// ```
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
