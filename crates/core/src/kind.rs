use serde::{Deserialize, Serialize};

/// Kind of purchasable product.
///
/// The billing service keeps one catalog and one owned-items view per kind, so
/// almost every query is issued once per kind.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductKind {
    /// Non-recurring item, owned permanently or consumed.
    OneTime,
    /// Subscription with one or more selectable plans.
    Recurring,
}

impl ProductKind {
    pub const ALL: [ProductKind; 2] = [ProductKind::OneTime, ProductKind::Recurring];

    pub fn as_str(self) -> &'static str {
        match self {
            ProductKind::OneTime => "one_time",
            ProductKind::Recurring => "recurring",
        }
    }
}

impl core::fmt::Display for ProductKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
