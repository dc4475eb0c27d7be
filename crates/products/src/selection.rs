use std::collections::BTreeSet;

use entitle_core::{ProductId, ProductKind};

/// Product ids of interest, split by kind.
///
/// Catalog queries and entitlement checks are issued once per kind, so callers
/// describe what they want in this shape.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProductSelection {
    one_time: BTreeSet<ProductId>,
    recurring: BTreeSet<ProductId>,
}

impl ProductSelection {
    pub fn new<I, J>(one_time: I, recurring: J) -> Self
    where
        I: IntoIterator<Item = ProductId>,
        J: IntoIterator<Item = ProductId>,
    {
        Self {
            one_time: one_time.into_iter().collect(),
            recurring: recurring.into_iter().collect(),
        }
    }

    pub fn with(mut self, kind: ProductKind, id: ProductId) -> Self {
        match kind {
            ProductKind::OneTime => self.one_time.insert(id),
            ProductKind::Recurring => self.recurring.insert(id),
        };
        self
    }

    pub fn ids(&self, kind: ProductKind) -> &BTreeSet<ProductId> {
        match kind {
            ProductKind::OneTime => &self.one_time,
            ProductKind::Recurring => &self.recurring,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.one_time.is_empty() && self.recurring.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> ProductId {
        ProductId::new(s).unwrap()
    }

    #[test]
    fn duplicate_ids_collapse() {
        let selection = ProductSelection::new([pid("life_time"), pid("life_time")], []);
        assert_eq!(selection.ids(ProductKind::OneTime).len(), 1);
        assert!(selection.ids(ProductKind::Recurring).is_empty());
    }

    #[test]
    fn with_adds_to_the_requested_kind() {
        let selection = ProductSelection::default()
            .with(ProductKind::Recurring, pid("monthly"))
            .with(ProductKind::Recurring, pid("yearly"));
        assert_eq!(selection.ids(ProductKind::Recurring).len(), 2);
        assert!(!selection.is_empty());
    }
}
