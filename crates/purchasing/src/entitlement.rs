use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use entitle_core::{ProductId, ProductKind};

use crate::record::PurchaseRecord;

/// Product ids the caller currently holds (purchased and acknowledged),
/// partitioned by kind.
///
/// Always rebuilt from a fresh owned-items query; never patched in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementSet {
    one_time: BTreeSet<ProductId>,
    recurring: BTreeSet<ProductId>,
}

impl EntitlementSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the set for one kind from that kind's owned-items query.
    pub fn from_owned(kind: ProductKind, records: &[PurchaseRecord]) -> Self {
        let mut set = Self::new();
        set.replace_kind(kind, records);
        set
    }

    /// Replace every entry of `kind` with what `records` entitles.
    pub fn replace_kind(&mut self, kind: ProductKind, records: &[PurchaseRecord]) {
        let owned = records
            .iter()
            .filter(|r| r.is_entitling())
            .flat_map(|r| r.product_ids.iter().cloned())
            .collect();
        *self.ids_mut(kind) = owned;
    }

    pub fn ids(&self, kind: ProductKind) -> &BTreeSet<ProductId> {
        match kind {
            ProductKind::OneTime => &self.one_time,
            ProductKind::Recurring => &self.recurring,
        }
    }

    fn ids_mut(&mut self, kind: ProductKind) -> &mut BTreeSet<ProductId> {
        match kind {
            ProductKind::OneTime => &mut self.one_time,
            ProductKind::Recurring => &mut self.recurring,
        }
    }

    pub fn contains(&self, kind: ProductKind, product_id: &str) -> bool {
        self.ids(kind).contains(product_id)
    }

    /// True when any of `watched` is held under `kind`.
    pub fn has_any<'a, I>(&self, kind: ProductKind, watched: I) -> bool
    where
        I: IntoIterator<Item = &'a ProductId>,
    {
        let owned = self.ids(kind);
        watched.into_iter().any(|id| owned.contains(id))
    }

    pub fn is_empty(&self) -> bool {
        self.one_time.is_empty() && self.recurring.is_empty()
    }
}
