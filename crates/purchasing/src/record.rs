use serde::{Deserialize, Serialize};

use entitle_core::{ProductId, PurchaseToken};

/// Purchase state as reported by the billing service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseState {
    Purchased,
    /// Payment still being processed (e.g. cash or delayed payment methods).
    Pending,
    Unspecified,
}

/// An owned purchase, as returned by owned-items queries and purchase
/// notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseRecord {
    pub product_ids: Vec<ProductId>,
    pub state: PurchaseState,
    pub token: PurchaseToken,
    pub is_acknowledged: bool,
}

impl PurchaseRecord {
    pub fn new(
        product_ids: Vec<ProductId>,
        state: PurchaseState,
        token: PurchaseToken,
        is_acknowledged: bool,
    ) -> Self {
        Self {
            product_ids,
            state,
            token,
            is_acknowledged,
        }
    }

    pub fn covers(&self, product_id: &str) -> bool {
        self.product_ids.iter().any(|p| p.as_str() == product_id)
    }

    /// Purchased and acknowledged: the only shape that grants an entitlement.
    pub fn is_entitling(&self) -> bool {
        self.state == PurchaseState::Purchased && self.is_acknowledged
    }

    /// Purchased but never acknowledged; the service revokes these if left alone.
    pub fn needs_acknowledgement(&self) -> bool {
        self.state == PurchaseState::Purchased && !self.is_acknowledged
    }
}
