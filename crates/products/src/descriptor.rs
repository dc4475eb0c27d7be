use serde::{Deserialize, Serialize};

use entitle_core::{DomainError, ProductId, ProductKind, ValueObject};

/// One selectable plan of a recurring product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferDescriptor {
    pub plan_id: String,
    /// Opaque token required to redeem this specific plan.
    pub token: String,
    pub formatted_price: String,
}

impl ValueObject for OfferDescriptor {}

impl OfferDescriptor {
    pub fn new(
        plan_id: impl Into<String>,
        token: impl Into<String>,
        formatted_price: impl Into<String>,
    ) -> Self {
        Self {
            plan_id: plan_id.into(),
            token: token.into(),
            formatted_price: formatted_price.into(),
        }
    }
}

/// A purchasable unit as reported by the billing service catalog.
///
/// Invariant: recurring products carry at least one offer, one-time products
/// carry none. Use [`ProductDescriptor::one_time`] / [`ProductDescriptor::recurring`]
/// to build validated instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductDescriptor {
    id: ProductId,
    kind: ProductKind,
    title: String,
    description: String,
    display_price: String,
    offers: Vec<OfferDescriptor>,
}

impl ValueObject for ProductDescriptor {}

impl ProductDescriptor {
    pub fn one_time(
        id: ProductId,
        title: impl Into<String>,
        display_price: impl Into<String>,
    ) -> Self {
        Self {
            id,
            kind: ProductKind::OneTime,
            title: title.into(),
            description: String::new(),
            display_price: display_price.into(),
            offers: Vec::new(),
        }
    }

    pub fn recurring(
        id: ProductId,
        title: impl Into<String>,
        offers: Vec<OfferDescriptor>,
    ) -> Result<Self, DomainError> {
        let first = offers.first().ok_or_else(|| {
            DomainError::validation(format!("recurring product {id} must carry at least one offer"))
        })?;
        // Subscriptions have no product-level price; show the first plan's.
        let display_price = first.formatted_price.clone();

        Ok(Self {
            id,
            kind: ProductKind::Recurring,
            title: title.into(),
            description: String::new(),
            display_price,
            offers,
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn id(&self) -> &ProductId {
        &self.id
    }

    pub fn kind(&self) -> ProductKind {
        self.kind
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn display_price(&self) -> &str {
        &self.display_price
    }

    pub fn offers(&self) -> &[OfferDescriptor] {
        &self.offers
    }

    pub fn offer(&self, plan_id: &str) -> Option<&OfferDescriptor> {
        self.offers.iter().find(|o| o.plan_id == plan_id)
    }

    /// Token redeeming `plan_id`, if this product offers that plan.
    ///
    /// First match wins when the service lists several offers for one plan.
    pub fn resolve_offer_token(&self, plan_id: &str) -> Option<&str> {
        self.offer(plan_id).map(|o| o.token.as_str())
    }
}

/// Combine per-kind query results into one catalog: one-time entries first,
/// then recurring entries. No cross-kind ordering is implied beyond that.
pub fn merge_catalog(
    one_time: Vec<ProductDescriptor>,
    recurring: Vec<ProductDescriptor>,
) -> Vec<ProductDescriptor> {
    let mut all = one_time;
    all.extend(recurring);
    all
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> ProductId {
        ProductId::new(s).unwrap()
    }

    fn premium() -> ProductDescriptor {
        ProductDescriptor::recurring(
            pid("premium"),
            "Premium",
            vec![
                OfferDescriptor::new("monthly", "tok-m", "$4.99"),
                OfferDescriptor::new("yearly", "tok-y", "$39.99"),
            ],
        )
        .unwrap()
    }

    #[test]
    fn recurring_requires_at_least_one_offer() {
        let err = ProductDescriptor::recurring(pid("premium"), "Premium", vec![]).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn recurring_display_price_comes_from_first_offer() {
        assert_eq!(premium().display_price(), "$4.99");
        assert_eq!(premium().kind(), ProductKind::Recurring);
    }

    #[test]
    fn resolve_offer_token_matches_plan_id() {
        let p = premium();
        assert_eq!(p.resolve_offer_token("yearly"), Some("tok-y"));
        assert_eq!(p.resolve_offer_token("weekly"), None);
    }

    #[test]
    fn one_time_products_have_no_offers() {
        let p = ProductDescriptor::one_time(pid("life_time"), "Lifetime", "$19.99");
        assert!(p.offers().is_empty());
        assert_eq!(p.resolve_offer_token("monthly"), None);
    }

    #[test]
    fn merge_keeps_one_time_entries_before_recurring() {
        let lt = ProductDescriptor::one_time(pid("life_time"), "Lifetime", "$19.99");
        let merged = merge_catalog(vec![lt.clone()], vec![premium()]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0], lt);
        assert_eq!(merged[1].id().as_str(), "premium");
    }

    #[test]
    fn descriptor_serializes_offers() {
        let json = serde_json::to_value(premium()).unwrap();
        assert_eq!(json["kind"], "recurring");
        assert_eq!(json["offers"][1]["plan_id"], "yearly");
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Property: a plan resolves iff some offer carries that plan id.
            #[test]
            fn resolution_agrees_with_offer_list(
                plans in proptest::collection::vec("[a-z]{1,8}", 1..6),
                wanted in "[a-z]{1,8}",
            ) {
                let offers = plans
                    .iter()
                    .map(|p| OfferDescriptor::new(p.clone(), format!("tok-{p}"), "$1"))
                    .collect();
                let product = ProductDescriptor::recurring(pid("sub"), "Sub", offers).unwrap();

                let resolved = product.resolve_offer_token(&wanted);
                prop_assert_eq!(resolved.is_some(), plans.contains(&wanted));
                if let Some(token) = resolved {
                    prop_assert_eq!(token, format!("tok-{wanted}"));
                }
            }
        }
    }
}
