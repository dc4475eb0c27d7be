use std::collections::BTreeSet;
use std::sync::Arc;

use entitle_core::{BillingError, ProductId, ProductKind};
use entitle_products::{ProductDescriptor, ProductSelection, merge_catalog};

use crate::backend::BillingBackend;
use crate::connection::ConnectionManager;

/// Looks up product descriptors, one query per kind. Nothing is cached.
pub struct CatalogResolver {
    backend: Arc<dyn BillingBackend>,
    connection: Arc<ConnectionManager>,
}

impl CatalogResolver {
    pub fn new(backend: Arc<dyn BillingBackend>, connection: Arc<ConnectionManager>) -> Self {
        Self {
            backend,
            connection,
        }
    }

    /// One-time entries followed by recurring entries.
    ///
    /// A kind whose query fails (or that has no ids) contributes nothing.
    pub async fn query(&self, selection: &ProductSelection) -> Vec<ProductDescriptor> {
        if selection.is_empty() {
            return Vec::new();
        }
        if !self.connection.ready().await {
            tracing::warn!("no billing session; catalog query returns nothing");
            return Vec::new();
        }

        let (one_time, recurring) = tokio::join!(
            self.query_kind(ProductKind::OneTime, selection.ids(ProductKind::OneTime)),
            self.query_kind(ProductKind::Recurring, selection.ids(ProductKind::Recurring)),
        );
        merge_catalog(one_time, recurring)
    }

    async fn query_kind(&self, kind: ProductKind, ids: &BTreeSet<ProductId>) -> Vec<ProductDescriptor> {
        if ids.is_empty() {
            return Vec::new();
        }

        let ids: Vec<ProductId> = ids.iter().cloned().collect();
        match self.backend.query_product_details(&ids, kind).await {
            Ok(products) => {
                tracing::debug!(kind = %kind, requested = ids.len(), found = products.len(), "catalog query");
                products
            }
            Err(response) => {
                let err = BillingError::QueryFailed { kind, response };
                tracing::warn!(kind = %kind, code = err.code(), error = %err, "catalog query failed");
                Vec::new()
            }
        }
    }
}
