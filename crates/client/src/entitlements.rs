//! Derived "is entitled" status.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures_util::stream::{self, Stream};
use tokio::sync::watch;

use entitle_core::{BillingError, ProductId, ProductKind};
use entitle_products::ProductSelection;
use entitle_purchasing::EntitlementSet;

use crate::backend::BillingBackend;
use crate::connection::{ConnectionManager, Session, SessionState};

/// Answers "does the caller hold any of these products?" from fresh owned-items
/// queries. Fails closed: any query failure counts as not entitled.
pub struct EntitlementTracker {
    backend: Arc<dyn BillingBackend>,
    connection: Arc<ConnectionManager>,
    refresh: watch::Sender<u64>,
}

impl EntitlementTracker {
    pub fn new(backend: Arc<dyn BillingBackend>, connection: Arc<ConnectionManager>) -> Arc<Self> {
        let (refresh, _) = watch::channel(0);
        Arc::new(Self {
            backend,
            connection,
            refresh,
        })
    }

    /// Ask every active `watch()` stream to recompute.
    pub fn refresh(&self) {
        self.refresh.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// Single-shot check across both kinds.
    pub async fn check(&self, selection: &ProductSelection) -> bool {
        if selection.is_empty() {
            return false;
        }
        if !self.connection.ready().await {
            tracing::debug!("no billing session; reporting not entitled");
            return false;
        }

        let (one_time, recurring) = tokio::join!(
            self.check_kind(ProductKind::OneTime, selection.ids(ProductKind::OneTime)),
            self.check_kind(ProductKind::Recurring, selection.ids(ProductKind::Recurring)),
        );
        one_time || recurring
    }

    async fn check_kind(&self, kind: ProductKind, watched: &BTreeSet<ProductId>) -> bool {
        if watched.is_empty() {
            return false;
        }

        match self.backend.query_owned_purchases(kind).await {
            Ok(records) => EntitlementSet::from_owned(kind, &records).has_any(kind, watched),
            Err(response) => {
                let err = BillingError::QueryFailed { kind, response };
                tracing::warn!(kind = %kind, code = err.code(), error = %err, "owned purchases query failed");
                false
            }
        }
    }

    /// Current value first, then a new value whenever a refresh changes it.
    ///
    /// Ends when the client is terminated.
    pub fn watch(
        self: &Arc<Self>,
        selection: ProductSelection,
    ) -> impl Stream<Item = bool> + Send + 'static {
        let cursor = WatchCursor {
            tracker: Arc::clone(self),
            selection,
            refresh: self.refresh.subscribe(),
            session: self.connection.subscribe(),
            last: None,
            started: false,
        };
        stream::unfold(cursor, |mut cursor| async move {
            let value = cursor.next_value().await?;
            Some((value, cursor))
        })
    }
}

struct WatchCursor {
    tracker: Arc<EntitlementTracker>,
    selection: ProductSelection,
    refresh: watch::Receiver<u64>,
    session: watch::Receiver<Session>,
    last: Option<bool>,
    started: bool,
}

impl WatchCursor {
    async fn next_value(&mut self) -> Option<bool> {
        loop {
            if self.started {
                tokio::select! {
                    changed = self.refresh.changed() => {
                        if changed.is_err() {
                            return None;
                        }
                    }
                    _ = terminated(&mut self.session) => {
                        return None;
                    }
                }
            } else {
                self.started = true;
                // Refreshes before the first value are covered by it.
                let _ = self.refresh.borrow_and_update();
            }

            if self.tracker.connection.is_terminated() {
                return None;
            }
            let value = self.tracker.check(&self.selection).await;
            if self.tracker.connection.is_terminated() {
                return None;
            }

            if self.last != Some(value) {
                self.last = Some(value);
                return Some(value);
            }
        }
    }
}

async fn terminated(session: &mut watch::Receiver<Session>) {
    loop {
        if session.borrow_and_update().state == SessionState::Terminated {
            return;
        }
        if session.changed().await.is_err() {
            return;
        }
    }
}
