//! Billing session lifecycle: single-flight connect, bounded reconnect, terminate.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::stream::{self, Stream};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::backend::{BillingBackend, SetupOutcome};
use crate::config::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    /// A connect is outstanding or a reconnect is scheduled.
    Connecting,
    Connected,
    /// Reconnects were exhausted; a fresh `connect()` starts a new cycle.
    Failed,
    Terminated,
}

/// Snapshot of the billing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Session {
    pub state: SessionState,
    /// Consecutive failed connects in the current cycle.
    pub retry_attempt: u32,
}

impl Session {
    fn new(state: SessionState, retry_attempt: u32) -> Self {
        Self {
            state,
            retry_attempt,
        }
    }
}

/// What `connect()` callers observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

struct Inner {
    session: Session,
    /// The task performing the next connect (possibly sleeping first).
    task: Option<JoinHandle<()>>,
}

/// Exclusive owner of the billing session.
///
/// Other components only ask for a ready session through [`ready`](Self::ready);
/// nothing else connects or disconnects.
pub struct ConnectionManager {
    backend: Arc<dyn BillingBackend>,
    policy: RetryPolicy,
    inner: Mutex<Inner>,
    session_tx: watch::Sender<Session>,
}

impl ConnectionManager {
    pub fn new(backend: Arc<dyn BillingBackend>, policy: RetryPolicy) -> Arc<Self> {
        let initial = Session::new(SessionState::Disconnected, 0);
        let (session_tx, _) = watch::channel(initial);
        Arc::new(Self {
            backend,
            policy,
            inner: Mutex::new(Inner {
                session: initial,
                task: None,
            }),
            session_tx,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> Session {
        *self.session_tx.borrow()
    }

    pub fn is_terminated(&self) -> bool {
        self.state().state == SessionState::Terminated
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.session_tx.subscribe()
    }

    /// Start (or join) a connection and follow its status.
    ///
    /// Emits `Connected` once the session is up and `Disconnected` when it is
    /// lost, fails, or is terminated. Ends after termination.
    pub fn connect(self: &Arc<Self>) -> impl Stream<Item = ConnectionStatus> + Send + 'static {
        self.request_connection();
        let cursor = StatusCursor {
            rx: self.session_tx.subscribe(),
            last: None,
            closed: false,
        };
        stream::unfold(cursor, |mut cursor| async move {
            let status = cursor.next_status().await?;
            Some((status, cursor))
        })
    }

    /// Connect if needed and wait until the session settles.
    ///
    /// True when `Connected`; false once the cycle ends `Failed` or the client
    /// is terminated.
    pub async fn ready(self: &Arc<Self>) -> bool {
        self.request_connection();
        let mut rx = self.session_tx.subscribe();
        loop {
            let state = rx.borrow_and_update().state;
            match state {
                SessionState::Connected => return true,
                SessionState::Failed | SessionState::Terminated => return false,
                SessionState::Disconnected | SessionState::Connecting => {}
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Release the session. Later connects are refused.
    pub async fn terminate(&self) {
        let task = {
            let mut inner = self.lock();
            if inner.session.state == SessionState::Terminated {
                return;
            }
            self.publish(&mut inner, Session::new(SessionState::Terminated, 0));
            inner.task.take()
        };

        if let Some(task) = task {
            task.abort();
        }
        self.backend.end_connection().await;
        tracing::info!("billing session terminated");
    }

    /// The service dropped an established session.
    pub fn on_service_disconnected(self: &Arc<Self>) {
        let mut inner = self.lock();
        if inner.session.state != SessionState::Connected {
            tracing::debug!(state = ?inner.session.state, "ignoring disconnect notification");
            return;
        }
        self.schedule_retry(&mut inner, "service disconnected");
    }

    fn request_connection(self: &Arc<Self>) {
        let mut inner = self.lock();
        match inner.session.state {
            SessionState::Connected | SessionState::Connecting | SessionState::Terminated => {}
            SessionState::Disconnected | SessionState::Failed => {
                self.publish(&mut inner, Session::new(SessionState::Connecting, 0));
                self.spawn_attempt(&mut inner, Duration::ZERO);
            }
        }
    }

    fn publish(&self, inner: &mut Inner, session: Session) {
        inner.session = session;
        self.session_tx.send_replace(session);
    }

    fn spawn_attempt(self: &Arc<Self>, inner: &mut Inner, delay: Duration) {
        let this = Arc::clone(self);
        inner.task = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            this.run_attempt().await;
        }));
    }

    async fn run_attempt(self: Arc<Self>) {
        let retry_attempt = {
            let inner = self.lock();
            // Terminated (or otherwise moved on) while this attempt was sleeping.
            if inner.session.state != SessionState::Connecting {
                return;
            }
            inner.session.retry_attempt
        };

        tracing::debug!(retry_attempt, "starting billing connection");
        let outcome = self.backend.start_connection().await;

        let mut inner = self.lock();
        if inner.session.state != SessionState::Connecting {
            return;
        }

        match outcome {
            SetupOutcome::Connected => {
                inner.task = None;
                self.publish(&mut inner, Session::new(SessionState::Connected, 0));
                tracing::info!(retry_attempt, "billing session connected");
            }
            SetupOutcome::Failed(response) => {
                tracing::warn!(code = %response.code, response = %response, "billing setup failed");
                self.schedule_retry(&mut inner, "setup failed");
            }
            SetupOutcome::Disconnected => {
                self.schedule_retry(&mut inner, "disconnected during setup");
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, inner: &mut Inner, reason: &str) {
        let attempt = inner.session.retry_attempt + 1;

        if !self.policy.should_retry(attempt) {
            inner.task = None;
            self.publish(inner, Session::new(SessionState::Failed, attempt));
            tracing::error!(retry_attempt = attempt, reason, "billing connection retries exhausted");
            return;
        }

        let delay = self.policy.delay_for_attempt(attempt);
        self.publish(inner, Session::new(SessionState::Connecting, attempt));
        tracing::warn!(
            retry_attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            reason,
            "scheduling billing reconnect"
        );
        self.spawn_attempt(inner, delay);
    }
}

struct StatusCursor {
    rx: watch::Receiver<Session>,
    last: Option<ConnectionStatus>,
    closed: bool,
}

impl StatusCursor {
    async fn next_status(&mut self) -> Option<ConnectionStatus> {
        if self.closed {
            return None;
        }
        loop {
            let state = self.rx.borrow_and_update().state;
            let status = match state {
                SessionState::Connected => Some(ConnectionStatus::Connected),
                SessionState::Disconnected | SessionState::Failed => {
                    Some(ConnectionStatus::Disconnected)
                }
                SessionState::Terminated => {
                    self.closed = true;
                    Some(ConnectionStatus::Disconnected)
                }
                // Still connecting: only a lost session is worth reporting.
                SessionState::Connecting => match self.last {
                    Some(ConnectionStatus::Connected) => Some(ConnectionStatus::Disconnected),
                    _ => None,
                },
            };

            if let Some(status) = status {
                if self.last != Some(status) {
                    self.last = Some(status);
                    return Some(status);
                }
            }
            if self.closed || self.rx.changed().await.is_err() {
                self.closed = true;
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::InMemoryBackend;
    use futures_util::StreamExt;

    fn manager(backend: &Arc<InMemoryBackend>) -> Arc<ConnectionManager> {
        ConnectionManager::new(backend.clone(), RetryPolicy::default())
    }

    #[tokio::test(start_paused = true)]
    async fn ready_connects_once_and_reports_connected() {
        let backend = Arc::new(InMemoryBackend::new());
        let manager = manager(&backend);

        assert!(manager.ready().await);
        assert!(manager.ready().await);
        assert_eq!(manager.state(), Session::new(SessionState::Connected, 0));
        assert_eq!(backend.calls().connects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_spaced_linearly() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.script_setup([SetupOutcome::Disconnected, SetupOutcome::Disconnected]);
        let manager = manager(&backend);

        let started = tokio::time::Instant::now();
        assert!(manager.ready().await);
        // 2 s after the first failure, 4 s after the second.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(6), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(6_100), "{elapsed:?}");
        assert_eq!(backend.calls().connects, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_cycle_fails_and_a_fresh_connect_restarts_it() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.script_setup([
            SetupOutcome::Disconnected,
            SetupOutcome::Failed(entitle_core::BillingResponse::new(
                entitle_core::ResponseCode::BillingUnavailable,
                "",
            )),
            SetupOutcome::Disconnected,
        ]);
        let manager = manager(&backend);

        assert!(!manager.ready().await);
        assert_eq!(manager.state(), Session::new(SessionState::Failed, 3));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(backend.calls().connects, 3);

        assert!(manager.ready().await);
        assert_eq!(backend.calls().connects, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn status_stream_reports_loss_and_recovery() {
        let backend = Arc::new(InMemoryBackend::new());
        let manager = manager(&backend);

        let mut status = Box::pin(manager.connect());
        assert_eq!(status.next().await, Some(ConnectionStatus::Connected));

        manager.on_service_disconnected();
        assert_eq!(status.next().await, Some(ConnectionStatus::Disconnected));
        assert_eq!(manager.state().retry_attempt, 1);

        assert_eq!(status.next().await, Some(ConnectionStatus::Connected));
        assert_eq!(backend.calls().connects, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_aborts_pending_reconnect_and_ends_streams() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.script_setup([SetupOutcome::Disconnected]);
        let manager = manager(&backend);

        let mut status = Box::pin(manager.connect());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(manager.state(), Session::new(SessionState::Connecting, 1));

        manager.terminate().await;
        manager.terminate().await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(backend.calls().connects, 1);
        assert_eq!(backend.calls().end_connections, 1);
        assert_eq!(status.next().await, Some(ConnectionStatus::Disconnected));
        assert_eq!(status.next().await, None);
        assert!(!manager.ready().await);
    }

    #[tokio::test]
    async fn disconnect_while_not_connected_is_ignored() {
        let backend = Arc::new(InMemoryBackend::new());
        let manager = manager(&backend);

        manager.on_service_disconnected();
        assert_eq!(manager.state().state, SessionState::Disconnected);
        assert_eq!(backend.calls().connects, 0);
    }
}
