use crate::infrastructure::error::InfraError;
use crate::infrastructure::http_backend::{ApiRequest, HttpBackend, REFRESH_PATH};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, oneshot};

const INVALIDATION_CAPACITY: usize = 16;

/// Raised once per failed refresh so the owner of the authenticated session
/// can drop it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInvalidated {
    pub cause: InfraError,
}

#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh_credentials(&self) -> Result<(), InfraError>;
}

/// Refreshes by calling the refresh endpoint directly on the backend, so a
/// rejected refresh can never recurse into another refresh.
pub struct RefreshEndpoint<B: HttpBackend> {
    backend: Arc<B>,
}

impl<B: HttpBackend> RefreshEndpoint<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl<B: HttpBackend> CredentialRefresher for RefreshEndpoint<B> {
    async fn refresh_credentials(&self) -> Result<(), InfraError> {
        let request = ApiRequest::post(REFRESH_PATH).non_retryable();
        self.backend.execute(&request).await?.into_result()?;
        Ok(())
    }
}

type Waiter = oneshot::Sender<Result<(), InfraError>>;

#[derive(Debug, Default)]
pub struct RefreshState {
    in_progress: bool,
    waiters: Vec<Waiter>,
}

impl RefreshState {
    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn queued(&self) -> usize {
        self.waiters.len()
    }
}

enum Role {
    Leader,
    Follower(oneshot::Receiver<Result<(), InfraError>>),
}

pub struct RefreshCoordinator {
    refresher: Arc<dyn CredentialRefresher>,
    state: Mutex<RefreshState>,
    invalidated: broadcast::Sender<SessionInvalidated>,
}

impl RefreshCoordinator {
    pub fn new(refresher: Arc<dyn CredentialRefresher>) -> Self {
        let (invalidated, _) = broadcast::channel(INVALIDATION_CAPACITY);
        Self {
            refresher,
            state: Mutex::new(RefreshState::default()),
            invalidated,
        }
    }

    pub fn subscribe_invalidated(&self) -> broadcast::Receiver<SessionInvalidated> {
        self.invalidated.subscribe()
    }

    pub fn is_refreshing(&self) -> bool {
        self.state().in_progress()
    }

    pub fn queued_waiters(&self) -> usize {
        self.state().queued()
    }

    /// Single-flight refresh. The first caller performs the refresh; callers
    /// arriving while it is in flight wait for the same outcome.
    pub async fn ensure_fresh_credentials(&self) -> Result<(), InfraError> {
        // Check and set happen under one lock with no await in between.
        let role = {
            let mut state = self.state();
            if state.in_progress {
                let (sender, receiver) = oneshot::channel();
                state.waiters.push(sender);
                Role::Follower(receiver)
            } else {
                state.in_progress = true;
                Role::Leader
            }
        };

        match role {
            Role::Follower(receiver) => receiver.await.unwrap_or(Err(InfraError::RefreshAbandoned)),
            Role::Leader => {
                let mut flight = InFlight {
                    coordinator: self,
                    settled: false,
                };
                tracing::debug!("refreshing credentials");
                let outcome = self
                    .refresher
                    .refresh_credentials()
                    .await
                    .map_err(|error| InfraError::RefreshFailed(Box::new(error)));
                flight.settle(outcome.clone());
                outcome
            }
        }
    }

    fn state(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, outcome: Result<(), InfraError>, signal_invalidation: bool) {
        let waiters = {
            let mut state = self.state();
            state.in_progress = false;
            std::mem::take(&mut state.waiters)
        };

        match &outcome {
            Ok(()) => tracing::debug!(waiters = waiters.len(), "credential refresh succeeded"),
            Err(cause) => {
                tracing::warn!(
                    waiters = waiters.len(),
                    error = %cause,
                    "credential refresh failed"
                );
                if signal_invalidation {
                    let _ = self.invalidated.send(SessionInvalidated {
                        cause: cause.clone(),
                    });
                }
            }
        }

        for waiter in waiters {
            let _ = waiter.send(outcome.clone());
        }
    }
}

/// Held by the leader while its refresh is in flight. If the leader is
/// dropped before settling, waiters are released with `RefreshAbandoned`.
struct InFlight<'a> {
    coordinator: &'a RefreshCoordinator,
    settled: bool,
}

impl InFlight<'_> {
    fn settle(&mut self, outcome: Result<(), InfraError>) {
        self.settled = true;
        self.coordinator.release(outcome, true);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.coordinator.release(Err(InfraError::RefreshAbandoned), false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::http_backend::ApiResponse;
    use futures::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct FakeRefresher {
        calls: AtomicUsize,
        fail_with: Mutex<Option<InfraError>>,
        gate: Option<Arc<Notify>>,
    }

    impl FakeRefresher {
        fn failing(error: InfraError) -> Self {
            Self {
                fail_with: Mutex::new(Some(error)),
                ..Self::default()
            }
        }

        fn gated(gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl CredentialRefresher for FakeRefresher {
        async fn refresh_credentials(&self) -> Result<(), InfraError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.gate {
                Some(gate) => gate.notified().await,
                None => tokio::time::sleep(Duration::from_millis(20)).await,
            }
            match self.fail_with.lock().expect("fail mutex poisoned").clone() {
                Some(error) => Err(error),
                None => Ok(()),
            }
        }
    }

    #[derive(Default)]
    struct CountingBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HttpBackend for CountingBackend {
        async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, InfraError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(request.path, REFRESH_PATH);
            assert!(!request.is_retryable());
            Ok(ApiResponse::new(401, "refresh token expired"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_refresh() {
        let refresher = Arc::new(FakeRefresher::default());
        let coordinator = RefreshCoordinator::new(refresher.clone());

        let results = join_all((0..5).map(|_| coordinator.ensure_fresh_credentials())).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert!(!coordinator.is_refreshing());
        assert_eq!(coordinator.queued_waiters(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_rejects_every_caller_and_signals_once() {
        let refresher = Arc::new(FakeRefresher::failing(InfraError::Http {
            status: 401,
            body: "expired".to_string(),
        }));
        let coordinator = RefreshCoordinator::new(refresher.clone());
        let mut invalidated = coordinator.subscribe_invalidated();

        let results = join_all((0..4).map(|_| coordinator.ensure_fresh_credentials())).await;

        let expected = InfraError::RefreshFailed(Box::new(InfraError::Http {
            status: 401,
            body: "expired".to_string(),
        }));
        assert!(results.iter().all(|result| result.as_ref().err() == Some(&expected)));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);

        let signal = invalidated.try_recv().expect("one invalidation");
        assert_eq!(signal.cause, expected);
        assert!(invalidated.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn each_failure_signals_separately() {
        let coordinator =
            RefreshCoordinator::new(Arc::new(FakeRefresher::failing(InfraError::Timeout)));
        let mut invalidated = coordinator.subscribe_invalidated();

        assert!(coordinator.ensure_fresh_credentials().await.is_err());
        assert!(coordinator.ensure_fresh_credentials().await.is_err());

        assert!(invalidated.try_recv().is_ok());
        assert!(invalidated.try_recv().is_ok());
        assert!(invalidated.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn state_is_cleared_between_attempts() {
        let refresher = Arc::new(FakeRefresher::default());
        let coordinator = RefreshCoordinator::new(refresher.clone());

        coordinator.ensure_fresh_credentials().await.expect("first refresh");
        coordinator.ensure_fresh_credentials().await.expect("second refresh");

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn abandoned_leader_releases_waiters() {
        let gate = Arc::new(Notify::new());
        let coordinator = Arc::new(RefreshCoordinator::new(Arc::new(FakeRefresher::gated(
            Arc::clone(&gate),
        ))));
        let mut invalidated = coordinator.subscribe_invalidated();

        let leader = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.ensure_fresh_credentials().await })
        };
        tokio::task::yield_now().await;
        assert!(coordinator.is_refreshing());

        let follower = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.ensure_fresh_credentials().await })
        };
        tokio::task::yield_now().await;
        assert_eq!(coordinator.queued_waiters(), 1);

        leader.abort();
        assert!(leader.await.is_err());

        let outcome = follower.await.expect("follower task");
        assert_eq!(outcome, Err(InfraError::RefreshAbandoned));
        assert!(!coordinator.is_refreshing());
        assert!(invalidated.try_recv().is_err());
    }

    #[tokio::test]
    async fn waiters_resume_in_arrival_order() {
        let gate = Arc::new(Notify::new());
        let coordinator = Arc::new(RefreshCoordinator::new(Arc::new(FakeRefresher::gated(
            Arc::clone(&gate),
        ))));
        let resumed = Arc::new(Mutex::new(Vec::new()));

        let leader = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.ensure_fresh_credentials().await })
        };
        tokio::task::yield_now().await;

        let mut followers = Vec::new();
        for index in 0..4 {
            let task_coordinator = Arc::clone(&coordinator);
            let resumed = Arc::clone(&resumed);
            followers.push(tokio::spawn(async move {
                let outcome = task_coordinator.ensure_fresh_credentials().await;
                resumed.lock().expect("order mutex poisoned").push(index);
                outcome
            }));
            tokio::task::yield_now().await;
            assert_eq!(coordinator.queued_waiters(), index + 1);
        }

        gate.notify_one();
        leader.await.expect("leader task").expect("refresh");
        for follower in followers {
            follower.await.expect("follower task").expect("shared refresh");
        }

        assert_eq!(*resumed.lock().expect("order mutex poisoned"), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn refresh_endpoint_surfaces_rejection_without_recursing() {
        let backend = Arc::new(CountingBackend::default());
        let coordinator = RefreshCoordinator::new(Arc::new(RefreshEndpoint::new(backend.clone())));

        let outcome = coordinator.ensure_fresh_credentials().await;

        assert!(matches!(outcome, Err(InfraError::RefreshFailed(_))));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }
}
