use crate::application::refresh::{RefreshCoordinator, RefreshEndpoint, SessionInvalidated};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::http_backend::{ApiRequest, ApiResponse, HttpBackend};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Outbound request path. Attaches credentials (through the backend's
/// cookie jar), and on a 401 refreshes once through the shared coordinator
/// before replaying the request exactly once.
pub struct Transport<B: HttpBackend> {
    backend: Arc<B>,
    coordinator: Arc<RefreshCoordinator>,
}

impl<B: HttpBackend + 'static> Transport<B> {
    /// The refresh coordinator, and with it the one `RefreshState`, is
    /// created here and shared by every clone of this transport.
    pub fn new(backend: Arc<B>) -> Self {
        let refresher = Arc::new(RefreshEndpoint::new(Arc::clone(&backend)));
        Self {
            backend,
            coordinator: Arc::new(RefreshCoordinator::new(refresher)),
        }
    }
}

impl<B: HttpBackend> Transport<B> {
    pub fn with_coordinator(backend: Arc<B>, coordinator: Arc<RefreshCoordinator>) -> Self {
        Self {
            backend,
            coordinator,
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    pub fn subscribe_invalidated(&self) -> broadcast::Receiver<SessionInvalidated> {
        self.coordinator.subscribe_invalidated()
    }

    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, InfraError> {
        let error = match self.send_once(&request).await {
            Ok(response) => return Ok(response),
            Err(error) => error,
        };

        if error.is_network() || !request.is_retryable() || request.was_retried() {
            return Err(error);
        }
        if !error.is_unauthorized() {
            return Err(error);
        }

        tracing::debug!(path = %request.path, "unauthorized; refreshing credentials before replay");
        self.coordinator.ensure_fresh_credentials().await?;

        let replay = request.into_replay();
        self.send_once(&replay).await
    }

    async fn send_once(&self, request: &ApiRequest) -> Result<ApiResponse, InfraError> {
        self.backend.execute(request).await?.into_result()
    }
}

impl<B: HttpBackend> Clone for Transport<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            coordinator: Arc::clone(&self.coordinator),
        }
    }
}
