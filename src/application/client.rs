use crate::application::api::{AuthApi, LoginOutcome, PomodoroApi, Registration};
use crate::application::heartbeat::HeartbeatEmitter;
use crate::application::push_channel::PushChannel;
use crate::application::reconciler::SessionReconciler;
use crate::application::refresh::SessionInvalidated;
use crate::application::task_timer::TaskTimer;
use crate::application::transport::Transport;
use crate::domain::models::{TaskRef, UserProfile};
use crate::infrastructure::config::SyncConfig;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::http_backend::{HttpBackend, ReqwestBackend};
use crate::infrastructure::push_connector::{PushConnector, TungsteniteConnector};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStatus {
    Unknown,
    Authenticated(UserProfile),
    Unauthenticated,
}

impl AuthStatus {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated(_))
    }

    pub fn profile(&self) -> Option<&UserProfile> {
        match self {
            Self::Authenticated(profile) => Some(profile),
            _ => None,
        }
    }
}

pub type DefaultSyncClient = SyncClient<ReqwestBackend, TungsteniteConnector>;

/// Owns the authenticated-session lifetime. The push channel and heartbeat
/// exist only while authenticated.
pub struct SyncClient<B: HttpBackend, C: PushConnector> {
    config: SyncConfig,
    api: Arc<PomodoroApi<B>>,
    push: PushChannel<C>,
    status: watch::Sender<AuthStatus>,
    heartbeat: Mutex<Option<HeartbeatEmitter>>,
    checking: AtomicBool,
    invalidations: JoinHandle<()>,
}

impl DefaultSyncClient {
    pub fn from_config(config: SyncConfig) -> Result<Arc<Self>, InfraError> {
        let backend = Arc::new(ReqwestBackend::new(
            &config.api_base_url,
            config.request_timeout,
        )?);
        let connector = Arc::new(TungsteniteConnector::new().with_cookies(backend.cookie_jar()));
        Ok(Self::new(config, backend, connector))
    }
}

impl<B: HttpBackend + 'static, C: PushConnector + 'static> SyncClient<B, C> {
    pub fn new(config: SyncConfig, backend: Arc<B>, connector: Arc<C>) -> Arc<Self> {
        let transport = Transport::new(backend);
        let invalidated = transport.subscribe_invalidated();
        let push = PushChannel::new(connector, config.push_url.clone());
        let (status, _) = watch::channel(AuthStatus::Unknown);

        Arc::new_cyclic(|weak: &Weak<Self>| Self {
            config,
            api: Arc::new(PomodoroApi::new(transport)),
            push,
            status,
            heartbeat: Mutex::new(None),
            checking: AtomicBool::new(false),
            invalidations: tokio::spawn(watch_invalidations(weak.clone(), invalidated)),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn api(&self) -> &Arc<PomodoroApi<B>> {
        &self.api
    }

    pub fn push_channel(&self) -> &PushChannel<C> {
        &self.push
    }

    pub fn status(&self) -> AuthStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<AuthStatus> {
        self.status.subscribe()
    }

    pub fn subscribe_invalidated(&self) -> broadcast::Receiver<SessionInvalidated> {
        self.api.transport().subscribe_invalidated()
    }

    pub fn is_heartbeat_running(&self) -> bool {
        self.heartbeat().as_ref().is_some_and(HeartbeatEmitter::is_running)
    }

    /// Focus length from the signed-in user's settings, else from config.
    pub fn focus_minutes(&self) -> u32 {
        self.status
            .borrow()
            .profile()
            .and_then(UserProfile::focus_minutes)
            .unwrap_or(self.config.default_focus_minutes)
    }

    /// Asks the server who is signed in. A call made while another check is
    /// running returns the current status without a request.
    pub async fn check_auth(&self) -> AuthStatus {
        if self.checking.swap(true, Ordering::SeqCst) {
            return self.status();
        }
        let _checking = CheckGuard(&self.checking);

        match self.api.authenticated().await {
            Ok(profile) => self.set_authenticated(profile),
            Err(error) => {
                tracing::debug!(%error, "not authenticated");
                self.set_unauthenticated();
            }
        }
        self.status()
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome, InfraError> {
        let outcome = self.api.login(email, password).await?;
        if outcome == LoginOutcome::Accepted {
            self.check_auth().await;
        }
        Ok(outcome)
    }

    pub async fn register(&self, registration: &Registration) -> Result<(), InfraError> {
        self.api.register(registration).await
    }

    /// Remote logout is best effort; local state is always signed out.
    pub async fn logout(&self) {
        if let Err(error) = self.api.logout().await {
            tracing::debug!(%error, "remote logout failed");
        }
        self.set_unauthenticated();
    }

    /// Builds a timer for `task` that follows this client's push channel.
    pub fn mount_timer(&self, task: TaskRef) -> TaskTimer<PomodoroApi<B>> {
        let reconciler = SessionReconciler::new(Arc::clone(&self.api), task, self.focus_minutes());
        TaskTimer::mount(Arc::new(reconciler)).attach(&self.push)
    }

    fn set_authenticated(&self, profile: UserProfile) {
        let was_authenticated = self.status.borrow().is_authenticated();
        if !was_authenticated {
            self.push.connect();
            let heartbeat =
                HeartbeatEmitter::start(Arc::clone(&self.api), self.config.heartbeat_interval);
            *self.heartbeat() = Some(heartbeat);
            tracing::info!(email = ?profile.email, "authenticated");
        }
        self.status.send_replace(AuthStatus::Authenticated(profile));
    }

    /// Tears down the push channel and heartbeat before publishing the new
    /// status. Observers see one transition however many times this runs.
    pub fn set_unauthenticated(&self) {
        self.push.disconnect();
        let heartbeat = self.heartbeat().take();
        drop(heartbeat);
        self.status.send_if_modified(|status| {
            if *status == AuthStatus::Unauthenticated {
                return false;
            }
            if status.is_authenticated() {
                tracing::info!("signed out");
            }
            *status = AuthStatus::Unauthenticated;
            true
        });
    }

    fn heartbeat(&self) -> MutexGuard<'_, Option<HeartbeatEmitter>> {
        self.heartbeat.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<B: HttpBackend, C: PushConnector> Drop for SyncClient<B, C> {
    fn drop(&mut self) {
        self.invalidations.abort();
    }
}

struct CheckGuard<'a>(&'a AtomicBool);

impl Drop for CheckGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

async fn watch_invalidations<B, C>(
    client: Weak<SyncClient<B, C>>,
    mut invalidated: broadcast::Receiver<SessionInvalidated>,
) where
    B: HttpBackend + 'static,
    C: PushConnector + 'static,
{
    loop {
        match invalidated.recv().await {
            Ok(signal) => {
                let Some(client) = client.upgrade() else {
                    return;
                };
                tracing::warn!(cause = %signal.cause, "session invalidated");
                client.set_unauthenticated();
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "missed session invalidation signals");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
