pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::api::{AuthApi, LoginOutcome, PomodoroApi, Registration, SessionApi};
pub use application::client::{AuthStatus, DefaultSyncClient, SyncClient};
pub use application::heartbeat::HeartbeatEmitter;
pub use application::push_channel::{MessageSubscription, PushChannel, parse_frame};
pub use application::reconciler::{NowProvider, SessionReconciler};
pub use application::refresh::{RefreshCoordinator, SessionInvalidated};
pub use application::task_timer::TaskTimer;
pub use application::ticker::CountdownTicker;
pub use application::transport::Transport;
pub use domain::models::{
    CountdownBaseline, FsmState, Phase, PhaseChange, PomodoroSession, SessionAction,
    SessionUpdate, TaskId, TaskRef, format_clock,
};
pub use domain::session::{DisplayedSession, Reconciled};
pub use infrastructure::config::SyncConfig;
pub use infrastructure::error::InfraError;
pub use infrastructure::logging::init_tracing;

use tokio::sync::broadcast::error::RecvError;

const EMAIL_KEY: &str = "POMODORO_EMAIL";
const PASSWORD_KEY: &str = "POMODORO_PASSWORD";
const TASK_ID_KEY: &str = "POMODORO_TASK_ID";

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Signs in from the environment, then follows one task's timer until
/// Ctrl-C.
pub async fn run() -> Result<(), InfraError> {
    let config = SyncConfig::from_env()?;
    tracing::info!(api = %config.api_base_url, push = %config.push_url, "starting pomodoro sync");
    let client = DefaultSyncClient::from_config(config)?;

    if let (Some(email), Some(password)) = (env_value(EMAIL_KEY), env_value(PASSWORD_KEY)) {
        if let LoginOutcome::Rejected(message) = client.login(&email, &password).await? {
            tracing::warn!(%message, "login rejected");
        }
    }

    let status = client.check_auth().await;
    if !status.is_authenticated() {
        tracing::warn!("not authenticated; set {EMAIL_KEY} and {PASSWORD_KEY} to sign in");
    }

    let Some(task_id) = env_value(TASK_ID_KEY) else {
        tracing::info!("no {TASK_ID_KEY} set; waiting for Ctrl-C");
        wait_for_shutdown().await;
        client.set_unauthenticated();
        return Ok(());
    };

    let timer = client.mount_timer(TaskRef::new(task_id.as_str()));
    if let Err(error) = timer.hydrate().await {
        tracing::warn!(%error, %task_id, "hydration failed");
    }
    tracing::info!(state = %timer.fsm_state(), remaining = %timer.display(), "session hydrated");

    let mut remaining = timer.subscribe_remaining();
    let mut phases = timer.subscribe_phases();
    let mut auth = client.subscribe_status();
    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            changed = remaining.changed() => {
                if changed.is_err() {
                    break;
                }
                let seconds = *remaining.borrow_and_update();
                tracing::info!(state = %timer.fsm_state(), remaining = %format_clock(seconds));
            }
            phase = phases.recv() => match phase {
                Ok(change) => tracing::info!(?change, "phase changed"),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "phase changes skipped")
                }
                Err(RecvError::Closed) => break,
            },
            changed = auth.changed() => {
                if changed.is_err() {
                    break;
                }
                let authenticated = auth.borrow_and_update().is_authenticated();
                if !authenticated {
                    tracing::warn!("session lost; sign in again to resume syncing");
                }
            }
        }
    }

    drop(timer);
    client.set_unauthenticated();
    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(%error, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}
