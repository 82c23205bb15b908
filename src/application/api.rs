use crate::application::transport::Transport;
use crate::domain::models::{SessionAction, SessionPayload, SessionUpdate, TaskId, UserProfile};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::http_backend::{ApiRequest, HttpBackend, LOGIN_PATH, REGISTER_PATH};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

const LOGOUT_PATH: &str = "/auth/logout/";
const AUTHENTICATED_PATH: &str = "/auth/authenticated/";
const ACTIVE_SESSION_PATH: &str = "/pomodoro/active-session/";
const HEARTBEAT_PATH: &str = "/pomodoro/heartbeat/";
const LOGIN_FAILED_MESSAGE: &str = "Login failed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    Accepted,
    Rejected(String),
}

#[derive(Debug, Default, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

impl LoginResponse {
    fn rejection_message(self) -> String {
        self.message
            .or(self.detail)
            .unwrap_or_else(|| LOGIN_FAILED_MESSAGE.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct AuthenticatedResponse {
    user: UserProfile,
}

/// Session operations the reconciler and heartbeat depend on.
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// `Ok(None)` when the server reports no active session.
    async fn get_active_session(
        &self,
        task_id: Option<&TaskId>,
    ) -> Result<Option<SessionUpdate>, InfraError>;

    async fn send_action(&self, task_id: &TaskId, action: SessionAction) -> Result<(), InfraError>;

    async fn send_heartbeat(&self) -> Result<(), InfraError>;
}

#[async_trait]
pub trait AuthApi: Send + Sync {
    async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome, InfraError>;

    async fn register(&self, registration: &Registration) -> Result<(), InfraError>;

    async fn logout(&self) -> Result<(), InfraError>;

    async fn authenticated(&self) -> Result<UserProfile, InfraError>;
}

/// Remote operations of the pomodoro service, all routed through `Transport`.
pub struct PomodoroApi<B: HttpBackend> {
    transport: Transport<B>,
}

impl<B: HttpBackend> PomodoroApi<B> {
    pub fn new(transport: Transport<B>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Transport<B> {
        &self.transport
    }

    pub async fn start_session(&self, task_id: &TaskId) -> Result<(), InfraError> {
        self.send_action(task_id, SessionAction::Start).await
    }

    pub async fn pause_session(&self, task_id: &TaskId) -> Result<(), InfraError> {
        self.send_action(task_id, SessionAction::Pause).await
    }

    pub async fn resume_session(&self, task_id: &TaskId) -> Result<(), InfraError> {
        self.send_action(task_id, SessionAction::Resume).await
    }

    pub async fn complete_session(&self, task_id: &TaskId) -> Result<(), InfraError> {
        self.send_action(task_id, SessionAction::Complete).await
    }
}

fn active_session_path(task_id: Option<&TaskId>) -> String {
    match task_id {
        Some(task_id) => format!("{ACTIVE_SESSION_PATH}{task_id}/"),
        None => ACTIVE_SESSION_PATH.to_string(),
    }
}

fn action_path(task_id: &TaskId, action: SessionAction) -> String {
    format!("/tasks/{task_id}/{}/", action.as_str())
}

#[async_trait]
impl<B: HttpBackend> SessionApi for PomodoroApi<B> {
    async fn get_active_session(
        &self,
        task_id: Option<&TaskId>,
    ) -> Result<Option<SessionUpdate>, InfraError> {
        let response = self
            .transport
            .send(ApiRequest::get(active_session_path(task_id)))
            .await?;
        let payload: SessionPayload = response.json()?;
        payload.into_update().map_err(InfraError::Protocol)
    }

    async fn send_action(&self, task_id: &TaskId, action: SessionAction) -> Result<(), InfraError> {
        self.transport
            .send(ApiRequest::post(action_path(task_id, action)))
            .await?;
        Ok(())
    }

    async fn send_heartbeat(&self) -> Result<(), InfraError> {
        self.transport.send(ApiRequest::post(HEARTBEAT_PATH)).await?;
        Ok(())
    }
}

#[async_trait]
impl<B: HttpBackend> AuthApi for PomodoroApi<B> {
    async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome, InfraError> {
        let request = ApiRequest::post(LOGIN_PATH)
            .with_json(json!({ "email": email, "password": password }))
            .non_retryable();
        let response = match self.transport.send(request).await {
            Ok(response) => response,
            Err(InfraError::Http { status, body }) if (400..500).contains(&status) => {
                let parsed: LoginResponse = serde_json::from_str(&body).unwrap_or_default();
                return Ok(LoginOutcome::Rejected(parsed.rejection_message()));
            }
            Err(error) => return Err(error),
        };

        let parsed: LoginResponse = response.json()?;
        if parsed.success {
            Ok(LoginOutcome::Accepted)
        } else {
            Ok(LoginOutcome::Rejected(parsed.rejection_message()))
        }
    }

    async fn register(&self, registration: &Registration) -> Result<(), InfraError> {
        let body = serde_json::to_value(registration)?;
        self.transport
            .send(ApiRequest::post(REGISTER_PATH).with_json(body).non_retryable())
            .await?;
        Ok(())
    }

    async fn logout(&self) -> Result<(), InfraError> {
        self.transport.send(ApiRequest::post(LOGOUT_PATH)).await?;
        Ok(())
    }

    async fn authenticated(&self) -> Result<UserProfile, InfraError> {
        let response = self.transport.send(ApiRequest::get(AUTHENTICATED_PATH)).await?;
        let parsed: AuthenticatedResponse = response.json()?;
        Ok(parsed.user)
    }
}
