use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use reqwest::cookie::Jar;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

pub const REFRESH_PATH: &str = "/auth/token/refresh/";
pub const LOGIN_PATH: &str = "/auth/login/";
pub const REGISTER_PATH: &str = "/auth/register/";

const AUTH_EXEMPT_PATHS: [&str; 3] = [REFRESH_PATH, LOGIN_PATH, REGISTER_PATH];

/// Requests to these endpoints must never trigger a credential refresh.
pub fn is_auth_exempt(path: &str) -> bool {
    AUTH_EXEMPT_PATHS.iter().any(|exempt| path.contains(exempt))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<serde_json::Value>,
    retryable: bool,
    retried: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            retryable: true,
            retried: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn with_json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Marks a request whose side effects must not be replayed.
    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable && !is_auth_exempt(&self.path)
    }

    pub fn was_retried(&self) -> bool {
        self.retried
    }

    pub(crate) fn into_replay(mut self) -> Self {
        self.retried = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn into_result(self) -> Result<Self, InfraError> {
        if self.is_success() {
            return Ok(self);
        }
        Err(InfraError::Http {
            status: self.status,
            body: self.body,
        })
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, InfraError> {
        if self.body.trim().is_empty() {
            return serde_json::from_str("null").map_err(InfraError::from);
        }
        serde_json::from_str(&self.body).map_err(|error| {
            InfraError::Json(format!("{error}; body={}", self.body))
        })
    }
}

#[async_trait]
pub trait HttpBackend: Send + Sync {
    /// Yields whatever response arrived, any status. `Err` means no response
    /// at all: connection failure or timeout.
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, InfraError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestBackend {
    client: Client,
    base_url: String,
    cookies: Arc<Jar>,
}

impl ReqwestBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, InfraError> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        Url::parse(&base_url)
            .map_err(|error| InfraError::InvalidConfig(format!("invalid api base url: {error}")))?;

        let cookies = Arc::new(Jar::default());
        let client = Client::builder()
            .cookie_provider(Arc::clone(&cookies))
            .timeout(timeout)
            .build()
            .map_err(|error| {
                InfraError::InvalidConfig(format!("failed to build http client: {error}"))
            })?;

        Ok(Self {
            client,
            base_url,
            cookies,
        })
    }

    /// Credential cookies, shared with the push connector's upgrade request.
    pub fn cookie_jar(&self) -> Arc<Jar> {
        Arc::clone(&self.cookies)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, InfraError> {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        Url::parse(&format!("{}{}", self.base_url, path)).map_err(|error| {
            InfraError::InvalidConfig(format!("invalid request path {path}: {error}"))
        })
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, InfraError> {
        let endpoint = self.endpoint(&request.path)?;
        let mut builder = self.client.request(request.method.clone(), endpoint);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|error| {
            if error.is_timeout() {
                InfraError::Timeout
            } else {
                InfraError::Network(format!("request to {} failed: {error}", request.path))
            }
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|error| {
            if error.is_timeout() {
                InfraError::Timeout
            } else {
                let path = &request.path;
                InfraError::Network(format!("failed reading response from {path}: {error}"))
            }
        })?;

        tracing::debug!(method = %request.method, path = %request.path, status, "http response");
        Ok(ApiResponse { status, body })
    }
}
