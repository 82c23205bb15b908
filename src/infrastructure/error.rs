use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InfraError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out")]
    Timeout,
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("credential refresh failed: {0}")]
    RefreshFailed(Box<InfraError>),
    #[error("credential refresh was abandoned before it settled")]
    RefreshAbandoned,
    #[error("JSON error: {0}")]
    Json(String),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("channel error: {0}")]
    Channel(String),
    #[error("another session action is still pending")]
    ActionPending,
    #[error("action {action} is not allowed while {state}")]
    InvalidAction { action: String, state: String },
}

impl InfraError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    /// No response was received at all.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout)
    }
}

impl From<serde_json::Error> for InfraError {
    fn from(error: serde_json::Error) -> Self {
        Self::Json(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_is_only_http_401() {
        let unauthorized = InfraError::Http {
            status: 401,
            body: String::new(),
        };
        let forbidden = InfraError::Http {
            status: 403,
            body: String::new(),
        };
        assert!(unauthorized.is_unauthorized());
        assert!(!forbidden.is_unauthorized());
        assert!(!InfraError::Timeout.is_unauthorized());
        assert!(InfraError::Timeout.is_network());
        assert_eq!(forbidden.status(), Some(403));
    }

    #[test]
    fn refresh_failure_keeps_cause_in_message() {
        let error = InfraError::RefreshFailed(Box::new(InfraError::Http {
            status: 401,
            body: "token expired".to_string(),
        }));
        assert_eq!(
            error.to_string(),
            "credential refresh failed: http 401: token expired"
        );
    }
}
