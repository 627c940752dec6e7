use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors surfaced by the dispatcher, the refresh coordinator and the session facade.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// 401 that is not eligible for (another) refresh.
    #[error("credential rejected by {path}")]
    CredentialRejected { path: String },
    #[error("forbidden: {body}")]
    Forbidden { body: String },
    #[error("server error {status}: {body}")]
    Server { status: StatusCode, body: String },
    #[error("request failed with status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// Every caller blocked on one failed refresh receives the same cause.
    #[error("token refresh failed: {0}")]
    RefreshFailed(Arc<SessionError>),
    #[error("refresh task ended without delivering a result")]
    RefreshAbandoned,
    #[error("no stored credential")]
    NotAuthenticated,
    #[error("invalid server response: {0}")]
    InvalidResponse(String),
}

impl SessionError {
    /// Status code reported by the server, if the failure came from an HTTP response.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            SessionError::CredentialRejected { .. } => Some(StatusCode::UNAUTHORIZED),
            SessionError::Forbidden { .. } => Some(StatusCode::FORBIDDEN),
            SessionError::Server { status, .. } | SessionError::Status { status, .. } => {
                Some(*status)
            }
            SessionError::Http(err) => err.status(),
            _ => None,
        }
    }

    /// Terminal authentication failures after which the caller should re-authenticate.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            SessionError::CredentialRejected { .. }
                | SessionError::RefreshFailed(_)
                | SessionError::RefreshAbandoned
                | SessionError::NotAuthenticated
        )
    }
}

/// Reasons a login attempt fails, in the terms presented to the person signing in.
#[derive(Debug, Error)]
pub enum LoginError {
    #[error("email and password are required")]
    MissingInput,
    #[error("please enter valid credentials")]
    InvalidFormat,
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("your account is not authorized to access this system")]
    NotAuthorized,
    #[error("server error, please try again later")]
    ServerUnavailable,
    #[error("login failed: {0}")]
    Unknown(#[source] SessionError),
}

impl From<SessionError> for LoginError {
    fn from(err: SessionError) -> Self {
        match err.status() {
            Some(StatusCode::BAD_REQUEST) => LoginError::InvalidFormat,
            Some(StatusCode::UNAUTHORIZED) => LoginError::InvalidCredentials,
            Some(StatusCode::FORBIDDEN) => LoginError::NotAuthorized,
            Some(status) if status.is_server_error() => LoginError::ServerUnavailable,
            _ => LoginError::Unknown(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_error_maps_statuses() {
        let bad = SessionError::Status {
            status: StatusCode::BAD_REQUEST,
            body: String::new(),
        };
        assert!(matches!(LoginError::from(bad), LoginError::InvalidFormat));

        let rejected = SessionError::CredentialRejected {
            path: "/auth/login".into(),
        };
        assert!(matches!(
            LoginError::from(rejected),
            LoginError::InvalidCredentials
        ));

        let forbidden = SessionError::Forbidden {
            body: String::new(),
        };
        assert!(matches!(
            LoginError::from(forbidden),
            LoginError::NotAuthorized
        ));

        let server = SessionError::Server {
            status: StatusCode::BAD_GATEWAY,
            body: String::new(),
        };
        assert!(matches!(
            LoginError::from(server),
            LoginError::ServerUnavailable
        ));

        let teapot = SessionError::Status {
            status: StatusCode::IM_A_TEAPOT,
            body: String::new(),
        };
        assert!(matches!(LoginError::from(teapot), LoginError::Unknown(_)));
    }

    #[test]
    fn refresh_failures_require_login() {
        let cause = Arc::new(SessionError::Timeout(Duration::from_secs(1)));
        assert!(SessionError::RefreshFailed(cause).requires_login());
        assert!(!SessionError::Forbidden {
            body: String::new()
        }
        .requires_login());
    }
}
