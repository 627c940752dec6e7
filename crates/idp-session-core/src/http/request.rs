use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use url::Url;

use crate::auth::{AccessToken, SessionError};

/// Everything needed to send, and later resend, one API call.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_json<T: Serialize>(self, body: &T) -> Result<Self, SessionError> {
        Ok(self.with_body(serde_json::to_value(body)?))
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    /// Resolve the request path against the API base URL, keeping any base path prefix.
    pub fn url(&self, base: &Url) -> Result<Url, SessionError> {
        let base = base.as_str().trim_end_matches('/');
        let path = self.path.trim_start_matches('/');
        Ok(Url::parse(&format!("{base}/{path}"))?)
    }
}

/// Status and body of a completed HTTP exchange.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, SessionError> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Whether a request is going out for the first time or being replayed after a refresh.
///
/// A replay carries the freshly obtained token and is never eligible for another refresh.
#[derive(Debug, Clone)]
pub enum Attempt {
    Initial,
    Replay(AccessToken),
}

impl Attempt {
    pub fn is_replay(&self) -> bool {
        matches!(self, Attempt::Replay(_))
    }
}

/// Classified result of a dispatched request.
#[derive(Debug)]
pub enum Outcome {
    Success(ApiResponse),
    /// First-attempt 401 from a non-exempt endpoint, eligible for one refresh.
    CredentialExpired {
        path: String,
        presented: Option<AccessToken>,
    },
    Failure(SessionError),
}

impl Outcome {
    pub fn into_result(self) -> Result<ApiResponse, SessionError> {
        match self {
            Outcome::Success(response) => Ok(response),
            Outcome::CredentialExpired { path, .. } => {
                Err(SessionError::CredentialRejected { path })
            }
            Outcome::Failure(err) => Err(err),
        }
    }
}
