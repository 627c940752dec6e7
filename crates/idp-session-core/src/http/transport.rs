use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use url::Url;

use crate::auth::{AccessToken, SessionError};
use crate::config::SessionConfig;

use super::{ApiRequest, ApiResponse, SessionCookies};

const USER_AGENT: &str = "idp-session/0.1.0";

/// Executes a single HTTP exchange.
///
/// Implementations only move bytes: they attach the bearer token they are given and report the
/// raw status. Classification happens in the dispatcher.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(
        &self,
        request: &ApiRequest,
        bearer: Option<&AccessToken>,
    ) -> Result<ApiResponse, SessionError>;

    /// Drop any server-session state the transport carries, such as cookies.
    fn forget_session(&self) -> Result<(), SessionError> {
        Ok(())
    }
}

/// Production transport backed by `reqwest`.
///
/// Carries the session cookie set at login so it is presented to the refresh and session-check
/// endpoints.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: Client,
    base_url: Url,
    cookies: Arc<SessionCookies>,
}

impl ReqwestTransport {
    pub fn new(config: &SessionConfig) -> Result<Self, SessionError> {
        Self::with_cookies(config, Arc::new(SessionCookies::in_memory()))
    }

    /// Use a caller-provided jar, typically one persisted per profile.
    pub fn with_cookies(
        config: &SessionConfig,
        cookies: Arc<SessionCookies>,
    ) -> Result<Self, SessionError> {
        let mut builder = Client::builder()
            .user_agent(USER_AGENT)
            .cookie_provider(Arc::clone(&cookies));
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            http: builder.build()?,
            base_url: config.base_url.clone(),
            cookies,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(
        &self,
        request: &ApiRequest,
        bearer: Option<&AccessToken>,
    ) -> Result<ApiResponse, SessionError> {
        let url = request.url(&self.base_url)?;
        let mut builder = self.http.request(request.method().clone(), url);
        if let Some(token) = bearer {
            builder = builder.header(AUTHORIZATION, token.bearer_header());
        }
        if let Some(body) = request.body() {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        Ok(ApiResponse { status, body })
    }

    fn forget_session(&self) -> Result<(), SessionError> {
        self.cookies.clear()
    }
}
