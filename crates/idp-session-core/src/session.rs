use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use url::Url;

use crate::auth::{
    ClientMetadata, Credential, CredentialStore, FileCredentialStore, LoginError, SessionError,
    TokenClient,
};
use crate::config::{ConfigLocator, SessionConfig};
use crate::http::{
    ApiRequest, ApiResponse, Dispatcher, ReqwestTransport, SessionCookies, Transport,
};
use crate::refresh::RefreshCoordinator;

static EMAIL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid email pattern"));

/// Result of a successful login.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    /// Where the application should continue, typically the client's callback carrying a code.
    pub redirect_to: Option<Url>,
    /// Credential issued directly by the login call, already stored.
    pub credential: Option<Credential>,
}

impl LoginOutcome {
    /// The `code` query parameter of the continuation target, ready for [`Session::exchange_code`].
    pub fn authorization_code(&self) -> Option<String> {
        self.redirect_to.as_ref().and_then(|url| {
            url.query_pairs()
                .find(|(key, _)| key == "code")
                .map(|(_, value)| value.into_owned())
        })
    }
}

/// Remote view of the current session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionStatus {
    #[serde(default = "default_authenticated")]
    pub authenticated: bool,
    #[serde(default)]
    pub user_id: Option<String>,
}

fn default_authenticated() -> bool {
    true
}

/// Public entry point: authentication operations plus authenticated API calls.
///
/// One `Session` owns one credential store and one refresh coordinator, so independent sessions
/// never share refresh state.
#[derive(Clone)]
pub struct Session {
    coordinator: RefreshCoordinator,
    tokens: TokenClient,
    store: Arc<dyn CredentialStore>,
}

impl Session {
    /// Build a session that talks HTTP through `reqwest`, keeping cookies in memory.
    pub fn new(
        config: SessionConfig,
        store: Arc<dyn CredentialStore>,
    ) -> Result<Self, SessionError> {
        Self::with_cookies(config, store, Arc::new(SessionCookies::in_memory()))
    }

    /// Like [`Session::new`], with the server-session cookies kept in `cookies`.
    pub fn with_cookies(
        config: SessionConfig,
        store: Arc<dyn CredentialStore>,
        cookies: Arc<SessionCookies>,
    ) -> Result<Self, SessionError> {
        let transport = Arc::new(ReqwestTransport::with_cookies(&config, cookies)?);
        Ok(Self::with_transport(config, store, transport))
    }

    /// Session persisted under `locator` for `config.profile`: credential and cookies survive
    /// restarts until logout or a failed refresh.
    pub fn persistent(
        config: SessionConfig,
        locator: ConfigLocator,
    ) -> Result<Self, SessionError> {
        let cookies = SessionCookies::load(locator.cookies_file(&config.profile))?;
        let store = FileCredentialStore::new(locator, config.profile.clone())?;
        Self::with_cookies(config, Arc::new(store), Arc::new(cookies))
    }

    pub fn with_transport(
        config: SessionConfig,
        store: Arc<dyn CredentialStore>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let dispatcher = Dispatcher::new(transport, store.clone(), config.endpoints.clone());
        let tokens = TokenClient::new(dispatcher.clone(), ClientMetadata::from(&config));
        let coordinator =
            RefreshCoordinator::new(dispatcher, tokens.clone(), config.refresh_timeout);
        Self {
            coordinator,
            tokens,
            store,
        }
    }

    pub fn current_credential(&self) -> Result<Option<Credential>, SessionError> {
        self.store.get()
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<LoginOutcome, LoginError> {
        let email = email.trim();
        if email.is_empty() || password.trim().is_empty() {
            return Err(LoginError::MissingInput);
        }
        if !EMAIL_PATTERN.is_match(email) {
            return Err(LoginError::InvalidFormat);
        }

        let response = self.tokens.login(email, password).await?;

        let redirect_to = match response.redirect_to.as_deref() {
            Some(raw) => Some(Url::parse(raw).map_err(|err| LoginError::Unknown(err.into()))?),
            None => None,
        };
        let credential = match response.access_token {
            Some(token) if !token.trim().is_empty() => Some(Credential::new(token)),
            _ => None,
        };
        if redirect_to.is_none() && credential.is_none() {
            return Err(LoginError::Unknown(SessionError::InvalidResponse(
                "login response carried neither redirect_to nor access_token".into(),
            )));
        }

        if let Some(credential) = &credential {
            self.store.set(credential).map_err(LoginError::Unknown)?;
        }
        info!(redirect = redirect_to.is_some(), "login succeeded");
        Ok(LoginOutcome {
            redirect_to,
            credential,
        })
    }

    /// Exchange an authorization code for a credential and store it.
    pub async fn exchange_code(&self, code: &str) -> Result<Credential, SessionError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(SessionError::InvalidInput(
                "authorization code is required".into(),
            ));
        }
        let credential = self.tokens.exchange_code(code).await?;
        self.store.set(&credential)?;
        info!("authorization code exchanged");
        Ok(credential)
    }

    /// Clear the local credential, then tell the server. The remote call is best-effort.
    ///
    /// Session cookies are kept for the remote call and dropped afterwards.
    pub async fn logout(&self) -> Result<(), SessionError> {
        self.store.clear()?;
        if let Err(err) = self.tokens.logout().await {
            warn!(error = %err, "remote logout failed; local credential already cleared");
        }
        self.coordinator.dispatcher().clear_session()?;
        info!("logged out");
        Ok(())
    }

    /// Ask the server whether the stored credential is still accepted.
    ///
    /// On failure the caller is expected to clear local state and re-authenticate.
    pub async fn validate_session(&self) -> Result<SessionStatus, SessionError> {
        if self.store.get()?.is_none() {
            return Err(SessionError::NotAuthenticated);
        }
        let path = self.coordinator.dispatcher().endpoints().session.clone();
        let response = self.coordinator.send(ApiRequest::get(path)).await?;
        let status = if response.body.trim().is_empty() {
            SessionStatus {
                authenticated: true,
                user_id: None,
            }
        } else {
            response.json::<SessionStatus>()?
        };
        if !status.authenticated {
            return Err(SessionError::NotAuthenticated);
        }
        Ok(status)
    }

    /// Send an arbitrary API request with refresh-on-expiry.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, SessionError> {
        self.coordinator.send(request).await
    }

    pub async fn get(&self, path: &str) -> Result<ApiResponse, SessionError> {
        self.send(ApiRequest::get(path)).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, SessionError> {
        self.get(path).await?.json()
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<ApiResponse, SessionError> {
        self.send(ApiRequest::post(path).with_body(body)).await
    }

    pub async fn put(&self, path: &str, body: Value) -> Result<ApiResponse, SessionError> {
        self.send(ApiRequest::put(path).with_body(body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse, SessionError> {
        self.send(ApiRequest::delete(path)).await
    }
}
