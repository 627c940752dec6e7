use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

use crate::config::SessionConfig;
use crate::http::{ApiRequest, ApiResponse, Attempt, Dispatcher};

use super::{Credential, SessionError};

/// Client metadata sent with login and code exchange.
#[derive(Debug, Clone)]
pub struct ClientMetadata {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_uri: Option<Url>,
}

impl From<&SessionConfig> for ClientMetadata {
    fn from(config: &SessionConfig) -> Self {
        Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
        }
    }
}

/// Raw login reply: a continuation target and/or an access token.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginResponse {
    #[serde(default)]
    pub redirect_to: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
}

/// Talks to the credential-issuing endpoints. None of these calls carry a bearer token.
#[derive(Clone)]
pub struct TokenClient {
    dispatcher: Dispatcher,
    client: ClientMetadata,
}

impl TokenClient {
    pub fn new(dispatcher: Dispatcher, client: ClientMetadata) -> Self {
        Self { dispatcher, client }
    }

    pub fn client(&self) -> &ClientMetadata {
        &self.client
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, SessionError> {
        #[derive(Serialize)]
        struct LoginBody<'a> {
            email: &'a str,
            password: &'a str,
            client_id: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            redirect_uri: Option<&'a str>,
        }

        let request = ApiRequest::post(self.dispatcher.endpoints().login.clone()).with_json(
            &LoginBody {
                email,
                password,
                client_id: &self.client.client_id,
                redirect_uri: self.client.redirect_uri.as_ref().map(Url::as_str),
            },
        )?;
        let response = self.post(&request).await?;
        response.json()
    }

    /// Exchange an authorization code for an access token.
    pub async fn exchange_code(&self, code: &str) -> Result<Credential, SessionError> {
        #[derive(Serialize)]
        struct ExchangeBody<'a> {
            grant_type: &'static str,
            code: &'a str,
            client_id: &'a str,
            #[serde(skip_serializing_if = "Option::is_none")]
            client_secret: Option<&'a str>,
            #[serde(skip_serializing_if = "Option::is_none")]
            redirect_uri: Option<&'a str>,
        }

        let request = ApiRequest::post(self.dispatcher.endpoints().token.clone()).with_json(
            &ExchangeBody {
                grant_type: "authorization_code",
                code,
                client_id: &self.client.client_id,
                client_secret: self.client.client_secret.as_deref(),
                redirect_uri: self.client.redirect_uri.as_ref().map(Url::as_str),
            },
        )?;
        let response = self.post(&request).await?;
        handle_token_response(&response)
    }

    /// Obtain a new access token using the ambient server-side session.
    pub async fn refresh(&self) -> Result<Credential, SessionError> {
        let request =
            ApiRequest::post(self.dispatcher.endpoints().refresh.clone()).with_body(json!({}));
        let response = self.post(&request).await?;
        handle_token_response(&response)
    }

    /// Terminate the remote session. Never enters refresh logic.
    pub async fn logout(&self) -> Result<(), SessionError> {
        let request =
            ApiRequest::post(self.dispatcher.endpoints().logout.clone()).with_body(json!({}));
        self.post(&request).await.map(|_| ())
    }

    async fn post(&self, request: &ApiRequest) -> Result<ApiResponse, SessionError> {
        self.dispatcher
            .send(request, &Attempt::Initial)
            .await
            .into_result()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
}

fn handle_token_response(response: &ApiResponse) -> Result<Credential, SessionError> {
    let payload: TokenResponse = response.json()?;
    if let Some(kind) = payload.token_type.as_deref() {
        if !kind.eq_ignore_ascii_case("bearer") {
            return Err(SessionError::InvalidResponse(format!(
                "unsupported token type '{kind}'"
            )));
        }
    }
    if payload.access_token.trim().is_empty() {
        return Err(SessionError::InvalidResponse("empty access token".into()));
    }
    Ok(Credential::new(payload.access_token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryCredentialStore;
    use crate::http::{Endpoints, ReqwestTransport};
    use httpmock::prelude::*;
    use reqwest::StatusCode;
    use std::sync::Arc;

    fn token_client(server: &MockServer, secret: Option<&str>) -> TokenClient {
        let base = Url::parse(&server.base_url()).unwrap();
        let mut config = SessionConfig::new(base, "client-id")
            .with_redirect_uri(Url::parse("http://localhost/callback").unwrap());
        if let Some(secret) = secret {
            config = config.with_secret(secret);
        }
        let transport = Arc::new(ReqwestTransport::new(&config).unwrap());
        let dispatcher = Dispatcher::new(
            transport,
            Arc::new(MemoryCredentialStore::new()),
            Endpoints::default(),
        );
        TokenClient::new(dispatcher, ClientMetadata::from(&config))
    }

    #[tokio::test]
    async fn exchange_code_success() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/auth/token")
                .json_body(serde_json::json!({
                    "grant_type": "authorization_code",
                    "code": "code123",
                    "client_id": "client-id",
                    "client_secret": "client-secret",
                    "redirect_uri": "http://localhost/callback"
                }));
            then.status(200).json_body_obj(&serde_json::json!({
                "access_token": "abc123",
                "refresh_token": "refresh456",
                "token_type": "Bearer",
                "expires_in": 900
            }));
        });

        let client = token_client(&server, Some("client-secret"));
        let credential = client.exchange_code("code123").await.unwrap();
        mock.assert();
        assert_eq!(credential.token().as_str(), "abc123");
    }

    #[tokio::test]
    async fn refresh_posts_empty_body() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/auth/refresh")
                .json_body(serde_json::json!({}));
            then.status(200)
                .json_body_obj(&serde_json::json!({ "access_token": "rotated" }));
        });

        let credential = token_client(&server, None).refresh().await.unwrap();
        mock.assert();
        assert_eq!(credential.token().as_str(), "rotated");
    }

    #[tokio::test]
    async fn token_endpoint_failure() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/auth/token");
            then.status(400).body(r#"{"error":"invalid_grant"}"#);
        });

        let err = token_client(&server, None)
            .exchange_code("bad")
            .await
            .unwrap_err();
        mock.assert();
        match err {
            SessionError::Status { status, body } => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert!(body.contains("invalid_grant"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsupported_token_type_is_rejected() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/auth/refresh");
            then.status(200).json_body_obj(&serde_json::json!({
                "access_token": "mac-token",
                "token_type": "mac"
            }));
        });

        let err = token_client(&server, None).refresh().await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn login_omits_missing_redirect_uri() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/auth/login").json_body(serde_json::json!({
                "email": "a@b.com",
                "password": "pw",
                "client_id": "client-id"
            }));
            then.status(200)
                .json_body_obj(&serde_json::json!({ "redirect_to": "https://app/cb?code=c1" }));
        });

        let base = Url::parse(&server.base_url()).unwrap();
        let config = SessionConfig::new(base, "client-id");
        let dispatcher = Dispatcher::new(
            Arc::new(ReqwestTransport::new(&config).unwrap()),
            Arc::new(MemoryCredentialStore::new()),
            Endpoints::default(),
        );
        let client = TokenClient::new(dispatcher, ClientMetadata::from(&config));

        let response = client.login("a@b.com", "pw").await.unwrap();
        mock.assert();
        assert_eq!(response.redirect_to.as_deref(), Some("https://app/cb?code=c1"));
        assert!(response.access_token.is_none());
    }
}
