use std::sync::Arc;

use reqwest::StatusCode;
use tracing::debug;

use crate::auth::{AccessToken, CredentialStore, SessionError};

use super::{ApiRequest, ApiResponse, Attempt, Endpoints, Outcome, Transport};

/// Sends requests with the session credential attached and classifies what comes back.
///
/// The dispatcher never refreshes on its own; a first-attempt 401 is reported upward as
/// [`Outcome::CredentialExpired`].
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    store: Arc<dyn CredentialStore>,
    endpoints: Arc<Endpoints>,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn CredentialStore>,
        endpoints: Endpoints,
    ) -> Self {
        Self {
            transport,
            store,
            endpoints: Arc::new(endpoints),
        }
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Remove the stored credential and the transport's server-session state.
    pub fn clear_session(&self) -> Result<(), SessionError> {
        self.store.clear()?;
        self.transport.forget_session()
    }

    pub async fn send(&self, request: &ApiRequest, attempt: &Attempt) -> Outcome {
        let exempt = self.endpoints.is_exempt(request.path());
        let bearer = if exempt {
            None
        } else {
            match attempt {
                Attempt::Replay(token) => Some(token.clone()),
                Attempt::Initial => match self.store.get() {
                    Ok(credential) => credential.map(|credential| credential.access_token),
                    Err(err) => return Outcome::Failure(err),
                },
            }
        };

        debug!(
            method = %request.method(),
            path = request.path(),
            authorized = bearer.is_some(),
            replay = attempt.is_replay(),
            "dispatching request"
        );

        match self.transport.execute(request, bearer.as_ref()).await {
            Ok(response) => classify(request, response, attempt, exempt, bearer),
            Err(err) => Outcome::Failure(err),
        }
    }
}

fn classify(
    request: &ApiRequest,
    response: ApiResponse,
    attempt: &Attempt,
    exempt: bool,
    presented: Option<AccessToken>,
) -> Outcome {
    let status = response.status;
    if status.is_success() {
        return Outcome::Success(response);
    }

    let path = request.path().to_owned();
    match status {
        StatusCode::UNAUTHORIZED if !exempt && !attempt.is_replay() => {
            Outcome::CredentialExpired { path, presented }
        }
        StatusCode::UNAUTHORIZED => Outcome::Failure(SessionError::CredentialRejected { path }),
        StatusCode::FORBIDDEN => Outcome::Failure(SessionError::Forbidden {
            body: response.body,
        }),
        status if status.is_server_error() => Outcome::Failure(SessionError::Server {
            status,
            body: response.body,
        }),
        status => Outcome::Failure(SessionError::Status {
            status,
            body: response.body,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Credential, MemoryCredentialStore};
    use crate::http::testing::{reply, ScriptedTransport};
    use serde_json::json;

    fn dispatcher(transport: Arc<ScriptedTransport>, token: Option<&str>) -> Dispatcher {
        let store = match token {
            Some(token) => MemoryCredentialStore::with_credential(Credential::new(token)),
            None => MemoryCredentialStore::new(),
        };
        Dispatcher::new(transport, Arc::new(store), Endpoints::default())
    }

    #[tokio::test]
    async fn attaches_stored_token() {
        let transport = ScriptedTransport::new(|_, _| reply(200, json!({ "ok": true })));
        let dispatcher = dispatcher(transport.clone(), Some("T1"));

        let outcome = dispatcher
            .send(&ApiRequest::get("/admin/status"), &Attempt::Initial)
            .await;

        assert!(matches!(outcome, Outcome::Success(_)));
        assert_eq!(transport.calls()[0].bearer.as_deref(), Some("T1"));
    }

    #[tokio::test]
    async fn exempt_endpoints_never_attach_token() {
        let transport = ScriptedTransport::new(|_, _| reply(200, json!({})));
        let dispatcher = dispatcher(transport.clone(), Some("T1"));

        for path in ["/auth/login", "/auth/token", "/auth/refresh"] {
            dispatcher
                .send(&ApiRequest::post(path), &Attempt::Initial)
                .await;
            dispatcher
                .send(&ApiRequest::post(path), &Attempt::Replay("T2".into()))
                .await;
        }

        let calls = transport.calls();
        assert_eq!(calls.len(), 6);
        assert!(calls.iter().all(|call| call.bearer.is_none()));
    }

    #[tokio::test]
    async fn replay_uses_given_token_not_store() {
        let transport = ScriptedTransport::new(|_, _| reply(200, json!({})));
        let dispatcher = dispatcher(transport.clone(), Some("T1"));

        dispatcher
            .send(&ApiRequest::get("/admin/status"), &Attempt::Replay("T2".into()))
            .await;

        assert_eq!(transport.calls()[0].bearer.as_deref(), Some("T2"));
    }

    #[tokio::test]
    async fn first_401_is_credential_expired() {
        let transport = ScriptedTransport::new(|_, _| reply(401, json!({ "error": "expired" })));
        let dispatcher = dispatcher(transport, Some("T1"));

        let outcome = dispatcher
            .send(&ApiRequest::get("/admin/status"), &Attempt::Initial)
            .await;

        match outcome {
            Outcome::CredentialExpired { path, presented } => {
                assert_eq!(path, "/admin/status");
                assert_eq!(presented, Some(AccessToken::new("T1")));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn replayed_401_is_terminal() {
        let transport = ScriptedTransport::new(|_, _| reply(401, json!({})));
        let dispatcher = dispatcher(transport, Some("T1"));

        let outcome = dispatcher
            .send(&ApiRequest::get("/admin/status"), &Attempt::Replay("T2".into()))
            .await;

        assert!(matches!(
            outcome,
            Outcome::Failure(SessionError::CredentialRejected { .. })
        ));
    }

    #[tokio::test]
    async fn exempt_401_is_not_refresh_eligible() {
        let transport = ScriptedTransport::new(|_, _| reply(401, json!({})));
        let dispatcher = dispatcher(transport, None);

        let outcome = dispatcher
            .send(&ApiRequest::post("/auth/refresh"), &Attempt::Initial)
            .await;

        assert!(matches!(
            outcome,
            Outcome::Failure(SessionError::CredentialRejected { .. })
        ));
    }

    #[tokio::test]
    async fn other_statuses_pass_through() {
        let transport = ScriptedTransport::new(|request, _| match request.path() {
            "/forbidden" => reply(403, json!({ "error": "forbidden" })),
            "/broken" => reply(500, json!({ "error": "server_error" })),
            _ => reply(400, json!({ "error": "invalid_request" })),
        });
        let dispatcher = dispatcher(transport, Some("T1"));

        let forbidden = dispatcher
            .send(&ApiRequest::get("/forbidden"), &Attempt::Initial)
            .await;
        assert!(matches!(
            forbidden,
            Outcome::Failure(SessionError::Forbidden { .. })
        ));

        let broken = dispatcher
            .send(&ApiRequest::get("/broken"), &Attempt::Initial)
            .await;
        assert!(matches!(
            broken,
            Outcome::Failure(SessionError::Server { status, .. }) if status == StatusCode::INTERNAL_SERVER_ERROR
        ));

        let invalid = dispatcher
            .send(&ApiRequest::get("/invalid"), &Attempt::Initial)
            .await;
        assert!(matches!(
            invalid,
            Outcome::Failure(SessionError::Status { status, .. }) if status == StatusCode::BAD_REQUEST
        ));
    }
}
