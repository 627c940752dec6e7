//! Scripted transport for exercising dispatch and refresh without a network.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use reqwest::{Method, StatusCode};
use serde_json::Value;

use crate::auth::{AccessToken, SessionError};

use super::{ApiRequest, ApiResponse, Transport};

pub(crate) type Reply = BoxFuture<'static, Result<ApiResponse, SessionError>>;

type Handler = dyn Fn(&ApiRequest, Option<&AccessToken>) -> Reply + Send + Sync;

#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub method: Method,
    pub path: String,
    pub bearer: Option<String>,
}

/// Records every call at the moment it is started, then answers with the scripted reply.
pub(crate) struct ScriptedTransport {
    handler: Box<Handler>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedTransport {
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&ApiRequest, Option<&AccessToken>) -> Reply + Send + Sync + 'static,
    {
        Arc::new(Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, path: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.path == path)
            .count()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(
        &self,
        request: &ApiRequest,
        bearer: Option<&AccessToken>,
    ) -> Result<ApiResponse, SessionError> {
        self.calls.lock().unwrap().push(RecordedCall {
            method: request.method().clone(),
            path: request.path().to_owned(),
            bearer: bearer.map(|token| token.as_str().to_owned()),
        });
        let reply = (self.handler)(request, bearer);
        reply.await
    }
}

/// JSON reply delivered after yielding once, so concurrent callers interleave.
pub(crate) fn reply(status: u16, body: Value) -> Reply {
    Box::pin(async move {
        tokio::task::yield_now().await;
        Ok::<_, SessionError>(ApiResponse::new(
            StatusCode::from_u16(status).unwrap(),
            body.to_string(),
        ))
    })
}
