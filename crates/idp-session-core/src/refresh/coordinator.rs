use std::collections::VecDeque;
use std::iter;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::auth::{AccessToken, SessionError, TokenClient};
use crate::http::{ApiRequest, ApiResponse, Attempt, Dispatcher, Outcome};

type Completion = oneshot::Sender<Result<ApiResponse, SessionError>>;
type Waiter = oneshot::Receiver<Result<ApiResponse, SessionError>>;

/// A caller blocked on the in-flight refresh, released exactly once.
struct PendingRequest {
    request: ApiRequest,
    respond: Completion,
}

enum RefreshState {
    Idle,
    Refreshing { queue: VecDeque<PendingRequest> },
}

enum Admission {
    /// Started a refresh; the caller waits for its own replay.
    Lead(PendingRequest, Waiter),
    /// Joined the refresh already in flight.
    Queued(Waiter),
    /// The credential was already replaced after this request went out.
    Replay(ApiRequest, AccessToken),
}

/// Serializes token refreshes and replays every request that was blocked on one.
///
/// At most one refresh call is in flight. Requests that hit an expired credential while it runs
/// are queued and replayed in arrival order once it resolves, or all rejected with the same
/// failure when it does not.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    dispatcher: Dispatcher,
    tokens: TokenClient,
    refresh_timeout: Duration,
    state: Mutex<RefreshState>,
}

impl RefreshCoordinator {
    pub fn new(dispatcher: Dispatcher, tokens: TokenClient, refresh_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                dispatcher,
                tokens,
                refresh_timeout,
                state: Mutex::new(RefreshState::Idle),
            }),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Send a request, absorbing a single credential expiry through refresh and replay.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, SessionError> {
        match self.inner.dispatcher.send(&request, &Attempt::Initial).await {
            Outcome::Success(response) => Ok(response),
            Outcome::Failure(err) => Err(err),
            Outcome::CredentialExpired { presented, .. } => self.recover(request, presented).await,
        }
    }

    async fn recover(
        &self,
        request: ApiRequest,
        presented: Option<AccessToken>,
    ) -> Result<ApiResponse, SessionError> {
        let waiter = match self.inner.admit(request, presented.as_ref())? {
            Admission::Lead(leader, waiter) => {
                tokio::spawn(run_refresh(Arc::clone(&self.inner), leader));
                waiter
            }
            Admission::Queued(waiter) => waiter,
            Admission::Replay(request, token) => {
                debug!(path = request.path(), "credential already rotated; replaying");
                return self
                    .inner
                    .dispatcher
                    .send(&request, &Attempt::Replay(token))
                    .await
                    .into_result();
            }
        };
        waiter.await.map_err(|_| SessionError::RefreshAbandoned)?
    }

    #[cfg(test)]
    pub(crate) fn is_refreshing(&self) -> bool {
        matches!(*self.inner.lock_state(), RefreshState::Refreshing { .. })
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        match &*self.inner.lock_state() {
            RefreshState::Idle => 0,
            RefreshState::Refreshing { queue } => queue.len(),
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(
        &self,
        request: ApiRequest,
        presented: Option<&AccessToken>,
    ) -> Result<Admission, SessionError> {
        let mut state = self.lock_state();
        if let RefreshState::Refreshing { queue } = &mut *state {
            let (respond, waiter) = oneshot::channel();
            queue.push_back(PendingRequest { request, respond });
            debug!(queued = queue.len(), "refresh in flight; request queued");
            return Ok(Admission::Queued(waiter));
        }

        let current = self
            .dispatcher
            .store()
            .get()?
            .map(|credential| credential.access_token);
        if let Some(current) = current {
            if presented != Some(&current) {
                return Ok(Admission::Replay(request, current));
            }
        }

        *state = RefreshState::Refreshing {
            queue: VecDeque::new(),
        };
        let (respond, waiter) = oneshot::channel();
        Ok(Admission::Lead(PendingRequest { request, respond }, waiter))
    }

    /// Return to `Idle`, handing back everything that queued up meanwhile.
    fn finish(&self) -> VecDeque<PendingRequest> {
        match mem::replace(&mut *self.lock_state(), RefreshState::Idle) {
            RefreshState::Refreshing { queue } => queue,
            RefreshState::Idle => VecDeque::new(),
        }
    }

    async fn replay(&self, pending: PendingRequest, token: AccessToken) {
        let outcome = self
            .dispatcher
            .send(&pending.request, &Attempt::Replay(token))
            .await;
        if pending.respond.send(outcome.into_result()).is_err() {
            debug!(
                path = pending.request.path(),
                "caller went away before its replay completed"
            );
        }
    }
}

/// Releases the state if the refresh task is torn down before resolving.
struct FinishGuard<'a> {
    inner: &'a Inner,
    done: bool,
}

impl<'a> FinishGuard<'a> {
    fn new(inner: &'a Inner) -> Self {
        Self { inner, done: false }
    }

    fn finish(&mut self) -> VecDeque<PendingRequest> {
        self.done = true;
        self.inner.finish()
    }
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            warn!("refresh task ended early; releasing queued requests");
            self.inner.finish();
        }
    }
}

/// Refresh once, then release the leader and every queued request.
///
/// A refreshed credential that cannot be written to the store counts as a failed refresh.
async fn run_refresh(inner: Arc<Inner>, leader: PendingRequest) {
    let mut guard = FinishGuard::new(&inner);
    info!(path = leader.request.path(), "access token expired; refreshing");

    let result = match timeout(inner.refresh_timeout, inner.tokens.refresh()).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::Timeout(inner.refresh_timeout)),
    };
    let result = result.and_then(|credential| {
        inner.dispatcher.store().set(&credential)?;
        Ok(credential)
    });

    match result {
        Ok(credential) => {
            let queue = guard.finish();
            info!(queued = queue.len(), "access token refreshed; replaying requests");

            let token = credential.access_token;
            let replays = iter::once(leader)
                .chain(queue)
                .map(|pending| inner.replay(pending, token.clone()));
            join_all(replays).await;
        }
        Err(err) => {
            warn!(error = %err, "token refresh failed; clearing session");
            if let Err(clear_err) = inner.dispatcher.clear_session() {
                warn!(error = %clear_err, "failed to clear session");
            }
            let queue = guard.finish();

            let cause = Arc::new(err);
            for pending in iter::once(leader).chain(queue) {
                let _ = pending
                    .respond
                    .send(Err(SessionError::RefreshFailed(Arc::clone(&cause))));
            }
        }
    }
}
