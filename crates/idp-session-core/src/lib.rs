//! Client-side session layer for the Identity Provider API.
//!
//! Requests go out through a [`http::Dispatcher`] that attaches the stored bearer token. When the
//! server rejects an expired token, the [`refresh::RefreshCoordinator`] obtains exactly one new
//! token and replays every request that was waiting on it.

pub mod auth;
pub mod config;
pub mod http;
pub mod refresh;
pub mod session;

pub use auth::{Credential, CredentialStore, LoginError, SessionError};
pub use config::SessionConfig;
pub use http::SessionCookies;
pub use session::{LoginOutcome, Session, SessionStatus};
