mod credential;
mod credential_store;
mod error;
mod token_client;

pub use credential::{AccessToken, Credential};
pub use credential_store::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use error::{LoginError, SessionError};
pub use token_client::{ClientMetadata, LoginResponse, TokenClient};
