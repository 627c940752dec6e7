use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque bearer value attached to outgoing requests.
///
/// Expiry is never known locally; the server reports it by rejecting the token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new<S: Into<String>>(value: S) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Value for the `Authorization` header.
    pub fn bearer_header(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(**redacted**)")
    }
}

impl From<&str> for AccessToken {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for AccessToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The single live credential of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: AccessToken,
    #[serde(default = "default_obtained_at")]
    pub obtained_at: DateTime<Utc>,
}

fn default_obtained_at() -> DateTime<Utc> {
    Utc::now()
}

impl Credential {
    pub fn new(access_token: impl Into<AccessToken>) -> Self {
        Self {
            access_token: access_token.into(),
            obtained_at: Utc::now(),
        }
    }

    pub fn token(&self) -> &AccessToken {
        &self.access_token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_hides_token() {
        let credential = Credential::new("super-secret");
        let rendered = format!("{credential:?}");
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn bearer_header_prefixes_scheme() {
        let token = AccessToken::new("abc");
        assert_eq!(token.bearer_header(), "Bearer abc");
    }

    #[test]
    fn legacy_payload_without_timestamp_deserializes() {
        let credential: Credential =
            serde_json::from_str(r#"{ "access_token": "T1" }"#).unwrap();
        assert_eq!(credential.token().as_str(), "T1");
    }
}
