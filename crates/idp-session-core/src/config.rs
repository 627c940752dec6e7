use std::env;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use thiserror::Error;
use url::Url;

use crate::http::Endpoints;

pub const DEFAULT_PROFILE: &str = "default";
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

/// Locates the per-user directory holding persisted credentials.
#[derive(Debug, Clone)]
pub struct ConfigLocator {
    root: PathBuf,
}

impl ConfigLocator {
    /// Attempt to discover the persistent configuration directory, creating it if needed.
    pub fn new() -> Result<Self, ConfigError> {
        let dirs = ProjectDirs::from("app", "iskolutions", "idp-session")
            .ok_or(ConfigError::MissingProjectDirs)?;
        Self::from_root(dirs.config_dir().to_path_buf())
    }

    /// Use an explicit directory instead of the platform default.
    pub fn from_root(root: PathBuf) -> Result<Self, ConfigError> {
        fs::create_dir_all(&root).map_err(ConfigError::CreateDir)?;
        set_user_only_permissions(&root)?;
        Ok(Self { root })
    }

    /// Path to the credential file for the given profile.
    pub fn credentials_file(&self, profile: &str) -> PathBuf {
        self.root.join(format!("credential-{profile}.json"))
    }

    /// Path to the server session cookies for the given profile.
    pub fn cookies_file(&self, profile: &str) -> PathBuf {
        self.root.join(format!("cookies-{profile}.json"))
    }
}

/// Replace `path` with `payload`, readable by the current user only.
pub(crate) fn write_private_file(path: &Path, payload: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.write_all(payload.as_bytes())?;

    #[cfg(unix)]
    {
        let mut perm = file.metadata()?.permissions();
        perm.set_mode(0o600);
        fs::set_permissions(path, perm)?;
    }

    Ok(())
}

fn set_user_only_permissions(path: &Path) -> Result<(), ConfigError> {
    #[cfg(unix)]
    {
        let metadata = fs::metadata(path)?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o700);
        fs::set_permissions(path, permissions)?;
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

/// Settings shared by the dispatcher, the refresh coordinator and the session facade.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub base_url: Url,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_uri: Option<Url>,
    pub endpoints: Endpoints,
    /// Upper bound for the single in-flight refresh call.
    pub refresh_timeout: Duration,
    pub request_timeout: Option<Duration>,
    pub profile: String,
}

impl SessionConfig {
    pub fn new<S: Into<String>>(base_url: Url, client_id: S) -> Self {
        Self {
            base_url,
            client_id: client_id.into(),
            client_secret: None,
            redirect_uri: None,
            endpoints: Endpoints::default(),
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            request_timeout: None,
            profile: DEFAULT_PROFILE.to_owned(),
        }
    }

    /// Read configuration from `IDP_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &'static str| {
            lookup(key)
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
        };

        let base_url =
            read("IDP_API_BASE_URL").ok_or(ConfigError::MissingVar("IDP_API_BASE_URL"))?;
        let base_url = Url::parse(&base_url).map_err(|source| ConfigError::InvalidUrl {
            key: "IDP_API_BASE_URL",
            source,
        })?;
        let client_id = read("IDP_CLIENT_ID").ok_or(ConfigError::MissingVar("IDP_CLIENT_ID"))?;

        let mut config = Self::new(base_url, client_id);
        config.client_secret = read("IDP_CLIENT_SECRET");

        if let Some(raw) = read("IDP_REDIRECT_URI") {
            let uri = Url::parse(&raw).map_err(|source| ConfigError::InvalidUrl {
                key: "IDP_REDIRECT_URI",
                source,
            })?;
            config.redirect_uri = Some(uri);
        }

        if let Some(raw) = read("IDP_REFRESH_TIMEOUT_SECS") {
            config.refresh_timeout = parse_seconds("IDP_REFRESH_TIMEOUT_SECS", &raw)?;
        }

        if let Some(raw) = read("IDP_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = Some(parse_seconds("IDP_REQUEST_TIMEOUT_SECS", &raw)?);
        }

        if let Some(profile) = read("IDP_PROFILE") {
            config.profile = profile;
        }

        Ok(config)
    }

    pub fn with_secret<S: Into<String>>(mut self, secret: S) -> Self {
        self.client_secret = Some(secret.into());
        self
    }

    pub fn with_redirect_uri(mut self, redirect_uri: Url) -> Self {
        self.redirect_uri = Some(redirect_uri);
        self
    }

    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }
}

fn parse_seconds(key: &'static str, raw: &str) -> Result<Duration, ConfigError> {
    let seconds = raw
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidNumber {
            key,
            value: raw.to_owned(),
        })?;
    if seconds == 0 {
        return Err(ConfigError::InvalidNumber {
            key,
            value: raw.to_owned(),
        });
    }
    Ok(Duration::from_secs(seconds))
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to determine configuration directory for idp-session")]
    MissingProjectDirs,
    #[error("failed to create configuration directory: {0}")]
    CreateDir(#[source] std::io::Error),
    #[error("filesystem error: {0}")]
    Io(#[source] std::io::Error),
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid URL in {key}: {source}")]
    InvalidUrl {
        key: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("invalid value '{value}' for {key}; expected a positive number of seconds")]
    InvalidNumber { key: &'static str, value: String },
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn credentials_file_appends_profile() {
        let temp_dir = TempDir::new().unwrap();
        let locator = ConfigLocator::from_root(temp_dir.path().to_path_buf()).unwrap();
        let path = locator.credentials_file("default");
        assert!(path.ends_with("credential-default.json"));
    }

    #[test]
    fn from_lookup_reads_all_settings() {
        let config = SessionConfig::from_lookup(lookup(&[
            ("IDP_API_BASE_URL", "https://idp.example.com/api/v1/"),
            ("IDP_CLIENT_ID", "client-1"),
            ("IDP_CLIENT_SECRET", "s3cret"),
            ("IDP_REDIRECT_URI", "https://app.example.com/callback"),
            ("IDP_REFRESH_TIMEOUT_SECS", "5"),
            ("IDP_PROFILE", "staging"),
        ]))
        .unwrap();

        assert_eq!(config.base_url.as_str(), "https://idp.example.com/api/v1/");
        assert_eq!(config.client_id, "client-1");
        assert_eq!(config.client_secret.as_deref(), Some("s3cret"));
        assert_eq!(
            config.redirect_uri.as_ref().map(Url::as_str),
            Some("https://app.example.com/callback")
        );
        assert_eq!(config.refresh_timeout, Duration::from_secs(5));
        assert_eq!(config.request_timeout, None);
        assert_eq!(config.profile, "staging");
    }

    #[test]
    fn from_lookup_requires_base_url_and_client() {
        let err = SessionConfig::from_lookup(lookup(&[("IDP_CLIENT_ID", "client")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar("IDP_API_BASE_URL")));

        let err = SessionConfig::from_lookup(lookup(&[("IDP_API_BASE_URL", "http://localhost")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar("IDP_CLIENT_ID")));
    }

    #[test]
    fn zero_refresh_timeout_is_rejected() {
        let err = SessionConfig::from_lookup(lookup(&[
            ("IDP_API_BASE_URL", "http://localhost"),
            ("IDP_CLIENT_ID", "client"),
            ("IDP_REFRESH_TIMEOUT_SECS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNumber { .. }));
    }
}
