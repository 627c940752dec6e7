use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use cookie::Cookie;
use reqwest::cookie::CookieStore;
use reqwest::header::HeaderValue;
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::{Host, Url};

use crate::auth::SessionError;
use crate::config::write_private_file;

/// Upper bound for `Max-Age`, in seconds.
const MAX_AGE_CAP: i64 = 400 * 24 * 60 * 60;

type CookieKey = (String, String, String);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredCookie {
    host: String,
    path: String,
    name: String,
    value: String,
    #[serde(default)]
    secure: bool,
    #[serde(default)]
    expires: Option<DateTime<Utc>>,
}

impl StoredCookie {
    fn from_set_cookie(cookie: &Cookie<'_>, host: &str, url: &Url, now: DateTime<Utc>) -> Self {
        let expires = match cookie.max_age() {
            Some(age) => {
                let seconds = age.whole_seconds().clamp(-1, MAX_AGE_CAP);
                Some(now + Duration::seconds(seconds))
            }
            None => cookie
                .expires_datetime()
                .and_then(|at| DateTime::from_timestamp(at.unix_timestamp(), 0)),
        };
        let path = cookie
            .path()
            .filter(|path| path.starts_with('/'))
            .map(str::to_owned)
            .unwrap_or_else(|| default_path(url.path()));

        Self {
            host: host.to_ascii_lowercase(),
            path,
            name: cookie.name().to_owned(),
            value: cookie.value().to_owned(),
            secure: cookie.secure().unwrap_or(false),
            expires,
        }
    }

    fn key(&self) -> CookieKey {
        (self.host.clone(), self.path.clone(), self.name.clone())
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|at| at <= now)
    }

    fn applies_to(&self, url: &Url) -> bool {
        let host_matches = url
            .host_str()
            .is_some_and(|host| host.eq_ignore_ascii_case(&self.host));
        let channel_ok = !self.secure || url.scheme() == "https" || is_loopback(url);
        host_matches && channel_ok && path_matches(url.path(), &self.path)
    }
}

/// Cookie jar for the server-side session, optionally mirrored to a per-profile file.
///
/// The refresh and session-check endpoints identify the caller by the cookie set at login, so a
/// credential persisted across processes is only useful together with these cookies. Cookies are
/// host-only; the `Domain` attribute is ignored.
pub struct SessionCookies {
    file: Option<PathBuf>,
    cookies: RwLock<BTreeMap<CookieKey, StoredCookie>>,
    write: Mutex<()>,
}

impl SessionCookies {
    /// Jar that lives as long as the process.
    pub fn in_memory() -> Self {
        Self {
            file: None,
            cookies: RwLock::new(BTreeMap::new()),
            write: Mutex::new(()),
        }
    }

    /// Jar backed by `path`. A missing file starts empty; an unreadable one is ignored and
    /// replaced on the next write.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, SessionError> {
        let path = path.into();
        let cookies = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Vec<StoredCookie>>(&raw) {
                Ok(saved) => {
                    let now = Utc::now();
                    saved
                        .into_iter()
                        .filter(|cookie| !cookie.is_expired(now))
                        .map(|cookie| (cookie.key(), cookie))
                        .collect()
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "ignoring unreadable cookie file");
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            file: Some(path),
            cookies: RwLock::new(cookies),
            write: Mutex::new(()),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.cookies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Forget every cookie and remove the backing file.
    pub fn clear(&self) -> Result<(), SessionError> {
        let _write = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        self.cookies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        if let Some(path) = &self.file {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn persist(&self) -> Result<(), SessionError> {
        let Some(path) = &self.file else {
            return Ok(());
        };
        let _write = self.write.lock().unwrap_or_else(PoisonError::into_inner);
        let snapshot: Vec<StoredCookie> = self
            .cookies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let payload = serde_json::to_string_pretty(&snapshot)?;
        write_private_file(path, &payload)?;
        Ok(())
    }
}

impl Default for SessionCookies {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl fmt::Debug for SessionCookies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self
            .cookies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("SessionCookies")
            .field("file", &self.file)
            .field("cookies", &count)
            .finish()
    }
}

impl CookieStore for SessionCookies {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        let Some(host) = url.host_str() else {
            return;
        };
        let now = Utc::now();
        let mut changed = false;
        {
            let mut jar = self.cookies.write().unwrap_or_else(PoisonError::into_inner);
            for header in cookie_headers {
                let Some(cookie) = header.to_str().ok().and_then(|raw| Cookie::parse(raw).ok())
                else {
                    continue;
                };
                let stored = StoredCookie::from_set_cookie(&cookie, host, url, now);
                if stored.is_expired(now) {
                    changed |= jar.remove(&stored.key()).is_some();
                } else {
                    jar.insert(stored.key(), stored);
                    changed = true;
                }
            }
        }
        if changed {
            if let Err(err) = self.persist() {
                warn!(error = %err, "failed to persist session cookies");
            }
        }
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        let now = Utc::now();
        let jar = self.cookies.read().unwrap_or_else(PoisonError::into_inner);
        let header = jar
            .values()
            .filter(|cookie| !cookie.is_expired(now) && cookie.applies_to(url))
            .map(|cookie| format!("{}={}", cookie.name, cookie.value))
            .collect::<Vec<_>>()
            .join("; ");
        if header.is_empty() {
            return None;
        }
        HeaderValue::from_str(&header).ok()
    }
}

fn default_path(request_path: &str) -> String {
    match request_path.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(index) => request_path[..index].to_owned(),
    }
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    request_path == cookie_path
        || (request_path.starts_with(cookie_path)
            && (cookie_path.ends_with('/') || request_path[cookie_path.len()..].starts_with('/')))
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}
