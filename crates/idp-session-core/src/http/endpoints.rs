/// Paths of the identity provider's authentication routes, relative to the API base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub login: String,
    pub token: String,
    pub refresh: String,
    pub logout: String,
    pub session: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            login: "/auth/login".into(),
            token: "/auth/token".into(),
            refresh: "/auth/refresh".into(),
            logout: "/auth/logout".into(),
            session: "/auth/session".into(),
        }
    }
}

impl Endpoints {
    /// Endpoints that establish or renew a credential never carry one and never trigger a refresh.
    pub fn is_exempt(&self, path: &str) -> bool {
        let path = normalize(path);
        [&self.login, &self.token, &self.refresh]
            .iter()
            .any(|exempt| normalize(exempt) == path)
    }
}

fn normalize(path: &str) -> &str {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    path.trim_matches('/')
}
