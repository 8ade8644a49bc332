/// Provider URLs
///
/// Two hosts: the browser-facing login surface and the REST API. Both are
/// configurable so tests can point them at a mock server.

use crate::config::BrokerSettings;
use std::time::Duration;

/// Resolved provider endpoints and call timeout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderEndpoints {
    web_url: String,
    api_url: String,
    pub timeout: Duration,
}

impl ProviderEndpoints {
    pub fn new(web_url: impl Into<String>, api_url: impl Into<String>) -> Self {
        Self {
            web_url: web_url.into().trim_end_matches('/').to_string(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn from_settings(settings: &BrokerSettings) -> Self {
        Self::new(&settings.web_url, &settings.api_url)
            .with_timeout(Duration::from_secs(settings.http_timeout_secs))
    }

    pub fn web_url(&self) -> &str {
        &self.web_url
    }

    /// Login page a human (or the emulator) starts from
    pub fn connect_login_url(&self, api_key: &str) -> String {
        format!("{}/connect/login?api_key={}&v=3", self.web_url, api_key)
    }

    /// Login page scoped to an existing session
    pub fn session_login_url(&self, api_key: &str, sess_id: &str) -> String {
        format!(
            "{}/connect/login?api_key={}&sess_id={}",
            self.web_url, api_key, sess_id
        )
    }

    pub fn password_url(&self) -> String {
        format!("{}/api/login", self.web_url)
    }

    pub fn twofa_url(&self) -> String {
        format!("{}/api/twofa", self.web_url)
    }

    pub fn session_token_url(&self) -> String {
        format!("{}/session/token", self.api_url)
    }

    pub fn profile_url(&self) -> String {
        format!("{}/user/profile", self.api_url)
    }

    pub fn trades_url(&self) -> String {
        format!("{}/trades", self.api_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slashes_are_dropped() {
        let endpoints = ProviderEndpoints::new("http://web/", "http://api/");
        assert_eq!(
            endpoints.connect_login_url("abc"),
            "http://web/connect/login?api_key=abc&v=3"
        );
        assert_eq!(endpoints.session_token_url(), "http://api/session/token");
        assert_eq!(endpoints.timeout, Duration::from_secs(30));
    }
}
