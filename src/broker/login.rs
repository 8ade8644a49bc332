/// Login Flow Emulator
///
/// Drives the provider's browser login (session, password, TOTP, two
/// redirect hops) and returns the single-use request token carried by the
/// final callback URL. Each attempt starts from an empty cookie jar and does
/// not follow redirects on its own. Nothing here retries; the credential
/// manager owns that.

use crate::broker::endpoints::ProviderEndpoints;
use crate::broker::totp;
use crate::config::AccountSecrets;
use crate::error::{Error, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, LOCATION, ORIGIN, REFERER};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const ACCEPT_HTML: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8";
const ACCEPT_JSON: &str = "application/json, text/plain, */*";

/// Anything that can hand out a fresh request token for an account
#[async_trait]
pub trait RequestTokenSource: Send + Sync {
    async fn mint(&self, account: &AccountSecrets) -> Result<String>;
}

/// JSON envelope of the password and 2FA steps
#[derive(Debug, Deserialize)]
struct StepResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<StepData>,
}

#[derive(Debug, Deserialize)]
struct StepData {
    #[serde(default)]
    request_id: Option<String>,
}

pub struct LoginFlowEmulator {
    endpoints: ProviderEndpoints,
    sess_id: Regex,
    request_token: Regex,
}

impl LoginFlowEmulator {
    pub fn new(endpoints: ProviderEndpoints) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| Error::Configuration(format!("invalid pattern {pattern}: {e}")))
        };
        Ok(Self {
            sess_id: compile(r"sess_id=([^&]+)")?,
            request_token: compile(r"request_token=([^&]+)")?,
            endpoints,
        })
    }

    fn build_client(&self) -> Result<reqwest::Client> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        Ok(reqwest::Client::builder()
            .cookie_provider(Arc::new(Jar::default()))
            .redirect(reqwest::redirect::Policy::none())
            .timeout(self.endpoints.timeout)
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .build()?)
    }

    async fn run_flow(&self, account: &AccountSecrets) -> Result<String> {
        let client = self.build_client()?;

        // Step 1: session id from the login redirect
        let response = client
            .get(self.endpoints.connect_login_url(&account.api_key))
            .header(ACCEPT, ACCEPT_HTML)
            .send()
            .await?;
        let location = redirect_target(&response, "session")?;
        let sess_id = self
            .capture(&self.sess_id, location.as_str())
            .ok_or_else(|| {
                Error::Protocol(format!("session id not found in redirect URL: {location}"))
            })?;
        debug!("Got session id for {}", account.name);

        let session_page = self.endpoints.session_login_url(&account.api_key, &sess_id);

        // Step 2: password
        let response = client
            .post(self.endpoints.password_url())
            .header(ACCEPT, ACCEPT_JSON)
            .header(REFERER, &session_page)
            .header(ORIGIN, self.endpoints.web_url())
            .form(&[
                ("user_id", account.user_id.as_str()),
                ("password", account.password.as_str()),
            ])
            .send()
            .await?;
        let step = read_step(response, "login").await?;
        let request_id = step
            .data
            .and_then(|d| d.request_id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::Protocol("login response carried no request_id".to_string()))?;

        // Step 3: second factor
        let code = totp::generate(&account.totp_seed)?;
        let response = client
            .post(self.endpoints.twofa_url())
            .header(ACCEPT, ACCEPT_JSON)
            .header(REFERER, &session_page)
            .header(ORIGIN, self.endpoints.web_url())
            .form(&[
                ("user_id", account.user_id.as_str()),
                ("request_id", request_id.as_str()),
                ("twofa_value", code.as_str()),
                ("twofa_type", "totp"),
            ])
            .send()
            .await?;
        read_step(response, "2FA").await?;
        info!("✅ 2FA accepted for {}", account.name);

        // Step 4: session page -> finish -> callback
        let response = client
            .get(&session_page)
            .header(ACCEPT, ACCEPT_HTML)
            .send()
            .await?;
        let finish = redirect_target(&response, "post-2FA")?;

        let response = client
            .get(finish)
            .header(ACCEPT, ACCEPT_HTML)
            .header(REFERER, &session_page)
            .send()
            .await?;
        let callback = redirect_target(&response, "finish")?;

        // Step 5: request token from the callback
        self.capture(&self.request_token, callback.as_str())
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "request token not found in final redirect URL: {callback}"
                ))
            })
    }

    fn capture(&self, pattern: &Regex, haystack: &str) -> Option<String> {
        pattern
            .captures(haystack)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }
}

#[async_trait]
impl RequestTokenSource for LoginFlowEmulator {
    async fn mint(&self, account: &AccountSecrets) -> Result<String> {
        info!("🔐 Starting web login for {}", account.name);
        let token = self.run_flow(account).await?;
        info!("🎟️ Got request token for {}", account.name);
        Ok(token)
    }
}

/// `Location` of a redirect, resolved against the URL that produced it
fn redirect_target(response: &reqwest::Response, step: &str) -> Result<Url> {
    let location = response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            Error::Protocol(format!(
                "{step} response ({}) had no Location header",
                response.status()
            ))
        })?;

    Url::parse(response.url().as_str())
        .and_then(|base| base.join(location))
        .map_err(|e| Error::Protocol(format!("{step} redirect '{location}' is not a URL: {e}")))
}

async fn read_step(response: reqwest::Response, step: &str) -> Result<StepResponse> {
    let status = response.status();
    let body = response.text().await?;
    let parsed: StepResponse = serde_json::from_str(&body).map_err(|e| {
        Error::Protocol(format!("{step} returned an unexpected body ({status}): {e}"))
    })?;

    if parsed.status != "success" {
        let reason = parsed
            .message
            .clone()
            .unwrap_or_else(|| format!("status {}", status));
        return Err(Error::Authentication(format!("{step} rejected: {reason}")));
    }
    Ok(parsed)
}
