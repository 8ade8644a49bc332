/// Session API
///
/// Request-token exchange and access-token probing against the provider's
/// REST API.

use crate::broker::endpoints::ProviderEndpoints;
use crate::config::AccountSecrets;
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

pub(crate) const KITE_VERSION_HEADER: &str = "X-Kite-Version";
pub(crate) const KITE_VERSION: &str = "3";

/// Result of checking whether an access token is still accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Valid,
    /// The provider explicitly rejected the token
    Expired,
    /// Transport failure or an answer we could not classify
    Unreachable,
}

#[async_trait]
pub trait SessionApi: Send + Sync {
    /// Never fails; callers treat anything but `Valid` as expired.
    async fn probe(&self, api_key: &str, access_token: &str) -> ProbeOutcome;

    /// Trade a request token for an access token.
    async fn exchange(&self, account: &AccountSecrets, request_token: &str) -> Result<String>;
}

/// hex(SHA-256(api_key + request_token + api_secret))
pub fn checksum(api_key: &str, request_token: &str, api_secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hasher.update(request_token.as_bytes());
    hasher.update(api_secret.as_bytes());
    hex::encode(hasher.finalize())
}

pub(crate) fn authorization(api_key: &str, access_token: &str) -> String {
    format!("token {}:{}", api_key, access_token)
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error_type: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct SessionData {
    access_token: Option<String>,
}

/// HTTP implementation of [`SessionApi`]
pub struct BrokerSession {
    pub(crate) client: reqwest::Client,
    pub(crate) endpoints: ProviderEndpoints,
}

impl BrokerSession {
    pub fn new(endpoints: ProviderEndpoints) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(endpoints.timeout)
            .build()?;
        Ok(Self { client, endpoints })
    }

    pub fn endpoints(&self) -> &ProviderEndpoints {
        &self.endpoints
    }
}

#[async_trait]
impl SessionApi for BrokerSession {
    async fn probe(&self, api_key: &str, access_token: &str) -> ProbeOutcome {
        let response = match self
            .client
            .get(self.endpoints.profile_url())
            .header(KITE_VERSION_HEADER, KITE_VERSION)
            .header(AUTHORIZATION, authorization(api_key, access_token))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("⚠️ Token probe for {} failed: {}", api_key, e);
                return ProbeOutcome::Unreachable;
            }
        };

        match response.status() {
            StatusCode::OK => ProbeOutcome::Valid,
            StatusCode::FORBIDDEN => {
                let body = response.text().await.unwrap_or_default();
                match serde_json::from_str::<Envelope<serde_json::Value>>(&body) {
                    Ok(envelope) if envelope.error_type.as_deref() == Some("TokenException") => {
                        debug!("Access token for {} has expired", api_key);
                        ProbeOutcome::Expired
                    }
                    _ => {
                        warn!("⚠️ Token probe for {} got an unrecognised 403: {}", api_key, body);
                        ProbeOutcome::Unreachable
                    }
                }
            }
            status => {
                warn!("⚠️ Token probe for {} returned {}", api_key, status);
                ProbeOutcome::Unreachable
            }
        }
    }

    async fn exchange(&self, account: &AccountSecrets, request_token: &str) -> Result<String> {
        let checksum = checksum(&account.api_key, request_token, &account.api_secret);
        let response = self
            .client
            .post(self.endpoints.session_token_url())
            .header(KITE_VERSION_HEADER, KITE_VERSION)
            .form(&[
                ("api_key", account.api_key.as_str()),
                ("request_token", request_token),
                ("checksum", checksum.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        let envelope: Envelope<SessionData> = serde_json::from_str(&body).map_err(|e| {
            Error::Protocol(format!("session token response ({status}) was not JSON: {e}"))
        })?;

        if envelope.status != "success" {
            return Err(Error::Authentication(format!(
                "session generation failed: {}",
                envelope.message.unwrap_or_else(|| status.to_string())
            )));
        }

        let access_token = envelope
            .data
            .and_then(|d| d.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::Protocol("session response had no access_token".to_string()))?;

        info!("🔓 Exchanged request token for {}", account.name);
        Ok(access_token)
    }
}
