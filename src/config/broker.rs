/// Broker account file
///
/// One record per brokerage account. Secrets are validated lazily, per
/// account, so a half-filled entry only disables that account.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Contents of the broker YAML file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Drive the web login automatically; when false only the manual
    /// fallback (operator-supplied request token) is used
    #[serde(default = "default_auto_login")]
    pub auto_login: bool,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

fn default_auto_login() -> bool {
    true
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            auto_login: default_auto_login(),
            accounts: Vec::new(),
        }
    }
}

/// One brokerage account as written by the operator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub password: String,
    /// Base32 TOTP seed
    #[serde(default)]
    pub totp_token: String,
    /// Request token pasted in after a manual login
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_token: Option<String>,
}

/// Account with every static secret present
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSecrets {
    pub name: String,
    pub api_key: String,
    pub api_secret: String,
    pub user_id: String,
    pub password: String,
    pub totp_seed: String,
}

impl AccountConfig {
    /// Check that every secret needed for login and exchange is set.
    pub fn secrets(&self) -> Result<AccountSecrets> {
        let missing: Vec<&str> = [
            ("api_key", &self.api_key),
            ("api_secret", &self.api_secret),
            ("user_id", &self.user_id),
            ("password", &self.password),
            ("totp_token", &self.totp_token),
        ]
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(field, _)| *field)
        .collect();

        if !missing.is_empty() {
            return Err(Error::Configuration(format!(
                "account '{}' is missing {}",
                self.display_name(),
                missing.join(", ")
            )));
        }

        Ok(AccountSecrets {
            name: self.display_name().to_string(),
            api_key: self.api_key.trim().to_string(),
            api_secret: self.api_secret.trim().to_string(),
            user_id: self.user_id.trim().to_string(),
            password: self.password.clone(),
            totp_seed: self.totp_token.trim().to_string(),
        })
    }

    fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.api_key
        } else {
            &self.name
        }
    }

    /// Operator-supplied request token, if any
    pub fn manual_request_token(&self) -> Option<&str> {
        self.request_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

impl BrokerConfig {
    /// Load the account file, writing a template when it does not exist yet.
    ///
    /// A freshly written template is reported as a configuration error so
    /// the caller does not try to log in with placeholder secrets.
    pub async fn load_or_template(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Ok(serde_yaml::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Self::write_template(path).await?;
                tracing::info!("📝 Created template broker config at: {}", path.display());
                Err(Error::Configuration(format!(
                    "broker config created at {}, fill in your account credentials",
                    path.display()
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Find an account by API key
    pub fn account(&self, api_key: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.api_key == api_key)
    }

    fn template() -> Self {
        let placeholder = |name: &str, prefix: &str| AccountConfig {
            name: name.to_string(),
            api_key: format!("your_{prefix}api_key_here"),
            api_secret: format!("your_{prefix}api_secret_here"),
            user_id: format!("your_{prefix}user_id_here"),
            password: format!("your_{prefix}password_here"),
            totp_token: format!("your_{prefix}totp_secret_here"),
            request_token: None,
        };
        Self {
            auto_login: true,
            accounts: vec![
                placeholder("Primary Account", ""),
                placeholder("Secondary Account", "second_"),
            ],
        }
    }

    async fn write_template(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let yaml = serde_yaml::to_string(&Self::template())?;
        tokio::fs::write(path, yaml).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        Ok(())
    }
}
