/// Configuration management for the sync daemon
///
/// Process settings come from environment variables (see [`Config::default`]);
/// broker account secrets live in a separate YAML file that is loaded per run
/// so an operator can drop a fresh request token in without a restart.

pub mod broker;

pub use broker::{AccountConfig, AccountSecrets, BrokerConfig};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,
    /// Broker provider endpoints and account file
    pub broker: BrokerSettings,
    /// Ledger journal the trade fetch appends to
    pub journal_path: PathBuf,
    /// External commands run by the price update task
    pub prices: PriceSyncConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Base directory for the state database (default: "data")
    /// Creates: {data_dir}/sync.db
    pub data_dir: PathBuf,
}

impl DatabaseConfig {
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("sync.db")
    }
}

/// Where the provider lives and where account secrets are read from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// Path of the YAML account file
    pub accounts_file: PathBuf,
    /// Base URL of the provider's web login surface
    pub web_url: String,
    /// Base URL of the provider's REST API
    pub api_url: String,
    /// Per-request timeout applied to every provider call
    pub http_timeout_secs: u64,
}

/// Shell commands for the three price sync stages; unset stages are skipped
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriceSyncConfig {
    pub commodities_cmd: Option<String>,
    pub cii_cmd: Option<String>,
    pub portfolios_cmd: Option<String>,
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for container deployment
    fn default() -> Self {
        let data_dir = PathBuf::from(
            std::env::var("LEDGER_SYNC_DATA_DIR").unwrap_or_else(|_| "data".to_string()),
        );

        Self {
            broker: BrokerSettings {
                accounts_file: std::env::var("LEDGER_SYNC_BROKER_CONFIG")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| data_dir.join("broker.yaml")),
                web_url: std::env::var("LEDGER_SYNC_WEB_URL")
                    .unwrap_or_else(|_| "https://kite.zerodha.com".to_string()),
                api_url: std::env::var("LEDGER_SYNC_API_URL")
                    .unwrap_or_else(|_| "https://api.kite.trade".to_string()),
                http_timeout_secs: std::env::var("LEDGER_SYNC_HTTP_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            },
            journal_path: std::env::var("LEDGER_SYNC_JOURNAL")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("main.ledger")),
            prices: PriceSyncConfig {
                commodities_cmd: non_empty_env("PRICE_SYNC_COMMODITIES_CMD"),
                cii_cmd: non_empty_env("PRICE_SYNC_CII_CMD"),
                portfolios_cmd: non_empty_env("PRICE_SYNC_PORTFOLIOS_CMD"),
            },
            database: DatabaseConfig { data_dir },
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
