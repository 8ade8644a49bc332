/// Daily Trades Fetch task

use crate::broker::trades::append_to_journal;
use crate::broker::{BrokerSession, CredentialManager, RequestTokenSource, SessionApi};
use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use crate::runtime::Task;
use crate::storage::CredentialStore;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const NAME: &str = "Daily Trades Fetch";
pub const SCHEDULE: &str = "0 0 16 * * *";

pub struct DailyTradesTask {
    accounts_file: PathBuf,
    journal: PathBuf,
    session: Arc<BrokerSession>,
    // shared by every run so overlapping runs serialise their refreshes
    credentials: CredentialManager,
}

impl DailyTradesTask {
    pub fn new(
        accounts_file: PathBuf,
        journal: PathBuf,
        store: CredentialStore,
        session: Arc<BrokerSession>,
        login: Arc<dyn RequestTokenSource>,
    ) -> Self {
        let api: Arc<dyn SessionApi> = session.clone();
        let credentials = CredentialManager::new(
            store,
            Arc::new(BrokerConfig::default()),
            api,
            login,
            session.endpoints().clone(),
        );
        Self {
            accounts_file,
            journal,
            session,
            credentials,
        }
    }
}

#[async_trait]
impl Task for DailyTradesTask {
    fn name(&self) -> &str {
        NAME
    }

    fn schedule(&self) -> &str {
        SCHEDULE
    }

    fn runs_on_startup(&self) -> bool {
        true
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        tracing::info!("📈 Starting daily trades fetch for all accounts");

        // re-read every run so a pasted request token is picked up without a restart
        let config = Arc::new(BrokerConfig::load_or_template(&self.accounts_file).await?);
        if config.accounts.is_empty() {
            return Err(Error::Configuration("no broker accounts configured".to_string()));
        }
        self.credentials.reload(Arc::clone(&config));

        for account in &config.accounts {
            if cancel.is_cancelled() {
                return Err(Error::Task("trades fetch cancelled".to_string()));
            }
            let name = if account.name.is_empty() {
                account.api_key.as_str()
            } else {
                account.name.as_str()
            };
            tracing::info!("Processing account: {}", name);

            let access_token = match self
                .credentials
                .get_valid_access_token(&account.api_key, &cancel)
                .await
            {
                Ok(token) => token,
                Err(e) if cancel.is_cancelled() => return Err(e),
                Err(e) => {
                    tracing::warn!("⚠️ No valid access token for {}: {}", name, e);
                    continue;
                }
            };

            let trades = match self
                .session
                .fetch_trades(&account.api_key, &access_token, &cancel)
                .await
            {
                Ok(trades) => trades,
                Err(e) => {
                    tracing::warn!("⚠️ Failed to fetch trades for {}: {}", name, e);
                    continue;
                }
            };

            tracing::info!("Found {} trades for {}", trades.len(), name);
            append_to_journal(&self.journal, name, &trades).await?;
        }

        if cancel.is_cancelled() {
            return Err(Error::Task("trades fetch cancelled".to_string()));
        }
        Ok(())
    }
}
