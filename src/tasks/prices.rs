/// Daily Price Update task

use crate::config::PriceSyncConfig;
use crate::error::{Error, Result};
use crate::runtime::Task;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const NAME: &str = "Daily Price Update";
pub const SCHEDULE: &str = "0 0 18 * * *";

/// The three price refresh stages
#[async_trait]
pub trait PriceSync: Send + Sync {
    async fn sync_commodities(&self, cancel: &CancellationToken) -> Result<()>;
    async fn sync_cii(&self, cancel: &CancellationToken) -> Result<()>;
    async fn sync_portfolios(&self, cancel: &CancellationToken) -> Result<()>;
}

pub struct DailyPriceUpdateTask {
    sync: Arc<dyn PriceSync>,
}

impl DailyPriceUpdateTask {
    pub fn new(sync: Arc<dyn PriceSync>) -> Self {
        Self { sync }
    }
}

#[async_trait]
impl Task for DailyPriceUpdateTask {
    fn name(&self) -> &str {
        NAME
    }

    fn schedule(&self) -> &str {
        SCHEDULE
    }

    fn runs_on_startup(&self) -> bool {
        false
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        tracing::info!("💹 Starting daily price update");

        self.sync.sync_commodities(&cancel).await?;

        if let Err(e) = self.sync.sync_cii(&cancel).await {
            tracing::warn!("⚠️ Failed to sync CII: {}", e);
        }
        if let Err(e) = self.sync.sync_portfolios(&cancel).await {
            tracing::warn!("⚠️ Failed to sync portfolios: {}", e);
        }

        tracing::info!("✅ Daily price update completed");
        Ok(())
    }
}

/// Runs operator-configured shell commands for each stage
pub struct CommandPriceSync {
    config: PriceSyncConfig,
}

impl CommandPriceSync {
    pub fn new(config: PriceSyncConfig) -> Self {
        Self { config }
    }

    async fn run_stage(
        &self,
        stage: &str,
        command: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(command) = command else {
            tracing::info!("No command configured for {} sync, skipping", stage);
            return Ok(());
        };

        tracing::debug!("Running {} sync: {}", stage, command);
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .kill_on_drop(true)
            .spawn()?;

        let finished = tokio::select! {
            status = child.wait() => Some(status?),
            _ = cancel.cancelled() => None,
        };
        let Some(status) = finished else {
            if let Err(e) = child.kill().await {
                tracing::warn!("⚠️ Failed to kill {} sync: {}", stage, e);
            }
            return Err(Error::Task(format!("{stage} sync cancelled")));
        };

        if status.success() {
            Ok(())
        } else {
            Err(Error::Task(format!("{stage} sync exited with {status}")))
        }
    }
}

#[async_trait]
impl PriceSync for CommandPriceSync {
    async fn sync_commodities(&self, cancel: &CancellationToken) -> Result<()> {
        self.run_stage("commodities", self.config.commodities_cmd.as_deref(), cancel)
            .await
    }

    async fn sync_cii(&self, cancel: &CancellationToken) -> Result<()> {
        self.run_stage("CII", self.config.cii_cmd.as_deref(), cancel)
            .await
    }

    async fn sync_portfolios(&self, cancel: &CancellationToken) -> Result<()> {
        self.run_stage("portfolios", self.config.portfolios_cmd.as_deref(), cancel)
            .await
    }
}
