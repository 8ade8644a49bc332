/// Application setup and run loop
///
/// Wires together all components: state database, credential store, broker
/// clients, task roster and scheduler. Provides the entry point used by the
/// binary.

use crate::{
    broker::{BrokerSession, LoginFlowEmulator, ProviderEndpoints, RequestTokenSource},
    config::Config,
    runtime::Scheduler,
    storage::{open_pool, CredentialStore},
    tasks::{default_roster, CommandPriceSync, DailyPriceUpdateTask, DailyTradesTask},
};
use anyhow::{Context, Result};
use sqlx::sqlite::SqlitePool;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Fully wired, not yet started application
pub struct App {
    pub pool: SqlitePool,
    pub scheduler: Arc<Scheduler>,
}

/// Build every component from the configuration
pub async fn create_app(config: Config) -> Result<App> {
    tracing::info!("📁 Data directory: {}", config.database.data_dir.display());
    let pool = open_pool(&config.database.database_path())
        .await
        .context("Failed to open state database")?;

    tracing::info!("🔌 Initializing broker clients");
    let endpoints = ProviderEndpoints::from_settings(&config.broker);
    let session = Arc::new(
        BrokerSession::new(endpoints.clone()).context("Failed to build broker HTTP client")?,
    );
    let login: Arc<dyn RequestTokenSource> = Arc::new(
        LoginFlowEmulator::new(endpoints).context("Failed to initialize login emulator")?,
    );

    tracing::info!("📋 Building task roster");
    let trades = DailyTradesTask::new(
        config.broker.accounts_file.clone(),
        config.journal_path.clone(),
        CredentialStore::new(pool.clone()),
        session,
        login,
    );
    let prices = DailyPriceUpdateTask::new(Arc::new(CommandPriceSync::new(config.prices.clone())));
    let scheduler = Arc::new(Scheduler::new(default_roster(trades, prices)));

    tracing::info!("✅ Application initialized successfully");
    Ok(App { pool, scheduler })
}

/// Start the scheduler and run until SIGINT/SIGTERM
pub async fn run(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting ledger-sync...");

    let app = create_app(config).await?;
    app.scheduler
        .initialize(app.pool.clone())
        .await
        .context("Failed to initialize scheduler")?;
    app.scheduler
        .start()
        .await
        .context("Failed to start scheduler")?;

    for (name, next) in app.scheduler.next_run_times().await {
        tracing::info!("🗓️ {} next runs at {}", name, next.format("%Y-%m-%d %H:%M:%S %Z"));
    }

    shutdown_signal().await;
    tracing::info!("🛑 Shutdown signal received");

    app.scheduler.stop().await.context("Failed to stop scheduler")?;
    app.pool.close().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("❌ Failed to listen for ctrl-c: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("❌ Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
