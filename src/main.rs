/// ledger-sync daemon
///
/// Loads configuration from the environment and runs the scheduler until
/// the process is told to stop.

use ledger_sync::{app::run, config::Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::default();
    run(config).await
}
