//! Site worker daemon: `fedrun worker`.

use anyhow::Result;
use fedrun::Site;

use super::super::Cli;

pub async fn cmd_worker(cli: &Cli) -> Result<()> {
    let config = super::load_config(cli)?;
    config.ensure_directories()?;

    let site = Site::from_config(config)?;
    site.run(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    })
    .await
}
