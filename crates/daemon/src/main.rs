// trisyncd: sync daemon entry point.

use anyhow::Context;
use tracing::info;
use trisync_daemon::config::DaemonConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = DaemonConfig::from_env().context("failed to load daemon configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.log_filter))
        .init();

    info!("starting trisync daemon");
    trisync_daemon::runtime::run(config).await.context("trisync daemon terminated unexpectedly")
}
