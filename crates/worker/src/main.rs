use anyhow::Context;
use tokio::runtime::Handle;

use firstsip_infra::config::WorkerConfig;
use firstsip_worker::app;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env().context("invalid worker configuration")?;
    firstsip_observability::init_with(&config.log_level, config.log_format.parse().unwrap_or_default());

    let pool = app::connect_postgres(&config).await?;
    let handle = Handle::current();

    // Handlers block on I/O; everything below runs on plain threads.
    let worker = tokio::task::spawn_blocking(move || {
        let services = app::build_services(&config, pool, handle)?;
        app::Worker::start(services, &config)
    })
    .await??;

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown signal received");

    tokio::task::spawn_blocking(move || worker.shutdown()).await?;
    Ok(())
}
