use abyss_replication::config::{HostConfig, Role};
use abyss_replication::host;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let config = HostConfig::load_or_default();
    config.validate()?;

    info!(
        "Abyss host v{} ({:?}, {} ticks/s)",
        env!("CARGO_PKG_VERSION"),
        config.role,
        config.tick_rate
    );

    match config.role {
        Role::Supervisor => host::run_supervisor(config).await?,
        Role::Simulation => host::run_simulation(config).await?,
    }

    info!("Host shutdown complete");
    Ok(())
}
