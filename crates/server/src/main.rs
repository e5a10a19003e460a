use anyhow::Context;
use server::{DeploymentImpl, routes};
use services::services::config::Config;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,server=debug,services=debug,db=debug"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config_path = utils::assets::config_path();
    let config = Config::load_or_default(&config_path);
    if !config_path.exists() {
        match config.save(&config_path) {
            Ok(()) => info!(path = %config_path.display(), "Wrote default config"),
            Err(e) => warn!(error = %e, "Failed to write default config"),
        }
    }

    let deployment = DeploymentImpl::new(config.with_env_overrides()?).await?;
    let server_config = &deployment.config().server;
    let address = format!("{}:{}", server_config.host, server_config.port);

    if let Some(availability) = deployment.availability() {
        let available = availability.is_available().await;
        info!(available, "Initial database availability check");
    }

    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    info!("Server running on http://{address}");

    axum::serve(listener, routes::router(deployment))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down");
}
