//! Standalone router. Supervisors started later find it already listening
//! and only connect to its control channel.

use portside::config;
use portside::router;
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("portside=info".parse().expect("valid log directive")),
        )
        .init();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let router_port = config::router_port();

    if !router::ensure_running(router_port, shutdown_rx).await {
        std::process::exit(1);
    }

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    let _ = shutdown_tx.send(true);

    Ok(())
}
