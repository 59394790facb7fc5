//! switchyard-broker: standalone broker host
//!
//! Loads configuration, initializes tracing, and serves the broker over the
//! in-process transport hub until ctrl-c. Deployments with a network
//! transport bind their own `FrontendTransport`/`BackendTransport`
//! implementations in place of the hub.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use switchyard::config::Config;
use switchyard::transport::ChannelHub;
use switchyard::Broker;

/// Initialize tracing with the SWITCHYARD_LOG environment variable.
///
/// Defaults to "info" level if SWITCHYARD_LOG is not set.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("SWITCHYARD_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load()?;
    info!(
        frontend = %config.broker.frontend_url,
        backend = %config.broker.backend_url,
        workers = config.runtime.worker_pool_size,
        "Starting broker"
    );

    let hub = ChannelHub::new();
    let broker = Arc::new(Broker::new(hub.clone(), hub.clone(), config.broker_options()).await?);

    let server = broker.clone();
    let serve_task = tokio::spawn(async move { server.serve().await });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    broker.stop();
    serve_task.await??;

    Ok(())
}
