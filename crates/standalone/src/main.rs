//! The metersync edge agent as a single process: DB pool, engines under the
//! supervisor, and the local control API.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use metersync::bacnet::UdpBacnetClient;
use metersync::db::{self, PgCatalogStore, PgReadingStore};
use metersync::remote::HttpRemoteClient;
use metersync::{AgentConfig, Supervisor};

#[derive(Parser)]
#[command(
    name = "metersync-standalone",
    about = "Polls BACnet meters, buffers readings locally, and syncs with the Client System"
)]
struct Args {
    /// Path to a TOML config file. Environment variables win over the file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    metersync::startup::configure_tracing();
    let args = Args::parse();

    let config = Arc::new(
        AgentConfig::load(args.config.as_deref()).context("loading configuration")?,
    );

    let pool = db::create_pool(&config).context("building the database pool")?;
    db::bootstrap_schema(&pool)
        .await
        .context("bootstrapping the local schema")?;

    let reading_store = Arc::new(PgReadingStore::new(pool.clone()));
    let catalog = Arc::new(PgCatalogStore::new(pool.clone()));
    let remote = Arc::new(HttpRemoteClient::new(&config).context("building the remote client")?);
    let bacnet = Arc::new(UdpBacnetClient::new(
        config.bacnet_bind_addr,
        config.bacnet_pool_size,
        config.bacnet_connect_timeout,
    ));

    let supervisor = Supervisor::start(
        config.clone(),
        Some(pool),
        reading_store,
        catalog,
        remote,
        bacnet,
    )
    .await
    .context("starting the supervisor")?;

    let app = metersync_client_api::routes::router(supervisor.clone());
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding the local API to {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "local API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving the local API")?;

    supervisor.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "could not listen for the shutdown signal");
        return;
    }
    tracing::info!("shutdown signal received");
}
