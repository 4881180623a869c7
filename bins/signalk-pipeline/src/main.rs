mod roles;

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// SignalK telemetry pipeline
#[derive(Parser, Debug)]
#[command(name = "signalk-pipeline")]
#[command(about = "Vessel telemetry pipeline: connectors, mappers, filter, store, server, transfer")]
#[command(version)]
struct Args {
    /// Pipeline stage to run in this process
    #[arg(value_enum)]
    role: Role,

    /// Role configuration (.yaml, .yml or .json)
    #[arg(short, long)]
    config: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    Connector,
    Mapper,
    Filter,
    Store,
    Server,
    Transfer,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,signalk=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    tracing::info!(role = ?args.role, config = %args.config.display(), "signalk-pipeline starting");

    let path = args.config.as_path();
    let shutdown = ctrl_c();
    match args.role {
        Role::Connector => roles::connector(path, shutdown).await?,
        Role::Mapper => roles::mapper(path, shutdown).await?,
        Role::Filter => roles::filter(path, shutdown).await?,
        Role::Store => roles::store(path, shutdown).await?,
        Role::Server => roles::server(path, shutdown).await?,
        Role::Transfer => roles::transfer(path, shutdown).await?,
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C. If the signal handler cannot be installed the role
/// runs until its input ends.
async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received Ctrl+C, shutting down..."),
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    }
}
