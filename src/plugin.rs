//! Plugin-side entry point.
//!
//! A plugin binary calls [`serve`] with its root [`Environment`]. The host
//! reads the printed address as the handshake line and dials it once.

use crate::config::{port_range_from_env, Config};
use crate::environment::{Environment, EnvironmentServer};
use crate::error::Result;
use crate::rpc::Broker;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::signal;
use tracing::info;

/// Expose `env`, announce its address on stdout, and run until interrupted.
pub async fn serve(env: Arc<dyn Environment>) -> Result<()> {
    let ports = port_range_from_env()?;
    let broker = Broker::new(ports, Config::default().accept_timeout());

    let address = broker
        .expose_once(Arc::new(EnvironmentServer::new(env)))
        .await?;
    announce(&address).await?;
    info!(%address, "Plugin serving");

    signal::ctrl_c().await?;
    info!("Plugin shutting down");
    Ok(())
}

/// Write the handshake line. Nothing else may be written to stdout first.
async fn announce(address: &str) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(format!("{address}\n").as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}
