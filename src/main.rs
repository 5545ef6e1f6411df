mod auth;
mod bridge;
mod config;
mod error;
mod protocol;
mod sandbox;
mod server;
mod session;
mod tls;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::sandbox::IsolationPolicy;
use crate::server::{ConnectionCounter, ServerContext};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sandboxd=info".parse()?),
        )
        .init();

    let config = ServerConfig::from_env()?;

    if let Err(e) = sandbox::raise_open_file_limit(config.max_open_files) {
        warn!("Failed to raise open file limit: {}", e);
    }

    let policy = IsolationPolicy::load(&config.policy_file).with_context(|| {
        format!(
            "Failed to load isolation policy from {}",
            config.policy_file.display()
        )
    })?;
    info!(
        "Loaded isolation policy from {} (launcher: {})",
        config.policy_file.display(),
        policy.launcher.name()
    );

    let acceptor = tls::load_acceptor(&config.cert_file, &config.key_file)
        .context("Failed to set up TLS")?;

    let listener = TcpListener::bind((config.host, config.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.host, config.port))?;
    info!("Listening on {}", listener.local_addr()?);

    let ctx = Arc::new(ServerContext {
        config,
        acceptor,
        policy,
        connections: ConnectionCounter::new(),
    });

    tokio::select! {
        _ = server::serve(listener, ctx) => {}
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            info!("Shutting down");
        }
    }

    Ok(())
}
