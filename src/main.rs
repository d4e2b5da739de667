use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bootstrap_signaling::clock::Clock;
use bootstrap_signaling::config::{Cli, Config};
use bootstrap_signaling::{router, AppState};

/// How long draining sessions get after the shutdown signal before the
/// server task is force-closed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = Config::try_from(cli).context("invalid configuration")?;

    let clock = Clock::system();
    let state = Arc::new(AppState::new(config.clone(), clock.clone()));
    let pruner = state.rendezvous.spawn_pruner(clock);

    let app = router(state.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(
        port = config.port,
        auth_enabled = config.token_digest.is_some(),
        messages_per_minute = config.messages_per_minute,
        connections_per_ip = config.connections_per_ip,
        "bootstrap-signaling.started"
    );

    // On ctrl-c the graceful-shutdown future stops the accept loop and flips
    // the shutdown watch, which every live session selects on.
    let shutdown = state.shutdown.clone();
    let mut draining = state.shutdown.subscribe();
    let service = app.into_make_service_with_connect_info::<SocketAddr>();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                let _ = shutdown.send(true);
            })
            .await
    });

    tokio::select! {
        result = &mut server => {
            result.context("server task failed")?.context("server error")?;
        }
        _ = draining.changed() => {
            info!(grace_secs = SHUTDOWN_GRACE.as_secs(), "draining signaling sessions");
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await {
                Ok(result) => {
                    result.context("server task failed")?.context("server error")?;
                }
                Err(_) => {
                    warn!("drain deadline passed, force-closing remaining sessions");
                    server.abort();
                }
            }
        }
    }

    pruner.abort();
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .json()
        .flatten_event(true)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}
