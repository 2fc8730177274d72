//! `wpt serve`: the workflow endpoint server.
//!
//! Runs the axum server, the local scheduler dispatcher (when the local
//! backend is selected) and a periodic purge of settled runs. All three stop
//! on Ctrl+C or SIGTERM.

use std::time::Duration;

use anyhow::Result;
use console::style;
use tokio_util::sync::CancellationToken;

use crate::http::router::build_router;
use crate::state::AppState;

const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub async fn serve(state: AppState, addr: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let shutdown = CancellationToken::new();

    if let Some(local) = state.local_scheduler() {
        let local = local.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { local.run(token).await });
    }
    tokio::spawn(purge_loop(state.clone(), shutdown.clone()));

    println!(
        "  {} Waypoint listening on {}",
        style("⚡").bold(),
        style(format!("http://{addr}")).cyan()
    );
    for name in state.engine.registry().names() {
        println!("    {} {}", style("POST").dim(), state.workflow_url(&name));
    }
    println!("  {}", style("Press Ctrl+C to stop").dim());

    let router = build_router(state);
    let server_token = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            server_token.cancel();
        })
        .await?;

    shutdown.cancel();
    println!("\n  Server stopped.");
    Ok(())
}

/// Purge settled runs past retention every hour until shutdown.
async fn purge_loop(state: AppState, shutdown: CancellationToken) {
    let retention_days = state.config().retention_days;
    let mut interval = tokio::time::interval(PURGE_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = state.engine.purge(retention_days).await {
                    tracing::warn!(error = %e, "periodic purge failed");
                }
            }
        }
    }
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
