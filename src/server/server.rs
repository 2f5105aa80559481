//! HTTP listener lifecycle.
//!
//! Each listener binds one address and serves its router until shutdown is
//! signalled, then drains in-flight connections within a bounded
//! termination window.

use anyhow::{Context, Result};
use axum::Router;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub const DEFAULT_REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
/// Request timeout plus slack for connections to finish writing.
pub const MAX_TERMINATION_WAIT: std::time::Duration = std::time::Duration::from_secs(30 + 5);

/// Bind `addr` and serve `router` until the shutdown signal fires. Returns
/// once in-flight connections have drained or the termination window has
/// elapsed.
pub async fn listen_until_shutdown(
    addr: String,
    router: Router,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("unable to bind {addr}"))?;
    info!(%addr, "starting server");

    let mut drain_deadline = shutdown.clone();
    let mut drain_signal = shutdown;
    let graceful = async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = drain_signal.changed().await;
                debug!("server stopping, draining connections");
            })
            .await
    };

    tokio::select! {
        result = graceful => {
            result.with_context(|| format!("server on {addr} failed"))?;
        }
        _ = async {
            let _ = drain_deadline.changed().await;
            sleep(MAX_TERMINATION_WAIT).await;
        } => {
            warn!(%addr, "termination window elapsed before connections drained");
        }
    }

    info!(%addr, "server gracefully stopped");
    Ok(())
}
