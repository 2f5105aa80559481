//! Health and readiness probes.
//!
//! The probe handler checks that every credential listener is up by
//! fetching `/` on each and expecting the router's 404; any other answer
//! means the listener is wedged or something else grabbed the port.

use anyhow::{bail, Context, Result};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use http::StatusCode;
use tokio::time::timeout;
use tracing::{error, trace, warn};

const DEFAULT_PROBE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Clone)]
pub struct ProbeState {
    addrs: Vec<String>,
    client: reqwest::Client,
    probe_timeout: std::time::Duration,
}

impl ProbeState {
    pub fn new(hosts_to_probe: &[String], port: u16) -> Self {
        Self {
            addrs: hosts_to_probe
                .iter()
                .map(|host| format!("{host}:{port}"))
                .collect(),
            client: reqwest::Client::new(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

pub fn probe_router(state: ProbeState) -> Router {
    Router::new()
        .route("/readyz", get(handle_probe))
        .route("/healthz", get(handle_probe))
        .with_state(state)
}

async fn handle_probe(State(state): State<ProbeState>) -> Response {
    match timeout(state.probe_timeout, probe_addrs(&state)).await {
        Ok(Ok(())) => StatusCode::OK.into_response(),
        Ok(Err(err)) => {
            error!("InternalServerError: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error occurred",
            )
                .into_response()
        }
        Err(_) => StatusCode::REQUEST_TIMEOUT.into_response(),
    }
}

async fn probe_addrs(state: &ProbeState) -> Result<()> {
    trace!("starting probe");
    for addr in &state.addrs {
        let url = format!("http://{addr}/");
        let response = state
            .client
            .get(&url)
            .send()
            .await
            .inspect_err(|err| warn!("failed probe: {err}"))
            .with_context(|| format!("probing {addr}"))?;

        // we expect a 404
        if response.status() != StatusCode::NOT_FOUND {
            warn!(%addr, status = %response.status(), "failed probe");
            bail!(
                "unexpected status code received, expected {}, got {}",
                StatusCode::NOT_FOUND,
                response.status()
            );
        }
    }
    Ok(())
}
