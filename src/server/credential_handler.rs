//! The credential endpoint.
//!
//! `GET /v1/credentials` with the raw service-account token in the
//! `Authorization` header. Requests pass the listener rate limiter and the
//! request validator before reaching the cache; every response increments
//! the status-code counter.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HOST};
use http::{HeaderMap, StatusCode};
use tracing::{error, info};

use crate::cache::RefreshingCache;
use crate::credentials::{CredentialRequest, Credentials};
use crate::errors::AgentError;
use crate::observability::metrics::get_metrics;
use crate::refresh::rate_limit::TokenBucket;
use crate::server::server::DEFAULT_REQUEST_TIMEOUT;
use crate::validation::RequestValidator;

#[derive(Clone)]
pub struct CredentialHandlerState {
    pub cluster_name: String,
    pub validator: RequestValidator,
    pub cache: Arc<RefreshingCache>,
    pub request_limiter: Arc<TokenBucket>,
}

/// Router for one credential listener. Unmatched paths fall through to the
/// default 404, which is what the probe handler expects to see on `/`.
pub fn credential_router(state: CredentialHandlerState) -> Router {
    Router::new()
        .route("/v1/credentials", get(handle_credentials))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .with_state(state)
}

async fn rate_limit_middleware(
    State(state): State<CredentialHandlerState>,
    request: Request,
    next: Next,
) -> Response {
    if state.request_limiter.try_acquire() {
        return next.run(request).await;
    }
    let err = AgentError::RateLimited("request rate exceeded".into());
    let status = err.http_status();
    count_status(status).await;
    (status, err.client_message()).into_response()
}

async fn handle_credentials(
    State(state): State<CredentialHandlerState>,
    request: Request,
) -> Response {
    info!(cluster_name = %state.cluster_name, "handling new credential request");

    let headers = request.headers();
    let credential_request = CredentialRequest {
        service_account_token: header_value(headers, AUTHORIZATION),
        cluster_name: state.cluster_name.clone(),
        request_target_host: header_value(headers, HOST),
    };

    match get_credentials(&state, &credential_request).await {
        Ok(credentials) => match serde_json::to_vec(&credentials) {
            Ok(body) => {
                count_status(StatusCode::OK).await;
                (
                    StatusCode::OK,
                    [(CONTENT_TYPE, "application/json")],
                    body,
                )
                    .into_response()
            }
            Err(err) => {
                error!("failed to serialize credentials: {err}");
                count_status(StatusCode::INTERNAL_SERVER_ERROR).await;
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Unable to serialize credentials",
                )
                    .into_response()
            }
        },
        Err(err) => {
            error!("error fetching credentials: {err}");
            let status = err.http_status();
            count_status(status).await;
            (status, err.client_message()).into_response()
        }
    }
}

async fn get_credentials(
    state: &CredentialHandlerState,
    request: &CredentialRequest,
) -> Result<Credentials, AgentError> {
    state.validator.validate(request)?;
    // Request-path fetches run under the listener's request deadline.
    let (credentials, _metadata) =
        tokio::time::timeout(DEFAULT_REQUEST_TIMEOUT, state.cache.get(request))
            .await
            .map_err(|_| AgentError::Internal("timed out fetching credentials".into()))??;
    Ok(credentials)
}

fn header_value(headers: &HeaderMap, name: http::header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

async fn count_status(status: StatusCode) {
    get_metrics()
        .await
        .http_response
        .with_label_values(&[status.as_str()])
        .inc();
}
