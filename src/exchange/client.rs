//! HTTP client for the identity-exchange service.
//!
//! The concrete [`CredentialProvider`]: posts the service-account token and
//! cluster name, gets back a credential document. Service error codes map
//! onto [`UpstreamErrorKind`] so the cache's refresh path can classify
//! failures. Transport failures are retried here, below the cache.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::credentials::{
    CredentialProvider, CredentialRequest, Credentials, ExpirationTime, ResponseMetadata,
};
use crate::errors::{UpstreamError, UpstreamErrorKind};
use crate::observability::metrics::get_metrics;
use crate::resilience::retry::RetrySettings;

/// Cluster-local default; production deployments override this.
pub const DEFAULT_EXCHANGE_ENDPOINT: &str = "https://pod-identity.cluster.local";

const CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(500);
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

pub struct ExchangeClient {
    client: Client,
    endpoint: String,
    retry: RetrySettings,
}

#[derive(Serialize)]
struct ExchangeRequestBody<'a> {
    #[serde(rename = "clusterName")]
    cluster_name: &'a str,
    #[serde(rename = "token")]
    token: &'a str,
}

#[derive(Deserialize)]
struct ExchangeResponseBody {
    #[serde(rename = "accessKeyId")]
    access_key_id: Option<String>,
    #[serde(rename = "secretAccessKey")]
    secret_access_key: Option<String>,
    #[serde(rename = "sessionToken")]
    session_token: Option<String>,
    #[serde(rename = "accountId")]
    account_id: Option<String>,
    #[serde(rename = "expiration")]
    expiration: Option<ExpirationTime>,
    #[serde(rename = "associationId")]
    association_id: Option<String>,
}

#[derive(Deserialize, Default)]
struct ExchangeErrorBody {
    code: Option<String>,
    message: Option<String>,
}

impl ExchangeClient {
    pub fn new(endpoint_override: Option<String>) -> anyhow::Result<Self> {
        let endpoint = match endpoint_override {
            Some(endpoint) => {
                info!(%endpoint, "overriding default identity-exchange endpoint");
                endpoint
            }
            None => DEFAULT_EXCHANGE_ENDPOINT.to_string(),
        };
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            endpoint,
            retry: RetrySettings::default(),
        })
    }

    async fn call_once(
        &self,
        request: &CredentialRequest,
    ) -> Result<(Credentials, ResponseMetadata), UpstreamError> {
        let url = format!("{}/v1/exchange", self.endpoint.trim_end_matches('/'));
        let body = ExchangeRequestBody {
            cluster_name: &request.cluster_name,
            token: &request.service_account_token,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let request_id = response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if !status.is_success() {
            let error_body: ExchangeErrorBody = response.json().await.unwrap_or_default();
            return Err(service_error(status.as_u16(), error_body, request_id));
        }

        let body: ExchangeResponseBody = response.json().await.map_err(|e| {
            UpstreamError::new(
                UpstreamErrorKind::Unknown,
                "Unknown",
                format!("invalid response from server: {e}"),
            )
        })?;

        let credentials = Credentials {
            access_key_id: required_field(body.access_key_id, "accessKeyId")?,
            secret_access_key: required_field(body.secret_access_key, "secretAccessKey")?,
            token: required_field(body.session_token, "sessionToken")?,
            account_id: required_field(body.account_id, "accountId")?,
            expiration: body.expiration.ok_or_else(|| missing_field("expiration"))?,
        };
        let metadata = ResponseMetadata {
            association_id: required_field(body.association_id, "associationId")?,
        };
        Ok((credentials, metadata))
    }
}

#[async_trait]
impl CredentialProvider for ExchangeClient {
    async fn fetch(
        &self,
        request: &CredentialRequest,
    ) -> Result<(Credentials, ResponseMetadata), UpstreamError> {
        info!("calling identity exchange to fetch credentials");
        let start = Instant::now();

        let result = self.retry.run_with_retry(|| self.call_once(request)).await;

        let elapsed = start.elapsed();
        get_metrics()
            .await
            .fetch_duration
            .with_label_values(&["exchange"])
            .observe(elapsed.as_secs_f64());

        match &result {
            Ok((_, metadata)) => {
                info!(
                    request_time_ms = elapsed.as_millis() as u64,
                    association_id = %metadata.association_id,
                    "successfully fetched credentials from identity exchange"
                );
            }
            Err(err) => {
                warn!(
                    request_time_ms = elapsed.as_millis() as u64,
                    error = %err,
                    "identity exchange call failed"
                );
            }
        }
        result
    }
}

fn required_field(value: Option<String>, name: &str) -> Result<String, UpstreamError> {
    value.filter(|v| !v.is_empty()).ok_or_else(|| missing_field(name))
}

fn missing_field(name: &str) -> UpstreamError {
    UpstreamError::new(
        UpstreamErrorKind::Unknown,
        "Unknown",
        format!("invalid response from server: missing {name}"),
    )
}

fn map_transport_error(err: reqwest::Error) -> UpstreamError {
    if err.is_timeout() {
        UpstreamError::timeout(format!("unable to fetch credentials from identity exchange: {err}"))
    } else {
        UpstreamError::transport(format!(
            "unable to fetch credentials from identity exchange: {err}"
        ))
    }
}

fn service_error(
    status: u16,
    body: ExchangeErrorBody,
    request_id: Option<String>,
) -> UpstreamError {
    let code = body.code.unwrap_or_else(|| "Unknown".to_string());
    let message = body
        .message
        .unwrap_or_else(|| "identity exchange returned an error".to_string());
    let kind = classify_error_code(&code, status);

    let mut err = UpstreamError::new(kind, code, message).with_http_status(status);
    if let Some(request_id) = request_id {
        err = err.with_request_id(request_id);
    }
    err
}

fn classify_error_code(code: &str, status: u16) -> UpstreamErrorKind {
    match code {
        "ResourceNotFoundException" => UpstreamErrorKind::ResourceNotFound,
        "ExpiredTokenException" => UpstreamErrorKind::ExpiredToken,
        "InvalidTokenException" => UpstreamErrorKind::InvalidToken,
        "AccessDeniedException" => UpstreamErrorKind::AccessDenied,
        "ThrottlingException" => UpstreamErrorKind::Throttled,
        "InternalServerException" => UpstreamErrorKind::ServerInternal,
        _ => match status {
            429 => UpstreamErrorKind::Throttled,
            s if s >= 500 => UpstreamErrorKind::ServerInternal,
            _ => UpstreamErrorKind::Unknown,
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tests::common::spawn_axum;
    use axum::routing::post;
    use axum::{Json, Router};
    use chrono::{Duration, Utc};
    use http::StatusCode;
    use serde_json::json;

    fn sample_request() -> CredentialRequest {
        CredentialRequest {
            service_account_token: "header.payload.signature".into(),
            cluster_name: "test-cluster".into(),
            request_target_host: "169.254.170.23".into(),
        }
    }

    async fn client_for(router: Router) -> (ExchangeClient, tokio::task::JoinHandle<()>) {
        let (handle, addr) = spawn_axum(router).await;
        let client = ExchangeClient::new(Some(format!("http://{addr}"))).unwrap();
        (client, handle)
    }

    #[tokio::test]
    async fn parses_successful_exchange_response() {
        let expiration = Utc::now() + Duration::hours(1);
        let expiration_str = expiration.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true);
        let router = Router::new().route(
            "/v1/exchange",
            post(move || {
                let expiration_str = expiration_str.clone();
                async move {
                    Json(json!({
                        "accessKeyId": "AKID",
                        "secretAccessKey": "secret",
                        "sessionToken": "session",
                        "accountId": "123456789012",
                        "expiration": expiration_str,
                        "associationId": "assoc-42",
                    }))
                }
            }),
        );
        let (client, handle) = client_for(router).await;

        let (credentials, metadata) = client.fetch(&sample_request()).await.unwrap();
        assert_eq!(credentials.access_key_id, "AKID");
        assert_eq!(credentials.account_id, "123456789012");
        assert_eq!(metadata.association_id, "assoc-42");
        assert_eq!(credentials.expiration.0, expiration);

        handle.abort();
    }

    #[tokio::test]
    async fn maps_access_denied_to_terminal_error() {
        let router = Router::new().route(
            "/v1/exchange",
            post(|| async {
                (
                    StatusCode::FORBIDDEN,
                    [("x-request-id", "req-9")],
                    Json(json!({
                        "code": "AccessDeniedException",
                        "message": "not authorized",
                    })),
                )
            }),
        );
        let (client, handle) = client_for(router).await;

        let err = client.fetch(&sample_request()).await.unwrap_err();
        assert_eq!(err.kind, UpstreamErrorKind::AccessDenied);
        assert!(err.kind.is_terminal());
        assert_eq!(err.http_status, Some(403));
        assert_eq!(err.request_id.as_deref(), Some("req-9"));

        handle.abort();
    }

    #[tokio::test]
    async fn maps_server_error_to_recoverable() {
        let router = Router::new().route(
            "/v1/exchange",
            post(|| async {
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({
                        "code": "InternalServerException",
                        "message": "boom",
                    })),
                )
            }),
        );
        let (client, handle) = client_for(router).await;

        let err = client.fetch(&sample_request()).await.unwrap_err();
        assert_eq!(err.kind, UpstreamErrorKind::ServerInternal);
        assert!(!err.kind.is_terminal());

        handle.abort();
    }

    #[tokio::test]
    async fn rejects_response_with_missing_fields() {
        let router = Router::new().route(
            "/v1/exchange",
            post(|| async {
                Json(json!({
                    "accessKeyId": "AKID",
                }))
            }),
        );
        let (client, handle) = client_for(router).await;

        let err = client.fetch(&sample_request()).await.unwrap_err();
        assert!(err.message.contains("invalid response from server"));

        handle.abort();
    }
}
