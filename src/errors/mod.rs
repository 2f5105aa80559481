//! Error taxonomy for the agent.
//!
//! Everything a client can observe maps onto one tagged enum, [`AgentError`];
//! the HTTP status mapping is a single match in [`AgentError::http_status`].
//! Upstream failures carry a structured [`UpstreamError`] so the refresh path
//! can decide between dropping and retaining cached credentials.

use std::error::Error as StdError;

use http::StatusCode;
use thiserror::Error;

/// Kind of failure reported by the identity-exchange service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    /// The pod-identity association no longer exists.
    ResourceNotFound,
    /// The service-account token has expired.
    ExpiredToken,
    /// The service-account token was rejected as invalid.
    InvalidToken,
    /// The exchange service denied access for this token.
    AccessDenied,
    /// The exchange service throttled the call.
    Throttled,
    /// The exchange service failed internally.
    ServerInternal,
    /// The call never produced a service response (connect/read failure).
    Transport,
    /// The call timed out before a response arrived.
    Timeout,
    /// Anything we could not map onto a known service error code.
    Unknown,
}

impl UpstreamErrorKind {
    /// Terminal kinds invalidate the cached credentials for the key: the
    /// association is gone or the token itself is no longer acceptable.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UpstreamErrorKind::ResourceNotFound
                | UpstreamErrorKind::ExpiredToken
                | UpstreamErrorKind::InvalidToken
                | UpstreamErrorKind::AccessDenied
        )
    }

    /// Transport-class failures are worth retrying inside the provider.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            UpstreamErrorKind::Transport
                | UpstreamErrorKind::Timeout
                | UpstreamErrorKind::ServerInternal
        )
    }
}

/// Structured error returned by the upstream credential provider.
#[derive(Debug, Clone, Error)]
#[error("({code}): {message}")]
pub struct UpstreamError {
    pub kind: UpstreamErrorKind,
    /// Service error code, e.g. `AccessDeniedException`. `Unknown` when the
    /// failure never reached the service.
    pub code: String,
    pub message: String,
    /// HTTP status of the upstream response, when one was received.
    pub http_status: Option<u16>,
    /// Request id reported by the upstream service, when present.
    pub request_id: Option<String>,
}

impl UpstreamError {
    pub fn new(kind: UpstreamErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            http_status: None,
            request_id: None,
        }
    }

    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::Transport, "Unknown", message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(UpstreamErrorKind::Timeout, "Unknown", message)
    }
}

/// Error surfaced by the agent on the credential path.
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    /// The request itself is malformed: empty or unparseable token, failed
    /// claim validation, missing pod UID.
    #[error("{0}")]
    Validation(String),

    /// The request arrived on an address the agent does not serve.
    #[error("Access Denied. {0}")]
    AccessDenied(String),

    /// The listener-level rate limiter rejected the request.
    #[error("Too Many Requests. {0}")]
    RateLimited(String),

    /// The upstream exchange failed; carries the structured service error.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// Internal failure that is not the client's fault.
    #[error("{0}")]
    Internal(String),
}

impl AgentError {
    /// HTTP status for this error. Upstream errors use the status reported
    /// by the exchange service when one is available.
    pub fn http_status(&self) -> StatusCode {
        match self {
            AgentError::Validation(_) => StatusCode::BAD_REQUEST,
            AgentError::AccessDenied(_) => StatusCode::FORBIDDEN,
            AgentError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            AgentError::Upstream(err) => err
                .http_status
                .and_then(|code| StatusCode::from_u16(code).ok())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            AgentError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message body sent to the client. Upstream messages include the
    /// upstream request id when the service reported one.
    pub fn client_message(&self) -> String {
        match self {
            AgentError::Upstream(err) => match &err.request_id {
                Some(request_id) => format!("[{request_id}]: {err}"),
                None => err.to_string(),
            },
            other => other.to_string(),
        }
    }
}

/// Walk an error's source chain looking for the innermost [`UpstreamError`].
///
/// Providers and the cache may wrap upstream failures; classification always
/// applies to the innermost service error, the way the Go SDK unwraps to the
/// API error before matching exception types.
pub fn find_upstream_error<'a>(
    err: &'a (dyn StdError + 'static),
) -> Option<&'a UpstreamError> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    let mut found = None;
    while let Some(e) = current {
        if let Some(upstream) = e.downcast_ref::<UpstreamError>() {
            found = Some(upstream);
        }
        current = e.source();
    }
    found
}

/// Classify an agent error for the refresh path: returns the upstream error
/// code and whether the failure is terminal for the cached entry.
pub fn classify_for_refresh(err: &AgentError) -> (&str, bool) {
    if let AgentError::Upstream(upstream) = err {
        return (upstream.code.as_str(), upstream.kind.is_terminal());
    }
    match find_upstream_error(err) {
        Some(upstream) => (upstream.code.as_str(), upstream.kind.is_terminal()),
        None => ("Unknown", false),
    }
}
