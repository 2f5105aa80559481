//! Request validation for the credential endpoint.
//!
//! Two checks, in order: the request must have arrived on one of the
//! agent's own addresses, and the bearer token must look like a valid
//! service-account token. Signature verification is deliberately absent;
//! the exchange service is the authority on token validity.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::config::settings::{DEFAULT_IPV4_TARGET_HOST, DEFAULT_IPV6_TARGET_HOST};
use crate::credentials::CredentialRequest;
use crate::errors::AgentError;

#[derive(Debug, Clone)]
pub struct RequestValidator {
    /// Addresses the agent expects calls on, normalized (no port, no
    /// brackets).
    expected_hosts: Vec<String>,
}

#[derive(Deserialize)]
struct RegisteredClaims {
    exp: Option<i64>,
    nbf: Option<i64>,
    #[allow(dead_code)]
    iat: Option<i64>,
}

impl Default for RequestValidator {
    fn default() -> Self {
        Self::new(&[
            DEFAULT_IPV4_TARGET_HOST.to_string(),
            DEFAULT_IPV6_TARGET_HOST.to_string(),
        ])
    }
}

impl RequestValidator {
    pub fn new(expected_hosts: &[String]) -> Self {
        let expected_hosts = expected_hosts
            .iter()
            .map(|h| strip_port_and_brackets(h).to_string())
            .collect();
        Self { expected_hosts }
    }

    /// Validate a credential request before it reaches the cache.
    pub fn validate(&self, request: &CredentialRequest) -> Result<(), AgentError> {
        debug!(
            target_host = %request.request_target_host,
            "validating call to requested target host"
        );
        self.validate_target_host(&request.request_target_host)?;
        self.validate_token(&request.service_account_token)?;
        trace!("request validation passed");
        Ok(())
    }

    fn validate_target_host(&self, raw_target_host: &str) -> Result<(), AgentError> {
        let target_host = strip_port_and_brackets(raw_target_host);
        if self.expected_hosts.iter().any(|h| h == target_host) {
            return Ok(());
        }
        Err(AgentError::AccessDenied(format!(
            "Called agent through invalid address, please use either {:?} address not {}",
            self.expected_hosts, raw_target_host
        )))
    }

    /// The token only has to be parseable with sane time claims; whether it
    /// is actually accepted is the exchange service's call.
    fn validate_token(&self, token: &str) -> Result<(), AgentError> {
        if token.is_empty() {
            return Err(AgentError::Validation(
                "Service account token cannot be empty".into(),
            ));
        }

        jsonwebtoken::decode_header(token).map_err(|e| {
            AgentError::Validation(format!("Service account token cannot be parsed: {e}"))
        })?;

        let claims = decode_claims(token).map_err(|reason| {
            AgentError::Validation(format!("Service account token cannot be parsed: {reason}"))
        })?;

        let now = Utc::now().timestamp();
        if let Some(exp) = claims.exp {
            if exp <= now {
                return Err(AgentError::Validation(
                    "Service account token failed basic claim validations: token is expired"
                        .into(),
                ));
            }
        }
        if let Some(nbf) = claims.nbf {
            if nbf > now {
                return Err(AgentError::Validation(
                    "Service account token failed basic claim validations: token is not valid yet"
                        .into(),
                ));
            }
        }
        Ok(())
    }
}

fn decode_claims(token: &str) -> Result<RegisteredClaims, String> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| "token is not a JWT".to_string())?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| format!("payload is not base64url: {e}"))?;
    serde_json::from_slice(&bytes).map_err(|e| format!("claims are not valid JSON: {e}"))
}

/// Drop a trailing `:port` and surrounding IPv6 brackets from a `Host`
/// header value. Bare IPv6 addresses (multiple colons, no brackets) pass
/// through untouched.
fn strip_port_and_brackets(raw: &str) -> &str {
    let host = match raw.strip_prefix('[') {
        Some(rest) => match rest.find(']') {
            Some(end) => return &rest[..end],
            None => raw,
        },
        None => raw,
    };
    match host.rfind(':') {
        Some(idx) if !host[..idx].contains(':') => &host[..idx],
        _ => host,
    }
}
