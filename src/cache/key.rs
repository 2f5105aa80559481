//! Cache-key derivation from service-account tokens.
//!
//! Entries are keyed by the pod UID embedded in the token's claims, not by
//! the token string: a rotated token for the same pod hits the same entry.
//! A token without the UID claim is rejected; there is no fallback to the
//! raw token.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::Deserialize;

use crate::errors::AgentError;

/// Stable identity of the workload a token belongs to (the pod UID).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodIdentity(String);

impl PodIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PodIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Deserialize)]
struct ServiceAccountClaims {
    #[serde(rename = "kubernetes.io")]
    kubernetes: Option<KubernetesClaims>,
}

#[derive(Deserialize)]
struct KubernetesClaims {
    pod: Option<PodClaims>,
}

#[derive(Deserialize)]
struct PodClaims {
    uid: Option<String>,
}

/// Derive the cache key from a service-account token by reading the
/// `kubernetes.io` → `pod` → `uid` claim of the (unverified) payload.
pub fn pod_uid_from_token(token: &str) -> Result<PodIdentity, AgentError> {
    parse_pod_uid(token).map_err(|reason| {
        AgentError::Validation(format!(
            "failed to get pod uid from service account token: {reason}"
        ))
    })
}

fn parse_pod_uid(token: &str) -> Result<PodIdentity, String> {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => return Err("token must have 3 dot-separated segments".into()),
    };

    let payload_bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| format!("payload is not base64url: {e}"))?;

    let claims: ServiceAccountClaims = serde_json::from_slice(&payload_bytes)
        .map_err(|e| format!("payload is not valid claim JSON: {e}"))?;

    claims
        .kubernetes
        .and_then(|k| k.pod)
        .and_then(|p| p.uid)
        .filter(|uid| !uid.is_empty())
        .map(PodIdentity)
        .ok_or_else(|| "kubernetes.io/pod/uid claim is absent".into())
}
