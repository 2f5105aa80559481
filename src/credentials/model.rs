//! Credential models shared by the handler, the cache, and the provider.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::UpstreamError;

/// A request for credentials as received on the credential endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRequest {
    /// Raw service-account token from the `Authorization` header.
    pub service_account_token: String,
    /// Cluster the agent serves; attached to every upstream call.
    pub cluster_name: String,
    /// Destination host the request was sent to, as seen in the `Host` header.
    pub request_target_host: String,
}

/// Temporary credentials as returned to workloads.
///
/// Field names on the wire follow the credential-provider contract the cloud
/// SDKs expect when they poll a container credential endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(rename = "AccessKeyId")]
    pub access_key_id: String,
    #[serde(rename = "SecretAccessKey")]
    pub secret_access_key: String,
    #[serde(rename = "Token")]
    pub token: String,
    #[serde(rename = "AccountId")]
    pub account_id: String,
    #[serde(rename = "Expiration")]
    pub expiration: ExpirationTime,
}

/// Expiration timestamp rendered the way SDK credential parsers expect:
/// RFC 3339 with nanosecond precision, UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpirationTime(pub DateTime<Utc>);

impl Serialize for ExpirationTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_rfc3339_opts(SecondsFormat::Nanos, true))
    }
}

impl<'de> Deserialize<'de> for ExpirationTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let parsed = DateTime::parse_from_rfc3339(&raw).map_err(serde::de::Error::custom)?;
        Ok(ExpirationTime(parsed.with_timezone(&Utc)))
    }
}

impl From<DateTime<Utc>> for ExpirationTime {
    fn from(value: DateTime<Utc>) -> Self {
        ExpirationTime(value)
    }
}

/// Metadata about a successful exchange, used for log correlation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMetadata {
    /// Identity-association id reported by the exchange service.
    pub association_id: String,
}

/// A provider of temporary credentials.
///
/// Implementations can be chained; the refreshing cache wraps the concrete
/// exchange client and both sides of the pair satisfy this trait.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Exchange the request's service-account token for credentials. The
    /// call must respect the caller's deadline (callers wrap it in a
    /// `tokio::time::timeout` where one applies).
    async fn fetch(
        &self,
        request: &CredentialRequest,
    ) -> Result<(Credentials, ResponseMetadata), UpstreamError>;
}
