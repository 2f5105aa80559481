//! Agent configuration.
//!
//! Values come from CLI flags, environment, or an optional YAML file; every
//! knob has a default except the cluster name. Validation happens once at
//! startup, before anything is constructed from the config.

use anyhow::{bail, Result};
use serde::Deserialize;

/// Link-local addresses workloads are expected to call the agent on.
pub const DEFAULT_IPV4_TARGET_HOST: &str = "169.254.170.23";
pub const DEFAULT_IPV6_TARGET_HOST: &str = "fd00:ec2::23";

/// Requests allowed per second on each credential listener; burst is half.
pub const REQUEST_RATE: f64 = 1000.0;

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Cluster the agent serves; attached to every exchange call.
    pub cluster_name: String,

    /// Hosts the credential listeners bind to.
    #[serde(default = "default_bind_hosts")]
    pub bind_hosts: Vec<String>,

    /// Credential listener port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Health/readiness listener port (bound on localhost).
    #[serde(default = "default_probe_port")]
    pub probe_port: u16,

    /// Metrics listener bind address.
    #[serde(default = "default_metrics_address")]
    pub metrics_address: String,

    /// Metrics listener port.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Maximum time the agent holds credentials before renewing them.
    #[serde(default = "default_credential_renewal_seconds")]
    pub credential_renewal_seconds: u64,

    /// Maximum number of unique credentials to cache.
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: usize,

    /// Maximum queries per second against the exchange service.
    #[serde(default = "default_refresh_qps")]
    pub refresh_qps: u32,

    /// How often the sweeper wakes to refresh and purge entries.
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,

    /// Override for the identity-exchange endpoint.
    #[serde(default)]
    pub endpoint_override: Option<String>,

    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl AgentConfig {
    /// A config with every default applied, for the flags-only startup path.
    pub fn with_cluster_name(cluster_name: String) -> Self {
        Self {
            cluster_name,
            bind_hosts: default_bind_hosts(),
            port: default_port(),
            probe_port: default_probe_port(),
            metrics_address: default_metrics_address(),
            metrics_port: default_metrics_port(),
            credential_renewal_seconds: default_credential_renewal_seconds(),
            max_cache_size: default_max_cache_size(),
            refresh_qps: default_refresh_qps(),
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
            endpoint_override: None,
            logging: None,
        }
    }

    pub fn credentials_renewal_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.credential_renewal_seconds as i64)
    }

    pub fn cleanup_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cleanup_interval_seconds)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.is_empty() {
            bail!("cluster name must be provided");
        }
        if self.bind_hosts.is_empty() {
            bail!("at least one bind host is required");
        }
        if self.max_cache_size == 0 {
            bail!("max cache size must be greater than zero");
        }
        if self.refresh_qps == 0 {
            bail!("refresh QPS must be greater than zero");
        }
        // The sweeper must be able to renew a fully populated cache within
        // one renewal window.
        let renewable = self.refresh_qps as u64 * self.credential_renewal_seconds;
        if renewable < (self.max_cache_size / 2) as u64 {
            bail!(
                "refresh QPS ({}) x credential renewal ({}s) cannot keep up with cache size ({})",
                self.refresh_qps,
                self.credential_renewal_seconds,
                self.max_cache_size
            );
        }
        Ok(())
    }
}

fn default_bind_hosts() -> Vec<String> {
    vec![
        DEFAULT_IPV4_TARGET_HOST.to_string(),
        format!("[{DEFAULT_IPV6_TARGET_HOST}]"),
    ]
}

fn default_port() -> u16 {
    80
}

fn default_probe_port() -> u16 {
    2703
}

fn default_metrics_address() -> String {
    "0.0.0.0".to_string()
}

fn default_metrics_port() -> u16 {
    2705
}

fn default_credential_renewal_seconds() -> u64 {
    3 * 60 * 60
}

fn default_max_cache_size() -> usize {
    2000
}

fn default_refresh_qps() -> u32 {
    3
}

fn default_cleanup_interval_seconds() -> u64 {
    60
}

/// ================================
/// Logging
/// ================================
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    pub level: String, // allowed: trace, debug, info, warn, error
    pub format: LogFormat,
}

impl LoggingConfig {
    pub fn new(level: String, format: LogFormat) -> Self {
        Self { level, format }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Compact,
}

impl LogFormat {
    pub fn from_env() -> Self {
        match std::env::var("LOG_FORMAT")
            .unwrap_or_else(|_| "json".to_string())
            .to_lowercase()
            .as_str()
        {
            "compact" | "text" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}
