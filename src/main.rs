use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinHandle;
use tracing::info;

use pod_identity_agent::cache::{RefreshingCache, RefreshingCacheOpts};
use pod_identity_agent::config::settings::{AgentConfig, REQUEST_RATE};
use pod_identity_agent::config::loader;
use pod_identity_agent::exchange::ExchangeClient;
use pod_identity_agent::observability::metrics::get_metrics;
use pod_identity_agent::observability::routes::metrics_router;
use pod_identity_agent::observability::service_resources_metrics::collect_process_metrics;
use pod_identity_agent::refresh::rate_limit::TokenBucket;
use pod_identity_agent::refresh::{Sweeper, SweeperOpts};
use pod_identity_agent::server::credential_handler::{credential_router, CredentialHandlerState};
use pod_identity_agent::server::probe_handler::{probe_router, ProbeState};
use pod_identity_agent::server::server::listen_until_shutdown;
use pod_identity_agent::utils::channel;
use pod_identity_agent::utils::logging::{self, LogLevel};
use pod_identity_agent::validation::RequestValidator;

/// A proxy server that exchanges Kubernetes service account tokens for
/// temporary cloud credentials by calling the identity-exchange service.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Name of the cluster the agent runs on
    #[arg(short = 'c', long, env = "CLUSTER_NAME")]
    cluster_name: Option<String>,
    /// Optional YAML config file; CLI flags override its values
    #[arg(long, env = "CONFIG")]
    config: Option<String>,
    /// Listening port of the credential server
    #[arg(short = 'p', long)]
    port: Option<u16>,
    /// Health and readiness listening port
    #[arg(long)]
    probe_port: Option<u16>,
    /// Metrics listening address
    #[arg(long)]
    metrics_address: Option<String>,
    /// Metrics listening port
    #[arg(long)]
    metrics_port: Option<u16>,
    /// Maximum time in seconds the agent waits before renewing credentials
    #[arg(long)]
    max_credential_renewal_seconds: Option<u64>,
    /// Maximum amount of unique credentials to cache
    #[arg(long)]
    max_cache_size: Option<usize>,
    /// Maximum amount of queries per second to the identity exchange
    #[arg(long)]
    max_service_qps: Option<u32>,
    /// Sweeper wakeup interval in seconds
    #[arg(long)]
    cleanup_interval_seconds: Option<u64>,
    /// Hosts to bind the credential server to
    #[arg(short = 'b', long = "bind-hosts")]
    bind_hosts: Vec<String>,
    /// Override for the identity-exchange endpoint
    #[arg(long)]
    endpoint: Option<String>,
    #[arg(long, env = "LOG_LEVEL", value_enum)]
    log_level: Option<LogLevel>,
}

impl Args {
    fn into_config(self) -> Result<(AgentConfig, Option<LogLevel>)> {
        let mut config = match &self.config {
            Some(path) => loader::load_config(path)?,
            None => AgentConfig::with_cluster_name(
                self.cluster_name
                    .clone()
                    .context("--cluster-name is required when no config file is given")?,
            ),
        };

        if let Some(cluster_name) = self.cluster_name {
            config.cluster_name = cluster_name;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(probe_port) = self.probe_port {
            config.probe_port = probe_port;
        }
        if let Some(metrics_address) = self.metrics_address {
            config.metrics_address = metrics_address;
        }
        if let Some(metrics_port) = self.metrics_port {
            config.metrics_port = metrics_port;
        }
        if let Some(renewal) = self.max_credential_renewal_seconds {
            config.credential_renewal_seconds = renewal;
        }
        if let Some(max_cache_size) = self.max_cache_size {
            config.max_cache_size = max_cache_size;
        }
        if let Some(qps) = self.max_service_qps {
            config.refresh_qps = qps;
        }
        if let Some(interval) = self.cleanup_interval_seconds {
            config.cleanup_interval_seconds = interval;
        }
        if !self.bind_hosts.is_empty() {
            config.bind_hosts = self.bind_hosts;
        }
        if let Some(endpoint) = self.endpoint {
            config.endpoint_override = Some(endpoint);
        }

        config.validate()?;
        Ok((config, self.log_level))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // -------------------------------
    // 1. Assemble and validate configuration
    // -------------------------------

    let args = Args::parse();
    let (config, log_level) = args.into_config()?;

    logging::run(&config, log_level)?;

    // -------------------------------
    // 2. Shutdown signal shared by every task
    // -------------------------------

    let (shutdown_tx, shutdown_rx) = channel::shutdown_channel();

    // -------------------------------
    // 3. Provider, cache, and sweeper
    // -------------------------------

    let provider = Arc::new(ExchangeClient::new(config.endpoint_override.clone())?);
    let cache = RefreshingCache::new(RefreshingCacheOpts {
        provider,
        credentials_renewal_ttl: config.credentials_renewal_ttl(),
        max_cache_size: config.max_cache_size,
        min_credential_ttl: None,
        clock: None,
    });
    let sweeper = Sweeper::new(
        cache.clone(),
        SweeperOpts {
            cleanup_interval: config.cleanup_interval(),
            refresh_qps: config.refresh_qps,
            credentials_renewal_ttl: config.credentials_renewal_ttl(),
            max_cache_size: config.max_cache_size,
            retry_interval: None,
            max_retry_jitter: None,
            renewal_timeout: None,
        },
    );
    let sweeper_handle = sweeper.spawn(shutdown_rx.clone());

    // -------------------------------
    // 4. Credential listeners, one per bind host
    // -------------------------------

    let validator = RequestValidator::new(&config.bind_hosts);
    let mut servers: Vec<JoinHandle<Result<()>>> = Vec::new();

    for host in &config.bind_hosts {
        let addr = format!("{host}:{}", config.port);
        let state = CredentialHandlerState {
            cluster_name: config.cluster_name.clone(),
            validator: validator.clone(),
            cache: cache.clone(),
            request_limiter: Arc::new(TokenBucket::new(REQUEST_RATE, REQUEST_RATE / 2.0)),
        };
        servers.push(tokio::spawn(listen_until_shutdown(
            addr,
            credential_router(state),
            shutdown_rx.clone(),
        )));
    }

    // -------------------------------
    // 5. Probe and metrics listeners
    // -------------------------------

    let probe_state = ProbeState::new(&config.bind_hosts, config.port);
    servers.push(tokio::spawn(listen_until_shutdown(
        format!("localhost:{}", config.probe_port),
        probe_router(probe_state.clone()),
        shutdown_rx.clone(),
    )));
    servers.push(tokio::spawn(listen_until_shutdown(
        format!("{}:{}", config.metrics_address, config.metrics_port),
        metrics_router().merge(probe_router(probe_state)),
        shutdown_rx.clone(),
    )));

    // -------------------------------
    // 6. Process resource metrics
    // -------------------------------

    let resources_handle = tokio::spawn(collect_process_metrics(shutdown_rx));
    get_metrics().await.up.set(1);
    info!(cluster_name = %config.cluster_name, "agent started");

    // -------------------------------
    // 7. Run until SIGTERM/SIGINT, then drain
    // -------------------------------

    shutdown_signal().await;
    info!("shutdown signal received, stopping servers");
    let _ = shutdown_tx.send(true);

    let drained = futures::future::try_join_all(servers)
        .await
        .context("server task panicked")?;
    for result in drained {
        result?;
    }
    sweeper_handle.await.context("sweeper task panicked")?;
    resources_handle.await.context("metrics task panicked")??;

    get_metrics().await.up.set(0);
    info!("agent stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("unable to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
