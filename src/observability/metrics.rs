use prometheus::{
    Gauge, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

// Declare the static OnceCell to hold the Metrics.
static METRICS_INSTANCE: OnceCell<Arc<Metrics>> = OnceCell::const_new();

/// Asynchronously initializes and gets a reference to the static `Metrics`.
pub async fn get_metrics() -> &'static Arc<Metrics> {
    METRICS_INSTANCE
        .get_or_init(|| async {
            info!("Initializing Metrics ...");
            Metrics::new()
        })
        .await
}

#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Credential endpoint metrics
    pub http_response: IntCounterVec,

    // Cache metrics
    pub cache_state: IntCounterVec,
    pub cache_errors: IntCounterVec,
    pub cached_credentials: IntGauge,

    // Exchange metrics
    pub fetch_duration: HistogramVec,

    // Runtime
    pub up: IntGauge,

    // === Service resource metrics ===
    pub process_cpu_usage: Gauge,
    pub process_memory_usage: IntGauge,
    pub process_open_fds: IntGauge,
    pub process_start_time: IntGauge,
    pub process_uptime: IntGauge,
}

impl Metrics {
    fn new() -> Arc<Self> {
        let registry = Registry::new_custom(Some("pod_identity".into()), None).unwrap();

        let metrics: Arc<Metrics> = Arc::new(Self {
            http_response: IntCounterVec::new(Opts::new("http_response", "Credential endpoint response codes"), &["code"]).unwrap(),

            cache_state: IntCounterVec::new(Opts::new("cache_state", "The state of credential in cache"), &["state"]).unwrap(),
            cache_errors: IntCounterVec::new(Opts::new("cache_errors", "Removing credentials from cache, got non recoverable error"), &["type"]).unwrap(),
            cached_credentials: IntGauge::new("cached_credentials", "Credential entries currently cached").unwrap(),

            fetch_duration: HistogramVec::new(HistogramOpts::new("fetch_duration_seconds", "Exchange call duration seconds").buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]), &["path"]).unwrap(),

            up: IntGauge::new("up", "1 if service is healthy").unwrap(),
            process_cpu_usage: Gauge::new("process_cpu_usage_percent", "CPU usage % of this process").unwrap(),
            process_memory_usage: IntGauge::new("process_memory_usage_bytes", "Resident memory used by this process").unwrap(),
            process_open_fds: IntGauge::new("process_open_fds", "Number of open file descriptors").unwrap(),
            process_start_time: IntGauge::new("process_start_time_seconds", "Process start time (UNIX seconds)").unwrap(),
            process_uptime: IntGauge::new("process_uptime_seconds", "Process uptime seconds").unwrap(),

            registry,
        });

        // Register all metrics in the registry
        let reg = &metrics.registry;
        reg.register(Box::new(metrics.http_response.clone())).unwrap();
        reg.register(Box::new(metrics.cache_state.clone())).unwrap();
        reg.register(Box::new(metrics.cache_errors.clone())).unwrap();
        reg.register(Box::new(metrics.cached_credentials.clone())).unwrap();
        reg.register(Box::new(metrics.fetch_duration.clone())).unwrap();
        reg.register(Box::new(metrics.up.clone())).unwrap();

        reg.register(Box::new(metrics.process_cpu_usage.clone())).unwrap();
        reg.register(Box::new(metrics.process_memory_usage.clone())).unwrap();
        reg.register(Box::new(metrics.process_open_fds.clone())).unwrap();
        reg.register(Box::new(metrics.process_start_time.clone())).unwrap();
        reg.register(Box::new(metrics.process_uptime.clone())).unwrap();

        metrics
    }
}
