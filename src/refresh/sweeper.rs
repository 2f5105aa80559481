//! Background refresh and expiry sweeper.
//!
//! One long-lived task wakes at the cleanup interval and performs two
//! passes over the cache: refresh entries past their refresh instant under
//! the global QPS budget, then purge entries past expiry. The sweeper owns
//! traversal; the cache only exposes state mutation primitives. Lifetime is
//! explicit: the task exits at its next wakeup after the shutdown signal.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::entry::CacheEntry;
use crate::cache::key::PodIdentity;
use crate::cache::RefreshingCache;
use crate::errors::classify_for_refresh;
use crate::observability::metrics::get_metrics;
use crate::refresh::rate_limit::TokenBucket;

pub const DEFAULT_CLEANUP_INTERVAL: StdDuration = StdDuration::from_secs(60);
pub const DEFAULT_RETRY_INTERVAL_SECONDS: i64 = 60;
pub const DEFAULT_MAX_RETRY_JITTER_SECONDS: i64 = 60;
/// Deadline for a single renewal attempt against the provider.
pub const RENEWAL_TIMEOUT: StdDuration = StdDuration::from_secs(60);

pub struct SweeperOpts {
    pub cleanup_interval: StdDuration,
    pub refresh_qps: u32,
    /// Used only for the construction-time capacity guard.
    pub credentials_renewal_ttl: Duration,
    pub max_cache_size: usize,
    /// Overrides for tests.
    pub retry_interval: Option<Duration>,
    pub max_retry_jitter: Option<Duration>,
    pub renewal_timeout: Option<StdDuration>,
}

pub struct Sweeper {
    cache: Arc<RefreshingCache>,
    limiter: TokenBucket,
    cleanup_interval: StdDuration,
    retry_interval: Duration,
    max_retry_jitter: Duration,
    renewal_timeout: StdDuration,
}

impl Sweeper {
    /// Panics when the refresh budget cannot keep a full cache renewed;
    /// this is a correctness constraint checked at startup.
    pub fn new(cache: Arc<RefreshingCache>, opts: SweeperOpts) -> Self {
        let refresh_qps = if opts.refresh_qps == 0 { 3 } else { opts.refresh_qps };
        if (refresh_qps as i64) * opts.credentials_renewal_ttl.num_seconds()
            < (opts.max_cache_size / 2) as i64
        {
            panic!(
                "refresh QPS is too small ({}) or credentials renewal too small ({:.2}s) to keep up with cache's size ({})",
                refresh_qps,
                opts.credentials_renewal_ttl.num_seconds() as f64,
                opts.max_cache_size
            );
        }

        Self {
            cache,
            limiter: TokenBucket::new(refresh_qps as f64, refresh_qps as f64),
            cleanup_interval: opts.cleanup_interval,
            retry_interval: opts
                .retry_interval
                .unwrap_or_else(|| Duration::seconds(DEFAULT_RETRY_INTERVAL_SECONDS)),
            max_retry_jitter: opts
                .max_retry_jitter
                .unwrap_or_else(|| Duration::seconds(DEFAULT_MAX_RETRY_JITTER_SECONDS)),
            renewal_timeout: opts.renewal_timeout.unwrap_or(RENEWAL_TIMEOUT),
        }
    }

    /// Run sweeps until shutdown is signalled.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut shutdown = shutdown;
            let mut ticker = tokio::time::interval(self.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval fires immediately; the first sweep should wait a full
            // period after startup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.sweep().await,
                    _ = shutdown.changed() => {
                        debug!("sweeper received shutdown signal, exiting");
                        return;
                    }
                }
            }
        })
    }

    /// One full sweep: refresh pass, then expiry pass.
    pub async fn sweep(&self) {
        let candidates = self.cache.refresh_candidates();
        if !candidates.is_empty() {
            debug!(count = candidates.len(), "entries due for refresh");
        }
        for (key, entry) in candidates {
            self.refresh_one(&key, entry).await;
        }

        let purged = self.cache.purge_expired();
        if purged > 0 {
            info!(count = purged, "purged expired cache entries");
        }
        self.cache.publish_size().await;
    }

    async fn refresh_one(&self, key: &PodIdentity, entry: CacheEntry) {
        // A request-path fetch for this key is already running; its result
        // will rewrite the entry, so this refresh coalesces with it.
        if self.cache.is_fetch_inflight(key) {
            debug!(pod_uid = %key, "refresh coalesces with in-flight fetch");
            return;
        }

        let metrics = get_metrics().await;
        let association_id = entry.association_id.as_deref().unwrap_or("").to_string();

        if self.limiter.try_acquire() {
            let attempt = tokio::time::timeout(
                self.renewal_timeout,
                self.cache
                    .fetch_via_flight(key, &entry.originating_request),
            )
            .await;

            match attempt {
                Ok(Ok(_)) => {
                    metrics.cache_state.with_label_values(&["hit"]).inc();
                    return;
                }
                Ok(Err(err)) => {
                    let (code, terminal) = classify_for_refresh(&err);
                    if terminal {
                        info!(
                            pod_uid = %key,
                            association_id = %association_id,
                            code,
                            error = %err,
                            "removing credentials from cache, got non recoverable error"
                        );
                        metrics
                            .cache_errors
                            .with_label_values(&["NonRecoverable"])
                            .inc();
                        self.cache.remove(key);
                        self.cache.publish_size().await;
                        return;
                    }
                    info!(
                        pod_uid = %key,
                        association_id = %association_id,
                        error = %err,
                        "could not renew, will try to keep existing creds, error is recoverable"
                    );
                }
                Err(_) => {
                    warn!(
                        pod_uid = %key,
                        association_id = %association_id,
                        "credential renewal timed out, will retry at next eligible sweep"
                    );
                }
            }
        } else {
            info!(pod_uid = %key, "rate limited, will try to keep creds locally");
        }

        // Retention branch: keep the old credentials if they still have
        // usable lifetime, otherwise evict.
        let now = self.cache.now();
        let remaining = entry.expires_at - now;
        if remaining > self.cache.min_credential_ttl() {
            let retry_after = (self.retry_interval + random_jitter(self.max_retry_jitter))
                .min(remaining);
            info!(
                pod_uid = %key,
                association_id = %association_id,
                remaining_seconds = remaining.num_seconds(),
                retry_after_seconds = retry_after.num_seconds(),
                "credentials still valid, keeping them, will try again after ttl expires"
            );
            self.cache.reschedule_refresh(key, now + retry_after);
        } else {
            metrics.cache_state.with_label_values(&["evicted"]).inc();
            info!(
                pod_uid = %key,
                association_id = %association_id,
                "evicting credentials since they are too old"
            );
            self.cache.remove(key);
            self.cache.publish_size().await;
        }
    }
}

fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.num_milliseconds();
    if max_ms <= 0 {
        return Duration::zero();
    }
    Duration::milliseconds(rand::thread_rng().gen_range(0..max_ms))
}
