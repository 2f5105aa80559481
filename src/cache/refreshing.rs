//! Read-through credential cache with single-flight fetch.
//!
//! Request handlers call [`RefreshingCache::get`]; the background sweeper
//! drives [`RefreshingCache::fetch_via_flight`] for entries due a refresh
//! and uses the mutation primitives (`remove`, `reschedule_refresh`,
//! `purge_expired`) to rewrite state. All upstream I/O happens with the
//! store lock released.

use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info, trace};

use crate::cache::entry::CacheEntry;
use crate::cache::flight::{FlightGroup, FlightRole};
use crate::cache::key::{pod_uid_from_token, PodIdentity};
use crate::cache::store::{CredentialStore, ReadOutcome};
use crate::credentials::{CredentialProvider, CredentialRequest, Credentials, ResponseMetadata};
use crate::errors::AgentError;
use crate::helpers::time::{system_clock, Clock};
use crate::observability::metrics::get_metrics;

/// Minimum lifetime, in seconds, credentials must have to be stored or
/// served.
pub const DEFAULT_MIN_CREDENTIAL_TTL_SECONDS: i64 = 15;

pub struct RefreshingCacheOpts {
    pub provider: Arc<dyn CredentialProvider>,
    /// Upper bound on how far ahead an entry's refresh instant may sit.
    pub credentials_renewal_ttl: Duration,
    pub max_cache_size: usize,
    /// Override for tests; defaults to [`DEFAULT_MIN_CREDENTIAL_TTL_SECONDS`].
    pub min_credential_ttl: Option<Duration>,
    /// Override for tests; defaults to the system clock.
    pub clock: Option<Clock>,
}

pub struct RefreshingCache {
    store: CredentialStore,
    flights: FlightGroup,
    provider: Arc<dyn CredentialProvider>,
    credentials_renewal_ttl: Duration,
    min_credential_ttl: Duration,
    clock: Clock,
}

impl RefreshingCache {
    pub fn new(opts: RefreshingCacheOpts) -> Arc<Self> {
        let min_credential_ttl = opts
            .min_credential_ttl
            .unwrap_or_else(|| Duration::seconds(DEFAULT_MIN_CREDENTIAL_TTL_SECONDS));
        Arc::new(Self {
            store: CredentialStore::new(opts.max_cache_size, min_credential_ttl),
            flights: FlightGroup::new(),
            provider: opts.provider,
            credentials_renewal_ttl: opts.credentials_renewal_ttl,
            min_credential_ttl,
            clock: opts.clock.unwrap_or_else(system_clock),
        })
    }

    /// Fetch credentials for a request, serving from the cache when a live
    /// entry exists and coalescing concurrent fetches per pod identity.
    pub async fn get(
        &self,
        request: &CredentialRequest,
    ) -> Result<(Credentials, Option<ResponseMetadata>), AgentError> {
        if request.service_account_token.is_empty() {
            return Err(AgentError::Validation(
                "service account token is empty, cannot fetch credentials without a valid one"
                    .into(),
            ));
        }

        let key = pod_uid_from_token(&request.service_account_token)?;
        let now = (self.clock)();

        match self.store.read(&key, now) {
            ReadOutcome::Hit(credentials) => {
                trace!(pod_uid = %key, "using cached credentials");
                return Ok((credentials, None));
            }
            ReadOutcome::Expired(entry) => {
                info!(
                    pod_uid = %key,
                    "cache entry holds credentials with small or invalid ttl, deleting"
                );
                self.note_evicted(&key, &entry);
            }
            ReadOutcome::Miss => {
                trace!(pod_uid = %key, "no cache entry, requesting credentials from provider");
            }
        }

        self.fetch_via_flight(&key, request).await
    }

    /// Perform (or join) the single in-flight fetch for a key, storing the
    /// result on success. Used by the request path on a miss and by the
    /// sweeper for refreshes, so a refresh can never race a request-path
    /// fetch for the same key.
    pub async fn fetch_via_flight(
        &self,
        key: &PodIdentity,
        request: &CredentialRequest,
    ) -> Result<(Credentials, Option<ResponseMetadata>), AgentError> {
        match self.flights.join_or_lead(key) {
            FlightRole::Leader(guard) => {
                let outcome = self.fetch_and_store(key, request).await;
                let shared = match &outcome {
                    Ok((credentials, _)) => Ok(credentials.clone()),
                    Err(err) => Err(err.clone()),
                };
                guard.complete(&shared);
                outcome
            }
            FlightRole::Waiter(rx) => {
                debug!(pod_uid = %key, "joining in-flight credential fetch");
                FlightGroup::await_result(rx)
                    .await
                    .map(|credentials| (credentials, None))
            }
        }
    }

    async fn fetch_and_store(
        &self,
        key: &PodIdentity,
        request: &CredentialRequest,
    ) -> Result<(Credentials, Option<ResponseMetadata>), AgentError> {
        let (credentials, metadata) = self.provider.fetch(request).await?;

        let now = (self.clock)();
        let creds_duration = credentials.expiration.0 - now;
        if creds_duration <= self.min_credential_ttl {
            return Err(AgentError::Internal(format!(
                "fetched credentials are expired or will expire within the next {:.2} seconds",
                duration_seconds(creds_duration)
            )));
        }

        let refresh_ttl = creds_duration.min(self.credentials_renewal_ttl);
        info!(
            pod_uid = %key,
            association_id = %metadata.association_id,
            refresh_ttl_seconds = refresh_ttl.num_seconds(),
            "storing credentials in cache"
        );

        let entry = CacheEntry {
            originating_request: request.clone(),
            credentials: credentials.clone(),
            refresh_at: now + refresh_ttl,
            expires_at: now + creds_duration,
            association_id: Some(metadata.association_id.clone()),
        };
        if let Some((victim_key, victim)) = self.store.insert(key.clone(), entry) {
            self.note_evicted(&victim_key, &victim);
        }
        self.publish_size().await;

        Ok((credentials, Some(metadata)))
    }

    /// Entries that are due a background refresh.
    pub fn refresh_candidates(&self) -> Vec<(PodIdentity, CacheEntry)> {
        self.store.refresh_candidates((self.clock)())
    }

    /// Whether a request-path fetch is already in flight for the key.
    pub fn is_fetch_inflight(&self, key: &PodIdentity) -> bool {
        self.flights.is_inflight(key)
    }

    /// Delete one entry, logging the eviction.
    pub fn remove(&self, key: &PodIdentity) -> Option<CacheEntry> {
        let removed = self.store.remove(key);
        if let Some(entry) = &removed {
            self.note_evicted(key, entry);
        }
        removed
    }

    /// Push an entry's refresh instant forward, clamped to its expiry.
    pub fn reschedule_refresh(&self, key: &PodIdentity, refresh_at: chrono::DateTime<chrono::Utc>) -> bool {
        self.store.reschedule_refresh(key, refresh_at)
    }

    /// Remove every entry past its expiry, logging each eviction once.
    pub fn purge_expired(&self) -> usize {
        let purged = self.store.purge_expired((self.clock)());
        for (key, entry) in &purged {
            self.note_evicted(key, entry);
        }
        purged.len()
    }

    /// Drop all entries (shutdown path).
    pub fn delete_all(&self) -> usize {
        let drained = self.store.delete_all();
        for (key, entry) in &drained {
            self.note_evicted(key, entry);
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Test/diagnostic peek; no LRU promotion, no expiry side effects.
    pub fn peek(&self, key: &PodIdentity) -> Option<CacheEntry> {
        self.store.peek(key)
    }

    pub fn min_credential_ttl(&self) -> Duration {
        self.min_credential_ttl
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        (self.clock)()
    }

    /// Mirror the cache size into the metrics gauge.
    pub async fn publish_size(&self) {
        get_metrics()
            .await
            .cached_credentials
            .set(self.store.len() as i64);
    }

    fn note_evicted(&self, key: &PodIdentity, entry: &CacheEntry) {
        info!(
            pod_uid = %key,
            association_id = entry.association_id.as_deref().unwrap_or(""),
            "credentials evicted"
        );
    }
}

fn duration_seconds(d: Duration) -> f64 {
    d.num_milliseconds() as f64 / 1000.0
}
