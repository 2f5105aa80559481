//! Sweeper behavior: refresh outcomes, retention, rate limiting, expiry.

use std::sync::Arc;

use chrono::{Duration, Utc};

use crate::cache::key::pod_uid_from_token;
use crate::cache::{PodIdentity, RefreshingCache, RefreshingCacheOpts};
use crate::credentials::{CredentialRequest, Credentials};
use crate::errors::{UpstreamError, UpstreamErrorKind};
use crate::refresh::{Sweeper, SweeperOpts};
use crate::tests::common::{
    make_token, sample_credentials, ManualClock, MockProvider, TokenSpec,
};
use crate::utils::channel;

struct Fixture {
    provider: Arc<MockProvider>,
    clock: ManualClock,
    cache: Arc<RefreshingCache>,
    sweeper: Sweeper,
    request: CredentialRequest,
    key: PodIdentity,
}

/// Cache with a 30-minute refresh horizon and a sweeper with one refresh
/// per second of budget; jitter is pinned to zero for determinism.
fn fixture() -> Fixture {
    let provider = Arc::new(MockProvider::new());
    let clock = ManualClock::new(Utc::now());
    let cache = RefreshingCache::new(RefreshingCacheOpts {
        provider: provider.clone(),
        credentials_renewal_ttl: Duration::minutes(30),
        max_cache_size: 5,
        min_credential_ttl: None,
        clock: Some(clock.clock()),
    });
    let sweeper = Sweeper::new(
        cache.clone(),
        SweeperOpts {
            cleanup_interval: std::time::Duration::from_secs(60),
            refresh_qps: 1,
            credentials_renewal_ttl: Duration::minutes(30),
            max_cache_size: 5,
            retry_interval: Some(Duration::seconds(60)),
            max_retry_jitter: Some(Duration::milliseconds(1)),
            renewal_timeout: None,
        },
    );
    let request = CredentialRequest {
        service_account_token: make_token(TokenSpec {
            pod_uid: Some("pod-refresh".into()),
            ..Default::default()
        }),
        cluster_name: "test-cluster".into(),
        request_target_host: "169.254.170.23".into(),
    };
    let key = pod_uid_from_token(&request.service_account_token).unwrap();
    Fixture {
        provider,
        clock,
        cache,
        sweeper,
        request,
        key,
    }
}

fn credentials_expiring_at(fixture: &Fixture, lifetime: Duration) -> Credentials {
    let mut credentials = sample_credentials(lifetime);
    credentials.expiration.0 = fixture.clock.now() + lifetime;
    credentials
}

async fn populate(fixture: &Fixture, credentials: Credentials) {
    fixture.provider.push_ok(credentials);
    fixture.cache.get(&fixture.request).await.unwrap();
}

#[tokio::test]
async fn successful_refresh_rewrites_the_entry() {
    let f = fixture();
    populate(&f, credentials_expiring_at(&f, Duration::hours(1))).await;
    let before = f.cache.peek(&f.key).unwrap();

    // Past the refresh horizon but well within the credential lifetime.
    f.clock.advance(Duration::minutes(31));
    let renewed = credentials_expiring_at(&f, Duration::hours(1));
    f.provider.push_ok(renewed.clone());
    f.sweeper.sweep().await;

    assert_eq!(f.provider.call_count(), 2);
    let after = f.cache.peek(&f.key).unwrap();
    assert_eq!(after.credentials, renewed);
    assert_eq!(after.expires_at, f.clock.now() + Duration::hours(1));
    assert!(after.expires_at >= before.expires_at);
    assert!(after.refresh_at <= after.expires_at);
}

#[tokio::test]
async fn refreshing_unchanged_credentials_is_idempotent() {
    let f = fixture();
    let original = credentials_expiring_at(&f, Duration::hours(1));
    populate(&f, original.clone()).await;

    f.clock.advance(Duration::minutes(31));
    // The exchange hands back the very same credential payload.
    f.provider.push_ok(original.clone());
    f.sweeper.sweep().await;

    let entry = f.cache.peek(&f.key).unwrap();
    assert_eq!(entry.credentials, original);
}

#[tokio::test]
async fn terminal_refresh_error_evicts_the_entry() {
    let f = fixture();
    populate(&f, credentials_expiring_at(&f, Duration::hours(1))).await;

    f.clock.advance(Duration::minutes(31));
    f.provider.push_err(
        UpstreamError::new(
            UpstreamErrorKind::AccessDenied,
            "AccessDeniedException",
            "association removed",
        )
        .with_http_status(403),
    );
    f.sweeper.sweep().await;

    assert!(f.cache.peek(&f.key).is_none(), "entry must be evicted");
    assert_eq!(f.provider.call_count(), 2);

    // The next request for the same pod reaches the provider; its error
    // propagates to the caller with the upstream status.
    f.provider.push_err(
        UpstreamError::new(
            UpstreamErrorKind::AccessDenied,
            "AccessDeniedException",
            "association removed",
        )
        .with_http_status(403),
    );
    let err = f.cache.get(&f.request).await.unwrap_err();
    assert_eq!(err.http_status(), http::StatusCode::FORBIDDEN);
    assert_eq!(f.provider.call_count(), 3);
}

#[tokio::test]
async fn recoverable_refresh_error_keeps_original_credentials() {
    let f = fixture();
    let original = credentials_expiring_at(&f, Duration::hours(1));
    populate(&f, original.clone()).await;

    f.clock.advance(Duration::minutes(31));
    f.provider.push_err(UpstreamError::new(
        UpstreamErrorKind::ServerInternal,
        "InternalServerException",
        "exchange having a bad day",
    ));
    f.sweeper.sweep().await;

    let entry = f.cache.peek(&f.key).expect("entry must be retained");
    assert_eq!(entry.credentials, original);
    // Refresh pushed forward by the retry interval (jitter pinned to zero).
    assert_eq!(entry.refresh_at, f.clock.now() + Duration::seconds(60));

    // A request within the original lifetime is a cache hit; the provider
    // is not consulted again.
    let calls_before = f.provider.call_count();
    let (got, _) = f.cache.get(&f.request).await.unwrap();
    assert_eq!(got, original);
    assert_eq!(f.provider.call_count(), calls_before);
}

#[tokio::test]
async fn rate_limited_refresh_pushes_refresh_forward_only() {
    let f = fixture();
    populate(&f, credentials_expiring_at(&f, Duration::hours(1))).await;

    // First sweep consumes the single-token budget on a successful refresh.
    f.clock.advance(Duration::minutes(31));
    f.provider.push_ok(credentials_expiring_at(&f, Duration::hours(1)));
    f.sweeper.sweep().await;
    let refreshed = f.cache.peek(&f.key).unwrap();

    // Immediately due again; the bucket has not refilled, so the refresh is
    // skipped for this sweep and only the refresh instant moves.
    f.clock.advance(Duration::minutes(31));
    f.sweeper.sweep().await;

    let entry = f.cache.peek(&f.key).expect("entry must be retained");
    assert_eq!(entry.credentials, refreshed.credentials);
    assert_eq!(entry.expires_at, refreshed.expires_at);
    assert_eq!(entry.refresh_at, f.clock.now() + Duration::seconds(60));
}

#[tokio::test]
async fn retention_evicts_entries_close_to_expiry() {
    let f = fixture();
    populate(&f, credentials_expiring_at(&f, Duration::hours(1))).await;

    // Due for refresh, but only 5 seconds of lifetime left; a failed
    // renewal cannot keep these.
    f.clock.advance(Duration::hours(1) - Duration::seconds(5));
    f.provider.push_err(UpstreamError::new(
        UpstreamErrorKind::ServerInternal,
        "InternalServerException",
        "still down",
    ));
    f.sweeper.sweep().await;

    assert!(f.cache.peek(&f.key).is_none());
}

#[tokio::test]
async fn sweep_removes_entries_past_expiry() {
    let f = fixture();
    populate(&f, credentials_expiring_at(&f, Duration::hours(1))).await;

    f.clock.advance(Duration::hours(2));
    f.provider.push_err(UpstreamError::new(
        UpstreamErrorKind::ServerInternal,
        "InternalServerException",
        "too late anyway",
    ));
    f.sweeper.sweep().await;

    assert!(f.cache.is_empty());
}

#[tokio::test]
async fn refresh_coalesces_with_inflight_request_fetch() {
    let f = fixture();
    populate(&f, credentials_expiring_at(&f, Duration::hours(1))).await;

    f.clock.advance(Duration::minutes(31));
    f.provider.set_delay(std::time::Duration::from_millis(300));
    f.provider.push_ok(credentials_expiring_at(&f, Duration::hours(1)));

    // A request-path fetch is in flight while the sweeper runs.
    let cache = f.cache.clone();
    let key = f.key.clone();
    let request = f.request.clone();
    let inflight = tokio::spawn(async move { cache.fetch_via_flight(&key, &request).await });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    f.sweeper.sweep().await;
    inflight.await.unwrap().unwrap();

    // One populate call plus one request-path fetch; the refresh did not
    // issue a third.
    assert_eq!(f.provider.call_count(), 2);
}

#[tokio::test]
async fn spawned_sweeper_refreshes_and_exits_on_shutdown() {
    let f = fixture();
    populate(&f, credentials_expiring_at(&f, Duration::hours(1))).await;

    f.clock.advance(Duration::minutes(31));
    f.provider.push_ok(credentials_expiring_at(&f, Duration::hours(1)));

    let sweeper = Sweeper::new(
        f.cache.clone(),
        SweeperOpts {
            cleanup_interval: std::time::Duration::from_millis(50),
            refresh_qps: 1,
            credentials_renewal_ttl: Duration::minutes(30),
            max_cache_size: 5,
            retry_interval: Some(Duration::seconds(60)),
            max_retry_jitter: Some(Duration::milliseconds(1)),
            renewal_timeout: None,
        },
    );
    let (shutdown_tx, shutdown_rx) = channel::shutdown_channel();
    let handle = sweeper.spawn(shutdown_rx);

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert_eq!(f.provider.call_count(), 2);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}
