//! Shared test helpers: token minting, a scriptable provider, clocks, and
//! an ephemeral axum server.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Router;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;

use crate::cache::key::{pod_uid_from_token, PodIdentity};
use crate::credentials::{
    CredentialProvider, CredentialRequest, Credentials, ExpirationTime, ResponseMetadata,
};
use crate::errors::{UpstreamError, UpstreamErrorKind};
use crate::helpers::time::Clock;

/// Spawn an Axum router on an ephemeral port and return (JoinHandle, SocketAddr)
pub async fn spawn_axum(router: Router) -> (JoinHandle<()>, SocketAddr) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind failed");
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.expect("server failed");
    });
    (handle, addr)
}

pub fn build_reqwest_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()
        .expect("reqwest client")
}

/// Claims layout for minted service-account tokens.
#[derive(Serialize)]
struct TestClaims {
    exp: i64,
    iat: i64,
    nbf: i64,
    iss: &'static str,
    sub: &'static str,
    #[serde(rename = "kubernetes.io", skip_serializing_if = "Option::is_none")]
    kubernetes: Option<serde_json::Value>,
}

pub struct TokenSpec {
    pub expiry: DateTime<Utc>,
    pub iat: Option<DateTime<Utc>>,
    pub nbf: Option<DateTime<Utc>>,
    pub pod_uid: Option<String>,
}

impl Default for TokenSpec {
    fn default() -> Self {
        Self {
            expiry: Utc::now() + Duration::hours(1),
            iat: None,
            nbf: None,
            pod_uid: None,
        }
    }
}

/// Mint an HS256-signed service-account token. The signature key is
/// irrelevant; the agent never verifies it.
pub fn make_token(spec: TokenSpec) -> String {
    let now = Utc::now();
    let claims = TestClaims {
        exp: spec.expiry.timestamp(),
        iat: spec.iat.unwrap_or(now).timestamp(),
        nbf: spec.nbf.unwrap_or(now).timestamp(),
        iss: "https://kubernetes.default.svc",
        sub: "system:serviceaccount:default:workload",
        kubernetes: spec
            .pod_uid
            .map(|uid| json!({ "pod": { "uid": uid } })),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"signingKey"),
    )
    .expect("token encoding")
}

/// Identity for a pod UID, derived the same way the cache does it.
pub fn pod_identity(pod_uid: &str) -> PodIdentity {
    pod_uid_from_token(&make_token(TokenSpec {
        pod_uid: Some(pod_uid.to_string()),
        ..Default::default()
    }))
    .expect("pod identity")
}

pub fn sample_credentials(lifetime: Duration) -> Credentials {
    Credentials {
        access_key_id: "AKIDEXAMPLE".into(),
        secret_access_key: "secret".into(),
        token: "session-token".into(),
        account_id: "123456789012".into(),
        expiration: ExpirationTime(Utc::now() + lifetime),
    }
}

pub fn sample_request(pod_uid: &str) -> CredentialRequest {
    CredentialRequest {
        service_account_token: make_token(TokenSpec {
            pod_uid: Some(pod_uid.to_string()),
            ..Default::default()
        }),
        cluster_name: "test-cluster".into(),
        request_target_host: "169.254.170.23".into(),
    }
}

pub fn fixed_clock(at: DateTime<Utc>) -> Clock {
    Arc::new(move || at)
}

/// Clock that tests can move forward between operations.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap() = to;
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    pub fn clock(&self) -> Clock {
        let now = Arc::clone(&self.now);
        Arc::new(move || *now.lock().unwrap())
    }
}

type ProviderResult = Result<(Credentials, ResponseMetadata), UpstreamError>;

/// Scriptable provider: queue responses in order; an exhausted queue
/// answers with a server-internal error so misbehaving tests fail loudly.
pub struct MockProvider {
    responses: Mutex<VecDeque<ProviderResult>>,
    seen_requests: Mutex<Vec<CredentialRequest>>,
    calls: AtomicUsize,
    delay: Mutex<Option<std::time::Duration>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            seen_requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            delay: Mutex::new(None),
        }
    }

    pub fn push_ok(&self, credentials: Credentials) {
        self.push_ok_with_association(credentials, "assoc-test");
    }

    pub fn push_ok_with_association(&self, credentials: Credentials, association_id: &str) {
        self.responses.lock().unwrap().push_back(Ok((
            credentials,
            ResponseMetadata {
                association_id: association_id.to_string(),
            },
        )));
    }

    pub fn push_err(&self, err: UpstreamError) {
        self.responses.lock().unwrap().push_back(Err(err));
    }

    /// Make every fetch sleep first, to hold flights open.
    pub fn set_delay(&self, delay: std::time::Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen_requests(&self) -> Vec<CredentialRequest> {
        self.seen_requests.lock().unwrap().clone()
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialProvider for MockProvider {
    async fn fetch(&self, request: &CredentialRequest) -> ProviderResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_requests.lock().unwrap().push(request.clone());

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.responses.lock().unwrap().pop_front().unwrap_or_else(|| {
            Err(UpstreamError::new(
                UpstreamErrorKind::ServerInternal,
                "InternalServerException",
                "mock provider response queue exhausted",
            ))
        })
    }
}
