//! Per-key single-flight coordination.
//!
//! At most one upstream fetch is in flight per pod identity. The first
//! caller becomes the leader and owns a [`FlightGuard`]; contenders that
//! arrive while the flight is open receive a receiver for the same result.
//! The guard is abort-safe: dropping it without completing delivers an
//! error to the waiters instead of leaving them hanging.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::cache::key::PodIdentity;
use crate::credentials::Credentials;
use crate::errors::AgentError;

pub type FlightResult = Result<Credentials, AgentError>;

type FlightMap = Arc<Mutex<HashMap<PodIdentity, watch::Receiver<Option<FlightResult>>>>>;

/// What a caller got when it asked to fetch a key.
pub enum FlightRole {
    /// This caller performs the fetch and must call [`FlightGuard::complete`].
    Leader(FlightGuard),
    /// Another fetch is in flight; await its result.
    Waiter(watch::Receiver<Option<FlightResult>>),
}

#[derive(Clone, Default)]
pub struct FlightGroup {
    inflight: FlightMap,
}

impl FlightGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lead a new flight for the key, or join the one already in progress.
    pub fn join_or_lead(&self, key: &PodIdentity) -> FlightRole {
        let mut map = self.inflight.lock().expect("flight map lock poisoned");
        if let Some(rx) = map.get(key) {
            return FlightRole::Waiter(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        map.insert(key.clone(), rx);
        FlightRole::Leader(FlightGuard {
            key: key.clone(),
            tx: Some(tx),
            inflight: Arc::clone(&self.inflight),
        })
    }

    /// Whether a fetch is currently in flight for the key. The sweeper uses
    /// this to coalesce refreshes with request-path fetches.
    pub fn is_inflight(&self, key: &PodIdentity) -> bool {
        self.inflight
            .lock()
            .expect("flight map lock poisoned")
            .contains_key(key)
    }

    /// Await the result of a flight joined as a waiter.
    pub async fn await_result(
        mut rx: watch::Receiver<Option<FlightResult>>,
    ) -> FlightResult {
        match rx.wait_for(|value| value.is_some()).await {
            Ok(value) => (*value).clone().unwrap_or_else(|| {
                Err(AgentError::Internal(
                    "credential fetch produced no result".into(),
                ))
            }),
            Err(_) => Err(AgentError::Internal(
                "credential fetch abandoned before completion".into(),
            )),
        }
    }
}

/// Held by the flight leader until the fetch resolves.
pub struct FlightGuard {
    key: PodIdentity,
    tx: Option<watch::Sender<Option<FlightResult>>>,
    inflight: FlightMap,
}

impl FlightGuard {
    /// Publish the fetch outcome to every waiter and close the flight.
    /// The key is unregistered before the send so a caller arriving after a
    /// failure starts a fresh fetch instead of observing the stale error.
    pub fn complete(mut self, result: &FlightResult) {
        self.unregister();
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(result.clone()));
        }
    }

    fn unregister(&self) {
        self.inflight
            .lock()
            .expect("flight map lock poisoned")
            .remove(&self.key);
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        // Leader was cancelled mid-fetch; fail the waiters rather than
        // leaving the key wedged.
        if let Some(tx) = self.tx.take() {
            self.unregister();
            let _ = tx.send(Some(Err(AgentError::Internal(
                "credential fetch aborted before completion".into(),
            ))));
        }
    }
}
