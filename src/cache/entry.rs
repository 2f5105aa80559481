//! Cache entry for one token identity.

use chrono::{DateTime, Utc};

use crate::credentials::{CredentialRequest, Credentials};

/// Everything the cache keeps per pod identity.
///
/// The originating request is retained so the sweeper can re-issue the
/// upstream call on refresh; the association id keeps refresh-path logs
/// correlated with the request that created the entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub originating_request: CredentialRequest,
    pub credentials: Credentials,
    /// Instant the entry becomes eligible for background refresh.
    /// Invariant: `refresh_at <= expires_at`.
    pub refresh_at: DateTime<Utc>,
    /// Instant the entry is unusable and must be deleted.
    pub expires_at: DateTime<Utc>,
    pub association_id: Option<String>,
}

impl CacheEntry {
    /// Remaining credential lifetime relative to `now`. Negative once the
    /// entry has expired.
    pub fn remaining_lifetime(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.expires_at - now
    }

    /// Whether the entry is due for a background refresh.
    pub fn due_for_refresh(&self, now: DateTime<Utc>) -> bool {
        now > self.refresh_at
    }

    /// Whether the entry must be purged.
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}
