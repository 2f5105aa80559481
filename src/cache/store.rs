//! LRU-bounded credential store.
//!
//! One mutex guards the map, the LRU order, and the entry timestamps.
//! Methods never invoke callbacks or I/O while holding the lock; deleted
//! entries are returned to the caller, which logs or counts them after the
//! lock is released.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;

use crate::cache::entry::CacheEntry;
use crate::cache::key::PodIdentity;
use crate::credentials::Credentials;

/// Outcome of a read for a key.
pub enum ReadOutcome {
    /// Entry exists with more than the minimum lifetime left.
    Hit(Credentials),
    /// Entry existed but was expired or too close to expiry; it has been
    /// removed and the caller must fall through to the fetch path.
    Expired(CacheEntry),
    Miss,
}

pub struct CredentialStore {
    inner: Mutex<LruCache<PodIdentity, CacheEntry>>,
    min_credential_ttl: Duration,
}

impl CredentialStore {
    /// Panics if `max_entries` is zero; caching cannot be disabled here and
    /// the configuration layer validates the size before construction.
    pub fn new(max_entries: usize, min_credential_ttl: Duration) -> Self {
        let capacity =
            NonZeroUsize::new(max_entries).expect("credential cache size must be non-zero");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            min_credential_ttl,
        }
    }

    /// Read a key, promoting it in the LRU order on a hit. An entry at or
    /// past its usable lifetime is removed in the same critical section so
    /// no reader can observe stale credentials.
    pub fn read(&self, key: &PodIdentity, now: DateTime<Utc>) -> ReadOutcome {
        let mut cache = self.inner.lock().expect("credential store lock poisoned");
        let present = match cache.get(key) {
            Some(entry) => {
                if entry.remaining_lifetime(now) > self.min_credential_ttl {
                    return ReadOutcome::Hit(entry.credentials.clone());
                }
                true
            }
            None => false,
        };
        if !present {
            return ReadOutcome::Miss;
        }
        match cache.pop(key) {
            Some(entry) => ReadOutcome::Expired(entry),
            None => ReadOutcome::Miss,
        }
    }

    /// Insert or overwrite an entry. Returns the least-recently-used victim
    /// when the insertion pushed the cache past capacity.
    pub fn insert(
        &self,
        key: PodIdentity,
        entry: CacheEntry,
    ) -> Option<(PodIdentity, CacheEntry)> {
        debug_assert!(entry.refresh_at <= entry.expires_at);
        let mut cache = self.inner.lock().expect("credential store lock poisoned");
        match cache.push(key.clone(), entry) {
            // push returns the previous value for the same key on overwrite;
            // only a different key is a capacity eviction.
            Some((evicted_key, evicted_entry)) if evicted_key != key => {
                Some((evicted_key, evicted_entry))
            }
            _ => None,
        }
    }

    pub fn remove(&self, key: &PodIdentity) -> Option<CacheEntry> {
        let mut cache = self.inner.lock().expect("credential store lock poisoned");
        cache.pop(key)
    }

    /// Push an entry's refresh instant forward without touching anything
    /// else. Returns false if the key vanished in the meantime.
    pub fn reschedule_refresh(&self, key: &PodIdentity, refresh_at: DateTime<Utc>) -> bool {
        let mut cache = self.inner.lock().expect("credential store lock poisoned");
        match cache.peek_mut(key) {
            Some(entry) => {
                entry.refresh_at = refresh_at.min(entry.expires_at);
                true
            }
            None => false,
        }
    }

    /// Snapshot of the entries due for a background refresh. Does not
    /// promote anything in the LRU order.
    pub fn refresh_candidates(&self, now: DateTime<Utc>) -> Vec<(PodIdentity, CacheEntry)> {
        let cache = self.inner.lock().expect("credential store lock poisoned");
        cache
            .iter()
            .filter(|(_, entry)| entry.due_for_refresh(now))
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }

    /// Remove and return every entry past its expiry.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Vec<(PodIdentity, CacheEntry)> {
        let mut cache = self.inner.lock().expect("credential store lock poisoned");
        let expired: Vec<PodIdentity> = cache
            .iter()
            .filter(|(_, entry)| entry.expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|key| cache.pop(&key).map(|entry| (key, entry)))
            .collect()
    }

    /// Remove and return everything.
    pub fn delete_all(&self) -> Vec<(PodIdentity, CacheEntry)> {
        let mut cache = self.inner.lock().expect("credential store lock poisoned");
        let mut drained = Vec::with_capacity(cache.len());
        while let Some((key, entry)) = cache.pop_lru() {
            drained.push((key, entry));
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("credential store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read without promoting or expiring; used by tests and the sweeper's
    /// retention branch to inspect timestamps.
    pub fn peek(&self, key: &PodIdentity) -> Option<CacheEntry> {
        let cache = self.inner.lock().expect("credential store lock poisoned");
        cache.peek(key).cloned()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::credentials::CredentialRequest;
    use crate::tests::common::sample_request;

    fn identity(s: &str) -> PodIdentity {
        crate::cache::key::pod_uid_from_token(&crate::tests::common::make_token(
            crate::tests::common::TokenSpec {
                expiry: Utc::now() + Duration::hours(1),
                pod_uid: Some(s.to_string()),
                ..Default::default()
            },
        ))
        .unwrap()
    }

    fn entry_expiring_in(request: CredentialRequest, lifetime: Duration) -> CacheEntry {
        let now = Utc::now();
        CacheEntry {
            originating_request: request,
            credentials: crate::tests::common::sample_credentials(lifetime),
            refresh_at: now + lifetime.min(Duration::minutes(5)),
            expires_at: now + lifetime,
            association_id: Some("assoc-1".into()),
        }
    }

    #[test]
    fn hit_requires_minimum_lifetime() {
        let store = CredentialStore::new(4, Duration::seconds(15));
        let key = identity("pod-a");
        store.insert(key.clone(), entry_expiring_in(sample_request("pod-a"), Duration::hours(1)));

        assert!(matches!(store.read(&key, Utc::now()), ReadOutcome::Hit(_)));

        // Within the minimum-TTL window the entry is removed on read.
        let near_expiry = Utc::now() + Duration::hours(1) - Duration::seconds(10);
        assert!(matches!(store.read(&key, near_expiry), ReadOutcome::Expired(_)));
        assert!(matches!(store.read(&key, Utc::now()), ReadOutcome::Miss));
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let store = CredentialStore::new(2, Duration::seconds(15));
        let (a, b, c) = (identity("pod-a"), identity("pod-b"), identity("pod-c"));

        assert!(store
            .insert(a.clone(), entry_expiring_in(sample_request("pod-a"), Duration::hours(1)))
            .is_none());
        assert!(store
            .insert(b.clone(), entry_expiring_in(sample_request("pod-b"), Duration::hours(1)))
            .is_none());

        // Touch `a` so `b` becomes the LRU victim.
        assert!(matches!(store.read(&a, Utc::now()), ReadOutcome::Hit(_)));

        let victim = store
            .insert(c.clone(), entry_expiring_in(sample_request("pod-c"), Duration::hours(1)))
            .expect("capacity eviction");
        assert_eq!(victim.0, b);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn overwrite_same_key_is_not_an_eviction() {
        let store = CredentialStore::new(2, Duration::seconds(15));
        let key = identity("pod-a");
        store.insert(key.clone(), entry_expiring_in(sample_request("pod-a"), Duration::hours(1)));
        let replaced =
            store.insert(key.clone(), entry_expiring_in(sample_request("pod-a"), Duration::hours(2)));
        assert!(replaced.is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn purge_removes_only_expired_entries() {
        let store = CredentialStore::new(4, Duration::seconds(15));
        let (a, b) = (identity("pod-a"), identity("pod-b"));
        store.insert(a.clone(), entry_expiring_in(sample_request("pod-a"), Duration::seconds(30)));
        store.insert(b.clone(), entry_expiring_in(sample_request("pod-b"), Duration::hours(1)));

        let purged = store.purge_expired(Utc::now() + Duration::minutes(1));
        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].0, a);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn refresh_candidates_and_reschedule() {
        let store = CredentialStore::new(4, Duration::seconds(15));
        let key = identity("pod-a");
        let mut entry = entry_expiring_in(sample_request("pod-a"), Duration::hours(1));
        entry.refresh_at = Utc::now() - Duration::seconds(1);
        store.insert(key.clone(), entry);

        let due = store.refresh_candidates(Utc::now());
        assert_eq!(due.len(), 1);

        // Reschedule clamps to the entry's expiry.
        let far_future = Utc::now() + Duration::hours(10);
        assert!(store.reschedule_refresh(&key, far_future));
        let entry = store.peek(&key).unwrap();
        assert_eq!(entry.refresh_at, entry.expires_at);
        assert!(store.refresh_candidates(Utc::now()).is_empty());
    }

    #[test]
    fn delete_all_drains_everything() {
        let store = CredentialStore::new(4, Duration::seconds(15));
        store.insert(
            identity("pod-a"),
            entry_expiring_in(sample_request("pod-a"), Duration::hours(1)),
        );
        store.insert(
            identity("pod-b"),
            entry_expiring_in(sample_request("pod-b"), Duration::hours(1)),
        );
        let drained = store.delete_all();
        assert_eq!(drained.len(), 2);
        assert!(store.is_empty());
    }
}
