//! Completed-result cache.
//!
//! Holds payloads of jobs observed `completed` under a canonical id.
//! Entries expire after a TTL and the cache is bounded; when full, the
//! entry with the oldest `cached_at` is evicted.

use std::time::Duration;

use indexmap::IndexMap;
use sitetrack_core::job::{IdKind, JobHandle, JobStatus};
use sitetrack_core::result::{Attachment, CachedResult, ResultOrigin};
use sitetrack_core::types::{JobId, Timestamp};

/// Default time-to-live of a cached result.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

/// Default number of cached results.
pub const DEFAULT_CACHE_CAPACITY: usize = 100;

/// What the cache needs to know about a job before storing its result.
#[derive(Debug, Clone, Copy)]
pub struct Observed<'a> {
    pub id: &'a str,
    pub id_kind: IdKind,
    pub status: JobStatus,
}

impl<'a> From<&'a JobHandle> for Observed<'a> {
    fn from(handle: &'a JobHandle) -> Self {
        Self {
            id: &handle.id,
            id_kind: handle.id_kind,
            status: handle.status,
        }
    }
}

/// TTL- and size-bounded map of completed payloads.
#[derive(Debug)]
pub struct ResultCache {
    /// Ordered by `cached_at`, oldest first.
    entries: IndexMap<JobId, CachedResult>,
    ttl: chrono::Duration,
    capacity: usize,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL, DEFAULT_CACHE_CAPACITY)
    }
}

impl ResultCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: IndexMap::new(),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            capacity,
        }
    }

    /// Look up a live entry. Expired entries are dropped on access.
    pub fn get(&mut self, id: &str, now: Timestamp) -> Option<&CachedResult> {
        let expired = self
            .entries
            .get(id)
            .is_some_and(|entry| self.is_expired(entry, now));
        if expired {
            tracing::debug!(job_id = id, "Cached result expired");
            self.entries.shift_remove(id);
            return None;
        }
        self.entries.get(id)
    }

    /// Store `payload` for a job observed `completed` under a canonical id.
    ///
    /// Returns `false` (and stores nothing) for any other job. The entry
    /// is marked [`ResultOrigin::Observed`]; a fetched entry for the same
    /// job is kept, since it already holds the artifact list.
    pub fn put(&mut self, job: Observed<'_>, payload: serde_json::Value, now: Timestamp) -> bool {
        if self
            .get(job.id, now)
            .is_some_and(CachedResult::is_authoritative)
        {
            return false;
        }
        self.insert(job, payload, Vec::new(), ResultOrigin::Observed, now)
    }

    /// Store a result read from the service, artifacts included.
    pub fn put_fetched(
        &mut self,
        job: Observed<'_>,
        payload: serde_json::Value,
        attachments: Vec<Attachment>,
        now: Timestamp,
    ) -> bool {
        self.insert(job, payload, attachments, ResultOrigin::Fetched, now)
    }

    fn insert(
        &mut self,
        job: Observed<'_>,
        payload: serde_json::Value,
        attachments: Vec<Attachment>,
        origin: ResultOrigin,
        now: Timestamp,
    ) -> bool {
        if job.status != JobStatus::Completed || job.id_kind != IdKind::Canonical {
            tracing::debug!(
                job_id = job.id,
                status = %job.status,
                "Refusing to cache result of unfinished or provisional job",
            );
            return false;
        }
        if self.capacity == 0 {
            return false;
        }

        // Re-inserting moves the entry to the back, keeping age order.
        self.entries.shift_remove(job.id);
        self.purge_expired(now);
        while self.entries.len() >= self.capacity {
            if let Some((evicted, _)) = self.entries.shift_remove_index(0) {
                tracing::debug!(job_id = %evicted, "Evicted oldest cached result");
            }
        }
        self.entries.insert(
            job.id.to_string(),
            CachedResult {
                id: job.id.to_string(),
                payload,
                attachments,
                origin,
                cached_at: now,
            },
        );
        true
    }

    pub fn remove(&mut self, id: &str) -> Option<CachedResult> {
        self.entries.shift_remove(id)
    }

    /// Drop every expired entry.
    pub fn purge_expired(&mut self, now: Timestamp) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, entry| now.signed_duration_since(entry.cached_at) <= ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_expired(&self, entry: &CachedResult, now: Timestamp) -> bool {
        now.signed_duration_since(entry.cached_at) > self.ttl
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;

    fn completed(id: &str) -> Observed<'_> {
        Observed {
            id,
            id_kind: IdKind::Canonical,
            status: JobStatus::Completed,
        }
    }

    #[test]
    fn stores_only_completed_canonical_jobs() {
        let mut cache = ResultCache::default();
        let now = Utc::now();

        let provisional = Observed {
            id_kind: IdKind::Provisional,
            ..completed("local-1")
        };
        let running = Observed {
            status: JobStatus::Processing,
            ..completed("J2")
        };
        assert!(!cache.put(provisional, json!(1), now));
        assert!(!cache.put(running, json!(2), now));
        assert!(cache.put(completed("J1"), json!({"score": 3}), now));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("J1", now).unwrap().payload["score"], 3);
        assert!(cache.get("J2", now).is_none());
    }

    #[test]
    fn put_from_handle_checks_handle_state() {
        let mut cache = ResultCache::default();
        let handle = JobHandle::canonical("J1".into(), None, Utc::now());
        assert!(!cache.put(Observed::from(&handle), json!(null), Utc::now()));
    }

    #[test]
    fn entries_expire_after_ttl() {
        let mut cache = ResultCache::new(Duration::from_secs(60), 10);
        let now = Utc::now();
        cache.put(completed("J1"), json!(1), now);

        assert!(cache.get("J1", now + chrono::Duration::seconds(59)).is_some());
        assert!(cache.get("J1", now + chrono::Duration::seconds(61)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn oldest_entry_is_evicted_at_capacity() {
        let mut cache = ResultCache::new(DEFAULT_CACHE_TTL, 2);
        let now = Utc::now();
        cache.put(completed("J1"), json!(1), now);
        cache.put(completed("J2"), json!(2), now + chrono::Duration::seconds(1));
        // Refreshing J1 makes J2 the oldest.
        cache.put(completed("J1"), json!(11), now + chrono::Duration::seconds(2));
        cache.put(completed("J3"), json!(3), now + chrono::Duration::seconds(3));

        let later = now + chrono::Duration::seconds(4);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("J2", later).is_none());
        assert_eq!(cache.get("J1", later).unwrap().payload, json!(11));
        assert!(cache.get("J3", later).is_some());
    }

    #[test]
    fn observed_entry_never_replaces_fetched_one() {
        let mut cache = ResultCache::default();
        let now = Utc::now();
        let report = Attachment {
            name: "report.pdf".into(),
            url: "https://files.example/report.pdf".into(),
            content_type: Some("application/pdf".into()),
        };

        assert!(cache.put(completed("J1"), json!({"score": 1}), now));
        assert!(!cache.get("J1", now).unwrap().is_authoritative());

        assert!(cache.put_fetched(completed("J1"), json!({"score": 2}), vec![report.clone()], now));
        assert!(!cache.put(completed("J1"), json!({"score": 3}), now));

        let entry = cache.get("J1", now).unwrap();
        assert_eq!(entry.origin, ResultOrigin::Fetched);
        assert_eq!(entry.payload["score"], 2);
        assert_eq!(entry.attachments, vec![report]);
    }

    #[test]
    fn zero_capacity_stores_nothing() {
        let mut cache = ResultCache::new(DEFAULT_CACHE_TTL, 0);
        assert!(!cache.put(completed("J1"), json!(1), Utc::now()));
        assert!(cache.is_empty());
    }
}
