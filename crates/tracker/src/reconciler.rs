//! Provisional-to-canonical identifier lifecycle and list reconciliation.
//!
//! A submission starts with a locally minted provisional id. When the
//! server answers, the handle is rekeyed in place; when submission fails
//! it is failed and retired on the next sweep, after subscribers have
//! seen the failure once.
//!
//! While canonical jobs are in flight the session periodically fetches
//! the authoritative list. A listed job is retired from the tracked set
//! only when the listing cannot be older than what we already know:
//! either the listing reports a terminal status, or the handle has not
//! changed since the fetch was issued.

use std::collections::HashMap;

use sitetrack_client::api::ListRecord;
use sitetrack_core::job::{mint_provisional_id, ErrorInfo, JobHandle};
use sitetrack_core::types::{JobId, Timestamp};

use crate::tracker::{JobTracker, Rekey, TrackerError};

/// One fetched page of the authoritative list.
#[derive(Debug, Clone)]
pub struct Listing {
    /// Instant the fetch was issued, before any response arrived.
    pub issued_at: Timestamp,
    pub records: Vec<ListRecord>,
}

/// Start tracking a job that is about to be submitted.
pub fn begin_submission(
    tracker: &mut JobTracker,
    site_name: Option<String>,
    now: Timestamp,
) -> JobHandle {
    let id = mint_provisional_id();
    tracing::debug!(provisional_id = %id, "Tracking provisional job");
    tracker.track_provisional(id, site_name, now).clone()
}

/// Rekey the provisional handle once the server has assigned an id.
pub fn confirm_submission(
    tracker: &mut JobTracker,
    provisional_id: &str,
    canonical_id: &str,
    now: Timestamp,
) -> Result<Rekey, TrackerError> {
    tracker.assign_canonical(provisional_id, canonical_id, now)
}

/// Fail the provisional handle of a submission that never got an id.
pub fn reject_submission(
    tracker: &mut JobTracker,
    provisional_id: &str,
    error: ErrorInfo,
    now: Timestamp,
) -> Result<JobHandle, TrackerError> {
    tracker
        .fail_submission(provisional_id, error, now)
        .cloned()
}

/// Retire provisional handles whose submission failed.
///
/// Returns the retired ids.
pub fn sweep_failed_submissions(tracker: &mut JobTracker) -> Vec<JobId> {
    let ids = tracker.failed_provisional_ids();
    for id in &ids {
        tracker.remove(id);
        tracing::debug!(provisional_id = %id, "Retired failed submission");
    }
    ids
}

/// Ids a listing may retire, applying the staleness fence.
pub fn retirable(tracker: &JobTracker, listing: &Listing) -> Vec<JobId> {
    let listed: HashMap<&str, &ListRecord> = listing
        .records
        .iter()
        .map(|record| (record.id.as_str(), record))
        .collect();

    tracker
        .non_terminal_canonical_ids()
        .into_iter()
        .filter(|id| {
            let Some(record) = listed.get(id.as_str()) else {
                return false;
            };
            let listed_terminal = record.status.is_some_and(|s| s.is_terminal());
            let unchanged_since_fetch = tracker
                .get(id)
                .is_some_and(|handle| handle.updated_at <= listing.issued_at);
            if !listed_terminal && !unchanged_since_fetch {
                tracing::debug!(
                    job_id = %id,
                    "Listing is older than the latest update; keeping job tracked",
                );
            }
            listed_terminal || unchanged_since_fetch
        })
        .collect()
}

/// Retire every job the listing makes authoritative. Returns the retired ids.
pub fn reconcile(tracker: &mut JobTracker, listing: &Listing) -> Vec<JobId> {
    let ids = retirable(tracker, listing);
    for id in &ids {
        tracker.remove(id);
        tracing::info!(job_id = %id, "Job visible in authoritative list; retired from tracking");
    }
    ids
}
