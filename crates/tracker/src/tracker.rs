//! The job tracker reducer.
//!
//! [`JobTracker`] holds every tracked [`JobHandle`] keyed by its current
//! id, in the order jobs were first tracked. It is the only place handle
//! fields are written. Updates from the streaming channel and the poller
//! are applied last-writer-wins on `(status, progress, message)`, except
//! that a terminal handle is frozen: nothing, not even a contact change,
//! mutates it afterwards.
//!
//! The reducer is synchronous. Callers own it exclusively, so there is
//! no suspension point between reading a handle and writing it back.

use indexmap::IndexMap;
use sitetrack_core::job::{
    clamp_progress, ContactState, ErrorInfo, IdKind, JobHandle, JobStatus, JobUpdate,
    PROGRESS_MAX,
};
use sitetrack_core::types::{JobId, Timestamp};

/// Errors returned by tracker operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackerError {
    #[error("Job {0} is not tracked")]
    UnknownJob(JobId),

    #[error("Job {0} does not have a provisional id")]
    NotProvisional(JobId),

    #[error("Job {0} is in a terminal state")]
    TerminalState(JobId),

    #[error("Job {0} has not finished yet")]
    NotTerminal(JobId),
}

/// Result of feeding one update to the reducer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// At least one field changed.
    Changed,
    /// The update carried nothing new.
    Unchanged,
    /// The handle is terminal; the update was dropped.
    Frozen,
}

/// How a provisional handle was confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rekey {
    /// The handle now lives under the canonical id, same position.
    Renamed,
    /// The canonical id was already tracked; the provisional entry was
    /// folded into it and dropped.
    Merged,
}

/// Every tracked job, keyed by current id.
#[derive(Debug, Default)]
pub struct JobTracker {
    jobs: IndexMap<JobId, JobHandle>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- creation ----

    /// Track an optimistic handle for a job that is about to be submitted.
    pub fn track_provisional(
        &mut self,
        id: JobId,
        site_name: Option<String>,
        now: Timestamp,
    ) -> &JobHandle {
        let handle = JobHandle::provisional(id.clone(), site_name, now);
        self.jobs.entry(id).or_insert(handle)
    }

    /// Resume tracking a job whose server id is already known.
    ///
    /// Tracking an id twice returns the existing handle unchanged.
    pub fn track_canonical(
        &mut self,
        id: JobId,
        site_name: Option<String>,
        now: Timestamp,
    ) -> &JobHandle {
        let handle = JobHandle::canonical(id.clone(), site_name, now);
        self.jobs.entry(id).or_insert(handle)
    }

    /// Rekey a provisional handle to its server-assigned id, in place.
    ///
    /// The logical record keeps its position and optimistic metadata.
    /// A `getting_ready` handle moves to `pending`.
    pub fn assign_canonical(
        &mut self,
        provisional_id: &str,
        canonical_id: &str,
        now: Timestamp,
    ) -> Result<Rekey, TrackerError> {
        let handle = self
            .jobs
            .get(provisional_id)
            .ok_or_else(|| TrackerError::UnknownJob(provisional_id.to_string()))?;
        if handle.id_kind != IdKind::Provisional {
            return Err(TrackerError::NotProvisional(provisional_id.to_string()));
        }
        if handle.is_terminal() {
            return Err(TrackerError::TerminalState(provisional_id.to_string()));
        }

        let Some((index, _, mut handle)) = self.jobs.shift_remove_full(provisional_id) else {
            return Err(TrackerError::UnknownJob(provisional_id.to_string()));
        };

        if let Some(existing) = self.jobs.get_mut(canonical_id) {
            // Keep the optimistic label if the canonical entry lacks one.
            if existing.site_name.is_none() && !existing.is_terminal() {
                existing.site_name = handle.site_name.take();
                existing.updated_at = now;
            }
            tracing::debug!(
                provisional_id,
                canonical_id,
                "Canonical id already tracked; merged provisional entry",
            );
            return Ok(Rekey::Merged);
        }

        handle.id = canonical_id.to_string();
        handle.id_kind = IdKind::Canonical;
        if handle.status == JobStatus::GettingReady {
            handle.status = JobStatus::Pending;
        }
        handle.updated_at = now;
        self.jobs
            .shift_insert(index, canonical_id.to_string(), handle);
        tracing::debug!(provisional_id, canonical_id, "Rekeyed job to canonical id");
        Ok(Rekey::Renamed)
    }

    /// Fail a provisional handle whose submission never produced an id.
    pub fn fail_submission(
        &mut self,
        provisional_id: &str,
        error: ErrorInfo,
        now: Timestamp,
    ) -> Result<&JobHandle, TrackerError> {
        let handle = self
            .jobs
            .get_mut(provisional_id)
            .ok_or_else(|| TrackerError::UnknownJob(provisional_id.to_string()))?;
        if handle.id_kind != IdKind::Provisional {
            return Err(TrackerError::NotProvisional(provisional_id.to_string()));
        }
        if handle.is_terminal() {
            return Err(TrackerError::TerminalState(provisional_id.to_string()));
        }

        handle.status = JobStatus::Failed;
        handle.message = Some(error.message.clone());
        handle.error = Some(error);
        handle.contact = ContactState::Idle;
        handle.updated_at = now;
        Ok(handle)
    }

    // ---- reducer ----

    /// Merge one observed update into the handle for `id`.
    pub fn apply(
        &mut self,
        id: &str,
        update: JobUpdate,
        now: Timestamp,
    ) -> Result<Applied, TrackerError> {
        let handle = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| TrackerError::UnknownJob(id.to_string()))?;
        if handle.is_terminal() {
            tracing::debug!(job_id = id, status = %handle.status, "Dropping update for terminal job");
            return Ok(Applied::Frozen);
        }

        let status = match update.status {
            // Only the client may put a job in `getting_ready`.
            Some(JobStatus::GettingReady) | None => handle.status,
            Some(status) => status,
        };
        let progress = match (status, update.progress) {
            (JobStatus::Completed, _) => PROGRESS_MAX,
            (_, Some(raw)) => clamp_progress(raw),
            (_, None) => handle.progress,
        };
        let message = update.message.or_else(|| handle.message.clone());

        let mut changed = status != handle.status
            || progress != handle.progress
            || message != handle.message;
        handle.status = status;
        handle.progress = progress;
        handle.message = message;

        match status {
            JobStatus::Completed => {
                handle.result = Some(update.result.unwrap_or(serde_json::Value::Null));
                changed = true;
            }
            JobStatus::Failed => {
                handle.error = Some(
                    update
                        .error
                        .unwrap_or_else(|| ErrorInfo::server("Analysis failed")),
                );
                changed = true;
            }
            _ => {}
        }

        if status.is_terminal() {
            tracing::info!(job_id = id, status = %status, "Job reached terminal state");
        }
        if changed {
            handle.updated_at = now;
            Ok(Applied::Changed)
        } else {
            Ok(Applied::Unchanged)
        }
    }

    /// Record how the client is currently hearing about `id`.
    pub fn set_contact(
        &mut self,
        id: &str,
        contact: ContactState,
        now: Timestamp,
    ) -> Result<Applied, TrackerError> {
        let handle = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| TrackerError::UnknownJob(id.to_string()))?;
        if handle.is_terminal() {
            return Ok(Applied::Frozen);
        }
        if handle.contact == contact {
            return Ok(Applied::Unchanged);
        }
        handle.contact = contact;
        handle.updated_at = now;
        Ok(Applied::Changed)
    }

    // ---- removal ----

    /// Remove a finished job the user has acknowledged.
    pub fn dismiss(&mut self, id: &str) -> Result<JobHandle, TrackerError> {
        let handle = self
            .jobs
            .get(id)
            .ok_or_else(|| TrackerError::UnknownJob(id.to_string()))?;
        if !handle.is_terminal() {
            return Err(TrackerError::NotTerminal(id.to_string()));
        }
        self.remove(id)
            .ok_or_else(|| TrackerError::UnknownJob(id.to_string()))
    }

    /// Remove `id` regardless of state. Used for retirement and cancellation.
    pub fn remove(&mut self, id: &str) -> Option<JobHandle> {
        self.jobs.shift_remove(id)
    }

    // ---- queries ----

    pub fn get(&self, id: &str) -> Option<&JobHandle> {
        self.jobs.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn has_non_terminal(&self) -> bool {
        self.jobs.values().any(|h| !h.is_terminal())
    }

    /// Canonical ids still worth reconciling against the list endpoint.
    pub fn non_terminal_canonical_ids(&self) -> Vec<JobId> {
        self.jobs
            .values()
            .filter(|h| h.is_canonical() && !h.is_terminal())
            .map(|h| h.id.clone())
            .collect()
    }

    /// Provisional handles whose submission failed.
    pub fn failed_provisional_ids(&self) -> Vec<JobId> {
        self.jobs
            .values()
            .filter(|h| !h.is_canonical() && h.status == JobStatus::Failed)
            .map(|h| h.id.clone())
            .collect()
    }

    /// Copy of every handle, in tracking order.
    pub fn snapshot(&self) -> Vec<JobHandle> {
        self.jobs.values().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
