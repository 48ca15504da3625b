//! Events published by a [`TrackingSession`](crate::session::TrackingSession).
//!
//! Delivered over a `tokio::sync::broadcast` channel; call
//! [`TrackingSession::subscribe`](crate::session::TrackingSession::subscribe)
//! to receive them.

use serde::Serialize;
use sitetrack_core::job::JobHandle;
use sitetrack_core::types::JobId;

/// Why a handle left the tracked set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetireReason {
    /// The authoritative list now shows the record.
    Listed,
    /// Submission failed and the failure has been shown.
    SubmissionFailed,
    /// The caller stopped observing the job.
    Cancelled,
    /// The caller acknowledged a finished job.
    Dismissed,
}

/// Everything a session reports to its subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrackerEvent {
    /// A handle was created or mutated; carries the new state.
    JobChanged(JobHandle),

    /// A provisional handle now lives under its canonical id.
    JobRekeyed { provisional: JobId, canonical: JobId },

    /// A handle was removed from the tracked set.
    JobRetired { id: JobId, reason: RetireReason },

    /// Aggregate progress of a watched batch.
    BatchProgress {
        batch_id: String,
        completed: u32,
        total: u32,
        message: Option<String>,
    },

    /// Every job of a watched batch is done.
    BatchCompleted {
        batch_id: String,
        results: serde_json::Value,
    },

    /// A watched batch failed, or its channel gave up.
    BatchFailed { batch_id: String, message: String },
}

impl TrackerEvent {
    /// Id of the job this event is about, if any.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::JobChanged(handle) => Some(&handle.id),
            Self::JobRekeyed { canonical, .. } => Some(canonical),
            Self::JobRetired { id, .. } => Some(id),
            Self::BatchProgress { .. } | Self::BatchCompleted { .. } | Self::BatchFailed { .. } => {
                None
            }
        }
    }
}
