//! Job handle, status machine vocabulary and failure classification.
//!
//! A [`JobHandle`] is the client's perceived state of one analysis job.
//! It starts either provisional (minted locally before the server has
//! answered) or canonical (server-assigned id), moves through
//! [`JobStatus`] and freezes once it reaches a terminal status.

use serde::{Deserialize, Serialize};

use crate::types::{JobId, Timestamp};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Prefix of client-minted provisional ids.
pub const PROVISIONAL_ID_PREFIX: &str = "local-";

/// Lowest allowed progress percentage.
pub const PROGRESS_MIN: u8 = 0;

/// Highest allowed progress percentage.
pub const PROGRESS_MAX: u8 = 100;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
///
/// `GettingReady` is entered purely client-side before the submission
/// response arrives. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    GettingReady,
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Whether no further transitions are permitted.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GettingReady => "getting_ready",
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an id was minted locally or assigned by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdKind {
    Provisional,
    Canonical,
}

/// How the client is currently hearing about a job.
///
/// Lets a UI tell "still working" apart from "lost contact but retrying".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ContactState {
    /// No observer attached yet.
    Idle,
    /// Streaming channel is open.
    Live,
    /// The active update path failed; retry `attempt` is pending.
    Reconnecting { attempt: u32 },
    /// Updates arrive through status polling.
    Polling,
    /// Every update path has given up.
    Lost,
}

// ---------------------------------------------------------------------------
// Failure classification
// ---------------------------------------------------------------------------

/// Why a job ended up `failed`, from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Request rejected before it reached the network.
    Validation,
    /// The submission request itself failed; no canonical id exists.
    SubmissionFailed,
    /// Streaming channel exhausted its reconnect budget.
    Transport,
    /// Polling spent its attempt budget without a terminal status.
    PollTimeout,
    /// The status endpoint reported the job does not exist.
    NotFound,
    /// The status endpoint refused our credentials.
    Unauthorized,
    /// Too many consecutive status fetches failed.
    ConnectionLost,
    /// The server reported the job itself failed.
    ServerReported,
}

/// Failure detail attached to a failed [`JobHandle`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: FailureKind,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn poll_timeout(attempts: u32) -> Self {
        Self::new(
            FailureKind::PollTimeout,
            format!("Timed out waiting for analysis to finish after {attempts} status checks"),
        )
    }

    pub fn not_found(id: &str) -> Self {
        Self::new(FailureKind::NotFound, format!("Analysis job {id} not found"))
    }

    pub fn unauthorized() -> Self {
        Self::new(
            FailureKind::Unauthorized,
            "Not authorized to view this analysis job",
        )
    }

    pub fn connection_lost(consecutive_errors: u32) -> Self {
        Self::new(
            FailureKind::ConnectionLost,
            format!("Connection lost: {consecutive_errors} consecutive status checks failed"),
        )
    }

    pub fn transport(attempts: u32) -> Self {
        Self::new(
            FailureKind::Transport,
            format!("Live updates unavailable after {attempts} reconnect attempts"),
        )
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ServerReported, message)
    }
}

// ---------------------------------------------------------------------------
// Updates
// ---------------------------------------------------------------------------

/// One observed change to a job, from either the stream or the poller.
///
/// `progress` is raw input; it is clamped when applied.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<f64>,
    pub message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<ErrorInfo>,
}

impl JobUpdate {
    pub fn progress(status: JobStatus, progress: f64, message: Option<String>) -> Self {
        Self {
            status: Some(status),
            progress: Some(progress),
            message,
            ..Default::default()
        }
    }

    pub fn completed(result: serde_json::Value) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            progress: Some(f64::from(PROGRESS_MAX)),
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn failed(error: ErrorInfo) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            message: Some(error.message.clone()),
            error: Some(error),
            ..Default::default()
        }
    }
}

/// Clamp a raw progress value into `0..=100`.
///
/// Non-finite input maps to 0 (NaN) or the nearest bound (infinities).
pub fn clamp_progress(raw: f64) -> u8 {
    if raw.is_nan() {
        return PROGRESS_MIN;
    }
    raw.round()
        .clamp(f64::from(PROGRESS_MIN), f64::from(PROGRESS_MAX)) as u8
}

// ---------------------------------------------------------------------------
// JobHandle
// ---------------------------------------------------------------------------

/// The client's view of one logical analysis job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: JobId,
    pub id_kind: IdKind,
    pub status: JobStatus,
    /// Always within `0..=100`.
    pub progress: u8,
    pub message: Option<String>,
    pub site_name: Option<String>,
    pub created_at: Timestamp,
    /// Time of the last applied mutation.
    pub updated_at: Timestamp,
    pub result: Option<serde_json::Value>,
    pub error: Option<ErrorInfo>,
    pub contact: ContactState,
}

impl JobHandle {
    /// Optimistic handle created the moment the user submits.
    pub fn provisional(id: JobId, site_name: Option<String>, now: Timestamp) -> Self {
        Self {
            id,
            id_kind: IdKind::Provisional,
            status: JobStatus::GettingReady,
            progress: PROGRESS_MIN,
            message: None,
            site_name,
            created_at: now,
            updated_at: now,
            result: None,
            error: None,
            contact: ContactState::Idle,
        }
    }

    /// Handle for a job whose server id is already known (resumed tracking).
    pub fn canonical(id: JobId, site_name: Option<String>, now: Timestamp) -> Self {
        Self {
            id_kind: IdKind::Canonical,
            status: JobStatus::Pending,
            ..Self::provisional(id, site_name, now)
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_canonical(&self) -> bool {
        self.id_kind == IdKind::Canonical
    }
}

/// Mint a fresh provisional id.
///
/// UUID v7 keeps the token time-ordered while staying collision free
/// for jobs submitted within the same millisecond.
pub fn mint_provisional_id() -> JobId {
    format!("{PROVISIONAL_ID_PREFIX}{}", uuid::Uuid::now_v7())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
