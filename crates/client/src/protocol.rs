//! Streaming wire protocol.
//!
//! A text frame is either a control frame (the literal keepalive
//! `ping`/`pong` tokens, which are not JSON) or a data frame carrying a
//! JSON object with a `type` discriminator. [`parse_frame`] separates
//! the two before any JSON parsing happens.

use serde::{Deserialize, Serialize};
use sitetrack_core::job::{ErrorInfo, JobStatus, JobUpdate};
use sitetrack_core::stream_events::{
    KEEPALIVE_PING, KEEPALIVE_PONG, MSG_TYPE_BATCH_COMPLETE, MSG_TYPE_BATCH_PROGRESS,
    MSG_TYPE_COMPLETE, MSG_TYPE_CONNECTED, MSG_TYPE_ERROR, MSG_TYPE_PROGRESS,
};

/// Fallback failure message when the server omits one.
const DEFAULT_FAILURE_MESSAGE: &str = "Analysis failed";

/// One decoded text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Control(ControlFrame),
    Data(StreamMessage),
}

/// Literal keepalive tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFrame {
    Ping,
    Pong,
}

impl ControlFrame {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => KEEPALIVE_PING,
            Self::Pong => KEEPALIVE_PONG,
        }
    }
}

/// All known JSON messages on job and batch channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    /// Server acknowledged the subscription.
    Connected {
        #[serde(default)]
        job_id: Option<String>,
        #[serde(default)]
        batch_id: Option<String>,
    },

    /// Job progress (percentage + optional human-readable step).
    Progress {
        #[serde(default)]
        job_id: Option<String>,
        #[serde(default)]
        status: Option<JobStatus>,
        #[serde(default)]
        progress: f64,
        #[serde(default)]
        message: Option<String>,
    },

    /// Job finished; `result` holds the completed payload.
    Complete {
        #[serde(default)]
        job_id: Option<String>,
        #[serde(default)]
        result: serde_json::Value,
    },

    /// Job or batch failed.
    Error {
        #[serde(default)]
        job_id: Option<String>,
        #[serde(default, alias = "error")]
        message: Option<String>,
    },

    /// Aggregate batch progress.
    BatchProgress {
        #[serde(default)]
        batch_id: Option<String>,
        #[serde(default)]
        completed: u32,
        #[serde(default)]
        total: u32,
        #[serde(default)]
        message: Option<String>,
    },

    /// All jobs of a batch are done.
    BatchComplete {
        #[serde(default)]
        batch_id: Option<String>,
        #[serde(default)]
        results: serde_json::Value,
    },
}

impl StreamMessage {
    /// The `type` discriminator this message carries on the wire.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => MSG_TYPE_CONNECTED,
            Self::Progress { .. } => MSG_TYPE_PROGRESS,
            Self::Complete { .. } => MSG_TYPE_COMPLETE,
            Self::Error { .. } => MSG_TYPE_ERROR,
            Self::BatchProgress { .. } => MSG_TYPE_BATCH_PROGRESS,
            Self::BatchComplete { .. } => MSG_TYPE_BATCH_COMPLETE,
        }
    }

    /// Translate a job-channel message into a tracker update.
    ///
    /// Returns `None` for messages that do not describe job state.
    pub fn to_job_update(&self) -> Option<JobUpdate> {
        match self {
            Self::Progress {
                status,
                progress,
                message,
                ..
            } => Some(JobUpdate::progress(
                status.unwrap_or(JobStatus::Processing),
                *progress,
                message.clone(),
            )),
            Self::Complete { result, .. } => Some(JobUpdate::completed(result.clone())),
            Self::Error { message, .. } => Some(JobUpdate::failed(ErrorInfo::server(
                message
                    .clone()
                    .unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.to_string()),
            ))),
            Self::Connected { .. } | Self::BatchProgress { .. } | Self::BatchComplete { .. } => {
                None
            }
        }
    }
}

/// Errors decoding a text frame.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed stream message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Decode one text frame.
///
/// Keepalive tokens are recognised before JSON parsing, so they never
/// produce a parse error. Unknown `type` values are reported as
/// [`ProtocolError::Malformed`]; callers log and drop them.
pub fn parse_frame(text: &str) -> Result<Frame, ProtocolError> {
    match text.trim() {
        KEEPALIVE_PONG => Ok(Frame::Control(ControlFrame::Pong)),
        KEEPALIVE_PING => Ok(Frame::Control(ControlFrame::Ping)),
        payload => Ok(Frame::Data(serde_json::from_str(payload)?)),
    }
}
