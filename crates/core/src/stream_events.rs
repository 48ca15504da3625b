//! Message type constants for the streaming channels.
//!
//! Job channels carry `connected`, `progress`, `complete` and `error`;
//! batch channels carry `connected`, `batch_progress`, `batch_complete`
//! and `error`.

/// Sent by the server right after a channel is established.
pub const MSG_TYPE_CONNECTED: &str = "connected";

/// Progress update for a single job (percentage + message).
pub const MSG_TYPE_PROGRESS: &str = "progress";

/// Job finished successfully; carries the result payload.
pub const MSG_TYPE_COMPLETE: &str = "complete";

/// Job or batch failed with a server-supplied message.
pub const MSG_TYPE_ERROR: &str = "error";

/// Aggregate progress for a batch of jobs.
pub const MSG_TYPE_BATCH_PROGRESS: &str = "batch_progress";

/// Every job in a batch has finished.
pub const MSG_TYPE_BATCH_COMPLETE: &str = "batch_complete";

/// Literal keepalive request written by the client. Not JSON.
pub const KEEPALIVE_PING: &str = "ping";

/// Literal keepalive reply written by the server. Not JSON.
pub const KEEPALIVE_PONG: &str = "pong";
