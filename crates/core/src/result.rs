//! Completed-result records.

use serde::{Deserialize, Serialize};

use crate::types::{JobId, Timestamp};

/// A completed job payload held by the result cache.
///
/// Only ever built for jobs observed `completed` under a canonical id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResult {
    pub id: JobId,
    pub payload: serde_json::Value,
    /// Empty when the payload came from a tracked completion.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub origin: ResultOrigin,
    pub cached_at: Timestamp,
}

/// Where a cached payload came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultOrigin {
    /// Carried by a status or stream update; artifacts are unknown.
    Observed,
    /// Read from the results or full-record endpoint.
    #[default]
    Fetched,
}

impl CachedResult {
    /// Whether the record is complete enough to serve without a fetch.
    pub fn is_authoritative(&self) -> bool {
        self.origin == ResultOrigin::Fetched
    }
}

/// A downloadable artifact produced by a completed analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub content_type: Option<String>,
}
