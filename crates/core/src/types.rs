/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Identifier of a tracked job, either client-minted or server-assigned.
pub type JobId = String;
