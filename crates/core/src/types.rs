/// Job identifiers are assigned by the store as monotonically increasing integers.
pub type DbId = i64;

/// Identifier of a queued job.
pub type JobId = DbId;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
