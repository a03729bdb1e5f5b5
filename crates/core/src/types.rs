/// Job identifiers are opaque UUIDs (v4).
pub type JobId = uuid::Uuid;

/// Owning-account reference. Accounts are managed by an external auth
/// layer; the engine only scopes visibility by this id.
pub type AccountId = i64;

/// Worker identity as reported on lease and progress calls.
pub type WorkerId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
