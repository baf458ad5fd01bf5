/// Marketplace account identifier (the seller's `unb` user id).
pub type AccountId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
