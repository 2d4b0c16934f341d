/// Member id inside a replica group (the `_id` of a member document).
pub type NodeId = u32;

/// Replica group id, which doubles as the replica set name and shard name.
pub type GroupId = String;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
