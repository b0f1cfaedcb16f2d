use thiserror::Error;

/// Errors that abort the replication process entirely. Anything recoverable
/// (a transient driver error, an ignorable write error) is handled where it
/// occurs and never surfaces as one of these.
#[derive(Error, Debug)]
pub enum ReplError {
    #[error("oplog window is empty: source has no retained history")]
    EmptyOplogWindow,

    #[error(
        "checkpoint {checkpoint} is older than the oldest retained oplog entry {oldest}: history \
         was truncated, a resnapshot is required"
    )]
    OplogTruncated { checkpoint: i64, oldest: i64 },

    #[error("document has no _id and no documentKey, cannot build an identity filter")]
    MissingIdentity,

    #[error("oplog entry has unsupported diff version (expected 2): {0:?}")]
    UnsupportedDiffVersion(Option<i32>),

    #[error("malformed diff document: {0}")]
    MalformedDiff(String),

    #[error("config validation failed: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Mongo(#[from] mongodb::error::Error),

    #[error(transparent)]
    Bson(#[from] bson::ser::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ReplError>;
