use std::sync::PoisonError;
use crossbeam::channel::{RecvError, SendError};
use thiserror::Error;
use tokio::task::JoinError;
use crate::execution::ResponsePath;
use crate::record::CacheKey;

/// Failure to turn stored record text back into a [`crate::Record`].
///
/// Cloneable so that a per-row outcome can be cached by the batch loader and
/// handed to every reader that asks for the same key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordCodecError {
    #[error("record {key} is not valid UTF-8/JSON: {reason}")]
    InvalidRecordEncoding { key: CacheKey, reason: String },

    #[error("record {key} does not decode to a JSON object")]
    InvalidRecordShape { key: CacheKey },

    #[error("record {key} has an unclassifiable value in field {field}")]
    InvalidRecordValue { key: CacheKey, field: String },
}

impl RecordCodecError {
    pub fn key(&self) -> &CacheKey {
        match self {
            RecordCodecError::InvalidRecordEncoding { key, .. } => key,
            RecordCodecError::InvalidRecordShape { key } => key,
            RecordCodecError::InvalidRecordValue { key, .. } => key,
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {

    #[error("missing value at {path}")]
    MissingValue { path: ResponsePath },

    #[error("object of type {actual} is not a {expected}")]
    InvalidObjectType { expected: String, actual: String },

    #[error("unexpected value at {path}, expected {expected}")]
    UnexpectedValue { path: ResponsePath, expected: &'static str },

    #[error("root record {0} not found")]
    MissingRoot(CacheKey),

    #[error("codec error: {0}")]
    Codec(#[from] RecordCodecError),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("redb compaction error: {0}")]
    RedbCompaction(#[from] redb::CompactionError),

    #[error("serde error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Join: {0}")]
    JoinError(#[from] JoinError),

    #[error("Recv: {0}")]
    RecvError(#[from] RecvError),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl CacheError {
    pub fn custom(msg: impl Into<String>) -> Self {
        CacheError::Custom(msg.into())
    }

    /// Resolution errors fail a subtree and null-bubble; everything else aborts the execution.
    pub fn is_resolution_error(&self) -> bool {
        matches!(
            self,
            CacheError::MissingValue { .. } | CacheError::InvalidObjectType { .. } | CacheError::UnexpectedValue { .. }
        )
    }
}

impl<T> From<SendError<T>> for CacheError
{
    fn from(e: SendError<T>) -> Self {
        CacheError::Custom(format!("send error: {:?}", e.to_string()))
    }
}

impl<T> From<PoisonError<T>> for CacheError
{
    fn from(e: PoisonError<T>) -> Self {
        CacheError::Custom(format!("Poison error: {:?}", e.to_string()))
    }
}
