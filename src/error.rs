use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// A specialized [`Result`] type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Failure while decoding a binary metadata blob.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The input ended inside a varint, or the varint ran past the 10-byte limit.
    #[error("malformed varint at offset {offset}")]
    MalformedVarint { offset: usize },

    /// A tag or length frame points outside the blob.
    #[error("malformed binary field at offset {offset}: {reason}")]
    MalformedBinaryField { offset: usize, reason: &'static str },
}

/// The error type for all engine operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The data directory does not exist or is not a directory.
    #[error("data directory not found: {}", .0.display())]
    RootNotFound(PathBuf),

    /// A shard could not be opened or queried.
    #[error("shard unreadable: {}: {source}", path.display())]
    ShardUnreadable {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// A binary metadata blob could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// A free-text conversation query matched more than one conversation.
    #[error("'{query}' matches {} conversations: {}", candidates.len(), candidates.join(", "))]
    AmbiguousConversationQuery {
        query: String,
        candidates: Vec<String>,
    },

    /// The requested conversation does not exist in any shard.
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    /// The stream was stopped through its cancellation token.
    #[error("aggregation cancelled")]
    Cancelled,

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl EngineError {
    /// Returns `true` for failures that are scoped to one shard or one record.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ShardUnreadable { .. } | Self::Decode(_))
    }
}
