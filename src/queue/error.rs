//! Queue error types.

use std::fmt;

/// Errors that can occur during queue operations.
#[derive(Debug)]
pub enum QueueError {
    /// IO error from a disk-backed store
    Io(std::io::Error),
    /// Storage backend error
    Storage(String),
    /// The queue id is not known to the store
    UnknownQueue(String),
    /// The store has been shut down
    Closed,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::Storage(e) => write!(f, "storage error: {}", e),
            Self::UnknownQueue(id) => write!(f, "unknown queue: {}", id),
            Self::Closed => write!(f, "queue store closed"),
        }
    }
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for QueueError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;
