use thiserror::Error;

use crate::session::{MediaKind, Uid};

/// Error types for the room controller
#[derive(Debug, Error)]
pub enum RoomError {
    /// Session errors
    #[error("Failed to connect to session: {0}")]
    Connection(String),

    #[error("Failed to subscribe to {kind} of {uid}: {reason}")]
    Subscription {
        uid: Uid,
        kind: MediaKind,
        reason: String,
    },

    #[error("Session not joined")]
    NotJoined,

    #[error("Session already joined as {0}")]
    AlreadyJoined(Uid),

    #[error("Room session closed")]
    SessionClosed,

    /// Local device errors
    #[error("Failed to capture local media: {0}")]
    Media(String),

    /// Membership directory errors
    #[error("Membership directory error: {0}")]
    Directory(String),

    /// Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Missing required configuration: {0}")]
    MissingConfiguration(String),

    #[error("Failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic errors
    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results using RoomError
pub type Result<T> = std::result::Result<T, RoomError>;

impl RoomError {
    pub fn internal(msg: impl Into<String>) -> Self {
        RoomError::Internal(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        RoomError::Connection(msg.into())
    }

    pub fn directory(msg: impl Into<String>) -> Self {
        RoomError::Directory(msg.into())
    }

    pub fn subscription(uid: &Uid, kind: MediaKind, reason: impl Into<String>) -> Self {
        RoomError::Subscription {
            uid: uid.clone(),
            kind,
            reason: reason.into(),
        }
    }
}

impl From<reqwest::Error> for RoomError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RoomError::Timeout(format!("directory request: {}", err))
        } else {
            RoomError::Directory(err.to_string())
        }
    }
}
