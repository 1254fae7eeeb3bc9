//! Error types for signaling and datagram relaying.

use crate::signaling::protocol::ErrorCode;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Signaling client and server errors
#[derive(Debug, Error)]
pub enum SignalError {
    /// Directed target is not registered with the relay
    #[error("peer {0} is not registered")]
    PeerNotFound(String),

    /// Request sent before `register`
    #[error("not registered with the signaling relay")]
    NotRegistered,

    /// Peer is not a member of the room
    #[error("not a member of room {0}")]
    NotInRoom(String),

    /// Room does not exist
    #[error("room {0} does not exist")]
    RoomNotFound(String),

    /// No answer within the deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        /// What was being waited for
        operation: &'static str,
        /// Deadline that elapsed
        after: Duration,
    },

    /// Connection to the relay is gone
    #[error("signaling connection closed")]
    Closed,

    /// WebSocket transport failure
    #[error("transport error: {0}")]
    Transport(#[from] Box<tungstenite::Error>),

    /// Malformed JSON
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Any other relay-side rejection
    #[error("rejected by relay ({code}): {message}")]
    Rejected {
        /// Wire error code
        code: ErrorCode,
        /// Relay description
        message: String,
    },

    /// Socket error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SignalError {
    /// Map a relay `error` message onto the typed variant
    #[must_use]
    pub fn from_code(code: ErrorCode, message: String, subject: Option<&str>) -> Self {
        let subject = subject.unwrap_or_default().to_string();
        match code {
            ErrorCode::PeerNotFound => Self::PeerNotFound(subject),
            ErrorCode::NotRegistered => Self::NotRegistered,
            ErrorCode::NotInRoom => Self::NotInRoom(subject),
            ErrorCode::RoomNotFound => Self::RoomNotFound(subject),
            code => Self::Rejected { code, message },
        }
    }
}

impl From<tungstenite::Error> for SignalError {
    fn from(err: tungstenite::Error) -> Self {
        Self::Transport(Box::new(err))
    }
}

/// Datagram relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    /// Message encoding failed
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// Socket error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No answer within the deadline
    #[error("relay did not answer within {0:?}")]
    Timeout(Duration),

    /// Client has not registered
    #[error("client not registered with relay")]
    NotRegistered,

    /// Destination not registered
    #[error("relay peer {0} not found")]
    PeerNotFound(String),

    /// Too many packets
    #[error("rate limited by relay")]
    RateLimited,

    /// Unexpected message
    #[error("invalid relay message")]
    InvalidMessage,

    /// Relay at capacity
    #[error("relay server full")]
    ServerFull,

    /// Receiver task has stopped
    #[error("relay client closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_code_maps_typed_variants() {
        let err = SignalError::from_code(ErrorCode::PeerNotFound, "gone".into(), Some("bob"));
        assert!(matches!(err, SignalError::PeerNotFound(ref id) if id == "bob"));

        let err = SignalError::from_code(ErrorCode::ServerFull, "full".into(), None);
        assert_eq!(err.to_string(), "rejected by relay (server-full): full");
    }

    #[test]
    fn test_timeout_display() {
        let err = SignalError::Timeout {
            operation: "register",
            after: Duration::from_secs(10),
        };
        assert_eq!(err.to_string(), "register timed out after 10s");
        assert_eq!(
            RelayError::PeerNotFound("a/1".into()).to_string(),
            "relay peer a/1 not found"
        );
    }
}
