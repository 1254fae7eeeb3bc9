//! Datagram relay message definitions.

use crate::error::RelayError;
use serde::{Deserialize, Serialize};

/// Relay client identifier
pub type ClientId = String;

/// Relay protocol messages, one per UDP datagram
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum RelayMessage {
    /// Client registers its identifier for the sending address
    Register {
        /// Identifier other clients address packets to
        client_id: ClientId,
    },

    /// Relay acknowledges registration
    RegisterAck {
        /// Relay instance identifier
        relay_id: u64,
    },

    /// Client sends a packet to another client through the relay
    SendPacket {
        /// Destination client
        dest_id: ClientId,
        /// Opaque payload
        payload: Vec<u8>,
    },

    /// Relay forwards a packet to its recipient
    RecvPacket {
        /// Source client
        src_id: ClientId,
        /// Opaque payload
        payload: Vec<u8>,
    },

    /// Refreshes the client's liveness
    Keepalive,

    /// Client leaves the relay
    Disconnect,

    /// Relay error response
    Error {
        /// Error code
        code: RelayErrorCode,
        /// Subject of the error (for `PeerNotFound`, the destination)
        message: String,
    },
}

/// Relay error codes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RelayErrorCode {
    /// Client not registered with relay
    NotRegistered = 1,
    /// Destination client not found
    PeerNotFound = 2,
    /// Rate limit exceeded
    RateLimited = 3,
    /// Invalid message format
    InvalidMessage = 4,
    /// Server at capacity
    ServerFull = 5,
}

impl RelayMessage {
    /// Serialize message to bytes
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Codec`] if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, RelayError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize message from bytes
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Codec`] for malformed datagrams.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RelayError> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Get the message type name
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Register { .. } => "Register",
            Self::RegisterAck { .. } => "RegisterAck",
            Self::SendPacket { .. } => "SendPacket",
            Self::RecvPacket { .. } => "RecvPacket",
            Self::Keepalive => "Keepalive",
            Self::Disconnect => "Disconnect",
            Self::Error { .. } => "Error",
        }
    }
}

impl RelayErrorCode {
    /// Typed error for a relay `Error` message
    #[must_use]
    pub fn into_error(self, message: String) -> RelayError {
        match self {
            Self::NotRegistered => RelayError::NotRegistered,
            Self::PeerNotFound => RelayError::PeerNotFound(message),
            Self::RateLimited => RelayError::RateLimited,
            Self::InvalidMessage => RelayError::InvalidMessage,
            Self::ServerFull => RelayError::ServerFull,
        }
    }
}
