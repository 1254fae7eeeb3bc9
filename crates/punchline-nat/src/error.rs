//! Error types for STUN probing, NAT classification, and hole punching.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// STUN transaction errors
#[derive(Debug, Error)]
pub enum StunError {
    /// I/O error on the probe socket
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No matching response arrived before the deadline
    #[error("no STUN response from {0} within deadline")]
    Timeout(SocketAddr),

    /// A matching response arrived but carried no usable IPv4 mapping
    #[error("STUN response from {0} carried no usable mapped address")]
    NoUsableResponse(SocketAddr),

    /// Server host did not resolve to an IPv4 address
    #[error("could not resolve STUN server {0} to an IPv4 address")]
    Resolve(String),

    /// Message shorter than the 20-byte header
    #[error("STUN message too short")]
    MessageTooShort,

    /// Header magic cookie mismatch
    #[error("invalid STUN magic cookie")]
    InvalidMagicCookie,

    /// Unsupported method or class bits
    #[error("invalid STUN message type")]
    InvalidMessageType,

    /// Attribute value malformed or unsupported address family
    #[error("invalid STUN attribute")]
    InvalidAttribute,
}

impl StunError {
    /// Whether the caller may reasonably retry against another server
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::NoUsableResponse(_) | Self::Resolve(_)
        )
    }
}

/// NAT classification errors
#[derive(Debug, Error)]
pub enum NatError {
    /// Classifier configured without STUN servers
    #[error("no STUN servers configured")]
    NoServers,

    /// Server entry is not `host:port`
    #[error("invalid STUN server address: {0}")]
    InvalidServer(String),

    /// The first probe failed, so nothing can be inferred
    #[error("STUN probe failed: {0}")]
    Stun(#[from] StunError),

    /// Socket setup failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Hole punching errors
#[derive(Debug, Error)]
pub enum PunchError {
    /// No acknowledgement within the connection timeout
    #[error("no punch acknowledgement from {remote} within {after:?}")]
    Timeout {
        /// Target endpoint
        remote: SocketAddr,
        /// Elapsed deadline
        after: Duration,
    },

    /// The remote actively refused the connection
    #[error("connection to {0} refused")]
    Refused(SocketAddr),

    /// Transport-level failure
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    /// Every predicted port fell outside the valid range
    #[error("no valid candidate ports around {0}")]
    NoCandidates(u16),

    /// The link failed after establishment (keep-alive send error or close)
    #[error("link closed")]
    Closed,
}

impl PunchError {
    /// Whether the error came from an elapsed deadline
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
