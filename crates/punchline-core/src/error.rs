//! Coordinator error types.

use crate::attempt::AttemptPhase;
use crate::connection::ConnectionId;
use crate::strategy::ConnectionMethod;
use punchline_nat::{NatError, PunchError};
use punchline_signal::{RelayError, SignalError};
use std::fmt;
use thiserror::Error;

/// Why a single strategy failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyFailure {
    /// Strategy that was tried
    pub method: ConnectionMethod,
    /// Rendered error
    pub reason: String,
}

impl fmt::Display for StrategyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.method, self.reason)
    }
}

fn list(failures: &[StrategyFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Coordinator errors
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Peer is not in any room we share
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// `register_peer` has not completed
    #[error("not registered with the signaling relay")]
    NotRegistered,

    /// Peer never published a usable public endpoint
    #[error("peer {0} has not published a public endpoint")]
    MissingEndpoint(String),

    /// Symmetric pair refused under the fail-fast policy
    #[error("no viable strategy for {0}: both sides are behind symmetric NAT and no relay is configured")]
    NoViableStrategy(String),

    /// Every strategy was tried and none connected
    #[error("all strategies failed for {peer_id}: {}", list(.failures))]
    AllStrategiesFailed {
        /// Target peer
        peer_id: String,
        /// One entry per attempted strategy, in the order they finished
        failures: Vec<StrategyFailure>,
    },

    /// Attempt phase machine violated
    #[error("invalid attempt transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// Current phase
        from: AttemptPhase,
        /// Requested phase
        to: AttemptPhase,
    },

    /// Relay strategy selected without a relay address
    #[error("no relay server configured")]
    NoRelay,

    /// Unknown connection id
    #[error("connection {0} not found")]
    ConnectionNotFound(ConnectionId),

    /// Connection was closed
    #[error("connection closed")]
    Closed,

    /// Signaling failure
    #[error("signaling error: {0}")]
    Signal(#[from] SignalError),

    /// NAT detection failure
    #[error("NAT detection failed: {0}")]
    Nat(#[from] NatError),

    /// Hole punching failure
    #[error("hole punch failed: {0}")]
    Punch(#[from] PunchError),

    /// Datagram relay failure
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),

    /// Malformed punch signal
    #[error("invalid punch signal: {0}")]
    Codec(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoordinatorError {
    /// Whether the caller can reasonably retry `connect_to_peer`
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AllStrategiesFailed { .. } | Self::Punch(_) | Self::Relay(_) | Self::Io(_)
        )
    }
}
