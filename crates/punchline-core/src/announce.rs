//! Punch announcements exchanged through the signaling relay.
//!
//! Carried as `signal` payloads:
//!
//! ```json
//! { "kind": "punch-attempt", "attempt": "9f2c41d07ab3e655", "method": "udp-hole-punch",
//!   "token": "<32 hex digits>", "endpoint": "198.51.100.4:40000", "nat": { ... } }
//! { "kind": "punch-cancel", "attempt": "9f2c41d07ab3e655" }
//! ```

use crate::attempt::{Attempt, AttemptId};
use crate::strategy::ConnectionMethod;
use punchline_nat::{NatInfo, PunchToken};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;

/// Punch coordination payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PunchSignal {
    /// The sender is starting `method`; the receiver should run its half
    #[serde(rename_all = "camelCase")]
    PunchAttempt {
        /// Attempt id, shared by both halves
        attempt: AttemptId,
        /// Strategy
        method: ConnectionMethod,
        /// Hex-encoded punch token
        token: String,
        /// Sender's public endpoint
        endpoint: SocketAddr,
        /// Sender's NAT behavior
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nat: Option<NatInfo>,
        /// Relay the sender uses for `turn-relay`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        relay: Option<SocketAddr>,
    },
    /// The sender gave up on, or no longer needs, an attempt
    #[serde(rename_all = "camelCase")]
    PunchCancel {
        /// Attempt id
        attempt: AttemptId,
    },
}

impl PunchSignal {
    /// Announcement for `attempt`
    #[must_use]
    pub fn announce(
        attempt: &Attempt,
        endpoint: SocketAddr,
        nat: &NatInfo,
        relay: Option<SocketAddr>,
    ) -> Self {
        Self::PunchAttempt {
            attempt: attempt.id().to_string(),
            method: attempt.method(),
            token: attempt.token().to_hex(),
            endpoint,
            nat: Some(nat.clone()),
            relay,
        }
    }

    /// Cancellation for attempt `id`
    #[must_use]
    pub fn cancel(id: &str) -> Self {
        Self::PunchCancel {
            attempt: id.to_string(),
        }
    }

    /// Parse a `signal` payload, `None` for unrelated payloads
    #[must_use]
    pub fn parse(payload: &Value) -> Option<Self> {
        serde_json::from_value(payload.clone()).ok()
    }

    /// Decoded token of an announcement
    #[must_use]
    pub fn token(&self) -> Option<PunchToken> {
        match self {
            Self::PunchAttempt { token, .. } => PunchToken::from_hex(token),
            Self::PunchCancel { .. } => None,
        }
    }

    /// Payload to send
    ///
    /// # Errors
    ///
    /// Returns the JSON encoding error.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}
