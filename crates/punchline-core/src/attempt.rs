//! Per-attempt phase tracking.
//!
//! ```text
//! Pending ──► Punching ──► Connected
//!    │           │
//!    └──► Relaying ──► Failed
//! ```
//!
//! `Connected` and `Failed` are terminal. Nothing retries a failed attempt.

use crate::error::CoordinatorError;
use crate::strategy::ConnectionMethod;
use punchline_nat::PunchToken;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Attempt phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptPhase {
    /// Announced, not started
    Pending,
    /// Punching or connecting directly
    Punching,
    /// Handshaking through the relay
    Relaying,
    /// Path established
    Connected,
    /// Gave up
    Failed,
}

impl AttemptPhase {
    /// Whether no further transition is allowed
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Connected | Self::Failed)
    }

    /// Whether `self -> next` is a legal transition
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use AttemptPhase::{Connected, Failed, Pending, Punching, Relaying};
        matches!(
            (self, next),
            (Pending, Punching | Relaying | Failed) | (Punching | Relaying, Connected | Failed)
        )
    }

    /// Working phase for `method`
    #[must_use]
    pub fn active_for(method: ConnectionMethod) -> Self {
        if method.is_relayed() {
            Self::Relaying
        } else {
            Self::Punching
        }
    }
}

/// Attempt identifier, shared with the remote side
pub type AttemptId = String;

/// One strategy being tried against one peer
#[derive(Debug, Clone)]
pub struct Attempt {
    id: AttemptId,
    peer_id: String,
    method: ConnectionMethod,
    token: PunchToken,
    phase: AttemptPhase,
    started: Instant,
}

impl Attempt {
    /// New pending attempt with a fresh id and token
    #[must_use]
    pub fn new(peer_id: &str, method: ConnectionMethod) -> Self {
        Self {
            id: hex::encode(rand::random::<[u8; 8]>()),
            peer_id: peer_id.to_string(),
            method,
            token: PunchToken::random(),
            phase: AttemptPhase::Pending,
            started: Instant::now(),
        }
    }

    /// Attempt id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Target peer
    #[must_use]
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Strategy in use
    #[must_use]
    pub fn method(&self) -> ConnectionMethod {
        self.method
    }

    /// Token both sides punch with
    #[must_use]
    pub fn token(&self) -> PunchToken {
        self.token
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> AttemptPhase {
        self.phase
    }

    /// Time since creation
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Move to `next`
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::InvalidTransition`] for an illegal move,
    /// leaving the phase unchanged.
    pub fn advance(&mut self, next: AttemptPhase) -> Result<(), CoordinatorError> {
        if !self.phase.can_transition_to(next) {
            return Err(CoordinatorError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        Ok(())
    }

    /// Snapshot for reporting
    #[must_use]
    pub fn status(&self) -> AttemptStatus {
        AttemptStatus {
            id: self.id.clone(),
            peer_id: self.peer_id.clone(),
            method: self.method,
            phase: self.phase,
            elapsed_ms: u64::try_from(self.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Reported state of an in-flight attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptStatus {
    /// Attempt id
    pub id: AttemptId,
    /// Target peer
    pub peer_id: String,
    /// Strategy
    pub method: ConnectionMethod,
    /// Current phase
    pub phase: AttemptPhase,
    /// Milliseconds since the attempt was created
    pub elapsed_ms: u64,
}
