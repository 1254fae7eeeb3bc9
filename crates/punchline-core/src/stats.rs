//! Connection statistics and health reporting.

use crate::strategy::ConnectionMethod;
use punchline_nat::NatType;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealthStatus {
    /// Signaling up and NAT behavior known
    Healthy,

    /// Signaling up but the NAT type could not be determined, so strategy
    /// ranking is guesswork
    Degraded,

    /// Signaling relay unreachable; no new connections can be coordinated
    Unhealthy,
}

/// Health snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Overall status
    pub status: HealthStatus,
    /// Whether the signaling connection is open
    pub signaling_connected: bool,
    /// Local NAT type
    pub nat_type: NatType,
    /// Open connections
    pub active_connections: usize,
    /// Attempts still running
    pub pending_attempts: usize,
    /// Seconds since start
    pub uptime_secs: u64,
}

impl HealthReport {
    /// Derive the status from its inputs
    #[must_use]
    pub fn status_for(signaling_connected: bool, nat_type: NatType) -> HealthStatus {
        if !signaling_connected {
            HealthStatus::Unhealthy
        } else if nat_type == NatType::Unknown {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Counters snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStats {
    /// Strategy attempts started as initiator
    pub attempts: u64,
    /// `connect_to_peer` calls that produced a connection
    pub successes: u64,
    /// `connect_to_peer` calls that failed
    pub failures: u64,
    /// Connections accepted as responder
    pub accepted: u64,
    /// Successful connections per method, both roles
    pub by_method: HashMap<ConnectionMethod, u64>,
    /// Mean time from first announcement to established connection
    pub mean_time_to_connect_ms: Option<u64>,
    /// Open connections
    pub active_connections: usize,
}

/// Running counters
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    attempts: u64,
    successes: u64,
    failures: u64,
    accepted: u64,
    by_method: HashMap<ConnectionMethod, u64>,
    connect_time: Duration,
}

impl StatsRecorder {
    pub(crate) fn attempt_started(&mut self) {
        self.attempts += 1;
    }

    pub(crate) fn connected(&mut self, method: ConnectionMethod, took: Duration) {
        self.successes += 1;
        self.connect_time += took;
        *self.by_method.entry(method).or_default() += 1;
    }

    pub(crate) fn accepted(&mut self, method: ConnectionMethod) {
        self.accepted += 1;
        *self.by_method.entry(method).or_default() += 1;
    }

    pub(crate) fn failed(&mut self) {
        self.failures += 1;
    }

    pub(crate) fn snapshot(&self, active_connections: usize) -> CoordinatorStats {
        let mean_time_to_connect_ms = (self.successes > 0).then(|| {
            let mean = self.connect_time.as_millis() / u128::from(self.successes);
            u64::try_from(mean).unwrap_or(u64::MAX)
        });
        CoordinatorStats {
            attempts: self.attempts,
            successes: self.successes,
            failures: self.failures,
            accepted: self.accepted,
            by_method: self.by_method.clone(),
            mean_time_to_connect_ms,
            active_connections,
        }
    }
}
