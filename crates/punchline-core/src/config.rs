//! Coordinator configuration.

use punchline_nat::{ClassifierConfig, NatInfo, PunchConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// How strategies are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackMode {
    /// One strategy at a time, in rank order, stopping at the first success
    #[default]
    Sequential,
    /// All strategies at once; the first success wins and the rest are cancelled
    Parallel,
}

/// What to do when both peers are behind symmetric NAT and no relay exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SymmetricPolicy {
    /// Warn about the low success rate and punch anyway
    #[default]
    AttemptPunch,
    /// Refuse with [`NoViableStrategy`](crate::CoordinatorError::NoViableStrategy)
    FailFast,
}

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Signaling relay WebSocket URL
    pub signaling_url: String,

    /// Local address punch sockets bind to
    ///
    /// Port 0 means "the port NAT detection ran on".
    pub bind_addr: SocketAddr,

    /// Endpoint to publish instead of the detected public address
    pub advertised_endpoint: Option<SocketAddr>,

    /// Pre-detected NAT behavior; skips STUN detection when set
    pub nat_override: Option<NatInfo>,

    /// Strategy execution mode
    pub fallback_mode: FallbackMode,

    /// Symmetric-symmetric handling
    pub symmetric_policy: SymmetricPolicy,

    /// Delay between announcing an attempt and starting it, so the remote
    /// side can begin its half
    pub attempt_grace: Duration,

    /// Deadline for signaling round-trips
    pub signaling_timeout: Duration,

    /// Datagram relay used by the `turn-relay` strategy
    pub relay_server: Option<SocketAddr>,

    /// Hole punching timings
    pub punch: PunchConfig,

    /// NAT detection settings
    pub classifier: ClassifierConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://127.0.0.1:8080".to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            advertised_endpoint: None,
            nat_override: None,
            fallback_mode: FallbackMode::Sequential,
            symmetric_policy: SymmetricPolicy::AttemptPunch,
            attempt_grace: Duration::from_millis(200),
            signaling_timeout: Duration::from_secs(10),
            relay_server: None,
            punch: PunchConfig::default(),
            classifier: ClassifierConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.fallback_mode, FallbackMode::Sequential);
        assert_eq!(config.symmetric_policy, SymmetricPolicy::AttemptPunch);
        assert_eq!(config.punch.connection_timeout, Duration::from_secs(30));
        assert!(config.relay_server.is_none());
        assert!(config.nat_override.is_none());
    }

    #[test]
    fn test_mode_names() {
        let mode: FallbackMode = serde_json::from_str("\"parallel\"").unwrap();
        assert_eq!(mode, FallbackMode::Parallel);
        let policy: SymmetricPolicy = serde_json::from_str("\"fail-fast\"").unwrap();
        assert_eq!(policy, SymmetricPolicy::FailFast);
    }
}
