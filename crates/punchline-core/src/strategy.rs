//! Connection strategy ranking.
//!
//! Strategies are ranked by an estimated success probability derived from
//! both peers' NAT types. The estimates are heuristics; they only decide the
//! order in which the coordinator tries things.

use crate::config::SymmetricPolicy;
use crate::error::CoordinatorError;
use punchline_nat::NatType;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// How a connection was (or will be) established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionMethod {
    /// Simultaneous UDP punch, or a birthday attack against a symmetric NAT
    UdpHolePunch,
    /// TCP simultaneous open with passive-connect fallback
    TcpHolePunch,
    /// Datagrams forwarded by the relay server
    TurnRelay,
    /// Plain TCP connect, both sides unNAT'd
    Direct,
}

impl ConnectionMethod {
    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UdpHolePunch => "udp-hole-punch",
            Self::TcpHolePunch => "tcp-hole-punch",
            Self::TurnRelay => "turn-relay",
            Self::Direct => "direct",
        }
    }

    /// Whether the method goes through a third party
    #[must_use]
    pub fn is_relayed(self) -> bool {
        self == Self::TurnRelay
    }
}

impl fmt::Display for ConnectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A ranked connection method
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Strategy {
    /// Method to attempt
    pub method: ConnectionMethod,
    /// Heuristic success estimate in `0.0..=1.0`
    pub estimated_success_probability: f64,
}

impl Strategy {
    const fn new(method: ConnectionMethod, estimated_success_probability: f64) -> Self {
        Self {
            method,
            estimated_success_probability,
        }
    }
}

fn udp_estimate(local: NatType, remote: NatType) -> f64 {
    use NatType::{FullCone, Open, PortRestricted, Symmetric, Unknown};
    match (local, remote) {
        (Symmetric, Symmetric) => 0.05,
        (Symmetric, _) | (_, Symmetric) => 0.4,
        (Open | FullCone, Open | FullCone) => 0.95,
        (Unknown, _) | (_, Unknown) => 0.6,
        (PortRestricted, _) | (_, PortRestricted) => 0.8,
    }
}

fn tcp_estimate(local: NatType, remote: NatType) -> f64 {
    use NatType::{FullCone, Open, Symmetric};
    match (local, remote) {
        (Open, Open) => 0.9,
        (Symmetric, _) | (_, Symmetric) => 0.1,
        (Open | FullCone, Open | FullCone) => 0.6,
        _ => 0.3,
    }
}

/// Every applicable strategy for a peer pair, best first
///
/// - UDP hole punching is always present; when both sides are symmetric it
///   stays in the list as a low-priority last resort.
/// - TCP hole punching is always present.
/// - The relay is added, ranked highest, when one is available.
/// - Direct connect is added only when both sides are [`NatType::Open`].
#[must_use]
pub fn get_all_strategies(local: NatType, remote: NatType, relay_available: bool) -> Vec<Strategy> {
    let mut strategies = vec![
        Strategy::new(ConnectionMethod::UdpHolePunch, udp_estimate(local, remote)),
        Strategy::new(ConnectionMethod::TcpHolePunch, tcp_estimate(local, remote)),
    ];
    if relay_available {
        strategies.push(Strategy::new(ConnectionMethod::TurnRelay, 0.99));
    }
    if local == NatType::Open && remote == NatType::Open {
        strategies.push(Strategy::new(ConnectionMethod::Direct, 0.98));
    }

    strategies.sort_by(|a, b| {
        b.estimated_success_probability
            .total_cmp(&a.estimated_success_probability)
    });
    strategies
}

/// Strategies the coordinator will actually run for `peer_id`
///
/// Applies `policy` when both sides are symmetric and nothing but punching
/// is available.
///
/// # Errors
///
/// Returns [`CoordinatorError::NoViableStrategy`] under
/// [`SymmetricPolicy::FailFast`] for a symmetric pair without a relay.
pub fn select_strategies(
    peer_id: &str,
    local: NatType,
    remote: NatType,
    relay_available: bool,
    policy: SymmetricPolicy,
) -> Result<Vec<Strategy>, CoordinatorError> {
    if local.is_symmetric() && remote.is_symmetric() && !relay_available {
        match policy {
            SymmetricPolicy::AttemptPunch => {
                warn!(
                    "both sides of {peer_id} are behind symmetric NAT and no relay is configured; \
                     hole punching has a low success rate"
                );
            }
            SymmetricPolicy::FailFast => {
                return Err(CoordinatorError::NoViableStrategy(peer_id.to_string()));
            }
        }
    }
    Ok(get_all_strategies(local, remote, relay_available))
}
