//! NAT behavior classification from STUN probe results.
//!
//! The classification is a best-effort heuristic derived from three mappings
//! observed on one socket (two against the primary server, one against the
//! secondary). It is not protocol-certified NAT typing in the RFC 5780 sense.

use crate::error::NatError;
use crate::packet::{ControlPacket, PacketKind, PunchToken};
use crate::stun;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Largest port step still considered predictable
pub const PREDICTABLE_DELTA: i32 = 10;

/// NAT type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NatType {
    /// No NAT: the mapped port equals the bound port
    Open,
    /// Same mapping for every destination
    FullCone,
    /// Mapping varies per destination
    Symmetric,
    /// Best-effort default when neither cone nor symmetric behavior is clear
    PortRestricted,
    /// Not enough probe results to decide
    Unknown,
}

impl NatType {
    /// Whether hole punching is expected to struggle with this type
    #[must_use]
    pub fn is_symmetric(self) -> bool {
        self == Self::Symmetric
    }
}

impl fmt::Display for NatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::FullCone => "full-cone",
            Self::Symmetric => "symmetric",
            Self::PortRestricted => "port-restricted",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Detected NAT behavior, immutable once computed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NatInfo {
    /// Classified NAT type
    #[serde(rename = "type")]
    pub nat_type: NatType,
    /// Public endpoint reported by the first probe
    pub public_address: SocketAddr,
    /// Whether a datagram sent to our own public endpoint came back
    pub hairpinning: bool,
    /// Whether consecutive mappings advance by a small constant step
    pub port_predictable: bool,
    /// Port step between the last two mappings, when observed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_delta: Option<i32>,
    /// Local address the probes were sent from
    #[serde(skip)]
    pub local_address: Option<SocketAddr>,
}

impl NatInfo {
    /// Info for a host known to be reachable at `public_address` without NAT
    #[must_use]
    pub fn open(public_address: SocketAddr) -> Self {
        Self {
            nat_type: NatType::Open,
            public_address,
            hairpinning: true,
            port_predictable: true,
            port_delta: Some(0),
            local_address: Some(public_address),
        }
    }

    /// Step to use when predicting this host's next mapping
    #[must_use]
    pub fn predicted_increment(&self) -> Option<i32> {
        self.port_delta
            .filter(|delta| *delta != 0 && delta.abs() < PREDICTABLE_DELTA)
    }
}

/// Apply the classification rules to three complete probe results
///
/// Rules, in priority order:
/// 1. first mapped port equals `local_port` → [`NatType::Open`]
/// 2. all three mappings identical → [`NatType::FullCone`]
/// 3. both primary probes agree, secondary differs → [`NatType::Symmetric`]
/// 4. otherwise → [`NatType::PortRestricted`]
#[must_use]
pub fn classify(local_port: u16, mappings: &[SocketAddr; 3]) -> NatType {
    let [first, second, third] = mappings;

    if first.port() == local_port {
        NatType::Open
    } else if first == second && second == third {
        NatType::FullCone
    } else if first == second {
        NatType::Symmetric
    } else {
        NatType::PortRestricted
    }
}

/// Port steps between consecutive mappings
#[must_use]
pub fn port_deltas(mappings: &[SocketAddr; 3]) -> (i32, i32) {
    let [a, b, c] = mappings.map(|addr| i32::from(addr.port()));
    (b - a, c - b)
}

/// Both steps small and equal
#[must_use]
pub fn is_port_predictable(mappings: &[SocketAddr; 3]) -> bool {
    let (d1, d2) = port_deltas(mappings);
    d1.abs() < PREDICTABLE_DELTA && d2.abs() < PREDICTABLE_DELTA && d1 == d2
}

/// Classifier configuration
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// STUN servers as `host:port`, primary first
    pub stun_servers: Vec<String>,
    /// Local address the probe socket binds to
    pub bind_addr: SocketAddr,
    /// Deadline for each Binding transaction
    pub probe_timeout: Duration,
    /// How long to wait for the hairpin datagram
    pub hairpin_timeout: Duration,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun.l.google.com:19302".to_string(),
                "stun1.l.google.com:19302".to_string(),
            ],
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            probe_timeout: stun::DEFAULT_TIMEOUT,
            hairpin_timeout: Duration::from_secs(5),
        }
    }
}

/// Runs the probe sequence and derives [`NatInfo`]
pub struct NatClassifier {
    config: ClassifierConfig,
}

impl NatClassifier {
    /// Create a classifier
    #[must_use]
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    /// Bind a probe socket and classify
    ///
    /// # Errors
    ///
    /// Returns an error if no servers are configured, the socket cannot be
    /// bound, or the first probe fails.
    pub async fn detect(&self) -> Result<NatInfo, NatError> {
        let socket = crate::socket::reusable_udp(self.config.bind_addr)?;
        self.detect_on(&socket).await
    }

    /// Classify using an already bound socket
    ///
    /// # Errors
    ///
    /// See [`NatClassifier::detect`].
    pub async fn detect_on(&self, socket: &UdpSocket) -> Result<NatInfo, NatError> {
        let primary = self
            .config
            .stun_servers
            .first()
            .ok_or(NatError::NoServers)?;
        let primary = self.resolve(primary).await?;
        let secondary = match self.config.stun_servers.get(1) {
            Some(server) => match self.resolve(server).await {
                Ok(addr) => Some(addr),
                Err(e) => {
                    warn!("secondary STUN server unusable: {e}");
                    None
                }
            },
            None => {
                warn!("only one STUN server configured; symmetric mappings cannot be detected");
                Some(primary)
            }
        };

        let local_addr = socket.local_addr()?;
        let timeout = self.config.probe_timeout;

        let first = stun::probe_addr(socket, primary, timeout).await?;
        let second = self.optional_probe(socket, primary).await;
        let third = match secondary {
            Some(server) => self.optional_probe(socket, server).await,
            None => None,
        };

        let (nat_type, port_predictable, port_delta) = match (second, third) {
            (Some(second), Some(third)) => {
                let mappings = [first, second, third];
                (
                    classify(local_addr.port(), &mappings),
                    is_port_predictable(&mappings),
                    Some(port_deltas(&mappings).1),
                )
            }
            _ if first.port() == local_addr.port() => (NatType::Open, false, None),
            _ => (NatType::Unknown, false, None),
        };

        let hairpinning = self.test_hairpin(socket, first).await;

        let info = NatInfo {
            nat_type,
            public_address: first,
            hairpinning,
            port_predictable,
            port_delta,
            local_address: Some(local_addr),
        };
        info!(
            "NAT classified as {} (public {}, hairpin {}, predictable {})",
            info.nat_type, info.public_address, info.hairpinning, info.port_predictable
        );
        Ok(info)
    }

    async fn resolve(&self, server: &str) -> Result<SocketAddr, NatError> {
        let (host, port) = split_host_port(server)?;
        Ok(stun::resolve_ipv4(host, port).await?)
    }

    async fn optional_probe(&self, socket: &UdpSocket, server: SocketAddr) -> Option<SocketAddr> {
        match stun::probe_addr(socket, server, self.config.probe_timeout).await {
            Ok(mapped) => Some(mapped),
            Err(e) => {
                debug!("follow-up STUN probe to {server} failed: {e}");
                None
            }
        }
    }

    /// Send a tagged datagram to our own public endpoint and wait for it
    async fn test_hairpin(&self, socket: &UdpSocket, public: SocketAddr) -> bool {
        let probe = ControlPacket::new(PacketKind::Hairpin, PunchToken::random());
        if let Err(e) = socket.send_to(&probe.encode(), public).await {
            debug!("hairpin send to {public} failed: {e}");
            return false;
        }

        let deadline = Instant::now() + self.config.hairpin_timeout;
        let mut buf = [0u8; 1500];
        loop {
            match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, _))) => {
                    if ControlPacket::decode(&buf[..len]) == Some(probe) {
                        return true;
                    }
                }
                Ok(Err(e)) if stun::is_transient(&e) => {}
                Ok(Err(e)) => {
                    debug!("hairpin receive failed: {e}");
                    return false;
                }
                Err(_) => return false,
            }
        }
    }
}

/// Split `host:port`, rejecting a missing or zero port
///
/// # Errors
///
/// Returns [`NatError::InvalidServer`] when the entry is malformed.
pub fn split_host_port(server: &str) -> Result<(&str, u16), NatError> {
    let invalid = || NatError::InvalidServer(server.to_string());
    let (host, port) = server.rsplit_once(':').ok_or_else(invalid)?;
    let port: u16 = port.parse().map_err(|_| invalid())?;
    if host.is_empty() || port == 0 {
        return Err(invalid());
    }
    Ok((host.trim_start_matches('[').trim_end_matches(']'), port))
}
