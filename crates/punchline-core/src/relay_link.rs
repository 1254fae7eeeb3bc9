//! Peer path through the datagram relay.
//!
//! Both sides register an attempt-scoped identity (`<peerId>/<attemptId>`)
//! and run the same punch / punch-ack exchange as a UDP hole punch, only
//! carried inside relay packets. The handshake proves the other side is
//! registered before any application data flows.

use crate::error::CoordinatorError;
use punchline_nat::{ControlPacket, LinkHealth, PacketKind, PunchToken};
use punchline_signal::RelayError;
use punchline_signal::relay::{RELAY_KEEPALIVE_INTERVAL, RelayClient};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Relay identity for `peer_id` within `attempt`
#[must_use]
pub fn relay_identity(peer_id: &str, attempt: &str) -> String {
    format!("{peer_id}/{attempt}")
}

/// Established relayed path to a peer
#[derive(Debug)]
pub struct RelayLink {
    client: Arc<RelayClient>,
    peer: String,
    token: PunchToken,
    local: SocketAddr,
    keepalive: JoinHandle<()>,
    health: Arc<LinkHealth>,
}

impl RelayLink {
    /// Register as `local_id` and handshake with `peer_id` within `timeout`
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Timeout`] if the peer never answers, or the
    /// registration failure.
    pub async fn open(
        relay: SocketAddr,
        local_id: String,
        peer_id: String,
        token: PunchToken,
        punch_interval: Duration,
        timeout: Duration,
    ) -> Result<Self, CoordinatorError> {
        let mut client = RelayClient::connect(relay, local_id).await?;
        client.register().await?;
        let client = Arc::new(client);
        let local = client.local_addr()?;

        let handshake = time::timeout(
            timeout,
            handshake(&client, &peer_id, token, punch_interval),
        )
        .await
        .unwrap_or(Err(RelayError::Timeout(timeout).into()));

        if let Err(e) = handshake {
            debug!("relay handshake with {peer_id} failed: {e}");
            if let Err(e) = client.disconnect().await {
                trace!("relay disconnect failed: {e}");
            }
            return Err(e);
        }

        info!("relay path to {peer_id} via {relay} established");
        let health = Arc::new(LinkHealth::default());
        let keepalive = spawn_keepalive(client.clone(), health.clone(), RELAY_KEEPALIVE_INTERVAL);
        Ok(Self {
            client,
            peer: peer_id,
            token,
            local,
            keepalive,
            health,
        })
    }

    /// Local socket address towards the relay
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Relay server address
    #[must_use]
    pub fn relay_addr(&self) -> SocketAddr {
        self.client.relay_addr()
    }

    /// Remote relay identity
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Whether the keep-alive is still running
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.health.is_failed() && !self.keepalive.is_finished()
    }

    /// Failure flag that trips when the keep-alive stops
    #[must_use]
    pub fn health(&self) -> Arc<LinkHealth> {
        self.health.clone()
    }

    /// Send application data
    ///
    /// # Errors
    ///
    /// Returns the relay client's send error.
    pub async fn send(&self, data: &[u8]) -> Result<(), RelayError> {
        self.client.send_to_peer(&self.peer, data).await
    }

    /// Receive the next application payload from the peer
    ///
    /// Late punches are acknowledged; packets from other identities are
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Closed`] once the relay client has stopped.
    pub async fn recv(&self) -> Result<Vec<u8>, RelayError> {
        loop {
            let (src, payload) = self.client.recv_from_peer().await?;
            if src != self.peer {
                trace!("dropping relay packet from {src}");
                continue;
            }
            match ControlPacket::decode(&payload) {
                Some(packet) if packet.matches(&self.token) => {
                    if packet.kind == PacketKind::Punch {
                        let ack = ControlPacket::new(PacketKind::PunchAck, self.token).encode();
                        self.client.send_to_peer(&self.peer, &ack).await?;
                    }
                }
                _ => return Ok(payload),
            }
        }
    }

    /// Stop the keep-alive and leave the relay
    pub async fn close(&self) {
        self.keepalive.abort();
        self.health.fail();
        if let Err(e) = self.client.disconnect().await {
            debug!("relay disconnect for {} failed: {e}", self.client.client_id());
        }
    }
}

impl Drop for RelayLink {
    fn drop(&mut self) {
        self.keepalive.abort();
        self.health.fail();
    }
}

async fn handshake(
    client: &RelayClient,
    peer: &str,
    token: PunchToken,
    interval: Duration,
) -> Result<(), CoordinatorError> {
    let punch = ControlPacket::new(PacketKind::Punch, token).encode();
    let ack = ControlPacket::new(PacketKind::PunchAck, token).encode();
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                client.send_to_peer(peer, &punch).await?;
                trace!("relay punch -> {peer}");
            }
            received = client.recv_from_peer() => {
                let (src, payload) = received?;
                if src != peer {
                    continue;
                }
                let Some(packet) = ControlPacket::decode(&payload) else {
                    continue;
                };
                if !packet.matches(&token) {
                    continue;
                }
                match packet.kind {
                    PacketKind::Punch => {
                        client.send_to_peer(peer, &ack).await?;
                        return Ok(());
                    }
                    PacketKind::PunchAck => return Ok(()),
                    PacketKind::Keepalive | PacketKind::Hairpin => {}
                }
            }
        }
    }
}

fn spawn_keepalive(
    client: Arc<RelayClient>,
    health: Arc<LinkHealth>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = client.keepalive().await {
                warn!("relay keep-alive for {} failed: {e}", client.client_id());
                health.fail();
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use punchline_signal::relay::RelayServer;

    async fn relay() -> SocketAddr {
        let server = Arc::new(RelayServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let addr = server.local_addr();
        tokio::spawn(async move { server.run().await });
        addr
    }

    #[tokio::test]
    async fn test_both_sides_handshake_and_exchange() {
        let relay = relay().await;
        let token = PunchToken::random();
        let interval = Duration::from_millis(50);
        let timeout = Duration::from_secs(5);

        let alice = tokio::spawn(RelayLink::open(
            relay,
            relay_identity("alice", "a1"),
            relay_identity("bob", "a1"),
            token,
            interval,
            timeout,
        ));
        let bob = RelayLink::open(
            relay,
            relay_identity("bob", "a1"),
            relay_identity("alice", "a1"),
            token,
            interval,
            timeout,
        )
        .await
        .unwrap();
        let alice = alice.await.unwrap().unwrap();
        assert_eq!(alice.peer(), "bob/a1");
        assert_eq!(alice.relay_addr(), relay);
        assert!(alice.is_alive());

        alice.send(b"through the relay").await.unwrap();
        let payload = time::timeout(Duration::from_secs(2), bob.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, b"through the relay");

        let health = bob.health();
        bob.close().await;
        assert!(health.is_failed());
        time::sleep(Duration::from_millis(20)).await;
        assert!(!bob.is_alive());
    }

    #[tokio::test]
    async fn test_absent_peer_times_out() {
        let relay = relay().await;
        let result = RelayLink::open(
            relay,
            relay_identity("alice", "a2"),
            relay_identity("nobody", "a2"),
            PunchToken::random(),
            Duration::from_millis(50),
            Duration::from_millis(300),
        )
        .await;
        assert!(matches!(
            result,
            Err(CoordinatorError::Relay(RelayError::Timeout(_)))
        ));
    }
}
