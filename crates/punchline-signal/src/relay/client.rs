//! Relay client implementation for connecting to relay servers.

use super::RELAY_CONNECT_TIMEOUT;
use super::protocol::{ClientId, RelayErrorCode, RelayMessage};
use crate::error::RelayError;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

/// Type alias for the message receiver
type MessageReceiver = Arc<Mutex<mpsc::UnboundedReceiver<(ClientId, Vec<u8>)>>>;

/// Relay client state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayClientState {
    /// Disconnected from relay
    Disconnected,
    /// Socket ready, not registered
    Connecting,
    /// Registration sent
    Registering,
    /// Connected and registered
    Connected,
    /// Relay rejected us or the socket failed
    Error,
}

/// Client of a [`RelayServer`](super::RelayServer)
#[derive(Debug)]
pub struct RelayClient {
    client_id: ClientId,
    relay_addr: SocketAddr,
    socket: Arc<UdpSocket>,
    state: Arc<Mutex<RelayClientState>>,
    rx: MessageReceiver,
    tx: mpsc::UnboundedSender<(ClientId, Vec<u8>)>,
    last_keepalive: Arc<Mutex<Instant>>,
    receiver: Option<JoinHandle<()>>,
}

impl RelayClient {
    /// Open a socket towards the relay at `addr`
    ///
    /// # Errors
    ///
    /// Returns error if the local socket cannot be bound.
    pub async fn connect(
        addr: SocketAddr,
        client_id: impl Into<ClientId>,
    ) -> Result<Self, RelayError> {
        let local = if addr.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            client_id: client_id.into(),
            relay_addr: addr,
            socket: Arc::new(socket),
            state: Arc::new(Mutex::new(RelayClientState::Connecting)),
            rx: Arc::new(Mutex::new(rx)),
            tx,
            last_keepalive: Arc::new(Mutex::new(Instant::now())),
            receiver: None,
        })
    }

    /// Register with the relay and start the receive task
    ///
    /// Returns the relay instance identifier.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Timeout`] if no acknowledgement arrives, or the
    /// relay's rejection.
    pub async fn register(&mut self) -> Result<u64, RelayError> {
        if let Some(receiver) = self.receiver.take() {
            receiver.abort();
        }
        *self.state.lock().await = RelayClientState::Registering;
        let msg = RelayMessage::Register {
            client_id: self.client_id.clone(),
        };
        self.socket.send(&msg.to_bytes()?).await?;

        let outcome = time::timeout(RELAY_CONNECT_TIMEOUT, self.await_ack())
            .await
            .unwrap_or(Err(RelayError::Timeout(RELAY_CONNECT_TIMEOUT)));

        match outcome {
            Ok(relay_id) => {
                *self.state.lock().await = RelayClientState::Connected;
                *self.last_keepalive.lock().await = Instant::now();
                info!(
                    "registered with relay {} as {} (relay {relay_id:016x})",
                    self.relay_addr, self.client_id
                );
                self.spawn_receiver();
                Ok(relay_id)
            }
            Err(e) => {
                *self.state.lock().await = RelayClientState::Error;
                Err(e)
            }
        }
    }

    /// Send a packet to another client through the relay
    ///
    /// # Errors
    ///
    /// Returns error if send fails or client not registered.
    pub async fn send_to_peer(&self, dest: &str, data: &[u8]) -> Result<(), RelayError> {
        if *self.state.lock().await != RelayClientState::Connected {
            return Err(RelayError::NotRegistered);
        }

        let msg = RelayMessage::SendPacket {
            dest_id: dest.to_string(),
            payload: data.to_vec(),
        };
        self.socket.send(&msg.to_bytes()?).await?;
        Ok(())
    }

    /// Receive the next packet forwarded by the relay
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Closed`] once the receive task has stopped.
    pub async fn recv_from_peer(&self) -> Result<(ClientId, Vec<u8>), RelayError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(RelayError::Closed)
    }

    /// Send keepalive message to maintain registration
    ///
    /// # Errors
    ///
    /// Returns error if send fails.
    pub async fn keepalive(&self) -> Result<(), RelayError> {
        let bytes = RelayMessage::Keepalive.to_bytes()?;
        self.socket.send(&bytes).await?;
        *self.last_keepalive.lock().await = Instant::now();
        Ok(())
    }

    /// Send a keepalive if `interval` has passed since the last one
    ///
    /// # Errors
    ///
    /// Returns error if keepalive send fails.
    pub async fn maybe_keepalive(&self, interval: Duration) -> Result<(), RelayError> {
        let last = *self.last_keepalive.lock().await;
        if last.elapsed() >= interval {
            self.keepalive().await?;
        }
        Ok(())
    }

    /// Leave the relay
    ///
    /// # Errors
    ///
    /// Returns error if disconnect message fails to send.
    pub async fn disconnect(&self) -> Result<(), RelayError> {
        let bytes = RelayMessage::Disconnect.to_bytes()?;
        self.socket.send(&bytes).await?;
        *self.state.lock().await = RelayClientState::Disconnected;
        Ok(())
    }

    /// Current client state
    pub async fn state(&self) -> RelayClientState {
        *self.state.lock().await
    }

    /// Relay server address
    #[must_use]
    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    /// Local socket address
    ///
    /// # Errors
    ///
    /// Returns error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.socket.local_addr()?)
    }

    /// Identifier registered with the relay
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn await_ack(&self) -> Result<u64, RelayError> {
        let mut buf = vec![0u8; super::MAX_RELAY_PACKET_SIZE];
        loop {
            let len = self.socket.recv(&mut buf).await?;
            match RelayMessage::from_bytes(&buf[..len]) {
                Ok(RelayMessage::RegisterAck { relay_id }) => return Ok(relay_id),
                Ok(RelayMessage::Error { code, message }) => return Err(code.into_error(message)),
                Ok(other) => debug!("ignoring {} while registering", other.message_type()),
                Err(e) => debug!("ignoring malformed relay datagram: {e}"),
            }
        }
    }

    fn spawn_receiver(&mut self) {
        let socket = self.socket.clone();
        let tx = self.tx.clone();
        let state = self.state.clone();

        self.receiver = Some(tokio::spawn(async move {
            let mut buf = vec![0u8; super::MAX_RELAY_PACKET_SIZE];

            loop {
                match socket.recv(&mut buf).await {
                    Ok(len) => match RelayMessage::from_bytes(&buf[..len]) {
                        Ok(RelayMessage::RecvPacket { src_id, payload }) => {
                            let _ = tx.send((src_id, payload));
                        }
                        // The destination may not have registered yet
                        Ok(RelayMessage::Error {
                            code: RelayErrorCode::PeerNotFound,
                            message,
                        }) => debug!("relay has no client {message}"),
                        Ok(RelayMessage::Error { code, message }) => {
                            warn!("relay error {code:?}: {message}");
                            if code == RelayErrorCode::NotRegistered {
                                *state.lock().await = RelayClientState::Error;
                            }
                        }
                        Ok(_) => {}
                        Err(e) => debug!("ignoring malformed relay datagram: {e}"),
                    },
                    Err(e) if super::is_transient(&e) => continue,
                    Err(e) => {
                        warn!("relay receive failed: {e}");
                        *state.lock().await = RelayClientState::Error;
                        break;
                    }
                }
            }
        }));
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            receiver.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{RelayServer, RelayServerConfig};

    async fn relay(config: RelayServerConfig) -> (Arc<RelayServer>, SocketAddr) {
        let server = Arc::new(
            RelayServer::bind_with_config("127.0.0.1:0".parse().unwrap(), config)
                .await
                .unwrap(),
        );
        let addr = server.local_addr();
        let running = server.clone();
        tokio::spawn(async move { running.run().await });
        (server, addr)
    }

    #[tokio::test]
    async fn test_packets_forwarded_both_ways() {
        let (server, addr) = relay(RelayServerConfig::default()).await;
        let mut alice = RelayClient::connect(addr, "alice").await.unwrap();
        let mut bob = RelayClient::connect(addr, "bob").await.unwrap();
        assert_eq!(alice.state().await, RelayClientState::Connecting);
        assert!(alice.local_addr().unwrap().port() != 0);

        let relay_id = alice.register().await.unwrap();
        assert_eq!(relay_id, server.relay_id());
        bob.register().await.unwrap();
        assert_eq!(server.client_count().await, 2);

        alice.send_to_peer("bob", b"ping").await.unwrap();
        let (from, payload) = time::timeout(Duration::from_secs(2), bob.recv_from_peer())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, "alice");
        assert_eq!(payload, b"ping");

        bob.send_to_peer("alice", b"pong").await.unwrap();
        let (from, _) = time::timeout(Duration::from_secs(2), alice.recv_from_peer())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, "bob");

        bob.disconnect().await.unwrap();
        assert_eq!(bob.state().await, RelayClientState::Disconnected);
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.client_count().await, 1);
    }

    #[tokio::test]
    async fn test_send_requires_registration() {
        let (_server, addr) = relay(RelayServerConfig::default()).await;
        let client = RelayClient::connect(addr, "early").await.unwrap();
        assert!(matches!(
            client.send_to_peer("bob", b"x").await,
            Err(RelayError::NotRegistered)
        ));
        assert_eq!(client.relay_addr(), addr);
        assert_eq!(client.client_id(), "early");
    }

    #[tokio::test]
    async fn test_register_rejected_when_full() {
        let (_server, addr) = relay(RelayServerConfig {
            max_clients: 1,
            ..RelayServerConfig::default()
        })
        .await;
        let mut first = RelayClient::connect(addr, "first").await.unwrap();
        first.register().await.unwrap();

        let mut second = RelayClient::connect(addr, "second").await.unwrap();
        assert!(matches!(second.register().await, Err(RelayError::ServerFull)));
        assert_eq!(second.state().await, RelayClientState::Error);
    }

    #[tokio::test]
    async fn test_idle_clients_expire() {
        let (server, addr) = relay(RelayServerConfig {
            client_timeout: Duration::from_millis(100),
            cleanup_interval: Duration::from_millis(50),
            ..RelayServerConfig::default()
        })
        .await;
        let mut client = RelayClient::connect(addr, "idle").await.unwrap();
        client.register().await.unwrap();
        assert_eq!(server.client_count().await, 1);

        time::sleep(Duration::from_millis(400)).await;
        assert_eq!(server.client_count().await, 0);
    }
}
