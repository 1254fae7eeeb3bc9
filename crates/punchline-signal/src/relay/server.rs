//! Relay server for forwarding datagrams between clients.

use super::MAX_RELAY_PACKET_SIZE;
use super::protocol::{ClientId, RelayErrorCode, RelayMessage};
use crate::error::RelayError;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone)]
struct ClientConnection {
    addr: SocketAddr,
    last_seen: Instant,
}

impl ClientConnection {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            last_seen: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    fn is_alive(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() < timeout
    }
}

/// Registered clients, indexed both ways
#[derive(Debug, Default)]
struct Clients {
    by_id: HashMap<ClientId, ClientConnection>,
    by_addr: HashMap<SocketAddr, ClientId>,
}

impl Clients {
    fn insert(&mut self, id: ClientId, addr: SocketAddr) {
        if let Some(previous) = self.by_addr.insert(addr, id.clone()) {
            if previous != id {
                self.by_id.remove(&previous);
            }
        }
        if let Some(old) = self.by_id.insert(id, ClientConnection::new(addr)) {
            if old.addr != addr {
                self.by_addr.remove(&old.addr);
            }
        }
    }

    fn remove_addr(&mut self, addr: SocketAddr) -> Option<ClientId> {
        let id = self.by_addr.remove(&addr)?;
        self.by_id.remove(&id);
        Some(id)
    }

    fn retain_alive(&mut self, timeout: Duration) -> usize {
        let before = self.by_id.len();
        self.by_id.retain(|_, client| client.is_alive(timeout));
        let by_id = &self.by_id;
        self.by_addr.retain(|_, id| by_id.contains_key(id));
        before - self.by_id.len()
    }
}

/// Fixed-window rate limiter keyed by client
struct RateLimiter {
    limit: usize,
    counts: HashMap<ClientId, (Instant, usize)>,
    window: Duration,
}

impl RateLimiter {
    fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            counts: HashMap::new(),
            window,
        }
    }

    fn check(&mut self, client: &str) -> bool {
        let now = Instant::now();
        let entry = self
            .counts
            .entry(client.to_string())
            .or_insert((now, 0));

        if now.duration_since(entry.0) >= self.window {
            *entry = (now, 0);
        }
        if entry.1 >= self.limit {
            return false;
        }
        entry.1 += 1;
        true
    }

    fn cleanup(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.counts
            .retain(|_, (start, _)| now.duration_since(*start) < window * 2);
    }
}

/// Stops the sweep when the serving future ends or is dropped
struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Maximum number of concurrent clients
    pub max_clients: usize,
    /// Packets forwarded per client per second
    pub rate_limit: usize,
    /// Idle time after which a client is dropped
    pub client_timeout: Duration,
    /// Period of the stale-client sweep
    pub cleanup_interval: Duration,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            max_clients: 10_000,
            rate_limit: 100,
            client_timeout: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(30),
        }
    }
}

/// DERP-style datagram relay
pub struct RelayServer {
    local_addr: SocketAddr,
    clients: Arc<RwLock<Clients>>,
    socket: Arc<UdpSocket>,
    rate_limiter: Arc<RwLock<RateLimiter>>,
    config: RelayServerConfig,
    relay_id: u64,
}

impl RelayServer {
    /// Bind with the default configuration
    ///
    /// # Errors
    ///
    /// Returns error if socket binding fails.
    pub async fn bind(bind_addr: SocketAddr) -> Result<Self, RelayError> {
        Self::bind_with_config(bind_addr, RelayServerConfig::default()).await
    }

    /// Bind with a custom configuration
    ///
    /// # Errors
    ///
    /// Returns error if socket binding fails.
    pub async fn bind_with_config(
        bind_addr: SocketAddr,
        config: RelayServerConfig,
    ) -> Result<Self, RelayError> {
        let socket = UdpSocket::bind(bind_addr).await?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            local_addr,
            clients: Arc::new(RwLock::new(Clients::default())),
            socket: Arc::new(socket),
            rate_limiter: Arc::new(RwLock::new(RateLimiter::new(
                config.rate_limit,
                Duration::from_secs(1),
            ))),
            config,
            relay_id: rand::random(),
        })
    }

    /// Forward datagrams until the task is cancelled
    ///
    /// # Errors
    ///
    /// Never returns under normal operation; receive errors are logged.
    pub async fn run(&self) -> Result<(), RelayError> {
        info!(
            "datagram relay listening on {} (id {:016x})",
            self.local_addr, self.relay_id
        );
        let _cleanup = AbortOnDrop(self.spawn_cleanup_task());
        let mut buf = vec![0u8; MAX_RELAY_PACKET_SIZE];

        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, from)) => match RelayMessage::from_bytes(&buf[..len]) {
                    Ok(msg) => self.handle_message(msg, from).await,
                    Err(e) => {
                        debug!("malformed relay datagram from {from}: {e}");
                        self.send_error(from, RelayErrorCode::InvalidMessage, "malformed")
                            .await;
                    }
                },
                Err(e) if super::is_transient(&e) => continue,
                Err(e) => {
                    warn!("relay receive failed: {e}");
                    return Err(e.into());
                }
            }
        }
    }

    async fn handle_message(&self, msg: RelayMessage, from: SocketAddr) {
        match msg {
            RelayMessage::Register { client_id } => self.handle_register(client_id, from).await,
            RelayMessage::SendPacket { dest_id, payload } => {
                let sender = self.clients.read().await.by_addr.get(&from).cloned();
                match sender {
                    Some(src_id) => self.handle_send_packet(src_id, dest_id, payload, from).await,
                    None => {
                        self.send_error(from, RelayErrorCode::NotRegistered, "not registered")
                            .await;
                    }
                }
            }
            RelayMessage::Keepalive => {
                let mut clients = self.clients.write().await;
                if let Some(id) = clients.by_addr.get(&from).cloned() {
                    if let Some(client) = clients.by_id.get_mut(&id) {
                        client.touch();
                    }
                }
            }
            RelayMessage::Disconnect => {
                if let Some(id) = self.clients.write().await.remove_addr(from) {
                    info!("relay client {id} disconnected");
                }
            }
            other => debug!("ignoring {} from {from}", other.message_type()),
        }
    }

    async fn handle_register(&self, client_id: ClientId, from: SocketAddr) {
        let mut clients = self.clients.write().await;
        if clients.by_id.len() >= self.config.max_clients && !clients.by_id.contains_key(&client_id)
        {
            drop(clients);
            self.send_error(from, RelayErrorCode::ServerFull, "server at capacity")
                .await;
            return;
        }

        info!("relay client {client_id} registered from {from}");
        clients.insert(client_id, from);
        drop(clients);

        self.send(
            from,
            &RelayMessage::RegisterAck {
                relay_id: self.relay_id,
            },
        )
        .await;
    }

    async fn handle_send_packet(
        &self,
        src_id: ClientId,
        dest_id: ClientId,
        payload: Vec<u8>,
        from: SocketAddr,
    ) {
        if !self.rate_limiter.write().await.check(&src_id) {
            self.send_error(from, RelayErrorCode::RateLimited, "rate limit exceeded")
                .await;
            return;
        }

        let dest_addr = {
            let mut clients = self.clients.write().await;
            if let Some(sender) = clients.by_id.get_mut(&src_id) {
                sender.touch();
            }
            clients.by_id.get(&dest_id).map(|client| client.addr)
        };

        match dest_addr {
            Some(addr) => {
                trace!("relaying {} bytes {src_id} -> {dest_id}", payload.len());
                self.send(addr, &RelayMessage::RecvPacket { src_id, payload })
                    .await;
            }
            None => {
                self.send_error(from, RelayErrorCode::PeerNotFound, &dest_id)
                    .await;
            }
        }
    }

    async fn send(&self, addr: SocketAddr, msg: &RelayMessage) {
        match msg.to_bytes() {
            Ok(bytes) => {
                if let Err(e) = self.socket.send_to(&bytes, addr).await {
                    debug!("relay send to {addr} failed: {e}");
                }
            }
            Err(e) => warn!("failed to encode {}: {e}", msg.message_type()),
        }
    }

    async fn send_error(&self, addr: SocketAddr, code: RelayErrorCode, message: &str) {
        let error = RelayMessage::Error {
            code,
            message: message.to_string(),
        };
        self.send(addr, &error).await;
    }

    fn spawn_cleanup_task(&self) -> tokio::task::JoinHandle<()> {
        let clients = self.clients.clone();
        let rate_limiter = self.rate_limiter.clone();
        let timeout = self.config.client_timeout;
        let interval = self.config.cleanup_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let expired = clients.write().await.retain_alive(timeout);
                if expired > 0 {
                    info!("relay expired {expired} idle clients");
                }
                rate_limiter.write().await.cleanup();
            }
        })
    }

    /// Number of registered clients
    pub async fn client_count(&self) -> usize {
        self.clients.read().await.by_id.len()
    }

    /// Bound address
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Relay instance identifier
    #[must_use]
    pub fn relay_id(&self) -> u64 {
        self.relay_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_server_config_default() {
        let config = RelayServerConfig::default();
        assert_eq!(config.max_clients, 10_000);
        assert_eq!(config.rate_limit, 100);
        assert_eq!(config.client_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_rate_limiter() {
        let mut limiter = RateLimiter::new(3, Duration::from_secs(1));
        assert!(limiter.check("a"));
        assert!(limiter.check("a"));
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));
        assert!(limiter.check("b"));
    }

    #[test]
    fn test_clients_reregister_moves_address() {
        let first: SocketAddr = "127.0.0.1:1000".parse().unwrap();
        let second: SocketAddr = "127.0.0.1:2000".parse().unwrap();
        let mut clients = Clients::default();

        clients.insert("a".into(), first);
        clients.insert("a".into(), second);
        assert_eq!(clients.by_id.len(), 1);
        assert!(!clients.by_addr.contains_key(&first));

        // Same address taking a new identity drops the old one
        clients.insert("b".into(), second);
        assert_eq!(clients.by_id.len(), 1);
        assert_eq!(clients.by_addr.get(&second).map(String::as_str), Some("b"));

        assert_eq!(clients.remove_addr(second).as_deref(), Some("b"));
        assert!(clients.by_id.is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_sender_rejected() {
        let server = Arc::new(
            RelayServer::bind("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap(),
        );
        let addr = server.local_addr();
        let running = server.clone();
        tokio::spawn(async move { running.run().await });
        assert_eq!(server.client_count().await, 0);

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let packet = RelayMessage::SendPacket {
            dest_id: "nobody".into(),
            payload: vec![1],
        };
        socket.send_to(&packet.to_bytes().unwrap(), addr).await.unwrap();

        let mut buf = vec![0u8; 1024];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            RelayMessage::from_bytes(&buf[..len]).unwrap(),
            RelayMessage::Error {
                code: RelayErrorCode::NotRegistered,
                ..
            }
        ));
    }
}
