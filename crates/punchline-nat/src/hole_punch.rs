//! UDP Hole Punching
//!
//! Both peers bind the port they advertised and fire tagged punch datagrams
//! at each other's public endpoint. Whoever hears the other first answers
//! with an acknowledgement; a received punch or acknowledgement carrying the
//! attempt token completes the handshake.
//!
//! For symmetric NATs the [`HolePuncher::birthday_attack`] fans out over a
//! handful of predicted ports and keeps the first that answers.

use crate::error::PunchError;
use crate::packet::{ControlPacket, PacketKind, PunchToken};
use crate::socket::{reusable_udp, unspecified_for};
use crate::stun::is_transient;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Maximum datagram read size
const RECV_BUFFER: usize = 65536;

/// Hole punching configuration
#[derive(Debug, Clone)]
pub struct PunchConfig {
    /// Deadline for one punch attempt
    pub connection_timeout: Duration,
    /// Spacing of punch datagrams
    pub punch_interval: Duration,
    /// Spacing of keep-alive datagrams on an established link
    pub keepalive_interval: Duration,
    /// Deadline for each TCP connect
    pub tcp_connect_timeout: Duration,
    /// Default port step for birthday candidates
    pub birthday_increment: i32,
}

impl Default for PunchConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(30),
            punch_interval: Duration::from_millis(500),
            keepalive_interval: Duration::from_secs(25),
            tcp_connect_timeout: Duration::from_secs(10),
            birthday_increment: 1,
        }
    }
}

/// Hole puncher for UDP and TCP NAT traversal
#[derive(Debug, Clone, Default)]
pub struct HolePuncher {
    pub(crate) config: PunchConfig,
}

impl HolePuncher {
    /// Create a hole puncher
    #[must_use]
    pub fn new(config: PunchConfig) -> Self {
        Self { config }
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &PunchConfig {
        &self.config
    }

    /// Punch from `local` towards `remote`
    ///
    /// A fresh socket is bound to `local` with address reuse. It is closed
    /// on every failure path.
    ///
    /// # Errors
    ///
    /// - [`PunchError::Timeout`] if no punch or acknowledgement carrying
    ///   `token` arrives within the connection timeout
    /// - [`PunchError::Socket`] if binding or sending fails
    pub async fn udp_punch(
        &self,
        local: SocketAddr,
        remote: SocketAddr,
        token: PunchToken,
    ) -> Result<UdpLink, PunchError> {
        let socket = reusable_udp(local)?;
        debug!(
            "UDP punch {} -> {remote} (token {token:?})",
            socket.local_addr()?
        );
        self.punch_on(socket, remote, token).await
    }

    async fn punch_on(
        &self,
        socket: UdpSocket,
        remote: SocketAddr,
        token: PunchToken,
    ) -> Result<UdpLink, PunchError> {
        let timeout = self.config.connection_timeout;
        let deadline = Instant::now() + timeout;
        let punch = ControlPacket::new(PacketKind::Punch, token).encode();
        let ack = ControlPacket::new(PacketKind::PunchAck, token).encode();

        let mut ticker = time::interval(self.config.punch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; RECV_BUFFER];

        loop {
            tokio::select! {
                () = time::sleep_until(deadline) => {
                    debug!("UDP punch to {remote} timed out after {timeout:?}");
                    return Err(PunchError::Timeout { remote, after: timeout });
                }
                _ = ticker.tick() => {
                    socket.send_to(&punch, remote).await?;
                    trace!("punch -> {remote}");
                }
                received = socket.recv_from(&mut buf) => {
                    let (len, from) = match received {
                        Ok(received) => received,
                        Err(e) if is_transient(&e) => continue,
                        Err(e) => return Err(e.into()),
                    };

                    let Some(packet) = ControlPacket::decode(&buf[..len]) else {
                        trace!("ignoring {len} foreign bytes from {from}");
                        continue;
                    };
                    if !packet.matches(&token) {
                        continue;
                    }

                    match packet.kind {
                        PacketKind::Punch => {
                            socket.send_to(&ack, from).await?;
                        }
                        PacketKind::PunchAck => {}
                        PacketKind::Keepalive | PacketKind::Hairpin => continue,
                    }

                    info!("UDP hole punched to {from}");
                    return Ok(UdpLink::establish(socket, from, token, self.config.keepalive_interval));
                }
            }
        }
    }

    /// Punch a symmetric NAT by racing predicted ports
    ///
    /// Candidates are derived from the reported port with
    /// [`birthday_candidates`]. Each gets its own ephemeral socket; the first
    /// to complete wins and the rest are aborted, their sockets closed.
    ///
    /// # Errors
    ///
    /// Returns [`PunchError::NoCandidates`] if no candidate lies in the
    /// valid port range, or the last attempt's error if all fail.
    pub async fn birthday_attack(
        &self,
        remote: SocketAddr,
        increment: i32,
        token: PunchToken,
    ) -> Result<UdpLink, PunchError> {
        let candidates = birthday_candidates(remote.port(), increment);
        if candidates.is_empty() {
            return Err(PunchError::NoCandidates(remote.port()));
        }
        debug!("birthday attack on {} via ports {candidates:?}", remote.ip());

        let local = unspecified_for(remote);
        let mut attempts = JoinSet::new();
        for port in candidates {
            let puncher = self.clone();
            let target = SocketAddr::new(remote.ip(), port);
            attempts.spawn(async move { puncher.udp_punch(local, target, token).await });
        }

        let mut last_error = None;
        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok(Ok(link)) => {
                    attempts.abort_all();
                    info!("birthday attack matched {}", link.remote_addr());
                    return Ok(link);
                }
                Ok(Err(e)) => {
                    trace!("birthday candidate failed: {e}");
                    last_error = Some(e);
                }
                Err(e) => trace!("birthday candidate task ended: {e}"),
            }
        }

        Err(last_error.unwrap_or(PunchError::Timeout {
            remote,
            after: self.config.connection_timeout,
        }))
    }
}

/// Predicted ports for a symmetric mapping
///
/// `+increment`, `+2·increment`, `-increment`, `+10`, `+100` from the
/// reported port, dropping values outside `1..=65535` and duplicates.
#[must_use]
pub fn birthday_candidates(reported: u16, increment: i32) -> Vec<u16> {
    let base = i32::from(reported);
    let raw = [
        base + increment,
        base + 2 * increment,
        base - increment,
        base + 10,
        base + 100,
    ];

    let mut ports = Vec::with_capacity(raw.len());
    for candidate in raw {
        if let Ok(port) = u16::try_from(candidate) {
            if port != 0 && !ports.contains(&port) {
                ports.push(port);
            }
        }
    }
    ports
}

/// Keep-alive timer bound 1:1 to an established UDP link
///
/// The task is aborted when the handle is cancelled or dropped. A send
/// failure marks the link failed and stops the timer.
#[derive(Debug)]
pub struct KeepAlive {
    task: JoinHandle<()>,
    state: Arc<LinkHealth>,
}

/// Shared failure flag of an established link
///
/// Set once by whichever side notices the link is gone (a keep-alive
/// send error, a data send error, or a shutdown) and never cleared.
#[derive(Debug, Default)]
pub struct LinkHealth {
    failed: AtomicBool,
    notify: Notify,
}

impl LinkHealth {
    /// Mark the link failed and wake every waiter
    pub fn fail(&self) {
        self.failed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Whether the link has failed
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Resolve once the link has failed
    pub async fn failed(&self) {
        loop {
            // Registered before the check so a concurrent `fail` is not lost
            let notified = self.notify.notified();
            if self.is_failed() {
                return;
            }
            notified.await;
        }
    }
}

impl KeepAlive {
    fn spawn(
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
        token: PunchToken,
        interval: Duration,
    ) -> Self {
        let state = Arc::new(LinkHealth::default());
        let task_state = state.clone();
        let packet = ControlPacket::new(PacketKind::Keepalive, token).encode();

        let task = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = socket.send_to(&packet, remote).await {
                    warn!("keep-alive to {remote} failed, closing link: {e}");
                    task_state.fail();
                    break;
                }
                trace!("keep-alive -> {remote}");
            }
        });

        Self { task, state }
    }

    /// Stop the timer
    pub fn cancel(&self) {
        self.task.abort();
    }

    /// Whether a keep-alive send has failed
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.state.is_failed()
    }

    /// Failure flag shared with the link
    #[must_use]
    pub fn health(&self) -> Arc<LinkHealth> {
        self.state.clone()
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.task.abort();
        self.state.fail();
    }
}

/// Established UDP path to a peer
///
/// Control datagrams carrying the attempt token are consumed internally:
/// late punches are acknowledged and keep-alives are dropped.
#[derive(Debug)]
pub struct UdpLink {
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    remote: SocketAddr,
    token: PunchToken,
    keepalive: KeepAlive,
}

impl UdpLink {
    fn establish(
        socket: UdpSocket,
        remote: SocketAddr,
        token: PunchToken,
        keepalive_interval: Duration,
    ) -> Self {
        let local = socket
            .local_addr()
            .unwrap_or_else(|_| unspecified_for(remote));
        let socket = Arc::new(socket);
        let keepalive = KeepAlive::spawn(socket.clone(), remote, token, keepalive_interval);
        Self {
            socket,
            local,
            remote,
            token,
            keepalive,
        }
    }

    /// Local endpoint of the punched socket
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Remote endpoint the handshake completed with
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Attempt token the link was punched with
    #[must_use]
    pub fn token(&self) -> PunchToken {
        self.token
    }

    /// Whether the keep-alive is still healthy
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.keepalive.is_failed() && !self.keepalive.task.is_finished()
    }

    /// Failure flag that trips when the keep-alive or a send fails
    #[must_use]
    pub fn health(&self) -> Arc<LinkHealth> {
        self.keepalive.health()
    }

    /// Send application data to the peer
    ///
    /// # Errors
    ///
    /// Returns [`PunchError::Closed`] once the keep-alive has failed.
    pub async fn send(&self, data: &[u8]) -> Result<usize, PunchError> {
        if self.keepalive.is_failed() {
            return Err(PunchError::Closed);
        }
        match self.socket.send_to(data, self.remote).await {
            Ok(sent) => Ok(sent),
            Err(e) => {
                self.keepalive.state.fail();
                Err(e.into())
            }
        }
    }

    /// Receive the next application datagram from the peer
    ///
    /// # Errors
    ///
    /// Returns [`PunchError::Closed`] if the link fails while waiting.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize, PunchError> {
        let state = &self.keepalive.state;
        loop {
            if state.is_failed() {
                return Err(PunchError::Closed);
            }

            let (len, from) = tokio::select! {
                () = state.failed() => return Err(PunchError::Closed),
                received = self.socket.recv_from(buf) => match received {
                    Ok(received) => received,
                    Err(e) if is_transient(&e) => continue,
                    Err(e) => return Err(e.into()),
                },
            };

            if from != self.remote {
                trace!("dropping datagram from unexpected source {from}");
                continue;
            }

            match ControlPacket::decode(&buf[..len]) {
                Some(packet) if packet.matches(&self.token) => {
                    if packet.kind == PacketKind::Punch {
                        let ack = ControlPacket::new(PacketKind::PunchAck, self.token).encode();
                        self.socket.send_to(&ack, from).await?;
                    }
                }
                _ => return Ok(len),
            }
        }
    }

    /// Cancel the keep-alive and fail pending and later I/O
    ///
    /// The socket itself is released when the link is dropped.
    pub fn shutdown(&self) {
        self.keepalive.cancel();
        self.keepalive.state.fail();
        debug!("UDP link {} -> {} shut down", self.local, self.remote);
    }

    /// Close the socket and cancel the keep-alive together
    pub fn close(self) {
        self.keepalive.cancel();
        debug!("UDP link {} -> {} closed", self.local, self.remote);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config(timeout: Duration) -> PunchConfig {
        PunchConfig {
            connection_timeout: timeout,
            punch_interval: Duration::from_millis(50),
            keepalive_interval: Duration::from_millis(100),
            ..PunchConfig::default()
        }
    }

    /// Answers every punch with an acknowledgement
    async fn spawn_acker(socket: UdpSocket) {
        tokio::spawn(async move {
            let mut buf = [0u8; 128];
            while let Ok((len, from)) = socket.recv_from(&mut buf).await {
                if let Some(packet) = ControlPacket::decode(&buf[..len]) {
                    if packet.kind == PacketKind::Punch {
                        let ack = ControlPacket::new(PacketKind::PunchAck, packet.token);
                        let _ = socket.send_to(&ack.encode(), from).await;
                    }
                }
            }
        });
    }

    #[test]
    fn test_default_config() {
        let config = PunchConfig::default();
        assert_eq!(config.connection_timeout, Duration::from_secs(30));
        assert_eq!(config.punch_interval, Duration::from_millis(500));
        assert_eq!(config.keepalive_interval, Duration::from_secs(25));
    }

    #[test]
    fn test_birthday_candidates() {
        assert_eq!(
            birthday_candidates(40000, 1),
            vec![40001, 40002, 39999, 40010, 40100]
        );
        assert_eq!(
            birthday_candidates(40000, 4),
            vec![40004, 40008, 39996, 40010, 40100]
        );
        // +10 coincides with 2·increment
        assert_eq!(
            birthday_candidates(40000, 5),
            vec![40005, 40010, 39995, 40100]
        );
        assert_eq!(birthday_candidates(65500, 1), vec![65501, 65502, 65499, 65510]);
        assert_eq!(birthday_candidates(1, 1), vec![2, 3, 11, 101]);
    }

    #[tokio::test]
    async fn test_udp_punch_both_sides() {
        let puncher = HolePuncher::new(fast_config(Duration::from_secs(5)));
        let a_port = UdpSocket::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let b_port = UdpSocket::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();
        let token = PunchToken::random();

        let other = puncher.clone();
        let b = tokio::spawn(async move { other.udp_punch(b_port, a_port, token).await });
        let a = puncher.udp_punch(a_port, b_port, token).await.unwrap();
        let b = b.await.unwrap().unwrap();

        assert_eq!(a.remote_addr(), b_port);
        assert_eq!(b.remote_addr(), a_port);

        a.send(b"hello").await.unwrap();
        let mut buf = [0u8; 64];
        let len = b.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"hello");
        assert!(a.is_alive());
    }

    #[tokio::test]
    async fn test_udp_punch_ignores_other_tokens() {
        let puncher = HolePuncher::new(fast_config(Duration::from_millis(400)));
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder_addr = responder.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 128];
            while let Ok((_, from)) = responder.recv_from(&mut buf).await {
                let wrong = ControlPacket::new(PacketKind::PunchAck, PunchToken::random());
                let _ = responder.send_to(&wrong.encode(), from).await;
            }
        });

        let err = puncher
            .udp_punch("127.0.0.1:0".parse().unwrap(), responder_addr, PunchToken::random())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_silent_peer_times_out_and_releases_socket() {
        let timeout = Duration::from_millis(600);
        let puncher = HolePuncher::new(fast_config(timeout));
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = UdpSocket::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();

        let started = std::time::Instant::now();
        let err = puncher
            .udp_punch(local, silent.local_addr().unwrap(), PunchToken::random())
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, PunchError::Timeout { after, .. } if after == timeout));
        assert!(elapsed >= timeout, "returned early after {elapsed:?}");
        assert!(elapsed < timeout + Duration::from_millis(250), "overran: {elapsed:?}");

        // A plain bind without address reuse only succeeds if the punch socket is gone
        UdpSocket::bind(local).await.unwrap();
    }

    #[tokio::test]
    async fn test_birthday_attack_finds_single_responder() {
        let puncher = HolePuncher::new(fast_config(Duration::from_secs(2)));
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder_addr = responder.local_addr().unwrap();
        spawn_acker(responder).await;

        // The responder sits at reported + 10
        let reported = SocketAddr::new(responder_addr.ip(), responder_addr.port() - 10);
        let link = puncher
            .birthday_attack(reported, 1, PunchToken::random())
            .await
            .unwrap();

        assert_eq!(link.remote_addr(), responder_addr);
    }

    #[tokio::test]
    async fn test_birthday_attack_no_candidates() {
        let puncher = HolePuncher::default();
        let remote: SocketAddr = "127.0.0.1:65535".parse().unwrap();
        // +10 and +100 overflow, and a large negative step pushes the rest out of range
        let err = puncher
            .birthday_attack(remote, 70000, PunchToken::random())
            .await
            .unwrap_err();
        assert!(matches!(err, PunchError::NoCandidates(65535)));
    }

    #[tokio::test]
    async fn test_keepalive_reaches_peer_and_stops_on_close() {
        let puncher = HolePuncher::new(fast_config(Duration::from_secs(2)));
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let token = PunchToken::random();

        let local = "127.0.0.1:0".parse().unwrap();
        let punch = tokio::spawn(async move { puncher.udp_punch(local, peer_addr, token).await });

        let mut buf = [0u8; 128];
        let (_, from) = peer.recv_from(&mut buf).await.unwrap();
        let ack = ControlPacket::new(PacketKind::PunchAck, token);
        peer.send_to(&ack.encode(), from).await.unwrap();
        let link = punch.await.unwrap().unwrap();

        // Drain until a keep-alive shows up
        let keepalive = time::timeout(Duration::from_secs(2), async {
            loop {
                let (len, _) = peer.recv_from(&mut buf).await.unwrap();
                if ControlPacket::decode(&buf[..len]).map(|p| p.kind) == Some(PacketKind::Keepalive) {
                    break;
                }
            }
        })
        .await;
        assert!(keepalive.is_ok());

        link.close();
        time::sleep(Duration::from_millis(50)).await;
        while let Ok(Ok(_)) = time::timeout(Duration::from_millis(10), peer.recv_from(&mut buf)).await {}

        let silence = time::timeout(Duration::from_millis(300), peer.recv_from(&mut buf)).await;
        assert!(silence.is_err(), "keep-alive still running after close");
    }

    #[tokio::test]
    async fn test_keepalive_send_failure_trips_health() {
        // An IPv4 socket cannot send to an IPv6 peer, so the first tick fails
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let link = UdpLink::establish(
            socket,
            "[::1]:9".parse().unwrap(),
            PunchToken::random(),
            Duration::from_millis(20),
        );
        let health = link.health();
        assert!(link.is_alive());

        time::timeout(Duration::from_secs(2), health.failed())
            .await
            .expect("keep-alive failure never reported");
        assert!(health.is_failed());
        assert!(!link.is_alive());
        let mut buf = [0u8; 16];
        assert!(matches!(link.recv(&mut buf).await, Err(PunchError::Closed)));
    }

    #[tokio::test]
    async fn test_health_resolves_for_late_waiters() {
        let health = Arc::new(LinkHealth::default());
        let waiter = tokio::spawn({
            let health = health.clone();
            async move { health.failed().await }
        });
        time::sleep(Duration::from_millis(20)).await;
        health.fail();
        time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        // Already failed: resolves immediately
        time::timeout(Duration::from_millis(50), health.failed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_fails_io() {
        let puncher = HolePuncher::new(fast_config(Duration::from_secs(2)));
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        spawn_acker(peer).await;

        let link = puncher
            .udp_punch("127.0.0.1:0".parse().unwrap(), peer_addr, PunchToken::random())
            .await
            .unwrap();
        assert!(link.is_alive());

        link.shutdown();
        assert!(!link.is_alive());
        assert!(matches!(link.send(b"late").await, Err(PunchError::Closed)));
        let mut buf = [0u8; 64];
        assert!(matches!(link.recv(&mut buf).await, Err(PunchError::Closed)));
    }
}
